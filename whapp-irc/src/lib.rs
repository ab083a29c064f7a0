//! IRC gateway for WhatsApp-Web-style chat sessions.

pub mod blob;
pub mod bridge;
pub mod caps;
pub mod chat;
pub mod config;
pub mod connection;
pub mod irc;
pub mod pipeline;
pub mod platform;
pub mod qr;
pub mod retry;
pub mod server;
pub mod store;
pub mod watermark;
pub mod web;
