//! The chat-platform automation API, as consumed by the gateway.
//!
//! A [`PlatformConnector`] opens a fresh [`Platform`] handle; the session
//! bridge owns that handle for the lifetime of one setup attempt. Two
//! implementations ship with the crate:
//!
//! - [`http::HttpConnector`] talks to a browser-automation sidecar.
//! - [`memory::MemoryPlatform`] is a scripted in-process platform for tests.

pub mod http;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Platform chat/contact id, e.g. `31612345678@c.us` or `1203630...@g.us`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub String);

impl ChatId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part before `@` (the phone number for personal accounts).
    pub fn user(&self) -> &str {
        self.0.split('@').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque session-resumption data (the web client's local storage).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionBlob(pub BTreeMap<String, String>);

impl SessionBlob {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// State reported by [`Platform::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginState {
    LoggedIn,
    LoggedOut,
}

/// The authenticated account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Me {
    pub id: ChatId,
    pub push_name: String,
}

/// A chat as listed by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawChat {
    pub id: ChatId,
    pub title: String,
    pub is_group: bool,
    /// Timestamp of the newest activity in the chat (unix seconds).
    pub timestamp: i64,
    #[serde(default)]
    pub description: Option<String>,
}

/// A chat member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawParticipant {
    pub id: ChatId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub is_me: bool,
}

/// Sender of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ChatId,
    #[serde(default)]
    pub name: Option<String>,
}

/// Attachment metadata; the bytes are fetched with [`Platform::download_media`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaInfo {
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: String,
    pub chat: ChatId,
    /// Unix seconds.
    pub timestamp: i64,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub sender: Option<Contact>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub media: Option<MediaInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Presence {
    pub online: bool,
    #[serde(default)]
    pub last_seen: Option<i64>,
}

/// One live platform session.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Load the web client and report whether it is already authenticated.
    async fn open(&self) -> Result<LoginState>;
    /// The code to encode in the login QR image.
    async fn login_code(&self) -> Result<String>;
    /// Resolves once the account is logged in.
    async fn wait_login(&self) -> Result<()>;
    async fn set_local_storage(&self, blob: &SessionBlob) -> Result<()>;
    async fn local_storage(&self) -> Result<SessionBlob>;
    async fn me(&self) -> Result<Me>;
    async fn all_chats(&self) -> Result<Vec<RawChat>>;
    async fn chat(&self, id: &ChatId) -> Result<RawChat>;
    async fn participants(&self, chat: &ChatId) -> Result<Vec<RawParticipant>>;
    /// Messages in `chat` strictly newer than `since` (all history for `None`).
    async fn messages_since(&self, chat: &ChatId, since: Option<i64>) -> Result<Vec<RawMessage>>;
    async fn presence(&self, chat: &ChatId) -> Result<Presence>;
    async fn send_message(&self, chat: &ChatId, text: &str) -> Result<()>;
    async fn download_media(&self, message: &RawMessage) -> Result<Vec<u8>>;
    async fn is_logged_in(&self) -> Result<bool>;
    /// Messages that arrived since the previous call.
    async fn new_messages(&self) -> Result<Vec<RawMessage>>;
    /// Release the session. Must tolerate being called more than once.
    async fn close(&self);
}

/// Opens platform sessions.
#[async_trait]
pub trait PlatformConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Platform>>;
}
