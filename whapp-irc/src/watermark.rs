//! Per-chat delivery watermarks.
//!
//! A watermark is the platform timestamp of the newest message already
//! delivered to the IRC client for a chat. Watermarks only ever move
//! forward while the process runs, including when a persisted snapshot is
//! restored on top of live state during a setup retry.

use std::collections::HashMap;
use std::sync::Mutex;

/// Chat id → newest delivered timestamp.
pub type WatermarkSnapshot = HashMap<String, i64>;

#[derive(Debug, Default)]
pub struct Watermarks {
    entries: Mutex<HashMap<String, i64>>,
}

impl Watermarks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, chat: &str) -> Option<i64> {
        self.entries.lock().unwrap().get(chat).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Move the watermark for `chat` up to `timestamp`.
    ///
    /// Returns `true` if the stored value changed. A timestamp at or below
    /// the current watermark is ignored.
    pub fn advance(&self, chat: &str, timestamp: i64) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(chat) {
            Some(current) if *current >= timestamp => false,
            Some(current) => {
                *current = timestamp;
                true
            }
            None => {
                entries.insert(chat.to_string(), timestamp);
                true
            }
        }
    }

    /// Merge a persisted snapshot, keeping the newer value per chat.
    pub fn restore(&self, snapshot: WatermarkSnapshot) {
        let mut entries = self.entries.lock().unwrap();
        for (chat, timestamp) in snapshot {
            entries
                .entry(chat)
                .and_modify(|current| *current = (*current).max(timestamp))
                .or_insert(timestamp);
        }
    }

    pub fn snapshot(&self) -> WatermarkSnapshot {
        self.entries.lock().unwrap().clone()
    }
}
