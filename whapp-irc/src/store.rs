//! Persisted user records.
//!
//! One record per nickname holding the platform session blob and the
//! watermark snapshot. Records are stored as JSON text so the layout can
//! be validated explicitly on load instead of trusting whatever is there.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::platform::SessionBlob;
use crate::watermark::WatermarkSnapshot;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserRecord {
    pub session_blob: SessionBlob,
    pub watermarks: WatermarkSnapshot,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored record for {nick} is invalid: {source}")]
    Decode {
        nick: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot encode record for {nick}: {source}")]
    Encode {
        nick: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Database failures may clear up on a later attempt; a record that
    /// does not decode or encode will not.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Sqlite(_))
    }
}

impl UserRecord {
    /// Decode a stored record, naming the offending field on failure.
    pub fn decode(nick: &str, raw: &str) -> Result<Self, StoreError> {
        serde_json::from_str(raw).map_err(|source| StoreError::Decode {
            nick: nick.to_string(),
            source,
        })
    }

    pub fn encode(&self, nick: &str) -> Result<String, StoreError> {
        serde_json::to_string(self).map_err(|source| StoreError::Encode {
            nick: nick.to_string(),
            source,
        })
    }
}

/// Durable record storage keyed by nickname.
pub trait UserStore: Send + Sync {
    fn load(&self, nick: &str) -> Result<Option<UserRecord>, StoreError>;
    fn save(&self, nick: &str, record: &UserRecord) -> Result<(), StoreError>;
}

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                nick        TEXT PRIMARY KEY,
                record_json TEXT NOT NULL,
                updated_at  INTEGER NOT NULL
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn nicks(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT nick FROM users ORDER BY nick")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }
}

impl UserStore for SqliteStore {
    fn load(&self, nick: &str) -> Result<Option<UserRecord>, StoreError> {
        let raw: Option<String> = self
            .conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT record_json FROM users WHERE nick = ?1",
                params![nick],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|raw| UserRecord::decode(nick, &raw)).transpose()
    }

    fn save(&self, nick: &str, record: &UserRecord) -> Result<(), StoreError> {
        let json = record.encode(nick)?;
        self.conn.lock().unwrap().execute(
            "INSERT INTO users (nick, record_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(nick) DO UPDATE SET
                record_json=excluded.record_json,
                updated_at=excluded.updated_at",
            params![nick, json, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }
}

/// Process-local store used when no database path is configured.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, UserRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(self, nick: &str, record: UserRecord) -> Self {
        self.records.lock().unwrap().insert(nick.to_string(), record);
        self
    }

    pub fn get(&self, nick: &str) -> Option<UserRecord> {
        self.records.lock().unwrap().get(nick).cloned()
    }
}

impl UserStore for MemoryStore {
    fn load(&self, nick: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.get(nick))
    }

    fn save(&self, nick: &str, record: &UserRecord) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap()
            .insert(nick.to_string(), record.clone());
        Ok(())
    }
}
