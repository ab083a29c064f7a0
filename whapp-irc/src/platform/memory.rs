//! Scripted in-process platform.
//!
//! Holds an account's chats, members and history in memory and lets the
//! caller drive login, logout and incoming traffic. Used by the test
//! suites; handy for local runs without a browser sidecar too.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tokio::sync::watch;

use super::{
    ChatId, LoginState, Me, Platform, PlatformConnector, Presence, RawChat, RawMessage,
    RawParticipant, SessionBlob,
};

#[derive(Debug, Default)]
struct Account {
    chats: Vec<RawChat>,
    participants: HashMap<ChatId, Vec<RawParticipant>>,
    history: HashMap<ChatId, Vec<RawMessage>>,
    incoming: VecDeque<RawMessage>,
    presence: HashMap<ChatId, Presence>,
    media: HashMap<String, Vec<u8>>,
    storage: SessionBlob,
    sent: Vec<(ChatId, String)>,
    broken_history: HashSet<ChatId>,
}

pub struct MemoryPlatform {
    me: Me,
    login_code: String,
    account: Mutex<Account>,
    logged_in: watch::Sender<bool>,
    fail_open: Mutex<Option<String>>,
    open_calls: AtomicUsize,
    close_calls: AtomicUsize,
}

impl MemoryPlatform {
    pub fn new(me: Me) -> Self {
        Self {
            me,
            login_code: "2@memory-login-code".to_string(),
            account: Mutex::new(Account::default()),
            logged_in: watch::channel(false).0,
            fail_open: Mutex::new(None),
            open_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
        }
    }

    /// Start already authenticated.
    pub fn logged_in(self) -> Self {
        self.logged_in.send_replace(true);
        self
    }

    pub fn with_chat(self, chat: RawChat, members: Vec<RawParticipant>) -> Self {
        {
            let mut account = self.account.lock().unwrap();
            account.participants.insert(chat.id.clone(), members);
            account.chats.push(chat);
        }
        self
    }

    pub fn with_history(self, messages: Vec<RawMessage>) -> Self {
        {
            let mut account = self.account.lock().unwrap();
            for message in messages {
                account
                    .history
                    .entry(message.chat.clone())
                    .or_default()
                    .push(message);
            }
        }
        self
    }

    pub fn with_media(self, message_id: &str, bytes: &[u8]) -> Self {
        self.account
            .lock()
            .unwrap()
            .media
            .insert(message_id.to_string(), bytes.to_vec());
        self
    }

    pub fn with_presence(self, chat: &ChatId, presence: Presence) -> Self {
        self.account
            .lock()
            .unwrap()
            .presence
            .insert(chat.clone(), presence);
        self
    }

    /// Make `messages_since` fail for one chat.
    pub fn with_broken_history(self, chat: &ChatId) -> Self {
        self.account
            .lock()
            .unwrap()
            .broken_history
            .insert(chat.clone());
        self
    }

    /// Make every `open` fail with `reason`.
    pub fn failing_open(self, reason: &str) -> Self {
        *self.fail_open.lock().unwrap() = Some(reason.to_string());
        self
    }

    /// Complete a pending QR login.
    pub fn complete_login(&self) {
        self.logged_in.send_replace(true);
    }

    pub fn log_out(&self) {
        self.logged_in.send_replace(false);
    }

    /// Deliver a message as if it just arrived on the account.
    pub fn push_message(&self, message: RawMessage) {
        let mut account = self.account.lock().unwrap();
        if let Some(chat) = account.chats.iter_mut().find(|c| c.id == message.chat) {
            chat.timestamp = chat.timestamp.max(message.timestamp);
        }
        account
            .history
            .entry(message.chat.clone())
            .or_default()
            .push(message.clone());
        account.incoming.push_back(message);
    }

    /// Add a chat after login, without announcing it.
    pub fn add_chat(&self, chat: RawChat, members: Vec<RawParticipant>) {
        let mut account = self.account.lock().unwrap();
        account.participants.insert(chat.id.clone(), members);
        account.chats.push(chat);
    }

    pub fn sent(&self) -> Vec<(ChatId, String)> {
        self.account.lock().unwrap().sent.clone()
    }

    pub fn storage(&self) -> SessionBlob {
        self.account.lock().unwrap().storage.clone()
    }

    pub fn set_storage(&self, blob: SessionBlob) {
        self.account.lock().unwrap().storage = blob;
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn login_code_value(&self) -> &str {
        &self.login_code
    }
}

#[async_trait]
impl Platform for MemoryPlatform {
    async fn open(&self) -> Result<LoginState> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.fail_open.lock().unwrap().clone() {
            bail!(reason);
        }
        Ok(if *self.logged_in.borrow() {
            LoginState::LoggedIn
        } else {
            LoginState::LoggedOut
        })
    }

    async fn login_code(&self) -> Result<String> {
        Ok(self.login_code.clone())
    }

    async fn wait_login(&self) -> Result<()> {
        let mut rx = self.logged_in.subscribe();
        rx.wait_for(|logged_in| *logged_in)
            .await
            .map_err(|_| anyhow!("platform closed while waiting for login"))?;
        Ok(())
    }

    async fn set_local_storage(&self, blob: &SessionBlob) -> Result<()> {
        self.account.lock().unwrap().storage = blob.clone();
        Ok(())
    }

    async fn local_storage(&self) -> Result<SessionBlob> {
        Ok(self.storage())
    }

    async fn me(&self) -> Result<Me> {
        Ok(self.me.clone())
    }

    async fn all_chats(&self) -> Result<Vec<RawChat>> {
        Ok(self.account.lock().unwrap().chats.clone())
    }

    async fn chat(&self, id: &ChatId) -> Result<RawChat> {
        self.account
            .lock()
            .unwrap()
            .chats
            .iter()
            .find(|c| c.id == *id)
            .cloned()
            .ok_or_else(|| anyhow!("no such chat: {id}"))
    }

    async fn participants(&self, chat: &ChatId) -> Result<Vec<RawParticipant>> {
        Ok(self
            .account
            .lock()
            .unwrap()
            .participants
            .get(chat)
            .cloned()
            .unwrap_or_default())
    }

    async fn messages_since(&self, chat: &ChatId, since: Option<i64>) -> Result<Vec<RawMessage>> {
        let account = self.account.lock().unwrap();
        if account.broken_history.contains(chat) {
            bail!("history unavailable for {chat}");
        }
        Ok(account
            .history
            .get(chat)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| since.is_none_or(|since| m.timestamp > since))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn presence(&self, chat: &ChatId) -> Result<Presence> {
        Ok(self
            .account
            .lock()
            .unwrap()
            .presence
            .get(chat)
            .copied()
            .unwrap_or_default())
    }

    async fn send_message(&self, chat: &ChatId, text: &str) -> Result<()> {
        let mut account = self.account.lock().unwrap();
        if !account.chats.iter().any(|c| c.id == *chat) {
            bail!("no such chat: {chat}");
        }
        account.sent.push((chat.clone(), text.to_string()));
        Ok(())
    }

    async fn download_media(&self, message: &RawMessage) -> Result<Vec<u8>> {
        self.account
            .lock()
            .unwrap()
            .media
            .get(&message.id)
            .cloned()
            .ok_or_else(|| anyhow!("no media for message {}", message.id))
    }

    async fn is_logged_in(&self) -> Result<bool> {
        Ok(*self.logged_in.borrow())
    }

    async fn new_messages(&self) -> Result<Vec<RawMessage>> {
        Ok(self.account.lock().unwrap().incoming.drain(..).collect())
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out the same [`MemoryPlatform`] on every connect.
pub struct MemoryConnector {
    platform: Arc<MemoryPlatform>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(platform: Arc<MemoryPlatform>) -> Self {
        Self {
            platform,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlatformConnector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn Platform>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let platform: Arc<dyn Platform> = self.platform.clone();
        Ok(platform)
    }
}
