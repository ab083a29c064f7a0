//! Per-client connection handler.
//!
//! Each TCP connection gets a [`Session`] plus a handful of tasks sharing
//! one cancellation token:
//! - reader: parses lines, answers PING, forwards the rest to dispatch
//! - writer: the only task touching the socket's write half
//! - dispatch: the connection state machine
//! - setup: platform login with retry
//! - sync: catch-up, then live relay and liveness polling
//! - persistence: saves the user record whenever it changes

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::blob::{self, BlobGuard, BlobStore};
use crate::bridge::SessionBridge;
use crate::caps::{self, Capabilities};
use crate::chat::{self, Chat, ChatList, JoinError};
use crate::irc::{self, Message};
use crate::pipeline::{self, SlotError};
use crate::platform::{ChatId, LoginState, Me, Platform, RawMessage, SessionBlob};
use crate::qr;
use crate::retry::{self, RetryPolicy};
use crate::server::SharedState;
use crate::store::{StoreError, UserRecord, UserStore};
use crate::watermark::Watermarks;

/// Pseudo-user that gateway status lines come from.
pub const STATUS_NICK: &str = "status";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    AwaitingNickname,
    SettingUp,
    Ready,
    Closing,
    Closed,
}

enum Event {
    Line(Message),
    SetupFinished(Result<()>),
    Disconnected,
}

/// A message ready for delivery, with its attachment published.
struct Resolved {
    message: RawMessage,
    media_url: Option<String>,
}

/// Everything one client connection shares between its tasks.
pub struct Session {
    pub id: String,
    server_name: String,
    out: mpsc::Sender<String>,
    nick: OnceLock<String>,
    caps: Capabilities,
    watermarks: Watermarks,
    chats: ChatList,
    me: Mutex<Option<Me>>,
    session_blob: Mutex<SessionBlob>,
    bridge: SessionBridge,
    store: Arc<dyn UserStore>,
    blobs: Arc<dyn BlobStore>,
    cancel: CancellationToken,
    dirty: watch::Sender<u64>,
    saved: Mutex<u64>,
    relay_window: usize,
    poll_interval: Duration,
}

impl Session {
    fn nick_or_star(&self) -> &str {
        self.nick.get().map(String::as_str).unwrap_or("*")
    }

    fn nick(&self) -> Result<&str> {
        self.nick
            .get()
            .map(String::as_str)
            .ok_or_else(|| anyhow!("no nickname registered"))
    }

    async fn send(&self, msg: Message) {
        if self.out.send(format!("{msg}\r\n")).await.is_err() {
            tracing::debug!(session_id = %self.id, "client gone, dropping line");
        }
    }

    async fn send_all(&self, msgs: Vec<Message>) {
        for msg in msgs {
            self.send(msg).await;
        }
    }

    async fn numeric(&self, code: &str, params: Vec<&str>) {
        let msg = Message::numeric(&self.server_name, code, self.nick_or_star(), params);
        self.send(msg).await;
    }

    /// A gateway diagnostic, shown as a private message from `status`.
    async fn status(&self, text: &str) {
        let nick = self.nick_or_star().to_string();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            self.send(Message::with_prefix(STATUS_NICK, "PRIVMSG", vec![nick.as_str(), line]))
                .await;
        }
    }

    fn mark_dirty(&self) {
        self.dirty.send_modify(|generation| *generation += 1);
    }

    fn record(&self) -> UserRecord {
        UserRecord {
            session_blob: self.session_blob.lock().unwrap().clone(),
            watermarks: self.watermarks.snapshot(),
        }
    }

    /// Save the user record if anything changed since the last save.
    fn flush(&self) {
        let Some(nick) = self.nick.get() else {
            return;
        };
        let mut saved = self.saved.lock().unwrap();
        let generation = *self.dirty.borrow();
        if generation <= *saved {
            return;
        }
        match self.store.save(nick, &self.record()) {
            Ok(()) => *saved = generation,
            Err(e) => tracing::warn!(session_id = %self.id, %nick, "failed to persist user record: {e}"),
        }
    }

    // ── setup ──────────────────────────────────────────────────────────

    async fn setup(self: &Arc<Self>, policy: RetryPolicy) -> Result<()> {
        let cancel = self.cancel.clone();
        retry::retry(
            policy,
            |attempt| {
                let session = Arc::clone(self);
                async move {
                    session.bridge.stop().await;
                    tokio::select! {
                        biased;
                        _ = session.cancel.cancelled() => Err(anyhow!("connection closed during setup")),
                        result = session.setup_attempt(attempt) => result,
                    }
                }
            },
            |e: &anyhow::Error| {
                !cancel.is_cancelled() && e.downcast_ref::<StoreError>().is_none_or(StoreError::is_transient)
            },
        )
        .await
    }

    async fn setup_attempt(&self, attempt: u32) -> Result<()> {
        let nick = self.nick()?;
        tracing::info!(session_id = %self.id, %nick, attempt, "setting up platform session");
        let platform = self
            .bridge
            .start(&self.cancel)
            .await
            .context("Failed to start platform session")?;

        if let Some(record) = self.store.load(nick)? {
            self.watermarks.restore(record.watermarks);
            *self.session_blob.lock().unwrap() = record.session_blob.clone();
            platform.open().await.context("Failed to open platform")?;
            if !record.session_blob.is_empty()
                && let Err(e) = platform.set_local_storage(&record.session_blob).await
            {
                tracing::warn!(session_id = %self.id, "failed to restore platform session: {e}");
            }
        }

        let qr = match platform.open().await.context("Failed to open platform")? {
            LoginState::LoggedOut => Some(self.publish_login_qr(platform.as_ref(), nick, attempt).await?),
            LoginState::LoggedIn => None,
        };
        platform.wait_login().await.context("Login did not complete")?;
        drop(qr);
        tracing::info!(session_id = %self.id, %nick, "platform login completed");
        self.status("logged in").await;

        match platform.local_storage().await {
            Ok(blob) => {
                *self.session_blob.lock().unwrap() = blob;
                self.mark_dirty();
            }
            Err(e) => tracing::warn!(session_id = %self.id, "failed to read platform session: {e}"),
        }

        let me = platform.me().await.context("Failed to fetch own identity")?;

        let chats = platform.all_chats().await.context("Failed to list chats")?;
        for raw in chats {
            let members = if raw.is_group {
                platform
                    .participants(&raw.id)
                    .await
                    .with_context(|| format!("Failed to list members of {}", raw.id))?
            } else {
                Vec::new()
            };
            self.chats.upsert(Chat::project(raw, members, Some(&me.id)));
        }
        tracing::info!(session_id = %self.id, %nick, chats = self.chats.len(), "chat list loaded");
        *self.me.lock().unwrap() = Some(me);
        Ok(())
    }

    /// Publish the login QR code and tell the client where it is. The
    /// returned guard removes the image when dropped.
    async fn publish_login_qr(&self, platform: &dyn Platform, nick: &str, attempt: u32) -> Result<BlobGuard> {
        let code = platform.login_code().await.context("Failed to fetch login code")?;
        let svg = qr::render_svg(&code)?;
        let stored = self
            .blobs
            .add(&format!("qr-{nick}-{attempt}"), "svg", svg.as_bytes())
            .context("Failed to publish QR code")?;
        let guard = BlobGuard::new(Arc::clone(&self.blobs), stored);
        self.status(&format!("Scan this QR code: {}", guard.url())).await;
        Ok(guard)
    }

    // ── delivery ───────────────────────────────────────────────────────

    /// Relay one platform message to the client.
    async fn deliver(&self, chat: &Chat, message: &RawMessage, media_url: Option<&str>) -> Result<(), JoinError> {
        let nick = self.nick_or_star().to_string();
        if chat.is_group
            && let Some(lines) = self.chats.join(&chat.id, &self.server_name, &nick)?
        {
            self.send_all(lines).await;
        }

        let sender = if message.from_me {
            nick.clone()
        } else if let Some(contact) = &message.sender {
            chat.participant(&contact.id)
                .map(|p| p.nick())
                .unwrap_or_else(|| chat::contact_nick(contact.name.as_deref(), &contact.id))
        } else {
            chat.identifier()
        };
        let target = if chat.is_group || message.from_me {
            chat.identifier()
        } else {
            nick.clone()
        };

        let mut lines: Vec<&str> = message
            .body
            .lines()
            .filter(|l| !l.trim().is_empty())
            .collect();
        if let Some(url) = media_url {
            lines.push(url);
        }

        let time = self
            .caps
            .has(caps::SERVER_TIME)
            .then(|| chrono::DateTime::from_timestamp(message.timestamp, 0))
            .flatten()
            .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true));

        for line in &lines {
            let mut msg = Message::with_prefix(&sender, "PRIVMSG", vec![target.as_str(), line]);
            if let Some(time) = &time {
                msg = msg.tag("time", time.as_str());
            }
            self.send(msg).await;
        }
        tracing::info!(
            session_id = %self.id,
            chat = %chat.id,
            timestamp = message.timestamp,
            "{sender} -> {target}: {}",
            lines.join(" ")
        );
        Ok(())
    }

    // ── catch-up ───────────────────────────────────────────────────────

    async fn catch_up(&self) -> Result<()> {
        let platform = self.bridge.platform()?;
        let replay = self.caps.has(caps::REPLAY);
        let was_empty = self.watermarks.is_empty();
        let mut delivered = 0usize;

        for chat in self.chats.all() {
            let key = chat.id.as_str();
            if was_empty || !replay {
                if self.watermarks.advance(key, chat.timestamp) {
                    self.mark_dirty();
                }
                continue;
            }

            let persisted = self.watermarks.get(key);
            if persisted.is_some_and(|ts| chat.timestamp <= ts) {
                continue;
            }

            let mut messages = match platform.messages_since(&chat.id, persisted).await {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::warn!(session_id = %self.id, chat = %chat.id, "failed to fetch missed messages: {e:#}");
                    continue;
                }
            };
            messages.sort_by_key(|m| m.timestamp);

            for message in messages.into_iter().filter(|m| m.timestamp <= chat.timestamp) {
                if self.watermarks.get(key).is_some_and(|wm| message.timestamp <= wm) {
                    continue;
                }
                let media_url = match resolve_media(platform.as_ref(), self.blobs.as_ref(), &message).await {
                    Ok(url) => url,
                    Err(e) => {
                        tracing::warn!(session_id = %self.id, message = %message.id, "failed to relay media: {e:#}");
                        continue;
                    }
                };
                if let Err(e) = self.deliver(&chat, &message, media_url.as_deref()).await {
                    tracing::warn!(session_id = %self.id, message = %message.id, "failed to deliver message: {e}");
                    continue;
                }
                self.watermarks.advance(key, message.timestamp);
                self.mark_dirty();
                delivered += 1;
            }
        }

        tracing::info!(session_id = %self.id, delivered, replay, "catch-up finished");
        Ok(())
    }

    // ── live relay ─────────────────────────────────────────────────────

    async fn relay(&self) -> Result<()> {
        let events = self.bridge.listen_for_messages(self.poll_interval)?;
        let platform = self.bridge.platform()?;
        let blobs = Arc::clone(&self.blobs);

        let mut resolved = pipeline::ordered(events, self.relay_window, move |event: Result<RawMessage>| {
            let platform = Arc::clone(&platform);
            let blobs = Arc::clone(&blobs);
            async move {
                let message = event?;
                let media_url = resolve_media(platform.as_ref(), blobs.as_ref(), &message).await?;
                Ok::<_, anyhow::Error>(Resolved { message, media_url })
            }
        });

        while let Some(slot) = resolved.next().await {
            match slot {
                Ok(item) => self.deliver_live(item).await,
                Err(SlotError::Failed(e)) => {
                    tracing::warn!(session_id = %self.id, "failed to resolve incoming message: {e:#}");
                }
                Err(SlotError::Aborted(e)) => {
                    tracing::warn!(session_id = %self.id, "message resolution aborted: {e}");
                }
            }
        }
        bail!("platform message stream ended")
    }

    async fn deliver_live(&self, item: Resolved) {
        let Resolved { message, media_url } = item;
        let chat = match self.chats.get(&message.chat) {
            Some(chat) => chat,
            None => match self.discover_chat(&message.chat).await {
                Ok(chat) => chat,
                Err(e) => {
                    tracing::warn!(session_id = %self.id, chat = %message.chat, "failed to load unknown chat: {e:#}");
                    return;
                }
            },
        };
        if let Err(e) = self.deliver(&chat, &message, media_url.as_deref()).await {
            tracing::warn!(session_id = %self.id, message = %message.id, "failed to deliver message: {e}");
            return;
        }
        self.chats.touch(&chat.id, message.timestamp);
        if self.watermarks.advance(chat.id.as_str(), message.timestamp) {
            self.mark_dirty();
        }
    }

    /// Fetch a chat the list doesn't know about yet and add it.
    async fn discover_chat(&self, id: &ChatId) -> Result<Chat> {
        let platform = self.bridge.platform()?;
        let raw = platform.chat(id).await?;
        let members = if raw.is_group {
            platform.participants(id).await?
        } else {
            Vec::new()
        };
        let me = self.me.lock().unwrap().as_ref().map(|me| me.id.clone());
        self.chats.upsert(Chat::project(raw, members, me.as_ref()));
        self.chats
            .get(id)
            .ok_or_else(|| anyhow!("chat {id} vanished after insert"))
    }

    /// Ends with `Ok` when the platform reports a logout.
    async fn watch_login(&self) -> Result<()> {
        let mut states = self.bridge.listen_logged_in(self.poll_interval)?;
        while let Some(state) = states.recv().await {
            match state.context("Failed to check login state")? {
                true => {}
                false => {
                    tracing::info!(session_id = %self.id, "platform session logged out");
                    self.status("logged out").await;
                    return Ok(());
                }
            }
        }
        bail!("login state stream ended")
    }

    async fn sync(&self) -> Result<()> {
        self.caps.wait().await;
        self.catch_up().await?;
        self.status("ready for new messages").await;
        tokio::select! {
            result = self.watch_login() => result,
            result = self.relay() => result,
        }
    }

    // ── commands ───────────────────────────────────────────────────────

    async fn handle_join(&self, msg: &Message) {
        let Some(targets) = msg.param(0) else {
            self.numeric(irc::ERR_NEEDMOREPARAMS, vec!["JOIN", "Not enough parameters"]).await;
            return;
        };
        let nick = self.nick_or_star().to_string();
        for target in targets.split(',').filter(|t| !t.is_empty()) {
            let joined = match self.chats.by_identifier(target) {
                Some(chat) => self.chats.join(&chat.id, &self.server_name, &nick),
                None => Err(JoinError::NoSuchChat(target.to_string())),
            };
            match joined {
                Ok(Some(lines)) => self.send_all(lines).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(session_id = %self.id, "join failed: {e}");
                    self.numeric(irc::ERR_NOSUCHCHANNEL, vec![target, "No such channel"]).await;
                }
            }
        }
    }

    async fn handle_privmsg(&self, msg: &Message) {
        let (Some(target), Some(text)) = (msg.param(0), msg.param(1)) else {
            self.numeric(irc::ERR_NOTEXTTOSEND, vec!["No text to send"]).await;
            return;
        };
        let Some(chat) = self.chats.by_identifier(target) else {
            let code = if target.starts_with('#') { irc::ERR_NOSUCHCHANNEL } else { irc::ERR_NOSUCHNICK };
            self.numeric(code, vec![target, "No such nick/channel"]).await;
            return;
        };
        let sent = match self.bridge.platform() {
            Ok(platform) => platform.send_message(&chat.id, text).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            tracing::warn!(session_id = %self.id, chat = %chat.id, "failed to send message: {e:#}");
            self.numeric(irc::ERR_CANNOTSENDTOCHAN, vec![target, "Cannot send to channel"]).await;
        }
    }

    async fn handle_whois(&self, msg: &Message) {
        let Some(target) = msg.param(msg.params.len().saturating_sub(1)) else {
            self.numeric(irc::ERR_NEEDMOREPARAMS, vec!["WHOIS", "Not enough parameters"]).await;
            return;
        };
        let Some((id, name)) = self.find_contact(target) else {
            self.numeric(irc::ERR_NOSUCHNICK, vec![target, "No such nick/channel"]).await;
            self.numeric(irc::RPL_ENDOFWHOIS, vec![target, "End of /WHOIS list."]).await;
            return;
        };

        let host = id.as_str().split_once('@').map(|(_, host)| host).unwrap_or("");
        self.numeric(irc::RPL_WHOISUSER, vec![target, id.user(), host, "*", name.as_str()])
            .await;

        let presence = match self.bridge.platform() {
            Ok(platform) => platform.presence(&id).await,
            Err(e) => Err(e.into()),
        };
        match presence {
            Ok(presence) if !presence.online => {
                let away = presence
                    .last_seen
                    .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
                    .map(|t| format!("last seen {}", t.format("%Y-%m-%d %H:%M UTC")))
                    .unwrap_or_else(|| "offline".to_string());
                self.numeric(irc::RPL_AWAY, vec![target, away.as_str()]).await;
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(session_id = %self.id, "presence lookup failed: {e:#}"),
        }
        self.numeric(irc::RPL_ENDOFWHOIS, vec![target, "End of /WHOIS list."]).await;
    }

    /// Find a direct chat or group member by nick.
    fn find_contact(&self, nick: &str) -> Option<(ChatId, String)> {
        let chats = self.chats.all();
        if let Some(chat) = chats
            .iter()
            .find(|c| !c.is_group && c.identifier().eq_ignore_ascii_case(nick))
        {
            return Some((chat.id.clone(), chat.name.clone()));
        }
        chats
            .iter()
            .flat_map(|c| c.participants.iter())
            .find(|p| !p.is_self && p.nick().eq_ignore_ascii_case(nick))
            .map(|p| (p.id.clone(), p.name.clone().unwrap_or_else(|| p.nick())))
    }

    async fn welcome(&self) {
        let nick = self.nick_or_star().to_string();
        let server = self.server_name.as_str();
        let welcome = format!("Welcome to the whapp-irc bridge, {nick}");
        let host = format!("Your host is {server}, running version {}", env!("CARGO_PKG_VERSION"));
        self.numeric(irc::RPL_WELCOME, vec![welcome.as_str()]).await;
        self.numeric(irc::RPL_YOURHOST, vec![host.as_str()]).await;
        self.numeric(irc::RPL_CREATED, vec!["This server was created for you"]).await;
        self.numeric(irc::RPL_MYINFO, vec![server, env!("CARGO_PKG_VERSION"), "i", "o"])
            .await;
    }
}

/// Download an attachment and publish it. `None` for text messages.
async fn resolve_media(platform: &dyn Platform, blobs: &dyn BlobStore, message: &RawMessage) -> Result<Option<String>> {
    let Some(media) = &message.media else {
        return Ok(None);
    };
    let bytes = platform
        .download_media(message)
        .await
        .with_context(|| format!("Failed to download media of {}", message.id))?;
    let stored = blobs.add(&message.id, &blob::media_extension(media, &bytes), &bytes)?;
    Ok(Some(stored.url))
}

/// Handle a plain TCP connection.
pub async fn handle(stream: TcpStream, state: Arc<SharedState>) -> Result<()> {
    let peer = stream.peer_addr()?;
    let session_id = format!("{peer}");
    tracing::info!(%session_id, "New connection");
    handle_generic_with_id(stream, state, session_id).await
}

/// Handle any async stream.
pub async fn handle_generic<S>(stream: S, state: Arc<SharedState>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let session_id = format!("stream-{id}");
    tracing::info!(%session_id, "New connection (generic stream)");
    handle_generic_with_id(stream, state, session_id).await
}

async fn handle_generic_with_id<S>(stream: S, state: Arc<SharedState>, session_id: String) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (out_tx, out_rx) = mpsc::channel::<String>(256);
    let writer_done = CancellationToken::new();
    let write_handle = tokio::spawn(write_loop(writer, out_rx, writer_done.clone(), session_id.clone()));

    let session = Arc::new(Session {
        id: session_id.clone(),
        server_name: state.config.server_name.clone(),
        out: out_tx,
        nick: OnceLock::new(),
        caps: Capabilities::new(),
        watermarks: Watermarks::new(),
        chats: ChatList::new(),
        me: Mutex::new(None),
        session_blob: Mutex::new(SessionBlob::default()),
        bridge: SessionBridge::new(Arc::clone(&state.connector)),
        store: Arc::clone(&state.store),
        blobs: Arc::clone(&state.blobs),
        cancel: CancellationToken::new(),
        dirty: watch::channel(0).0,
        saved: Mutex::new(0),
        relay_window: state.config.relay_window,
        poll_interval: state.config.poll_interval(),
    });
    state.connections.lock().unwrap().insert(session_id.clone(), None);

    let (events_tx, mut events) = mpsc::channel::<Event>(64);
    let mut tasks = vec![
        tokio::spawn(read_loop(BufReader::new(reader), Arc::clone(&session), events_tx.clone())),
        tokio::spawn(persist_loop(Arc::clone(&session))),
        tokio::spawn(cap_timeout(Arc::clone(&session), state.config.cap_timeout())),
    ];

    let mut conn_state = State::Connecting;
    tracing::debug!(%session_id, state = ?conn_state, "connection state");
    conn_state = State::AwaitingNickname;

    loop {
        let event = tokio::select! {
            _ = session.cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };

        match event {
            Event::Disconnected => break,
            Event::SetupFinished(Ok(())) => {
                conn_state = State::Ready;
                tracing::info!(%session_id, nick = session.nick_or_star(), "session ready");
                session.welcome().await;
                let sync_session = Arc::clone(&session);
                tasks.push(tokio::spawn(async move {
                    let session = sync_session;
                    let result = tokio::select! {
                        _ = session.cancel.cancelled() => return,
                        result = session.sync() => result,
                    };
                    match result {
                        Ok(()) => tracing::info!(session_id = %session.id, "sync finished"),
                        Err(e) => {
                            tracing::warn!(session_id = %session.id, "sync failed: {e:#}");
                            session.status(&format!("bridge stopped: {e}")).await;
                        }
                    }
                    session.cancel.cancel();
                }));
            }
            Event::SetupFinished(Err(e)) => {
                tracing::warn!(%session_id, "setup failed: {e:#}");
                if !session.cancel.is_cancelled() {
                    session
                        .status(&format!("giving up trying to setup whapp bridge: {e}"))
                        .await;
                }
                break;
            }
            Event::Line(msg) => {
                if msg.command == "QUIT" {
                    tracing::info!(%session_id, "client quit");
                    break;
                }
                if let Some(next) = dispatch(&session, &state, conn_state, &msg, &events_tx, &mut tasks).await {
                    if next != conn_state {
                        tracing::debug!(%session_id, from = ?conn_state, to = ?next, "connection state");
                    }
                    conn_state = next;
                }
            }
        }
    }

    conn_state = State::Closing;
    tracing::debug!(%session_id, state = ?conn_state, "connection state");
    session.cancel.cancel();
    // Nothing reads events any more; senders parked on a full queue must fail.
    drop(events);
    for task in tasks {
        let _ = task.await;
    }
    session.bridge.stop().await;
    session.flush();
    state.connections.lock().unwrap().remove(&session_id);

    writer_done.cancel();
    let _ = write_handle.await;
    conn_state = State::Closed;
    tracing::info!(%session_id, state = ?conn_state, "connection closed");
    Ok(())
}

/// Handle one client line. Returns the next state, if it changed.
async fn dispatch(
    session: &Arc<Session>,
    state: &Arc<SharedState>,
    current: State,
    msg: &Message,
    events: &mpsc::Sender<Event>,
    tasks: &mut Vec<JoinHandle<()>>,
) -> Option<State> {
    match msg.command.as_str() {
        "CAP" => {
            let replies = session.caps.handle(msg, &session.server_name, session.nick_or_star());
            session.send_all(replies).await;
            None
        }
        "NICK" => {
            if current != State::AwaitingNickname {
                tracing::debug!(session_id = %session.id, "nick change ignored");
                return None;
            }
            let Some(nick) = msg.param(0).filter(|n| !n.is_empty()) else {
                session.numeric(irc::ERR_NEEDMOREPARAMS, vec!["NICK", "Not enough parameters"]).await;
                return None;
            };
            if session.nick.set(nick.to_string()).is_err() {
                return None;
            }
            state
                .connections
                .lock()
                .unwrap()
                .insert(session.id.clone(), Some(nick.to_string()));
            if !session.caps.negotiation_started() {
                session.caps.finish();
            }

            let setup_session = Arc::clone(session);
            let policy = state.setup_retry;
            let events = events.clone();
            tasks.push(tokio::spawn(async move {
                let result = setup_session.setup(policy).await;
                let _ = events.send(Event::SetupFinished(result)).await;
            }));
            Some(State::SettingUp)
        }
        "USER" | "PONG" => None,
        _ if current != State::Ready => {
            session.numeric(irc::ERR_NOTREGISTERED, vec!["You have not registered"]).await;
            None
        }
        "JOIN" => {
            session.handle_join(msg).await;
            None
        }
        "PRIVMSG" => {
            session.handle_privmsg(msg).await;
            None
        }
        "WHOIS" => {
            session.handle_whois(msg).await;
            None
        }
        other => {
            session.numeric(irc::ERR_UNKNOWNCOMMAND, vec![other, "Unknown command"]).await;
            None
        }
    }
}

async fn read_loop<R>(mut reader: BufReader<R>, session: Arc<Session>, events: mpsc::Sender<Event>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut line_buf = String::new();
    loop {
        line_buf.clear();
        let read = tokio::select! {
            _ = session.cancel.cancelled() => return,
            read = reader.read_line(&mut line_buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(session_id = %session.id, "read error: {e}");
                break;
            }
        }

        let Some(msg) = Message::parse(&line_buf) else {
            continue;
        };
        tracing::debug!(session_id = %session.id, "<- {}", line_buf.trim());

        if msg.command == "PING" {
            let token = msg.param(0).unwrap_or("");
            let server = session.server_name.as_str();
            session
                .send(Message::with_prefix(server, "PONG", vec![server, token]).trailing())
                .await;
            continue;
        }
        let sent = tokio::select! {
            _ = session.cancel.cancelled() => return,
            sent = events.send(Event::Line(msg)) => sent,
        };
        if sent.is_err() {
            return;
        }
    }
    let _ = events.send(Event::Disconnected).await;
}

async fn write_loop<W>(mut writer: W, mut lines: mpsc::Receiver<String>, done: CancellationToken, session_id: String)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let line = tokio::select! {
            biased;
            line = lines.recv() => line,
            _ = done.cancelled() => None,
        };
        let Some(line) = line else { break };
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(%session_id, "Write error: {e}");
            return;
        }
    }
    // Lines queued before shutdown still go out.
    while let Ok(line) = lines.try_recv() {
        if writer.write_all(line.as_bytes()).await.is_err() {
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn persist_loop(session: Arc<Session>) {
    let mut dirty = session.dirty.subscribe();
    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break,
            changed = dirty.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        session.flush();
    }
}

async fn cap_timeout(session: Arc<Session>, timeout: Duration) {
    tokio::select! {
        _ = session.cancel.cancelled() => {}
        _ = tokio::time::sleep(timeout) => {
            if session.caps.finish() {
                tracing::debug!(session_id = %session.id, "capability negotiation timed out");
            }
        }
    }
}
