//! IRCv3 capability negotiation.
//!
//! The set is mutable until [`Capabilities::finish`] is called (on `CAP END`,
//! on the negotiation timeout, or when a client registers without ever
//! sending `CAP LS`). Anything that must not act on a partial set awaits
//! [`Capabilities::wait`] first.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tokio::sync::watch;

use crate::irc::Message;

/// Replay of messages missed while disconnected.
pub const REPLAY: &str = "whapp-irc/replay";
/// IRCv3 `server-time`: relayed lines carry the platform timestamp.
pub const SERVER_TIME: &str = "server-time";

/// Capabilities advertised in `CAP LS`.
pub const SUPPORTED: &[&str] = &[REPLAY, SERVER_TIME];

#[derive(Debug, Default)]
struct CapState {
    /// name → accepted (true) / rejected (false)
    requested: BTreeMap<String, bool>,
    started: bool,
    finished: bool,
}

#[derive(Debug)]
pub struct Capabilities {
    state: Mutex<CapState>,
    done: watch::Sender<bool>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::new()
    }
}

impl Capabilities {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CapState::default()),
            done: watch::channel(false).0,
        }
    }

    /// Record a capability the client asserted support for.
    /// Returns `false` if negotiation already finished.
    pub fn declare(&self, name: &str) -> bool {
        self.record(name, true)
    }

    /// Record a capability the client asked for but did not get.
    pub fn reject(&self, name: &str) -> bool {
        self.record(name, false)
    }

    fn record(&self, name: &str, accepted: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.finished {
            tracing::debug!(cap = name, "capability change after negotiation ignored");
            return false;
        }
        state.requested.insert(name.to_ascii_lowercase(), accepted);
        true
    }

    /// Freeze the set and release every waiter. Idempotent; returns `true`
    /// only for the call that actually finished negotiation.
    pub fn finish(&self) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if state.finished {
                return false;
            }
            state.finished = true;
        }
        self.done.send_replace(true);
        true
    }

    pub fn has(&self, name: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .requested
            .get(&name.to_ascii_lowercase())
            .copied()
            .unwrap_or(false)
    }

    fn is_recorded(&self, name: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.requested.contains_key(&name.to_ascii_lowercase())
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().unwrap().finished
    }

    /// Whether the client ever sent `CAP LS`/`CAP REQ`.
    pub fn negotiation_started(&self) -> bool {
        self.state.lock().unwrap().started
    }

    /// Resolves once [`finish`](Self::finish) has been called.
    pub async fn wait(&self) {
        let mut rx = self.done.subscribe();
        // The sender lives in `self`, so this only returns once finished.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Accepted capability names, sorted.
    pub fn accepted(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .requested
            .iter()
            .filter(|(_, accepted)| **accepted)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Handle a `CAP` command and return the replies to send.
    pub fn handle(&self, msg: &Message, server: &str, nick: &str) -> Vec<Message> {
        let sub = msg.param(0).map(str::to_ascii_uppercase);
        match sub.as_deref() {
            Some("LS") => {
                self.state.lock().unwrap().started = true;
                let supported = SUPPORTED.join(" ");
                vec![Message::with_prefix(server, "CAP", vec![nick, "LS", supported.as_str()])]
            }
            Some("REQ") => {
                self.state.lock().unwrap().started = true;
                let raw = msg.param(1).unwrap_or("");
                let requested: Vec<&str> = raw.split_whitespace().collect();
                let all_supported = !requested.is_empty()
                    && requested
                        .iter()
                        .all(|cap| SUPPORTED.iter().any(|s| s.eq_ignore_ascii_case(cap)));

                let accepted = all_supported && !self.is_finished();
                for cap in &requested {
                    if accepted {
                        self.declare(cap);
                    } else if !self.is_recorded(cap) {
                        // A NAK leaves earlier grants untouched.
                        self.reject(cap);
                    }
                }

                let verdict = if accepted { "ACK" } else { "NAK" };
                vec![Message::with_prefix(server, "CAP", vec![nick, verdict, raw])]
            }
            Some("LIST") => {
                let list = self.accepted().join(" ");
                vec![Message::with_prefix(server, "CAP", vec![nick, "LIST", list.as_str()])]
            }
            Some("END") => {
                if self.finish() {
                    tracing::debug!(caps = ?self.accepted(), "capability negotiation finished");
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}
