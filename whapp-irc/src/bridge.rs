//! Ownership of the live platform session for one connection.
//!
//! `start` always opens a fresh handle (closing any previous one) and `stop`
//! is safe to call at any time, any number of times. The listeners are
//! polling tasks bound to the session's cancellation token, so they end
//! when the session is stopped or the connection goes away.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::platform::{Platform, PlatformConnector, RawMessage};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("platform session not started")]
    NotStarted,
}

struct ActiveSession {
    platform: Arc<dyn Platform>,
    cancel: CancellationToken,
}

pub struct SessionBridge {
    connector: Arc<dyn PlatformConnector>,
    active: Mutex<Option<ActiveSession>>,
}

impl SessionBridge {
    pub fn new(connector: Arc<dyn PlatformConnector>) -> Self {
        Self {
            connector,
            active: Mutex::new(None),
        }
    }

    /// Open a new platform session, replacing any existing one.
    pub async fn start(&self, parent: &CancellationToken) -> Result<Arc<dyn Platform>> {
        self.stop().await;
        let platform = self.connector.connect().await?;
        let previous = self.active.lock().unwrap().replace(ActiveSession {
            platform: Arc::clone(&platform),
            cancel: parent.child_token(),
        });
        // A concurrent start won the race; keep the newest handle only.
        if let Some(previous) = previous {
            previous.cancel.cancel();
            previous.platform.close().await;
        }
        Ok(platform)
    }

    /// Close the current session, if any.
    pub async fn stop(&self) {
        let active = self.active.lock().unwrap().take();
        if let Some(active) = active {
            active.cancel.cancel();
            active.platform.close().await;
            tracing::debug!("platform session stopped");
        }
    }

    pub fn platform(&self) -> Result<Arc<dyn Platform>, BridgeError> {
        self.active
            .lock()
            .unwrap()
            .as_ref()
            .map(|active| Arc::clone(&active.platform))
            .ok_or(BridgeError::NotStarted)
    }

    fn session(&self) -> Result<(Arc<dyn Platform>, CancellationToken), BridgeError> {
        self.active
            .lock()
            .unwrap()
            .as_ref()
            .map(|active| (Arc::clone(&active.platform), active.cancel.clone()))
            .ok_or(BridgeError::NotStarted)
    }

    /// Poll the login state every `interval`. The first value is sent
    /// immediately; the stream ends when the session is stopped or after
    /// the first error.
    pub fn listen_logged_in(&self, interval: Duration) -> Result<mpsc::Receiver<Result<bool>>, BridgeError> {
        let (platform, cancel) = self.session()?;
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let state = platform.is_logged_in().await;
                let failed = state.is_err();
                if tx.send(state).await.is_err() || failed {
                    break;
                }
            }
        });
        Ok(rx)
    }

    /// Poll for new messages every `interval`, yielding them one at a time
    /// in the order the platform returned them.
    pub fn listen_for_messages(
        &self,
        interval: Duration,
    ) -> Result<mpsc::Receiver<Result<RawMessage>>, BridgeError> {
        let (platform, cancel) = self.session()?;
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match platform.new_messages().await {
                    Ok(batch) => {
                        for message in batch {
                            if tx.send(Ok(message)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }
}
