//! Platform adapter for a browser-automation sidecar.
//!
//! The sidecar drives the web client and exposes one REST resource per
//! browser session:
//!
//! - `POST /sessions` creates a session and returns its id
//! - `/sessions/{id}/...` reads and drives that session
//! - `DELETE /sessions/{id}` closes the browser

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{
    ChatId, LoginState, Me, Platform, PlatformConnector, Presence, RawChat, RawMessage,
    RawParticipant, SessionBlob,
};

const LOGIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct CreatedSession {
    id: String,
}

#[derive(Debug, Deserialize)]
struct OpenResponse {
    state: LoginState,
}

#[derive(Debug, Deserialize)]
struct LoginCode {
    code: String,
}

#[derive(Debug, Deserialize)]
struct LoggedIn {
    logged_in: bool,
}

#[derive(Debug, Serialize)]
struct Outgoing<'a> {
    chat: &'a ChatId,
    text: &'a str,
}

/// Opens sessions on the sidecar at `base_url`.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    base_url: String,
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl PlatformConnector for HttpConnector {
    async fn connect(&self) -> Result<Arc<dyn Platform>> {
        let url = format!("{}/sessions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("Failed to connect to platform sidecar")?;
        let created: CreatedSession = check(resp, "create session")
            .await?
            .json()
            .await
            .context("Failed to parse session response")?;
        tracing::debug!(session = %created.id, "platform session created");
        Ok(Arc::new(HttpPlatform {
            session_url: format!("{}/sessions/{}", self.base_url, created.id),
            client: self.client.clone(),
        }))
    }
}

/// One sidecar browser session.
pub struct HttpPlatform {
    session_url: String,
    client: reqwest::Client,
}

async fn check(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        bail!("platform {what} failed ({status}): {text}");
    }
    Ok(resp)
}

impl HttpPlatform {
    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.session_url)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let resp = self
            .client
            .get(self.url(path))
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {path}"))?;
        check(resp, path)
            .await?
            .json()
            .await
            .with_context(|| format!("Failed to parse {path} response"))
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<reqwest::Response> {
        let resp = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {path}"))?;
        check(resp, path).await
    }
}

#[async_trait]
impl Platform for HttpPlatform {
    async fn open(&self) -> Result<LoginState> {
        let resp: OpenResponse = self
            .post("open", &serde_json::json!({}))
            .await?
            .json()
            .await
            .context("Failed to parse open response")?;
        Ok(resp.state)
    }

    async fn login_code(&self) -> Result<String> {
        let code: LoginCode = self.get_json("login-code", &[]).await?;
        Ok(code.code)
    }

    async fn wait_login(&self) -> Result<()> {
        while !self.is_logged_in().await? {
            tokio::time::sleep(LOGIN_POLL_INTERVAL).await;
        }
        Ok(())
    }

    async fn set_local_storage(&self, blob: &SessionBlob) -> Result<()> {
        self.post("local-storage", blob).await?;
        Ok(())
    }

    async fn local_storage(&self) -> Result<SessionBlob> {
        self.get_json("local-storage", &[]).await
    }

    async fn me(&self) -> Result<Me> {
        self.get_json("me", &[]).await
    }

    async fn all_chats(&self) -> Result<Vec<RawChat>> {
        self.get_json("chats", &[]).await
    }

    async fn chat(&self, id: &ChatId) -> Result<RawChat> {
        self.get_json("chat", &[("chat", id.as_str())]).await
    }

    async fn participants(&self, chat: &ChatId) -> Result<Vec<RawParticipant>> {
        self.get_json("participants", &[("chat", chat.as_str())]).await
    }

    async fn messages_since(&self, chat: &ChatId, since: Option<i64>) -> Result<Vec<RawMessage>> {
        let since = since.map(|ts| ts.to_string());
        let mut query = vec![("chat", chat.as_str())];
        if let Some(since) = since.as_deref() {
            query.push(("since", since));
        }
        self.get_json("messages", &query).await
    }

    async fn presence(&self, chat: &ChatId) -> Result<Presence> {
        self.get_json("presence", &[("chat", chat.as_str())]).await
    }

    async fn send_message(&self, chat: &ChatId, text: &str) -> Result<()> {
        self.post("send", &Outgoing { chat, text }).await?;
        Ok(())
    }

    async fn download_media(&self, message: &RawMessage) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(self.url("media"))
            .query(&[("chat", message.chat.as_str()), ("message", message.id.as_str())])
            .send()
            .await
            .context("GET media")?;
        let bytes = check(resp, "media download")
            .await?
            .bytes()
            .await
            .context("Failed to read media body")?;
        Ok(bytes.to_vec())
    }

    async fn is_logged_in(&self) -> Result<bool> {
        let state: LoggedIn = self.get_json("logged-in", &[]).await?;
        Ok(state.logged_in)
    }

    async fn new_messages(&self) -> Result<Vec<RawMessage>> {
        self.get_json("new-messages", &[]).await
    }

    async fn close(&self) {
        match self.client.delete(&self.session_url).send().await {
            Ok(resp) if resp.status().is_success() || resp.status() == reqwest::StatusCode::NOT_FOUND => {}
            Ok(resp) => tracing::warn!(status = %resp.status(), "platform session close failed"),
            Err(e) => tracing::warn!("platform session close failed: {e}"),
        }
    }
}
