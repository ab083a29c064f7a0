//! Server state and TCP listener.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::blob::{BlobStore, FsBlobStore};
use crate::config::ServerConfig;
use crate::connection;
use crate::platform::PlatformConnector;
use crate::platform::http::HttpConnector;
use crate::retry::RetryPolicy;
use crate::store::{MemoryStore, SqliteStore, UserStore};
use crate::web;

/// Shared state accessible by all connection handlers.
pub struct SharedState {
    pub config: ServerConfig,
    pub connector: Arc<dyn PlatformConnector>,
    pub store: Arc<dyn UserStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub setup_retry: RetryPolicy,
    /// session_id -> nick (once registered)
    pub connections: Mutex<HashMap<String, Option<String>>>,
    pub started_at: Instant,
}

pub struct Server {
    config: ServerConfig,
    connector: Arc<dyn PlatformConnector>,
    store: Arc<dyn UserStore>,
    blobs: Arc<dyn BlobStore>,
    setup_retry: RetryPolicy,
}

impl Server {
    /// Build a server from configuration: sidecar platform, SQLite (or
    /// in-memory) records and the files directory.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let store: Arc<dyn UserStore> = match &config.db_path {
            Some(path) => {
                let store = SqliteStore::open(path).with_context(|| format!("Failed to open database: {path}"))?;
                let known = store.nicks().context("Failed to list stored users")?;
                tracing::info!(users = known.len(), "Opened user database at {path}");
                Arc::new(store)
            }
            None => {
                tracing::warn!("No --db-path given, user records will not survive a restart");
                Arc::new(MemoryStore::new())
            }
        };
        let blobs = Arc::new(
            FsBlobStore::new(&config.files_dir, &config.files_url)
                .with_context(|| format!("Failed to prepare files dir: {}", config.files_dir))?,
        );
        let connector = Arc::new(HttpConnector::new(&config.platform_url));
        Ok(Self::with_parts(config, connector, store, blobs))
    }

    /// Create a server with explicit collaborators (for testing).
    pub fn with_parts(
        config: ServerConfig,
        connector: Arc<dyn PlatformConnector>,
        store: Arc<dyn UserStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            config,
            connector,
            store,
            blobs,
            setup_retry: RetryPolicy::default(),
        }
    }

    pub fn with_setup_retry(mut self, policy: RetryPolicy) -> Self {
        self.setup_retry = policy;
        self
    }

    fn into_state(self) -> Arc<SharedState> {
        Arc::new(SharedState {
            config: self.config,
            connector: self.connector,
            store: self.store,
            blobs: self.blobs,
            setup_retry: self.setup_retry,
            connections: Mutex::new(HashMap::new()),
            started_at: Instant::now(),
        })
    }

    /// Run the server, blocking forever.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen_addr))?;
        tracing::info!("IRC listener on {}", self.config.listen_addr);

        let files_addr = self.config.files_addr.clone();
        let files_dir = self.config.files_dir.clone();
        let state = self.into_state();

        if let Some(addr) = files_addr {
            let web_state = Arc::clone(&state);
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("Failed to bind file server on {addr}"))?;
            tracing::info!("File server on {addr}, serving {files_dir}");
            tokio::spawn(async move {
                if let Err(e) = web::serve(listener, web_state, files_dir).await {
                    tracing::error!("File server error: {e}");
                }
            });
        }

        accept_loop(listener, state).await
    }

    /// Start the server and return the bound address + task handle (for testing).
    pub async fn start(self) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");
        let state = self.into_state();
        let handle = tokio::spawn(accept_loop(listener, state));
        Ok((addr, handle))
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<SharedState>) -> Result<()> {
    loop {
        let (stream, _addr) = listener.accept().await?;
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = connection::handle(stream, state).await {
                tracing::error!("Connection error: {e}");
            }
        });
    }
}
