//! HTTP file server and read-only status API.
//!
//! Serves the blob directory under `/files` so QR codes and relayed media
//! resolve for IRC clients, plus a small health endpoint.

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use crate::server::SharedState;

/// Build the axum router.
pub fn router(state: Arc<SharedState>, files_dir: impl Into<PathBuf>) -> Router {
    Router::new()
        .route("/api/v1/health", get(api_health))
        .nest_service("/files", ServeDir::new(files_dir.into()))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: Arc<SharedState>, files_dir: impl Into<PathBuf>) -> anyhow::Result<()> {
    axum::serve(listener, router(state, files_dir)).await?;
    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    server_name: String,
    connections: usize,
    registered: usize,
    uptime_secs: u64,
}

async fn api_health(State(state): State<Arc<SharedState>>) -> Json<HealthResponse> {
    let (connections, registered) = {
        let connections = state.connections.lock().unwrap();
        (connections.len(), connections.values().filter(|nick| nick.is_some()).count())
    };
    Json(HealthResponse {
        server_name: state.config.server_name.clone(),
        connections,
        registered,
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}
