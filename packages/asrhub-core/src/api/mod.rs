//! Transport layer: HTTP + SSE, WebSocket, Socket.IO and Redis adapters.
//!
//! Handlers are thin: every adapter normalizes its inbound payloads into
//! canonical actions for the effects layer and encodes outbound events from
//! the shared broadcast channel. Business logic lives behind the store.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;

use crate::config::HubConfig;
use crate::effects::SessionEffects;
use crate::events::EventBridge;
use crate::provider::ProviderPool;
use crate::store::StateStore;

pub mod http;
pub mod redis;
pub mod socketio;
pub mod ws;
pub mod ws_connection;

pub use ws_connection::WsConnectionManager;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind the listen address.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// I/O failure while serving.
    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared application state for the API layer.
#[derive(Clone)]
pub struct AppState {
    pub effects: Arc<SessionEffects>,
    pub store: Arc<StateStore>,
    pub bridge: Arc<EventBridge>,
    pub config: Arc<HubConfig>,
    pub ws_manager: Arc<WsConnectionManager>,
    /// Pools surfaced through the health endpoint.
    pub pools: Vec<Arc<ProviderPool>>,
}

/// Binds the configured address and serves the router until shutdown.
pub async fn start_server(state: AppState) -> Result<(), ServerError> {
    let addr: SocketAddr = format!(
        "{}:{}",
        state.config.transports.api_host, state.config.transports.api_port
    )
    .parse()
    .map_err(|err| {
        ServerError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid bind address: {err}"),
        ))
    })?;

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;

    log::info!("Server listening on http://{addr}");
    let app = http::create_router(state);
    axum::serve(listener, app).await?;
    Ok(())
}
