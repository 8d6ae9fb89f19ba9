//! WebSocket connection tracking with force-close capability.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

/// Per-connection state: which session the client bound itself to.
struct ConnectionState {
    bound_session: RwLock<Option<String>>,
}

/// Tracks all active WebSocket connections.
///
/// Uses a hierarchical cancellation token so shutdown can force-close every
/// handler; after `close_all` a fresh token is installed and new connections
/// are accepted again.
pub struct WsConnectionManager {
    connections: DashMap<String, Arc<ConnectionState>>,
    next_id: AtomicU64,
    global_cancel: RwLock<CancellationToken>,
}

impl WsConnectionManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            global_cancel: RwLock::new(CancellationToken::new()),
        }
    }

    /// Registers a new connection and returns its RAII guard.
    pub fn register(self: &Arc<Self>) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn_id = format!("ws-{id}");
        let cancel_token = self.global_cancel.read().child_token();
        let state = Arc::new(ConnectionState {
            bound_session: RwLock::new(None),
        });
        self.connections.insert(conn_id.clone(), Arc::clone(&state));
        log::info!(
            "[WS] connection registered: {} (total: {})",
            conn_id,
            self.connections.len()
        );
        ConnectionGuard {
            id: conn_id,
            manager: Arc::clone(self),
            state,
            cancel_token,
        }
    }

    fn unregister(&self, id: &str) {
        if self.connections.remove(id).is_some() {
            log::info!(
                "[WS] connection unregistered: {} (remaining: {})",
                id,
                self.connections.len()
            );
        }
    }

    /// Number of active connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Signals every connection handler to terminate. Returns how many were
    /// signalled.
    pub fn close_all(&self) -> usize {
        let count = self.connections.len();
        if count > 0 {
            log::info!("[WS] force-closing {} connection(s)", count);
            let mut guard = self.global_cancel.write();
            guard.cancel();
            *guard = CancellationToken::new();
        }
        count
    }
}

impl Default for WsConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that unregisters a connection when dropped.
pub struct ConnectionGuard {
    id: String,
    manager: Arc<WsConnectionManager>,
    state: Arc<ConnectionState>,
    cancel_token: CancellationToken,
}

impl ConnectionGuard {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Binds the connection to a session for outbound filtering.
    pub fn bind_session(&self, session_id: &str) {
        *self.state.bound_session.write() = Some(session_id.to_string());
    }

    /// The session this connection is bound to, if any.
    #[must_use]
    pub fn bound_session(&self) -> Option<String> {
        self.state.bound_session.read().clone()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.manager.unregister(&self.id);
    }
}
