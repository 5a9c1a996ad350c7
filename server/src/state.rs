use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::WsConfig;
use crate::ws::ConnectionRegistry;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Registered WebSocket connections, one per user
    pub registry: ConnectionRegistry,
    /// WebSocket endpoint settings
    pub ws: Arc<WsConfig>,
    /// Cancelled once when the server begins shutting down
    pub shutdown: CancellationToken,
    /// Every connection actor, registered or not
    pub connections: TaskTracker,
}

impl AppState {
    pub fn new(registry: ConnectionRegistry, ws: WsConfig) -> Self {
        Self {
            registry,
            ws: Arc::new(ws),
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
        }
    }

    /// Tell every connection actor to send its close frame and stop.
    /// Returns how many actors were still running.
    pub fn begin_shutdown(&self) -> usize {
        self.connections.close();
        self.shutdown.cancel();
        self.connections.len()
    }

    /// Wait for the connection actors to finish, up to `limit`.
    /// Returns false if some were still running when the limit expired.
    pub async fn drain_connections(&self, limit: Duration) -> bool {
        self.connections.close();
        tokio::time::timeout(limit, self.connections.wait())
            .await
            .is_ok()
    }
}
