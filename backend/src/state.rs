//! Application state management.

use crate::config::TransportSettings;
use crate::mcp::{LifecycleCoordinator, McpHandler, ProtocolEngine, SessionRegistry};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// Live MCP sessions
    sessions: SessionRegistry,
    /// Transport tuning
    settings: TransportSettings,
    /// Cancelled once shutdown begins
    shutdown: CancellationToken,
}

impl AppState {
    /// Create application state serving `engine` with the given transport settings.
    pub fn new(engine: Arc<dyn ProtocolEngine>, settings: TransportSettings) -> Self {
        let sessions = SessionRegistry::new(engine, settings.event_log_capacity);
        Self {
            inner: Arc::new(AppStateInner {
                sessions,
                settings,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.inner.settings
    }

    /// Coordinator that shuts down every session of this state.
    pub fn lifecycle(&self) -> LifecycleCoordinator {
        LifecycleCoordinator::new(
            self.inner.sessions.clone(),
            self.inner.shutdown.clone(),
            self.inner.settings.drain_timeout(),
            self.inner.settings.shutdown_timeout(),
        )
    }

    /// Start reclaiming abandoned sessions in the background.
    ///
    /// Returns `None` when idle reclamation is disabled. The task ends once
    /// shutdown begins.
    pub fn spawn_reaper(&self) -> Option<JoinHandle<()>> {
        let max_idle = self.inner.settings.session_idle_timeout()?;
        info!("MCP: Reclaiming sessions idle for {:?}", max_idle);
        Some(tokio::spawn(self.inner.sessions.clone().run_reaper(
            max_idle,
            self.inner.settings.drain_timeout(),
            self.inner.shutdown.clone(),
        )))
    }

    /// Whether the server has begun shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(
            Arc::new(McpHandler::new("relay")),
            TransportSettings::default(),
        )
    }
}
