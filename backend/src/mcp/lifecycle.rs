//! Server-wide shutdown of MCP sessions.

use crate::mcp::registry::SessionRegistry;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Outcome of a shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub sessions_closed: usize,
    pub streams_closed: usize,
    /// Sessions that did not close cleanly (drain timeout or task failure).
    pub failures: usize,
    /// Whether the overall budget ran out and remaining sessions were forced closed.
    pub timed_out: bool,
}

#[derive(Default)]
struct Counters {
    sessions: AtomicUsize,
    streams: AtomicUsize,
    failures: AtomicUsize,
}

/// Coordinates server shutdown across all sessions.
#[derive(Clone)]
pub struct LifecycleCoordinator {
    sessions: SessionRegistry,
    shutdown: CancellationToken,
    drain_timeout: Duration,
    budget: Duration,
}

impl LifecycleCoordinator {
    pub fn new(
        sessions: SessionRegistry,
        shutdown: CancellationToken,
        drain_timeout: Duration,
        budget: Duration,
    ) -> Self {
        Self {
            sessions,
            shutdown,
            drain_timeout,
            budget,
        }
    }

    /// Whether shutdown has begun. New sessions are refused from then on.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop accepting sessions, then close every session and stream.
    ///
    /// Sessions are closed concurrently. A session that fails to close is
    /// counted and logged; the others still close. Whatever is left when the
    /// budget runs out is closed without draining.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutdown.cancel();

        let sessions = self.sessions.all();
        info!("MCP: Shutting down {} sessions", sessions.len());

        let counters = Arc::new(Counters::default());
        let mut tasks = JoinSet::new();
        for session in sessions {
            let registry = self.sessions.clone();
            let counters = Arc::clone(&counters);
            let drain_timeout = self.drain_timeout;
            tasks.spawn(async move {
                if session.close_stream() {
                    counters.streams.fetch_add(1, Ordering::SeqCst);
                }
                match session.close(drain_timeout).await {
                    Ok(()) => {
                        counters.sessions.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => {
                        warn!("MCP: Failed to close session {}: {}", session.id(), e);
                        counters.failures.fetch_add(1, Ordering::SeqCst);
                    }
                }
                registry.remove(session.id());
            });
        }

        let joined = tokio::time::timeout(self.budget, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    warn!("MCP: Session close task failed: {}", e);
                    counters.failures.fetch_add(1, Ordering::SeqCst);
                }
            }
        })
        .await;

        let timed_out = joined.is_err();
        if timed_out {
            warn!(
                "MCP: Shutdown budget of {:?} exceeded, forcing remaining sessions closed",
                self.budget
            );
            tasks.abort_all();
        }

        // Anything still registered was aborted or raced in before the token flipped.
        for session in self.sessions.all() {
            if session.close_stream() {
                counters.streams.fetch_add(1, Ordering::SeqCst);
            }
            session.close_now();
            self.sessions.remove(session.id());
            counters.failures.fetch_add(1, Ordering::SeqCst);
        }

        let report = ShutdownReport {
            sessions_closed: counters.sessions.load(Ordering::SeqCst),
            streams_closed: counters.streams.load(Ordering::SeqCst),
            failures: counters.failures.load(Ordering::SeqCst),
            timed_out,
        };
        info!(
            "MCP: Shutdown complete ({} sessions closed, {} streams closed, {} failures)",
            report.sessions_closed, report.streams_closed, report.failures
        );
        report
    }
}
