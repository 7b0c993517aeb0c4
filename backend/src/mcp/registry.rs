//! Concurrent session registry.

use crate::mcp::handler::ProtocolEngine;
use crate::mcp::session::Session;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct RegistryInner {
    sessions: DashMap<String, Arc<Session>>,
    engine: Arc<dyn ProtocolEngine>,
    event_log_capacity: Option<usize>,
}

/// Maps session ids to live sessions.
///
/// Cheap to clone; all clones share the same map. Lookups hand out an
/// `Arc<Session>`, so no map shard lock is held across an await.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(engine: Arc<dyn ProtocolEngine>, event_log_capacity: Option<usize>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: DashMap::new(),
                engine,
                event_log_capacity,
            }),
        }
    }

    /// Create and register a new uninitialized session with a fresh id.
    pub fn create(&self) -> Arc<Session> {
        loop {
            let id = uuid::Uuid::new_v4().to_string();
            if let Entry::Vacant(entry) = self.inner.sessions.entry(id.clone()) {
                let session = Arc::new(Session::new(
                    id.clone(),
                    Arc::clone(&self.inner.engine),
                    self.inner.event_log_capacity,
                ));
                entry.insert(Arc::clone(&session));
                info!("MCP: Created new session {}", id);
                return session;
            }
        }
    }

    /// Look up a session by id.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    /// Remove a session. Removing an unknown id is a no-op.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.inner.sessions.remove(id).map(|(_, session)| session);
        if removed.is_some() {
            info!("MCP: Removed session {}", id);
        } else {
            debug!("MCP: Session {} already removed", id);
        }
        removed
    }

    /// Snapshot of all registered sessions.
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.inner
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Close and remove sessions abandoned for at least `max_idle`.
    ///
    /// Returns the number of sessions reclaimed.
    pub async fn reap_idle(&self, max_idle: Duration, drain_timeout: Duration) -> usize {
        let candidates: Vec<String> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| entry.value().is_abandoned(max_idle))
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = 0;
        for id in candidates {
            // Re-check under the shard lock; the client may have come back.
            let Some((_, session)) = self
                .inner
                .sessions
                .remove_if(&id, |_, session| session.is_abandoned(max_idle))
            else {
                continue;
            };
            info!(
                "Cleaning up idle MCP session: {} (idle: {}s, age: {}s)",
                id,
                session.idle_for().as_secs(),
                session.age_secs()
            );
            if let Err(e) = session.close(drain_timeout).await {
                warn!("MCP: {}", e);
            }
            reaped += 1;
        }
        reaped
    }

    /// Periodically reclaim abandoned sessions until `shutdown` is cancelled.
    pub async fn run_reaper(
        self,
        max_idle: Duration,
        drain_timeout: Duration,
        shutdown: CancellationToken,
    ) {
        let period = (max_idle / 2).max(Duration::from_millis(10));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("MCP session reaper shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let reaped = self.reap_idle(max_idle, drain_timeout).await;
                    if reaped > 0 {
                        debug!("MCP: Reaped {} idle sessions, {} remaining", reaped, self.len());
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }
}
