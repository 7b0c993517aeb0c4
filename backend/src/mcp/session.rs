//! MCP session management.
//!
//! A session is one logical client across many HTTP requests. It owns its
//! event log, at most one live SSE stream, and the protocol engine it was
//! bound to when it was created.

use crate::mcp::event_log::{EventLog, EventLogError, LogEntry};
use crate::mcp::handler::ProtocolEngine;
use futures::stream::{self, Stream};
use parking_lot::Mutex;
use relay_types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Entries pulled from the log per wake-up of a live stream.
const STREAM_BATCH: usize = 64;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, initialize request still being processed.
    Uninitialized,
    /// Initialized; accepts requests and streams.
    Active,
    /// Termination requested; draining in-flight work.
    Closing,
    /// Terminal.
    Closed,
}

/// Error type for session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session {id} is not active ({state:?})")]
    NotActive { id: String, state: SessionState },

    #[error("Session {id} is gone")]
    Gone { id: String },

    #[error("Session {id} did not drain within {timeout:?} ({pending} requests in flight)")]
    DrainTimeout {
        id: String,
        timeout: Duration,
        pending: usize,
    },

    #[error(transparent)]
    EventLog(#[from] EventLogError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The currently attached live stream.
struct StreamSlot {
    attachment: u64,
    cancel: CancellationToken,
}

/// An MCP session.
pub struct Session {
    id: String,
    created_at: Instant,
    last_active: Mutex<Instant>,
    engine: Arc<dyn ProtocolEngine>,
    state: Mutex<SessionState>,
    log: EventLog,
    stream: Mutex<Option<StreamSlot>>,
    next_attachment: AtomicU64,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("events", &self.log.latest())
            .field("streaming", &self.has_stream())
            .finish()
    }
}

impl Session {
    /// Create a new, uninitialized session bound to `engine`.
    pub(crate) fn new(
        id: String,
        engine: Arc<dyn ProtocolEngine>,
        event_log_capacity: Option<usize>,
    ) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            last_active: Mutex::new(Instant::now()),
            engine,
            state: Mutex::new(SessionState::Uninitialized),
            log: EventLog::new(event_log_capacity),
            stream: Mutex::new(None),
            next_attachment: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    /// Unique session identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Get the session age in seconds.
    pub fn age_secs(&self) -> u64 {
        self.created_at.elapsed().as_secs()
    }

    /// Time since the last request, stream attach, or stream end.
    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// Whether the session can be reclaimed as abandoned: no live stream, no
    /// request in flight, and no client activity for `max_idle`.
    pub fn is_abandoned(&self, max_idle: Duration) -> bool {
        !self.has_stream() && self.in_flight() == 0 && self.idle_for() >= max_idle
    }

    /// Read access to the session's event log.
    pub fn event_log(&self) -> &EventLog {
        &self.log
    }

    /// Number of requests currently being processed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Mark the session as initialized.
    pub fn activate(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        match *state {
            SessionState::Uninitialized => {
                *state = SessionState::Active;
                debug!("MCP session {} marked as active", self.id);
                Ok(())
            }
            SessionState::Active => Ok(()),
            other => Err(SessionError::NotActive {
                id: self.id.clone(),
                state: other,
            }),
        }
    }

    /// Register the initialize request as in-flight work.
    pub fn begin_initialize(self: &Arc<Self>) -> Result<RequestGuard, SessionError> {
        self.begin(SessionState::Uninitialized)
    }

    /// Register a regular request as in-flight work.
    ///
    /// Fails unless the session is active, so requests that race a DELETE are
    /// rejected instead of running against a closing session.
    pub fn begin_request(self: &Arc<Self>) -> Result<RequestGuard, SessionError> {
        self.begin(SessionState::Active)
    }

    fn begin(self: &Arc<Self>, required: SessionState) -> Result<RequestGuard, SessionError> {
        let state = self.state.lock();
        if *state != required {
            return Err(SessionError::NotActive {
                id: self.id.clone(),
                state: *state,
            });
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.touch();
        Ok(RequestGuard {
            session: Arc::clone(self),
        })
    }

    /// Run a request through the bound protocol engine.
    pub async fn handle(
        self: &Arc<Self>,
        request: JsonRpcRequest,
    ) -> anyhow::Result<Option<JsonRpcResponse>> {
        self.engine
            .handle(SessionHandle::new(self), request)
            .await
    }

    /// Append a serialized message to the event log.
    ///
    /// Attached streams pick it up immediately; otherwise it waits for replay.
    pub fn push(&self, payload: impl Into<Arc<str>>) -> Result<u64, SessionError> {
        let state = self.state.lock();
        if *state != SessionState::Active {
            return Err(SessionError::NotActive {
                id: self.id.clone(),
                state: *state,
            });
        }
        Ok(self.log.append(payload))
    }

    /// Whether a live stream is attached.
    pub fn has_stream(&self) -> bool {
        self.stream.lock().is_some()
    }

    /// Attach a live stream.
    ///
    /// With `last_event_id` the stream first replays every entry after it and
    /// then continues live; without it delivery starts at the current tail.
    /// A previously attached stream is closed first.
    pub fn attach_stream(
        self: &Arc<Self>,
        last_event_id: Option<u64>,
        idle_timeout: Option<Duration>,
    ) -> Result<impl Stream<Item = LogEntry> + Send + 'static, SessionError> {
        let cancel = CancellationToken::new();
        let attachment = self.next_attachment.fetch_add(1, Ordering::SeqCst);
        let (tip, cursor) = {
            let state = self.state.lock();
            if *state != SessionState::Active {
                return Err(SessionError::NotActive {
                    id: self.id.clone(),
                    state: *state,
                });
            }

            // Appends take the state lock, so none can slip between the
            // subscription and the cursor.
            let tip = self.log.subscribe();
            let cursor = match last_event_id {
                Some(id) => {
                    self.log.check_cursor(id)?;
                    id
                }
                None => self.log.latest(),
            };

            let mut slot = self.stream.lock();
            if let Some(previous) = slot.take() {
                info!(
                    "MCP: Replacing stream {} of session {}",
                    previous.attachment, self.id
                );
                previous.cancel.cancel();
            }
            *slot = Some(StreamSlot {
                attachment,
                cancel: cancel.clone(),
            });
            (tip, cursor)
        };
        self.touch();

        let cursor_state = LiveCursor {
            lease: StreamLease {
                session: Arc::downgrade(self),
                attachment,
            },
            session: Arc::clone(self),
            cursor,
            pending: VecDeque::new(),
            tip,
            cancel,
            idle_timeout,
        };

        Ok(stream::unfold(cursor_state, |mut live| async move {
            live.next_entry().await.map(|entry| (entry, live))
        }))
    }

    /// Close the live stream, if any. Returns whether one was attached.
    pub fn close_stream(&self) -> bool {
        match self.stream.lock().take() {
            Some(slot) => {
                slot.cancel.cancel();
                debug!(
                    "MCP: Closed stream {} of session {}",
                    slot.attachment, self.id
                );
                true
            }
            None => false,
        }
    }

    /// Release the stream slot when the stream it belongs to ends.
    fn release_stream(&self, attachment: u64) {
        let mut slot = self.stream.lock();
        if slot.as_ref().map(|s| s.attachment) == Some(attachment) {
            *slot = None;
            self.touch();
            debug!("MCP: Stream {} of session {} released", attachment, self.id);
        }
    }

    /// Move to `Closing`, close the live stream, wait for in-flight requests,
    /// then move to `Closed`.
    ///
    /// Closing an already closing or closed session is a no-op. If draining
    /// exceeds `drain_timeout` the session is closed anyway and the timeout is
    /// reported as an error.
    pub async fn close(&self, drain_timeout: Duration) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock();
            match *state {
                SessionState::Closing | SessionState::Closed => return Ok(()),
                _ => *state = SessionState::Closing,
            }
        }
        self.close_stream();

        let drained = tokio::time::timeout(drain_timeout, self.wait_drained()).await;
        *self.state.lock() = SessionState::Closed;

        match drained {
            Ok(()) => {
                info!("MCP: Session {} closed", self.id);
                Ok(())
            }
            Err(_) => Err(SessionError::DrainTimeout {
                id: self.id.clone(),
                timeout: drain_timeout,
                pending: self.in_flight(),
            }),
        }
    }

    /// Close immediately without draining.
    pub fn close_now(&self) {
        *self.state.lock() = SessionState::Closed;
        self.close_stream();
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Marks one request as in flight for the lifetime of the guard.
pub struct RequestGuard {
    session: Arc<Session>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if self.session.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.session.drained.notify_waiters();
        }
    }
}

/// Frees the session's stream slot when the stream is dropped, whether it
/// ended on its own or the client went away.
struct StreamLease {
    session: Weak<Session>,
    attachment: u64,
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.release_stream(self.attachment);
        }
    }
}

/// State of one attached stream.
struct LiveCursor {
    // Declared first so the slot is released before the session handle drops.
    lease: StreamLease,
    session: Arc<Session>,
    /// Last delivered sequence.
    cursor: u64,
    pending: VecDeque<LogEntry>,
    tip: watch::Receiver<u64>,
    cancel: CancellationToken,
    idle_timeout: Option<Duration>,
}

impl LiveCursor {
    async fn next_entry(&mut self) -> Option<LogEntry> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }

            if let Some(entry) = self.pending.pop_front() {
                self.cursor = entry.sequence;
                return Some(entry);
            }

            match self.session.log.read_after(self.cursor, STREAM_BATCH) {
                Ok(batch) if !batch.is_empty() => {
                    self.pending.extend(batch);
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        "MCP: Stream {} of session {} fell behind: {}",
                        self.lease.attachment, self.session.id, e
                    );
                    return None;
                }
            }

            let idle_timeout = self.idle_timeout;
            let idle = async move {
                match idle_timeout {
                    Some(timeout) => tokio::time::sleep(timeout).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                changed = self.tip.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = idle => {
                    info!(
                        "MCP: Reclaiming idle stream {} of session {}",
                        self.lease.attachment, self.session.id
                    );
                    return None;
                }
            }
        }
    }
}

/// A handle given to the protocol engine for one session.
///
/// Holds a weak reference, so a handle kept by a tool does not keep a
/// terminated session alive.
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    session: Weak<Session>,
}

impl SessionHandle {
    pub(crate) fn new(session: &Arc<Session>) -> Self {
        Self {
            id: session.id.clone(),
            session: Arc::downgrade(session),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.id
    }

    /// Current session state, `Closed` if the session is gone.
    pub fn state(&self) -> SessionState {
        self.session
            .upgrade()
            .map(|s| s.state())
            .unwrap_or(SessionState::Closed)
    }

    /// Push a JSON-RPC notification to the client over the event stream.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<u64, SessionError> {
        let notification = JsonRpcNotification::new(method, params);
        let payload = serde_json::to_string(&notification)?;
        self.push_raw(payload)
    }

    /// Push an already serialized message.
    pub fn push_raw(&self, payload: impl Into<Arc<str>>) -> Result<u64, SessionError> {
        let session = self.session.upgrade().ok_or_else(|| SessionError::Gone {
            id: self.id.clone(),
        })?;
        session.push(payload)
    }
}
