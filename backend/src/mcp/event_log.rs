//! Per-session append-only event log.
//!
//! Every server-initiated message for a session is appended here before it is
//! delivered. Streams read the log through a cursor (the last sequence number
//! they delivered), so a stream that detaches and reattaches with
//! `Last-Event-ID` resumes exactly where it left off.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;

/// Maximum number of entries handed out per read.
const READ_BATCH: usize = 64;

/// A single logged message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Position in the session log, starting at 1.
    pub sequence: u64,
    /// Serialized JSON-RPC message.
    pub payload: Arc<str>,
}

/// Error type for event log reads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventLogError {
    #[error("Events after {requested} are no longer available (oldest retained: {oldest})")]
    Evicted { requested: u64, oldest: u64 },

    #[error("Event {requested} has not been produced yet (latest: {latest})")]
    Ahead { requested: u64, latest: u64 },
}

struct LogInner {
    entries: VecDeque<LogEntry>,
    next_sequence: u64,
}

/// Ordered, replayable buffer of outbound messages for one session.
pub struct EventLog {
    inner: Mutex<LogInner>,
    /// Latest appended sequence; wakes attached streams.
    tip: watch::Sender<u64>,
    /// Retention cap; `None` keeps every entry.
    capacity: Option<usize>,
}

impl EventLog {
    /// Create an empty log.
    ///
    /// A capacity of `Some(0)` is treated as unbounded.
    pub fn new(capacity: Option<usize>) -> Self {
        let (tip, _) = watch::channel(0);
        Self {
            inner: Mutex::new(LogInner {
                entries: VecDeque::new(),
                next_sequence: 1,
            }),
            tip,
            capacity: capacity.filter(|c| *c > 0),
        }
    }

    /// Append a payload and return its sequence number.
    ///
    /// Only the owning session appends, so this is not public outside `mcp`.
    pub(super) fn append(&self, payload: impl Into<Arc<str>>) -> u64 {
        let mut inner = self.inner.lock();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.entries.push_back(LogEntry {
            sequence,
            payload: payload.into(),
        });

        if let Some(capacity) = self.capacity {
            while inner.entries.len() > capacity {
                inner.entries.pop_front();
            }
        }

        // Published under the lock so readers never see the tip ahead of the entries.
        self.tip.send_replace(sequence);
        sequence
    }

    /// Sequence of the most recent entry, or 0 when nothing was appended.
    pub fn latest(&self) -> u64 {
        self.inner.lock().next_sequence - 1
    }

    /// Sequence of the oldest entry still retained.
    pub fn oldest_retained(&self) -> Option<u64> {
        self.inner.lock().entries.front().map(|e| e.sequence)
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Watch the latest sequence number. Used by live streams to wait for appends.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tip.subscribe()
    }

    /// Check that a stream may resume after `cursor`.
    pub fn check_cursor(&self, cursor: u64) -> Result<(), EventLogError> {
        let inner = self.inner.lock();
        Self::validate(&inner, cursor)
    }

    /// Read up to `max` entries with a sequence strictly greater than `cursor`.
    pub fn read_after(&self, cursor: u64, max: usize) -> Result<Vec<LogEntry>, EventLogError> {
        let inner = self.inner.lock();
        Self::validate(&inner, cursor)?;

        let Some(front) = inner.entries.front() else {
            return Ok(Vec::new());
        };
        // Entries are contiguous, so the index follows from the sequence.
        let start = (cursor + 1).saturating_sub(front.sequence) as usize;
        Ok(inner.entries.iter().skip(start).take(max).cloned().collect())
    }

    /// Replay every entry after `last_seen`, in order.
    ///
    /// The replay is lazy and bounded by the entries present when it was
    /// created. Call again with a new cursor to restart.
    pub fn replay_from(&self, last_seen: u64) -> Result<Replay<'_>, EventLogError> {
        self.check_cursor(last_seen)?;
        Ok(Replay {
            log: self,
            cursor: last_seen,
            end: self.latest(),
            buffer: VecDeque::new(),
            truncated: false,
        })
    }

    fn validate(inner: &LogInner, cursor: u64) -> Result<(), EventLogError> {
        let latest = inner.next_sequence - 1;
        if cursor > latest {
            return Err(EventLogError::Ahead {
                requested: cursor,
                latest,
            });
        }
        if let Some(front) = inner.entries.front() {
            if cursor + 1 < front.sequence {
                return Err(EventLogError::Evicted {
                    requested: cursor,
                    oldest: front.sequence,
                });
            }
        }
        Ok(())
    }
}

/// Lazy iterator over a backlog of log entries.
pub struct Replay<'a> {
    log: &'a EventLog,
    cursor: u64,
    end: u64,
    buffer: VecDeque<LogEntry>,
    truncated: bool,
}

impl Replay<'_> {
    /// Sequence of the last entry yielded (or the starting cursor).
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Whether entries were evicted while the replay was in progress.
    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

impl Iterator for Replay<'_> {
    type Item = LogEntry;

    fn next(&mut self) -> Option<LogEntry> {
        if self.buffer.is_empty() {
            if self.cursor >= self.end || self.truncated {
                return None;
            }
            match self.log.read_after(self.cursor, READ_BATCH) {
                Ok(batch) => self.buffer.extend(batch),
                Err(_) => {
                    self.truncated = true;
                    return None;
                }
            }
        }

        let entry = self.buffer.pop_front()?;
        if entry.sequence > self.end {
            self.buffer.clear();
            return None;
        }
        self.cursor = entry.sequence;
        Some(entry)
    }
}
