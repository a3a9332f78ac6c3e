//! Sinks and the per-connection writing handle.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use crate::line::{LineKind, SessionLine};

/// Receives session lines from connections.
///
/// Sinks are shared across connections as `Arc<dyn SessionSink>` and called
/// from the reactor thread, so `append` must be cheap and must never block
/// on anything slower than a short mutex hold.
pub trait SessionSink: Send + Sync {
    /// Appends one line to the log.
    fn append(&self, line: SessionLine);
}

/// Capped in-memory sink.
///
/// Keeps the newest `capacity` lines and silently drops the oldest once the
/// cap is reached, so a long-running session cannot grow without bound.
///
/// ```
/// use logging::{LineKind, MemorySink, SessionLine, SessionSink};
///
/// let sink = MemorySink::new(2);
/// for n in 0..3 {
///     sink.append(SessionLine::new(LineKind::Info, 1, format!("note {n}")));
/// }
/// let lines = sink.snapshot();
/// assert_eq!(lines.len(), 2);
/// assert_eq!(lines[0].text, "note 1");
/// assert_eq!(lines[1].text, "note 2");
/// ```
pub struct MemorySink {
    capacity: usize,
    lines: Mutex<VecDeque<SessionLine>>,
}

/// Lines a [`MemorySink`] keeps when built with [`MemorySink::default`].
const DEFAULT_CAPACITY: usize = 1000;

impl MemorySink {
    /// Creates a sink keeping at most `capacity` lines. A capacity of zero
    /// is clamped to one so the most recent line always survives.
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            lines: Mutex::new(VecDeque::new()),
        })
    }

    /// Copies the retained lines, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SessionLine> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Number of retained lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no lines are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all retained lines.
    pub fn clear(&self) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            lines: Mutex::new(VecDeque::new()),
        }
    }
}

impl SessionSink for MemorySink {
    fn append(&self, line: SessionLine) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.push_back(line);
        while lines.len() > self.capacity {
            lines.pop_front();
        }
    }
}

/// A connection's writing end of a shared sink.
///
/// Stamps the connection id on every line, so one sink can serve any number
/// of connections and their transcripts stay separable.
#[derive(Clone)]
pub struct SessionLog {
    sink: Arc<dyn SessionSink>,
    conn: u64,
}

impl SessionLog {
    /// Pairs a sink with a connection identity.
    #[must_use]
    pub fn new(sink: Arc<dyn SessionSink>, conn: u64) -> Self {
        Self { sink, conn }
    }

    /// The connection identity stamped on emitted lines.
    #[must_use]
    pub fn conn(&self) -> u64 {
        self.conn
    }

    /// Records a command sent to the server. The caller masks passwords
    /// before logging.
    pub fn command(&self, text: impl Into<String>) {
        self.push(LineKind::Command, text);
    }

    /// Records a reply line received from the server.
    pub fn reply(&self, text: impl Into<String>) {
        self.push(LineKind::Reply, text);
    }

    /// Records a connection or protocol error.
    pub fn error(&self, text: impl Into<String>) {
        self.push(LineKind::Error, text);
    }

    /// Records a bookkeeping note.
    pub fn info(&self, text: impl Into<String>) {
        self.push(LineKind::Info, text);
    }

    fn push(&self, kind: LineKind, text: impl Into<String>) {
        self.sink.append(SessionLine::new(kind, self.conn, text));
    }
}
