//! Event vocabulary shared between the reactor and the sockets it drives.
//!
//! Everything the reactor delivers is addressed by a `(SlotId, SocketUid)`
//! pair. Slots are reused, so the uid is what actually identifies a socket
//! object; every queue in this crate re-validates the pair before dispatch
//! and drops entries whose owner is gone.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::Reactor;

/// Process-unique socket identity.
///
/// Allocated once per socket object and never reused for the lifetime of the
/// process. Survives slot reuse and connection hand-off, which is why timers
/// and posted messages are keyed by it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketUid(u64);

impl SocketUid {
    /// Mints the next unused uid.
    pub fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value, for log attribution.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for SocketUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uid{}", self.0)
    }
}

impl fmt::Display for SocketUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index into the reactor's slot table.
///
/// Valid only together with the [`SocketUid`] that was captured when the
/// slot was assigned; a bare slot says nothing once the table entry has been
/// reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SlotId(pub(crate) u32);

impl SlotId {
    /// Slot position as an index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one timer family of a socket.
///
/// Kinds are defined by the owning crate; `delete_timer` cancels every
/// pending entry of a kind for one uid, so families must not be shared
/// between independent waits.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimerKind(pub u32);

/// Identifies one posted-message family of a socket.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MsgKind(pub u32);

/// Readiness classes delivered to a socket.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Readiness {
    /// Bytes may be available for reading.
    Readable,
    /// The socket accepts writes again.
    Writable,
    /// The peer closed or the connection failed.
    Closed,
    /// An inbound connection is waiting on a listening socket.
    ///
    /// Never produced by the OS translation layer here; listening sockets
    /// surface as `Readable` and their owner reposts this class once it has
    /// recognized the readiness as an accept.
    AcceptReady,
}

/// One readiness notification with an optional OS-level error.
#[derive(Clone, Copy, Debug)]
pub struct NetEvent {
    /// What kind of readiness this is.
    pub readiness: Readiness,
    /// OS error attached to the notification, when one is known.
    pub error: Option<io::ErrorKind>,
}

impl NetEvent {
    /// Plain event without an error.
    pub fn new(readiness: Readiness) -> Self {
        Self {
            readiness,
            error: None,
        }
    }

    /// Event carrying an error, used for failed connects and resets.
    pub fn with_error(readiness: Readiness, error: io::ErrorKind) -> Self {
        Self {
            readiness,
            error: Some(error),
        }
    }
}

/// A socket object drivable by the reactor.
///
/// All three callbacks run on the reactor thread, one at a time per process;
/// no additional synchronization is required between them. Implementations
/// receive the reactor handle so they can arm timers, post messages, or
/// repost synthetic readiness, and must not hold their own state lock while
/// doing so (see the crate docs on lock order).
pub trait ReactorSocket: Send + Sync {
    /// The socket's process-unique identity.
    fn uid(&self) -> SocketUid;

    /// Readiness notification for this socket.
    fn on_ready(&self, reactor: &Reactor, event: NetEvent);

    /// A timer armed by this socket expired.
    fn on_timer(&self, reactor: &Reactor, kind: TimerKind, payload: u64);

    /// A message posted to this socket arrived.
    fn on_message(&self, reactor: &Reactor, kind: MsgKind, payload: u64);
}

/// What to do with the socket object when a slot is released.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeregisterMode {
    /// Drop the table's reference; the object is reclaimed when the last
    /// outside reference goes away.
    Drop,
    /// Unlink only; the caller keeps the object alive and may re-register
    /// it later.
    Detach,
}

/// A timer queue entry, owned by [`crate::timer::TimerQueue`].
#[derive(Clone, Debug)]
pub(crate) struct TimerEntry {
    /// Owning slot; `None` marks an entry abandoned mid-dispatch.
    pub(crate) slot: Option<SlotId>,
    pub(crate) uid: SocketUid,
    pub(crate) deadline: Instant,
    pub(crate) kind: TimerKind,
    pub(crate) payload: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uids_are_unique_and_monotonic() {
        let a = SocketUid::fresh();
        let b = SocketUid::fresh();
        assert_ne!(a, b);
        assert!(b.value() > a.value());
    }

    #[test]
    fn net_event_constructors() {
        let plain = NetEvent::new(Readiness::Readable);
        assert_eq!(plain.readiness, Readiness::Readable);
        assert!(plain.error.is_none());

        let reset = NetEvent::with_error(Readiness::Closed, io::ErrorKind::ConnectionReset);
        assert_eq!(reset.error, Some(io::ErrorKind::ConnectionReset));
    }
}
