//! Plumbing shared by both transfer directions: the messages a data
//! connection posts to its owning worker, timer identities, pause
//! bookkeeping, and the progress snapshots the owner polls.

use std::io;
use std::time::Duration;

use reactor::{MsgKind, Reactor, SlotId, SocketUid, TimerKind};
use tracing::trace;

/// The data stream reached the connected state.
pub const MSG_DATA_CONNECTED: MsgKind = MsgKind(netio::OWNER_MSG_BASE);
/// The data stream closed; poll the error and progress accessors.
pub const MSG_DATA_CLOSED: MsgKind = MsgKind(netio::OWNER_MSG_BASE + 1);
/// A flush buffer is ready for checkout via `give_flush_data`.
pub const MSG_FLUSH_DATA: MsgKind = MsgKind(netio::OWNER_MSG_BASE + 2);
/// The upload ran out of staged bytes; prepare the next batch.
pub const MSG_PREPARE_DATA: MsgKind = MsgKind(netio::OWNER_MSG_BASE + 3);
/// The stream is closed and every transfer byte has been handed over.
pub const MSG_TRANSFER_FINISHED: MsgKind = MsgKind(netio::OWNER_MSG_BASE + 4);
/// A listen endpoint is known (or failed); see `listen_endpoint`.
pub const MSG_LISTEN_READY: MsgKind = MsgKind(netio::OWNER_MSG_BASE + 5);

/// Periodic flush of a partially filled read buffer.
pub(crate) const TIMER_FLUSH: TimerKind = TimerKind(1);
/// No-data watchdog shared by both directions.
pub(crate) const TIMER_NO_DATA: TimerKind = TimerKind(2);

/// How often the no-data watchdog wakes up to look at the clock.
pub(crate) const NO_DATA_PERIOD: Duration = Duration::from_secs(10);

/// Identifies the worker socket that owns a transfer. Every message is
/// posted to this slot and validated against this uid; the payload carries
/// the data connection's own uid so a worker driving several transfers can
/// discard stale notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerTarget {
    /// Reactor slot the owner occupies.
    pub slot: SlotId,
    /// Uid the owner registered under.
    pub uid: SocketUid,
}

/// Reactor attachment captured at `bind` time so the connection can arm
/// timers and post messages from any thread.
#[derive(Clone)]
pub(crate) struct ConnBinding {
    pub(crate) reactor: Reactor,
    pub(crate) slot: SlotId,
}

/// Coarse life-cycle of a transfer, reported in the status snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransferPhase {
    /// Created but not dialing yet.
    #[default]
    Idle,
    /// Dialing, negotiating a proxy, or waiting for the peer to connect in.
    Connecting,
    /// The stream is up, or closed with bytes still being flushed.
    Transferring,
    /// The stream is closed and every byte has been handed over.
    Finished,
}

/// Readiness that arrived while the transfer was paused, replayed on
/// resume. A close supersedes pending reads and writes and keeps its error;
/// the close replay drains whatever those would have delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Postponed {
    #[default]
    None,
    Readable,
    Writable,
    Close(Option<io::ErrorKind>),
}

impl Postponed {
    pub(crate) fn note(&mut self, ev: Postponed) {
        match (*self, ev) {
            (Postponed::None, _) | (_, Postponed::Close(_)) => *self = ev,
            _ => {}
        }
    }
}

/// Point-in-time progress snapshot of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DownloadStatus {
    /// Where the transfer is in its life-cycle.
    pub phase: TransferPhase,
    /// Decompressed bytes received so far.
    pub downloaded: u64,
    /// Expected total, clamped so it never trails `downloaded`.
    pub total: u64,
    /// Time since the last byte moved.
    pub idle: Duration,
    /// Recent throughput in bytes per second.
    pub speed: u64,
}

/// Point-in-time progress snapshot of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UploadStatus {
    /// Where the transfer is in its life-cycle.
    pub phase: TransferPhase,
    /// Bytes handed to the transport so far, counted decompressed.
    pub uploaded: u64,
    /// Expected total, clamped so it never trails `uploaded`.
    pub total: u64,
    /// Time since the last byte moved.
    pub idle: Duration,
    /// Recent throughput in bytes per second.
    pub speed: u64,
}

/// Posts `kind` to the owner, payload set to the posting connection's uid.
/// Silently does nothing while no owner or no binding is attached.
pub(crate) fn post_to_owner(
    binding: Option<&ConnBinding>,
    owner: Option<OwnerTarget>,
    kind: MsgKind,
    from: SocketUid,
) {
    if let (Some(b), Some(t)) = (binding, owner) {
        if !b.reactor.post(t.slot, t.uid, kind, from.value()) {
            trace!(kind = kind.0, "owner post dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postponed_close_supersedes_reads_and_writes() {
        let mut p = Postponed::None;
        p.note(Postponed::Readable);
        assert_eq!(p, Postponed::Readable);
        p.note(Postponed::Writable);
        assert_eq!(p, Postponed::Readable);
        p.note(Postponed::Close(Some(io::ErrorKind::ConnectionReset)));
        assert_eq!(p, Postponed::Close(Some(io::ErrorKind::ConnectionReset)));
        p.note(Postponed::Readable);
        assert_eq!(p, Postponed::Close(Some(io::ErrorKind::ConnectionReset)));
    }
}
