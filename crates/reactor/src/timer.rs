//! Deadline-ordered timer queue.
//!
//! # Overview
//!
//! Timers live in one flat vector ordered by absolute deadline; entries with
//! equal deadlines keep their insertion order (a new entry goes *after* the
//! last equal one). The reactor loop derives its poll timeout from the head
//! entry and dispatches the due prefix on each pass.
//!
//! # Invariants
//!
//! - While a dispatch pass is running, the due prefix is *protected*: new
//!   entries are inserted behind it (so one pass can never re-process its own
//!   insertions) and deletions inside it abandon the entry in place instead
//!   of shifting indices. The whole prefix is drained at the end of the pass.
//! - Entries are keyed by owner uid, not slot: a socket whose slot changed
//!   between arming and expiry is still found by a sequential uid scan at
//!   dispatch time.

use std::time::{Duration, Instant};

use crate::event::{SlotId, SocketUid, TimerEntry, TimerKind};

/// Outcome of an insertion, telling the caller whether the poll timeout has
/// to be re-derived.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Armed {
    /// The new entry became the earliest deadline.
    NewHead,
    /// An earlier entry still leads; no wakeup needed.
    Queued,
}

/// The timer queue. Single instance per reactor, guarded by the reactor's
/// state lock.
#[derive(Default)]
pub(crate) struct TimerQueue {
    entries: Vec<TimerEntry>,
    /// `Some(n)` while the first `n` entries are being dispatched.
    protected: Option<usize>,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Number of pending entries, abandoned ones included.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Deadline of the earliest pending entry.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|e| e.deadline)
    }

    /// Inserts a timer for `(slot, uid)`.
    ///
    /// The insertion point is found by binary search among entries at or
    /// behind the protected prefix, after every entry with the same
    /// deadline.
    pub(crate) fn insert(
        &mut self,
        slot: SlotId,
        uid: SocketUid,
        deadline: Instant,
        kind: TimerKind,
        payload: u64,
    ) -> Armed {
        let floor = self.protected.unwrap_or(0);
        let tail = &self.entries[floor..];
        let at = floor + tail.partition_point(|e| e.deadline <= deadline);
        self.entries.insert(
            at,
            TimerEntry {
                slot: Some(slot),
                uid,
                deadline,
                kind,
                payload,
            },
        );
        if at == 0 { Armed::NewHead } else { Armed::Queued }
    }

    /// Removes every entry matching `(uid, kind)`.
    ///
    /// Entries inside the protected prefix are abandoned in place (slot
    /// cleared) so that dispatch indices stay valid; the drain at the end of
    /// the pass reclaims them. Returns the number of entries cancelled.
    pub(crate) fn remove(&mut self, uid: SocketUid, kind: TimerKind) -> usize {
        let protected = self.protected.unwrap_or(0);
        let mut cancelled = 0;
        let mut i = self.entries.len();
        while i > 0 {
            i -= 1;
            let e = &self.entries[i];
            if e.uid != uid || e.kind != kind || e.slot.is_none() {
                continue;
            }
            cancelled += 1;
            if i < protected {
                self.entries[i].slot = None;
            } else {
                self.entries.remove(i);
            }
        }
        cancelled
    }

    /// Removes every entry owned by `uid`, any kind. Used when a socket is
    /// deregistered for good.
    pub(crate) fn remove_all_for(&mut self, uid: SocketUid) -> usize {
        let protected = self.protected.unwrap_or(0);
        let mut cancelled = 0;
        let mut i = self.entries.len();
        while i > 0 {
            i -= 1;
            let e = &self.entries[i];
            if e.uid != uid || e.slot.is_none() {
                continue;
            }
            cancelled += 1;
            if i < protected {
                self.entries[i].slot = None;
            } else {
                self.entries.remove(i);
            }
        }
        cancelled
    }

    /// Marks the due prefix protected and returns its length.
    ///
    /// Must be balanced by [`Self::end_dispatch`]. Nested dispatch is a
    /// logic error.
    pub(crate) fn begin_dispatch(&mut self, now: Instant) -> usize {
        debug_assert!(self.protected.is_none(), "timer dispatch re-entered");
        let due = self.entries.partition_point(|e| e.deadline <= now);
        self.protected = Some(due);
        due
    }

    /// Snapshot of one protected entry, `None` when it was abandoned.
    pub(crate) fn protected_entry(&self, i: usize) -> Option<(SlotId, SocketUid, TimerKind, u64)> {
        let e = self.entries.get(i)?;
        let slot = e.slot?;
        Some((slot, e.uid, e.kind, e.payload))
    }

    /// Drains the protected prefix and reopens the queue.
    pub(crate) fn end_dispatch(&mut self) {
        if let Some(n) = self.protected.take() {
            self.entries.drain(..n);
        }
    }

    /// True when the head entry has been due for at least `grace`.
    ///
    /// Used by the loop's starvation guard: a busy readiness stream must not
    /// keep due timers waiting indefinitely.
    pub(crate) fn starving(&self, now: Instant, grace: Duration) -> bool {
        self.entries
            .first()
            .is_some_and(|e| now.saturating_duration_since(e.deadline) >= grace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn slot(n: u32) -> SlotId {
        SlotId(n)
    }

    const KIND_A: TimerKind = TimerKind(1);
    const KIND_B: TimerKind = TimerKind(2);

    #[test]
    fn equal_deadlines_keep_insertion_order() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        let u1 = SocketUid::fresh();
        let u2 = SocketUid::fresh();
        let u3 = SocketUid::fresh();
        q.insert(slot(0), u1, now, KIND_A, 10);
        q.insert(slot(1), u2, now, KIND_A, 20);
        q.insert(slot(2), u3, now, KIND_A, 30);

        let due = q.begin_dispatch(now);
        assert_eq!(due, 3);
        let payloads: Vec<u64> = (0..due)
            .filter_map(|i| q.protected_entry(i))
            .map(|(_, _, _, p)| p)
            .collect();
        assert_eq!(payloads, vec![10, 20, 30]);
        q.end_dispatch();
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn earliest_deadline_reports_new_head() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        let uid = SocketUid::fresh();
        assert_eq!(
            q.insert(slot(0), uid, now + Duration::from_secs(5), KIND_A, 0),
            Armed::NewHead
        );
        assert_eq!(
            q.insert(slot(0), uid, now + Duration::from_secs(9), KIND_A, 0),
            Armed::Queued
        );
        assert_eq!(
            q.insert(slot(0), uid, now + Duration::from_secs(1), KIND_A, 0),
            Armed::NewHead
        );
        assert_eq!(q.next_deadline(), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn remove_matches_uid_and_kind_only() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        let keep = SocketUid::fresh();
        let gone = SocketUid::fresh();
        q.insert(slot(0), keep, now, KIND_A, 0);
        q.insert(slot(1), gone, now, KIND_A, 0);
        q.insert(slot(1), gone, now + Duration::from_millis(1), KIND_A, 0);
        q.insert(slot(1), gone, now, KIND_B, 0);

        assert_eq!(q.remove(gone, KIND_A), 2);
        assert_eq!(q.len(), 2);
        assert_eq!(q.remove(gone, KIND_B), 1);
        assert_eq!(q.remove(keep, KIND_B), 0);
    }

    #[test]
    fn delete_inside_dispatch_abandons_in_place() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        let a = SocketUid::fresh();
        let b = SocketUid::fresh();
        q.insert(slot(0), a, now, KIND_A, 1);
        q.insert(slot(1), b, now, KIND_A, 2);

        let due = q.begin_dispatch(now);
        assert_eq!(due, 2);
        // Dispatch of entry 0 cancels entry 1; indices must survive.
        assert_eq!(q.remove(b, KIND_A), 1);
        assert!(q.protected_entry(0).is_some());
        assert!(q.protected_entry(1).is_none());
        q.end_dispatch();
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn insert_during_dispatch_lands_behind_prefix() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        let uid = SocketUid::fresh();
        q.insert(slot(0), uid, now, KIND_A, 1);

        let due = q.begin_dispatch(now);
        assert_eq!(due, 1);
        // An already-due re-arm from inside the dispatch must not extend the
        // protected prefix of this pass.
        assert_eq!(q.insert(slot(0), uid, now, KIND_A, 2), Armed::Queued);
        q.end_dispatch();
        assert_eq!(q.len(), 1);

        let due = q.begin_dispatch(now);
        assert_eq!(due, 1);
        assert_eq!(q.protected_entry(0).map(|(_, _, _, p)| p), Some(2));
        q.end_dispatch();
    }

    #[test]
    fn starvation_guard_needs_grace() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        let uid = SocketUid::fresh();
        q.insert(slot(0), uid, now, KIND_A, 0);
        assert!(!q.starving(now, Duration::from_millis(500)));
        assert!(q.starving(now + Duration::from_millis(500), Duration::from_millis(500)));
    }

    proptest! {
        // Dispatch order is always (deadline, insertion order).
        #[test]
        fn dispatch_order_is_stable(offsets in proptest::collection::vec(0u64..50, 1..40)) {
            let base = Instant::now();
            let mut q = TimerQueue::new();
            let uid = SocketUid::fresh();
            for (i, off) in offsets.iter().enumerate() {
                q.insert(slot(0), uid, base + Duration::from_millis(*off), KIND_A, i as u64);
            }

            let horizon = base + Duration::from_millis(100);
            let due = q.begin_dispatch(horizon);
            prop_assert_eq!(due, offsets.len());
            let order: Vec<u64> = (0..due)
                .filter_map(|i| q.protected_entry(i))
                .map(|(_, _, _, p)| p)
                .collect();
            q.end_dispatch();

            let mut expect: Vec<(u64, u64)> = offsets
                .iter()
                .enumerate()
                .map(|(i, off)| (*off, i as u64))
                .collect();
            expect.sort();
            let expect: Vec<u64> = expect.into_iter().map(|(_, i)| i).collect();
            prop_assert_eq!(order, expect);
        }
    }
}
