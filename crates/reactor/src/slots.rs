//! Socket slot table.
//!
//! A growable vector of optional socket references. Slots are nulled on
//! removal and reused (lowest first via a free-slot hint), never shifted, so
//! a `SlotId` stays stable for the lifetime of one registration. Because of
//! reuse, a slot alone never identifies a socket: lookups that dispatch
//! events always pass the uid captured when the event was queued, and a
//! mismatch means the event's owner is gone.

use std::sync::Arc;

use tracing::trace;

use crate::event::{ReactorSocket, SlotId, SocketUid};

struct Entry {
    uid: SocketUid,
    socket: Arc<dyn ReactorSocket>,
}

/// The table, guarded by the reactor's state lock.
pub(crate) struct SlotTable {
    slots: Vec<Option<Entry>>,
    /// Index of the lowest possibly-free slot; `slots.len()` when full.
    first_free: usize,
}

impl SlotTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            first_free: 0,
        }
    }

    /// Number of occupied slots.
    pub(crate) fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Inserts `socket` into the lowest free slot, growing if necessary.
    pub(crate) fn add(&mut self, socket: Arc<dyn ReactorSocket>) -> SlotId {
        let uid = socket.uid();
        // Advance the hint to the first actually-free slot.
        while self.first_free < self.slots.len() && self.slots[self.first_free].is_some() {
            self.first_free += 1;
        }
        let at = self.first_free;
        if at == self.slots.len() {
            self.slots.push(Some(Entry { uid, socket }));
        } else {
            self.slots[at] = Some(Entry { uid, socket });
        }
        self.first_free = at + 1;
        SlotId(at as u32)
    }

    /// Clears `slot` and returns the reference that occupied it.
    pub(crate) fn remove(&mut self, slot: SlotId) -> Option<Arc<dyn ReactorSocket>> {
        let at = slot.index();
        let entry = self.slots.get_mut(at)?.take()?;
        if at < self.first_free {
            self.first_free = at;
        }
        Some(entry.socket)
    }

    /// Uid of the socket currently occupying `slot`, if any.
    pub(crate) fn uid_at(&self, slot: SlotId) -> Option<SocketUid> {
        self.slots.get(slot.index())?.as_ref().map(|e| e.uid)
    }

    /// Returns the occupant of `slot` only when its uid still matches.
    ///
    /// The silent-drop half of the re-validation contract lives here: a
    /// mismatch traces and returns `None`, it never yields the new occupant.
    pub(crate) fn validate(
        &self,
        slot: SlotId,
        uid: SocketUid,
    ) -> Option<Arc<dyn ReactorSocket>> {
        match self.slots.get(slot.index())?.as_ref() {
            Some(e) if e.uid == uid => Some(Arc::clone(&e.socket)),
            Some(e) => {
                trace!(slot = slot.0, expected = %uid, found = %e.uid, "lost event: slot reused");
                None
            }
            None => {
                trace!(slot = slot.0, expected = %uid, "lost event: slot empty");
                None
            }
        }
    }

    /// Like [`Self::validate`] but silent, for lookups that have a fallback
    /// (timers and posted messages retry by uid scan before giving up).
    pub(crate) fn peek(&self, slot: SlotId, uid: SocketUid) -> Option<Arc<dyn ReactorSocket>> {
        self.slots
            .get(slot.index())?
            .as_ref()
            .filter(|e| e.uid == uid)
            .map(|e| Arc::clone(&e.socket))
    }

    /// Sequential scan by uid, for owners whose slot changed between queueing
    /// and dispatch (connection hand-off).
    pub(crate) fn find_by_uid(&self, uid: SocketUid) -> Option<(SlotId, Arc<dyn ReactorSocket>)> {
        self.slots.iter().enumerate().find_map(|(i, s)| {
            s.as_ref()
                .filter(|e| e.uid == uid)
                .map(|e| (SlotId(i as u32), Arc::clone(&e.socket)))
        })
    }

    /// Drops every entry. Used on shutdown.
    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.first_free = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Reactor;
    use crate::event::{MsgKind, NetEvent, TimerKind};

    struct Dummy(SocketUid);

    impl ReactorSocket for Dummy {
        fn uid(&self) -> SocketUid {
            self.0
        }
        fn on_ready(&self, _: &Reactor, _: NetEvent) {}
        fn on_timer(&self, _: &Reactor, _: TimerKind, _: u64) {}
        fn on_message(&self, _: &Reactor, _: MsgKind, _: u64) {}
    }

    fn dummy() -> (SocketUid, Arc<dyn ReactorSocket>) {
        let uid = SocketUid::fresh();
        (uid, Arc::new(Dummy(uid)))
    }

    #[test]
    fn lowest_free_slot_is_reused() {
        let mut t = SlotTable::new();
        let (_, s0) = dummy();
        let (_, s1) = dummy();
        let (_, s2) = dummy();
        assert_eq!(t.add(s0), SlotId(0));
        assert_eq!(t.add(s1), SlotId(1));
        assert_eq!(t.add(s2), SlotId(2));

        assert!(t.remove(SlotId(1)).is_some());
        let (_, s3) = dummy();
        assert_eq!(t.add(s3), SlotId(1));
        let (_, s4) = dummy();
        assert_eq!(t.add(s4), SlotId(3));
        assert_eq!(t.occupied(), 4);
    }

    #[test]
    fn validate_rejects_stale_uid() {
        let mut t = SlotTable::new();
        let (old_uid, s) = dummy();
        let slot = t.add(s);
        assert!(t.validate(slot, old_uid).is_some());

        t.remove(slot);
        let (new_uid, s2) = dummy();
        assert_eq!(t.add(s2), slot);

        assert!(t.validate(slot, old_uid).is_none());
        assert!(t.validate(slot, new_uid).is_some());
    }

    #[test]
    fn uid_scan_survives_slot_change() {
        let mut t = SlotTable::new();
        let (uid, s) = dummy();
        let (_, filler) = dummy();
        t.add(filler);
        let first = t.add(Arc::clone(&s));
        t.remove(first);
        t.remove(SlotId(0));
        let second = t.add(s);
        assert_ne!(first, second);
        let found = t.find_by_uid(uid);
        assert_eq!(found.map(|(slot, _)| slot), Some(second));
    }
}
