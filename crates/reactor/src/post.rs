//! FIFO of cross-thread posted messages.
//!
//! Any thread may post `(slot, uid, kind, payload)`; the reactor drains the
//! queue on its own loop in strict arrival order, re-validating the owner
//! before each delivery. Messages whose owner vanished are dropped with a
//! trace, never delivered to a slot's new occupant.

use std::collections::VecDeque;

use crate::event::{MsgKind, SlotId, SocketUid};

/// One posted message.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PostedMessage {
    pub(crate) slot: SlotId,
    pub(crate) uid: SocketUid,
    pub(crate) kind: MsgKind,
    pub(crate) payload: u64,
}

/// The message FIFO, guarded by the reactor's state lock.
#[derive(Default)]
pub(crate) struct PostQueue {
    fifo: VecDeque<PostedMessage>,
}

impl PostQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.fifo.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.fifo.is_empty()
    }

    pub(crate) fn push(&mut self, slot: SlotId, uid: SocketUid, kind: MsgKind, payload: u64) {
        self.fifo.push_back(PostedMessage {
            slot,
            uid,
            kind,
            payload,
        });
    }

    pub(crate) fn pop(&mut self) -> Option<PostedMessage> {
        self.fifo.pop_front()
    }

    /// Drops every queued message addressed to `uid`. Used when a socket is
    /// deregistered with pending traffic.
    pub(crate) fn purge(&mut self, uid: SocketUid) -> usize {
        let before = self.fifo.len();
        self.fifo.retain(|m| m.uid != uid);
        before - self.fifo.len()
    }
}
