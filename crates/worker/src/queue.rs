//! The queue seam between workers and whoever owns the work list.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use crate::item::{ForcedAction, InDoubtFlags, ItemId, WorkItem};

/// Hands items to workers and takes them back on abort.
///
/// Implementations are shared across workers; every method must be cheap
/// and safe to call from the reactor thread.
pub trait WorkQueue: Send + Sync {
    /// Next eligible item. `None` sends the worker to sleep.
    fn next_item(&self) -> Option<WorkItem>;

    /// Returns an unfinished item, together with whatever server-side
    /// effects may have happened while it was abandoned.
    fn return_item(&self, item: WorkItem, in_doubt: InDoubtFlags);

    /// Records a conflict decision for a queued item. Returns whether the
    /// item was found.
    fn update_forced_action(&self, id: ItemId, action: ForcedAction) -> bool;
}

/// FIFO queue for tests and simple embeddings.
///
/// Returned items are parked separately instead of re-queued, so a worker
/// that keeps failing cannot spin on the same item; the embedder decides
/// what to do with them.
#[derive(Default)]
pub struct MemoryQueue {
    items: Mutex<VecDeque<WorkItem>>,
    returned: Mutex<Vec<(WorkItem, InDoubtFlags)>>,
}

impl MemoryQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an item to the back.
    pub fn push(&self, item: WorkItem) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(item);
    }

    /// Items waiting to be handed out.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no items are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items handed back unfinished, in return order.
    #[must_use]
    pub fn returned(&self) -> Vec<(WorkItem, InDoubtFlags)> {
        self.returned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl WorkQueue for MemoryQueue {
    fn next_item(&self) -> Option<WorkItem> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn return_item(&self, item: WorkItem, in_doubt: InDoubtFlags) {
        self.returned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((item, in_doubt));
    }

    fn update_forced_action(&self, id: ItemId, action: ForcedAction) -> bool {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(item) = items.iter_mut().find(|i| i.id == id) {
            item.forced = action;
            return true;
        }
        drop(items);
        let mut returned = self.returned.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((item, _)) = returned.iter_mut().find(|(i, _)| i.id == id) {
            item.forced = action;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemKind;

    fn item(id: u64, path: &str) -> WorkItem {
        WorkItem::new(
            ItemId(id),
            ItemKind::DeleteFile {
                path: path.to_owned(),
            },
        )
    }

    #[test]
    fn items_come_out_in_push_order() {
        let q = MemoryQueue::new();
        q.push(item(1, "a"));
        q.push(item(2, "b"));
        assert_eq!(q.next_item().unwrap().id, ItemId(1));
        assert_eq!(q.next_item().unwrap().id, ItemId(2));
        assert!(q.next_item().is_none());
    }

    #[test]
    fn returned_items_are_parked_not_requeued() {
        let q = MemoryQueue::new();
        q.push(item(1, "a"));
        let taken = q.next_item().unwrap();
        let flags = InDoubtFlags {
            deleted: true,
            ..InDoubtFlags::default()
        };
        q.return_item(taken, flags);
        assert!(q.next_item().is_none());
        let returned = q.returned();
        assert_eq!(returned.len(), 1);
        assert!(returned[0].1.deleted);
    }

    #[test]
    fn forced_action_update_reaches_queued_and_returned_items() {
        let q = MemoryQueue::new();
        q.push(item(1, "a"));
        assert!(q.update_forced_action(ItemId(1), ForcedAction::Overwrite));
        assert_eq!(q.next_item().unwrap().forced, ForcedAction::Overwrite);

        q.push(item(2, "b"));
        let taken = q.next_item().unwrap();
        q.return_item(taken, InDoubtFlags::default());
        assert!(q.update_forced_action(ItemId(2), ForcedAction::Skip));
        assert_eq!(q.returned()[0].0.forced, ForcedAction::Skip);
        assert!(!q.update_forced_action(ItemId(9), ForcedAction::Skip));
    }
}
