//! Wait lists used for IPC sender lists, semaphore waiters and DRQ inboxes.
//!
//! A [`Queue`] is a spin lock next to a list of `Arc`s.
//! Every element embeds a [`QueueItem`], a single atomic word that either holds
//! the id of the queue the element is on, or, when it is on no queue,
//! the [`QueueStatus`] left behind by whoever dequeued it.
//!
//! Because the item names its owner, several parties can race to remove the
//! same element (e.g., a receiver taking a sender while that sender's timeout
//! tries to abort the send); only the one that finds its own queue id in the
//! item, while holding that queue's lock, succeeds.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;

#[cfg(test)]
mod test;

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::{Mutex, MutexGuard};

/// The state an item is left in after it was removed from a queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum QueueStatus {
    /// Removed by the regular consumer of the queue.
    Ok = 0,
    /// Removed because the waiter should retry the operation.
    Retry = 1,
    /// Removed because the operation was aborted or the queue went away.
    Invalid = 2,
}

impl QueueStatus {
    fn from_word(word: usize) -> Option<QueueStatus> {
        match word {
            0 => Some(QueueStatus::Ok),
            1 => Some(QueueStatus::Retry),
            2 => Some(QueueStatus::Invalid),
            _ => None,
        }
    }
}

/// Queue ids are multiples of 8, so they never collide with a status value.
const QUEUE_ID_SHIFT: u32 = 3;
static NEXT_QUEUE_ID: AtomicUsize = AtomicUsize::new(1);

/// The link word embedded in every element that can be put on a [`Queue`].
pub struct QueueItem {
    owner: AtomicUsize,
    prio: AtomicUsize,
}

impl QueueItem {
    pub const fn new() -> QueueItem {
        QueueItem {
            owner: AtomicUsize::new(QueueStatus::Ok as usize),
            prio: AtomicUsize::new(0),
        }
    }

    /// Whether the item is currently on some queue.
    pub fn is_queued(&self) -> bool {
        self.owner.load(Ordering::Acquire) >= (1 << QUEUE_ID_SHIFT)
    }

    /// The id of the queue the item is on, if any.
    pub fn queue_id(&self) -> Option<usize> {
        let word = self.owner.load(Ordering::Acquire);
        (word >= (1 << QUEUE_ID_SHIFT)).then_some(word)
    }

    /// The status the last dequeue left behind, or `None` while the item is queued.
    pub fn status(&self) -> Option<QueueStatus> {
        QueueStatus::from_word(self.owner.load(Ordering::Acquire))
    }

    /// The priority this item was queued with by [`QueueGuard::enqueue_prio()`].
    pub fn prio(&self) -> usize {
        self.prio.load(Ordering::Relaxed)
    }

    fn set_owner(&self, queue_id: usize) {
        self.owner.store(queue_id, Ordering::Release);
    }

    fn set_status(&self, status: QueueStatus) {
        self.owner.store(status as usize, Ordering::Release);
    }
}

impl Default for QueueItem {
    fn default() -> QueueItem {
        QueueItem::new()
    }
}

impl fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status() {
            Some(status) => write!(f, "QueueItem({:?})", status),
            None => write!(f, "QueueItem(queued on {:#x}, prio {})", self.owner.load(Ordering::Relaxed), self.prio()),
        }
    }
}

/// Types that embed a [`QueueItem`] and can therefore be put on a [`Queue`].
pub trait Queued {
    fn queue_item(&self) -> &QueueItem;
}


/// A spinlock-protected list of `Arc<T>`.
pub struct Queue<T: Queued> {
    id: usize,
    list: Mutex<VecDeque<Arc<T>>>,
}

impl<T: Queued> Queue<T> {
    pub fn new() -> Queue<T> {
        let n = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        Queue {
            id: n << QUEUE_ID_SHIFT,
            list: Mutex::new(VecDeque::new()),
        }
    }

    /// The id that items on this queue record as their owner.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Locks the queue.
    pub fn q_lock(&self) -> QueueGuard<'_, T> {
        QueueGuard { id: self.id, list: self.list.lock() }
    }

    /// Whether `item` is on this queue. Only a hint unless the lock is held.
    pub fn owns(&self, item: &T) -> bool {
        item.queue_item().queue_id() == Some(self.id)
    }

    /// Locks the queue and removes `item`; see [`QueueGuard::dequeue()`].
    pub fn dequeue(&self, item: &T, status: QueueStatus) -> bool {
        // Cheap rejection without touching the lock.
        if !self.owns(item) {
            return false;
        }
        self.q_lock().dequeue(item, status)
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.list.lock().len()
    }
}

impl<T: Queued> Default for Queue<T> {
    fn default() -> Queue<T> {
        Queue::new()
    }
}

impl<T: Queued> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Queue({:#x})", self.id)
    }
}

/// Exclusive access to a locked [`Queue`].
pub struct QueueGuard<'q, T: Queued> {
    id: usize,
    list: MutexGuard<'q, VecDeque<Arc<T>>>,
}

impl<'q, T: Queued> QueueGuard<'q, T> {
    /// Appends `item` at the tail.
    ///
    /// # Panics
    /// If the item is already on a queue.
    pub fn enqueue(&mut self, item: Arc<T>) {
        let link = item.queue_item();
        assert!(!link.is_queued(), "Queue::enqueue(): item is already queued ({:?})", link);
        link.set_owner(self.id);
        self.list.push_back(item);
    }

    /// Inserts `item` behind every element with a priority greater than or equal to `prio`.
    ///
    /// # Panics
    /// If the item is already on a queue.
    pub fn enqueue_prio(&mut self, item: Arc<T>, prio: usize) {
        let link = item.queue_item();
        assert!(!link.is_queued(), "Queue::enqueue_prio(): item is already queued ({:?})", link);
        link.prio.store(prio, Ordering::Relaxed);
        link.set_owner(self.id);
        let pos = self.list
            .iter()
            .position(|e| e.queue_item().prio() < prio)
            .unwrap_or(self.list.len());
        self.list.insert(pos, item);
    }

    /// Removes `item` from this queue, leaving `status` in its link word.
    ///
    /// Returns `false`, without touching the list, if the item is not on this queue.
    pub fn dequeue(&mut self, item: &T, status: QueueStatus) -> bool {
        let link = item.queue_item();
        if link.queue_id() != Some(self.id) {
            return false;
        }
        match self.list.iter().position(|e| core::ptr::eq(Arc::as_ptr(e), item)) {
            Some(pos) => {
                self.list.remove(pos);
                link.set_status(status);
                true
            }
            None => {
                error!("Queue::dequeue(): item claims queue {:#x} but is not on it", self.id);
                link.set_status(status);
                false
            }
        }
    }

    /// The head of the queue.
    pub fn first(&self) -> Option<&Arc<T>> {
        self.list.front()
    }

    /// Removes and returns the head, leaving [`QueueStatus::Ok`] in its link word.
    pub fn pop_front(&mut self) -> Option<Arc<T>> {
        let item = self.list.pop_front()?;
        item.queue_item().set_status(QueueStatus::Ok);
        Some(item)
    }

    /// Removes every element, leaving `status` in their link words.
    pub fn drain(&mut self, status: QueueStatus) -> VecDeque<Arc<T>> {
        let drained = core::mem::take(&mut *self.list);
        for item in drained.iter() {
            item.queue_item().set_status(status);
        }
        drained
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<T>> {
        self.list.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }
}
