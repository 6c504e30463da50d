use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Error;

const DEFAULT_CAPACITY: usize = 64;

/// Heap-slot marker for an item that is not linked into any queue.
const DETACHED: usize = usize::MAX;

/// A thread-safe earliest-deadline-first expiry queue.
///
/// Items are ordered by an absolute `u64` deadline in a binary min-heap
/// behind a single mutex. [`expire`](Self::expire) pops every item whose
/// deadline has passed and hands its value to the expiry callback, in
/// non-decreasing deadline order. Dropping the queue expires every
/// remaining item.
///
/// The callback runs with the queue mutex held: it must not call back into
/// the same queue, or the thread deadlocks.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use troika::ExpiryQueue;
///
/// let fired = Arc::new(AtomicUsize::new(0));
/// let queue = {
///     let fired = Arc::clone(&fired);
///     ExpiryQueue::new(move |_: &u32| {
///         fired.fetch_add(1, Ordering::Relaxed);
///     })
/// };
///
/// queue.insert(0, 7, 100); // deadline 100
/// assert_eq!(queue.expire_all(50), 0);
/// assert_eq!(queue.expire_all(100), 1);
/// assert_eq!(fired.load(Ordering::Relaxed), 1);
/// ```
pub struct ExpiryQueue<T> {
    heap: Mutex<Vec<Arc<Item<T>>>>,
    expire_cb: Box<dyn Fn(&T) + Send + Sync>,
    counters: Counters,
}

/// A queued value with its deadline.
///
/// Items are created detached and owned by the queue once inserted.
/// Holding on to the [`Arc`] handle allows removing or rescheduling the
/// item in O(log n) via its heap back-pointer.
pub struct Item<T> {
    /// Absolute deadline.
    expire: AtomicU64,
    /// Position in the heap array, `DETACHED` when unlinked. Only written
    /// under the owning queue's mutex.
    slot: AtomicUsize,
    value: T,
}

#[derive(Default)]
struct Counters {
    inserts: AtomicU64,
    expirations: AtomicU64,
    reschedules: AtomicU64,
    removes: AtomicU64,
}

impl<T> Item<T> {
    /// Creates a detached item with an absolute deadline.
    pub fn new(expire: u64, value: T) -> Arc<Item<T>> {
        Arc::new(Item {
            expire: AtomicU64::new(expire),
            slot: AtomicUsize::new(DETACHED),
            value,
        })
    }

    /// Returns the item's value.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Returns the item's absolute deadline.
    pub fn deadline(&self) -> u64 {
        self.expire.load(Ordering::Relaxed)
    }

    /// Returns `true` while the item is linked into a queue.
    pub fn is_queued(&self) -> bool {
        self.slot.load(Ordering::Relaxed) != DETACHED
    }
}

impl<T> ExpiryQueue<T> {
    /// Creates a queue with the default capacity of 64 items.
    pub fn new(expire_cb: impl Fn(&T) + Send + Sync + 'static) -> ExpiryQueue<T> {
        Self::with_capacity(DEFAULT_CAPACITY, expire_cb)
    }

    /// Creates a queue sized for `capacity` items before the first grow.
    /// Zero selects the default.
    pub fn with_capacity(
        capacity: usize,
        expire_cb: impl Fn(&T) + Send + Sync + 'static,
    ) -> ExpiryQueue<T> {
        let capacity = if capacity == 0 { DEFAULT_CAPACITY } else { capacity };
        ExpiryQueue {
            heap: Mutex::new(Vec::with_capacity(capacity)),
            expire_cb: Box::new(expire_cb),
            counters: Counters::default(),
        }
    }

    /// Inserts a value expiring at `now + ttl` (wrapping on overflow; the
    /// clock domain is the caller's) and returns a handle to the queued
    /// item.
    pub fn insert(&self, now: u64, value: T, ttl: u64) -> Arc<Item<T>> {
        let item = Item::new(now.wrapping_add(ttl), value);
        // A freshly created item is detached, so this cannot fail.
        let _ = self.insert_item(&item);
        item
    }

    /// Links a detached item into the queue.
    pub fn insert_item(&self, item: &Arc<Item<T>>) -> Result<(), Error> {
        let mut heap = self.heap.lock();
        if item.slot.load(Ordering::Relaxed) != DETACHED {
            return Err(Error::AlreadyQueued);
        }
        heap.push(Arc::clone(item));
        let idx = heap.len() - 1;
        item.slot.store(idx, Ordering::Relaxed);
        sift_up(&mut heap, idx);
        self.counters.inserts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Unlinks an item from the queue without firing it.
    pub fn remove_item(&self, item: &Item<T>) -> Result<(), Error> {
        let mut heap = self.heap.lock();
        let idx = item.slot.load(Ordering::Relaxed);
        if idx == DETACHED {
            return Err(Error::NotQueued);
        }
        // An index from an item queued elsewhere says nothing about this
        // heap; make sure it really points back at the caller's item.
        if idx >= heap.len() || !ptr::eq(Arc::as_ptr(&heap[idx]), item) {
            return Err(Error::NotQueued);
        }
        detach(&mut heap, idx);
        self.counters.removes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Moves a queued item to a new deadline of `now + new_ttl`.
    ///
    /// The item is unlinked, re-stamped and re-linked; it is never
    /// observable with a stale heap position.
    pub fn reschedule(&self, now: u64, item: &Arc<Item<T>>, new_ttl: u64) -> Result<(), Error> {
        self.remove_item(item)?;
        item.expire
            .store(now.wrapping_add(new_ttl), Ordering::Relaxed);
        self.counters.reschedules.fetch_add(1, Ordering::Relaxed);
        self.insert_item(item)
    }

    /// Fires up to `max` items whose deadline is at or before `now`,
    /// in non-decreasing deadline order. Returns the number fired.
    pub fn expire(&self, now: u64, max: usize) -> usize {
        if max == 0 {
            return 0;
        }
        let mut heap = self.heap.lock();
        let mut fired = 0;
        while fired < max {
            let Some(root) = heap.first() else { break };
            if root.expire.load(Ordering::Relaxed) > now {
                break;
            }
            let item = detach(&mut heap, 0);
            (self.expire_cb)(&item.value);
            fired += 1;
        }
        self.counters
            .expirations
            .fetch_add(fired as u64, Ordering::Relaxed);
        fired
    }

    /// Fires every item whose deadline is at or before `now`.
    pub fn expire_all(&self, now: u64) -> usize {
        self.expire(now, usize::MAX)
    }

    /// Returns the number of queued items.
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    /// Returns `true` if no items are queued.
    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    /// Returns a snapshot of the queue's advisory counters.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            inserts: self.counters.inserts.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            reschedules: self.counters.reschedules.load(Ordering::Relaxed),
            removes: self.counters.removes.load(Ordering::Relaxed),
        }
    }
}

impl<T> Drop for ExpiryQueue<T> {
    fn drop(&mut self) {
        // Destruction fires every remaining item, like the explicit path.
        self.expire_all(u64::MAX);
    }
}

impl<T> fmt::Debug for ExpiryQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpiryQueue")
            .field("len", &self.len())
            .finish()
    }
}

// Remove the item at `idx`, refill the hole from the tail and restore heap
// order. The filler may need to move either direction.
fn detach<T>(heap: &mut Vec<Arc<Item<T>>>, idx: usize) -> Arc<Item<T>> {
    let item = heap.swap_remove(idx);
    item.slot.store(DETACHED, Ordering::Relaxed);
    if idx < heap.len() {
        heap[idx].slot.store(idx, Ordering::Relaxed);
        let parent = idx.wrapping_sub(1) / 2;
        if idx > 0 && deadline(heap, idx) < deadline(heap, parent) {
            sift_up(heap, idx);
        } else {
            sift_down(heap, idx);
        }
    }
    item
}

#[inline]
fn deadline<T>(heap: &[Arc<Item<T>>], idx: usize) -> u64 {
    heap[idx].expire.load(Ordering::Relaxed)
}

// 0-indexed binary min-heap on `expire`: parent (i-1)/2, children 2i+1 and
// 2i+2. Both sifts are iterative and keep the back-pointers in step with
// every swap.

fn sift_up<T>(heap: &mut [Arc<Item<T>>], mut idx: usize) {
    while idx > 0 {
        let parent = (idx - 1) / 2;
        if deadline(heap, idx) >= deadline(heap, parent) {
            break;
        }
        swap_items(heap, idx, parent);
        idx = parent;
    }
}

fn sift_down<T>(heap: &mut [Arc<Item<T>>], mut idx: usize) {
    loop {
        let left = 2 * idx + 1;
        let right = 2 * idx + 2;
        let mut smallest = idx;
        if left < heap.len() && deadline(heap, left) < deadline(heap, smallest) {
            smallest = left;
        }
        if right < heap.len() && deadline(heap, right) < deadline(heap, smallest) {
            smallest = right;
        }
        if smallest == idx {
            break;
        }
        swap_items(heap, idx, smallest);
        idx = smallest;
    }
}

fn swap_items<T>(heap: &mut [Arc<Item<T>>], a: usize, b: usize) {
    heap.swap(a, b);
    heap[a].slot.store(a, Ordering::Relaxed);
    heap[b].slot.store(b, Ordering::Relaxed);
}

/// A point-in-time snapshot of a queue's advisory counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct QueueStats {
    /// Items linked into the queue.
    pub inserts: u64,
    /// Items fired through the expiry callback.
    pub expirations: u64,
    /// Items moved to a new deadline.
    pub reschedules: u64,
    /// Items unlinked without firing.
    pub removes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> ExpiryQueue<u64> {
        ExpiryQueue::new(|_| {})
    }

    fn assert_heap(heap: &[Arc<Item<u64>>]) {
        for i in 1..heap.len() {
            assert!(deadline(heap, (i - 1) / 2) <= deadline(heap, i));
            assert_eq!(heap[i].slot.load(Ordering::Relaxed), i);
        }
        if !heap.is_empty() {
            assert_eq!(heap[0].slot.load(Ordering::Relaxed), 0);
        }
    }

    #[test]
    fn heap_order_after_inserts() {
        let queue = queue();
        for ttl in [9, 3, 7, 1, 8, 2, 6, 4, 5, 0] {
            queue.insert(0, ttl, ttl);
        }
        assert_heap(&queue.heap.lock());
    }

    #[test]
    fn heap_order_after_removals() {
        let queue = queue();
        let items: Vec<_> = (0..16).map(|ttl| queue.insert(0, ttl, ttl)).collect();
        for item in items.iter().step_by(3) {
            queue.remove_item(item).unwrap();
            assert_heap(&queue.heap.lock());
        }
    }

    #[test]
    fn detached_item_reports_not_queued() {
        let queue = queue();
        let item = Item::new(10, 0);
        assert_eq!(queue.remove_item(&item), Err(Error::NotQueued));
        queue.insert_item(&item).unwrap();
        assert_eq!(queue.insert_item(&item), Err(Error::AlreadyQueued));
        queue.remove_item(&item).unwrap();
        assert!(!item.is_queued());
    }
}
