use std::hash::{BuildHasher, Hasher};
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::error::Error;
use crate::map::MapStats;

pub(crate) const DEFAULT_BUCKETS: usize = 100;
pub(crate) const DEFAULT_GC_BATCH: usize = 10;

// The sharded table.
//
// Foreground operations hold the descriptor read guard for their whole
// duration. The two structural mutations, swapping in a doubled bucket
// array and retiring a drained old one, take the write guard; acquiring it
// doubles as the barrier that waits out every in-flight operation.
pub(crate) struct Table<V, S> {
    root: RwLock<Root<V>>,

    /// Grow claim. `true` means no thread is currently building a
    /// replacement bucket array; the builder runs outside the write lock,
    /// so losers keep operating on the crowded table instead of piling up.
    grow_allowed: AtomicBool,

    /// Bounded number of migration steps folded into each foreground
    /// lookup, get-or-insert and remove.
    gc_batch: usize,

    build_hasher: S,
    counters: Counters,
}

// The current generation of buckets, plus the previous one while a
// migration is in flight.
struct Root<V> {
    lines: Box<[Line<V>]>,

    /// Bucket depth above which an insert attempts to double the table.
    /// Recomputed as `⌊√buckets⌋` on every grow.
    max_depth: usize,

    old: Option<OldTable<V>>,
}

// A retired bucket array, drained cooperatively into the current one.
struct OldTable<V> {
    lines: Box<[Line<V>]>,

    /// Index of the next bucket to drain. Taken with `try_lock` so at most
    /// one thread migrates at a time; contended passes simply yield.
    cursor: Mutex<usize>,
}

// One bucket: an entry chain behind a reader-writer lock.
pub(crate) struct Line<V> {
    head: RwLock<Option<Box<Node<V>>>>,

    /// Advisory entry count, only used to trigger resizes.
    depth: AtomicUsize,
}

struct Node<V> {
    hash: u64,
    key: Box<[u8]>,
    value: V,
    next: Option<Box<Node<V>>>,
}

#[derive(Default)]
struct Counters {
    lookups: AtomicU64,
    inserts: AtomicU64,
    removes: AtomicU64,
    collisions: AtomicU64,
    resizes: AtomicU64,
    resize_fails: AtomicU64,
}

impl<V> Root<V> {
    // Bucket count is not forced to a power of two; index by modulo.
    #[inline]
    fn line(&self, hash: u64) -> &Line<V> {
        &self.lines[(hash % self.lines.len() as u64) as usize]
    }
}

impl<V> OldTable<V> {
    #[inline]
    fn line(&self, hash: u64) -> &Line<V> {
        &self.lines[(hash % self.lines.len() as u64) as usize]
    }

    fn drained(&self) -> bool {
        *self.cursor.lock() >= self.lines.len()
    }
}

impl<V> Line<V> {
    fn get(&self, hash: u64, key: &[u8]) -> Option<V>
    where
        V: Clone,
    {
        let head = self.head.read();
        find(&head, hash, key).cloned()
    }

    /// Link a node at the head of the chain. Returns whether the bucket
    /// already held entries.
    fn push(&self, mut node: Box<Node<V>>) -> bool {
        let mut head = self.head.write();
        let collision = head.is_some();
        node.next = head.take();
        *head = Some(node);
        self.depth.fetch_add(1, Ordering::Relaxed);
        collision
    }

    fn remove(&self, hash: u64, key: &[u8]) -> Option<V> {
        let mut head = self.head.write();
        let value = unlink(&mut head, hash, key)?;
        self.depth.fetch_sub(1, Ordering::Relaxed);
        Some(value)
    }

}

impl<V> Drop for Line<V> {
    fn drop(&mut self) {
        // Unlink iteratively; dropping a long duplicate chain through the
        // default recursive `Box` drop can blow the stack.
        let mut next = self.head.get_mut().take();
        while let Some(mut node) = next {
            next = node.next.take();
        }
    }
}

// Walk a locked chain. Chains are LIFO, so the first match is the most
// recently inserted entry for the key.
fn find<'a, V>(head: &'a Option<Box<Node<V>>>, hash: u64, key: &[u8]) -> Option<&'a V> {
    let mut cur = head.as_deref();
    while let Some(node) = cur {
        if node.hash == hash && *node.key == *key {
            return Some(&node.value);
        }
        cur = node.next.as_deref();
    }
    None
}

// Unlink the first matching node from a locked chain.
fn unlink<V>(head: &mut Option<Box<Node<V>>>, hash: u64, key: &[u8]) -> Option<V> {
    let mut cur = head;
    loop {
        match cur {
            None => return None,
            Some(node) if node.hash == hash && *node.key == *key => {
                let mut node = cur.take()?;
                *cur = node.next.take();
                return Some(node.value);
            }
            Some(node) => cur = &mut node.next,
        }
    }
}

fn alloc_lines<V>(n: usize) -> Box<[Line<V>]> {
    (0..n)
        .map(|_| Line {
            head: RwLock::new(None),
            depth: AtomicUsize::new(0),
        })
        .collect()
}

impl<V, S> Table<V, S> {
    pub(crate) fn new(buckets: usize, gc_batch: usize, build_hasher: S) -> Table<V, S> {
        let buckets = if buckets == 0 { DEFAULT_BUCKETS } else { buckets };
        Table {
            root: RwLock::new(Root {
                lines: alloc_lines(buckets),
                max_depth: buckets.isqrt(),
                old: None,
            }),
            grow_allowed: AtomicBool::new(true),
            gc_batch: gc_batch.max(1),
            build_hasher,
            counters: Counters::default(),
        }
    }

    pub(crate) fn buckets(&self) -> usize {
        self.root.read().lines.len()
    }

    pub(crate) fn len(&self) -> usize {
        let root = self.root.read();
        let depths = |lines: &[Line<V>]| {
            lines
                .iter()
                .map(|line| line.depth.load(Ordering::Relaxed))
                .sum::<usize>()
        };
        depths(&root.lines) + root.old.as_ref().map_or(0, |old| depths(&old.lines))
    }

    pub(crate) fn stats(&self) -> MapStats {
        MapStats {
            lookups: self.counters.lookups.load(Ordering::Relaxed),
            inserts: self.counters.inserts.load(Ordering::Relaxed),
            removes: self.counters.removes.load(Ordering::Relaxed),
            collisions: self.counters.collisions.load(Ordering::Relaxed),
            resizes: self.counters.resizes.load(Ordering::Relaxed),
            resize_fails: self.counters.resize_fails.load(Ordering::Relaxed),
        }
    }

    /// Manually drain up to `max_steps` migration steps.
    pub(crate) fn gc(&self, max_steps: usize) -> usize {
        let root = self.root.read();
        let (steps, drained) = self.drain_step(&root, max_steps);
        drop(root);
        if drained {
            self.finish_migration();
        }
        steps
    }

    // Enter the table and fold in a bounded amount of migration work,
    // retiring the old bucket array once it runs dry.
    fn operate(&self) -> RwLockReadGuard<'_, Root<V>> {
        let root = self.root.read();
        if root.old.is_none() {
            return root;
        }
        let (_, drained) = self.drain_step(&root, self.gc_batch);
        if !drained {
            return root;
        }
        drop(root);
        self.finish_migration();
        self.root.read()
    }

    // Move up to `max_steps` entries from the old table into the current
    // one. Advancing the cursor over an emptied bucket costs a step, like
    // moving an entry does. Returns the steps performed and whether the
    // old table is fully drained.
    fn drain_step(&self, root: &Root<V>, max_steps: usize) -> (usize, bool) {
        let Some(old) = &root.old else {
            return (0, false);
        };
        let Some(mut cursor) = old.cursor.try_lock() else {
            // Someone else is already migrating; let them.
            return (0, false);
        };

        let mut steps = 0;
        'buckets: while *cursor < old.lines.len() {
            let line = &old.lines[*cursor];
            let mut head = line.head.write();
            loop {
                if steps >= max_steps {
                    break 'buckets;
                }
                let Some(mut node) = head.take() else {
                    *cursor += 1;
                    steps += 1;
                    break;
                };
                *head = node.next.take();
                line.depth.fetch_sub(1, Ordering::Relaxed);
                // The move happens under this bucket's lock: a concurrent
                // reader that misses the entry in the old table is
                // guaranteed to find it in the current one.
                if root.line(node.hash).push(node) {
                    self.counters.collisions.fetch_add(1, Ordering::Relaxed);
                }
                steps += 1;
            }
        }
        let drained = *cursor >= old.lines.len();
        (steps, drained)
    }

    // Retire a fully drained old table. Taking the write guard waits out
    // every operation that might still be reading it.
    fn finish_migration(&self) {
        let mut root = self.root.write();
        if root.old.as_ref().is_some_and(|old| old.drained()) {
            root.old = None;
            tracing::debug!(buckets = root.lines.len(), "table migration complete");
        }
    }

    // Double the bucket array. At most one thread builds the replacement;
    // the rest fall through and keep working with the crowded bucket.
    fn try_grow<'a>(&'a self, root: RwLockReadGuard<'a, Root<V>>) -> RwLockReadGuard<'a, Root<V>> {
        if !self.grow_allowed.swap(false, Ordering::Acquire) {
            return root;
        }
        if root.old.is_some() {
            // One migration generation at a time; growing again now would
            // strand the entries still parked in the old table.
            self.counters.resize_fails.fetch_add(1, Ordering::Relaxed);
            self.grow_allowed.store(true, Ordering::Release);
            return root;
        }
        let new_size = root.lines.len() * 2;
        drop(root);

        // Holding the claim keeps `lines` and `old` stable, so the array
        // can be built without blocking readers.
        let lines = alloc_lines(new_size);
        let mut root = self.root.write();
        let old_lines = mem::replace(&mut root.lines, lines);
        root.max_depth = new_size.isqrt();
        root.old = Some(OldTable {
            lines: old_lines,
            cursor: Mutex::new(0),
        });
        self.counters.resizes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            old_buckets = new_size / 2,
            new_buckets = new_size,
            "table grow started"
        );
        self.grow_allowed.store(true, Ordering::Release);
        drop(root);
        self.root.read()
    }
}

impl<V, S: BuildHasher> Table<V, S> {
    #[inline]
    fn hash_key(&self, key: &[u8]) -> u64 {
        let mut hasher = self.build_hasher.build_hasher();
        hasher.write(key);
        hasher.finish()
    }

    pub(crate) fn insert(&self, key: &[u8], value: V) -> Result<(), Error> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        let hash = self.hash_key(key);
        // Copying the key is the expensive part; do it before entering.
        let node = Box::new(Node {
            hash,
            key: key.into(),
            value,
            next: None,
        });

        let mut root = self.operate();
        if root.line(hash).depth.load(Ordering::Relaxed) > root.max_depth {
            root = self.try_grow(root);
        }
        let collision = root.line(hash).push(node);
        self.counters.inserts.fetch_add(1, Ordering::Relaxed);
        if collision {
            self.counters.collisions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<V>
    where
        V: Clone,
    {
        if key.is_empty() {
            return None;
        }
        let hash = self.hash_key(key);
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);

        let root = self.operate();
        if let Some(value) = root.line(hash).get(hash, key) {
            return Some(value);
        }
        // A key missing here may still be parked in the old table.
        root.old
            .as_ref()
            .and_then(|old| old.line(hash).get(hash, key))
    }

    pub(crate) fn get_or_insert(&self, key: &[u8], value: V) -> Result<V, Error>
    where
        V: Clone,
    {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        let hash = self.hash_key(key);
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);

        let mut root = self.operate();
        if root.line(hash).depth.load(Ordering::Relaxed) > root.max_depth {
            root = self.try_grow(root);
        }

        // The old table can only lose entries, so a hit there is stable.
        if let Some(old) = &root.old {
            if let Some(existing) = old.line(hash).get(hash, key) {
                return Ok(existing);
            }
        }

        let line = root.line(hash);
        let mut head = line.head.write();
        if let Some(existing) = find(&head, hash, key) {
            return Ok(existing.clone());
        }

        // Building the node copies the key, so do it off the bucket lock
        // and revalidate afterwards. Every insert lands at the head of the
        // chain, so an unchanged head means nothing was written in between.
        let snapshot = head.as_deref().map(|node| node as *const Node<V>);
        drop(head);
        let mut node = Box::new(Node {
            hash,
            key: key.into(),
            value,
            next: None,
        });
        let mut head = line.head.write();
        if head.as_deref().map(|node| node as *const Node<V>) != snapshot {
            if let Some(existing) = find(&head, hash, key) {
                return Ok(existing.clone());
            }
        }

        let value = node.value.clone();
        let collision = head.is_some();
        node.next = head.take();
        *head = Some(node);
        line.depth.fetch_add(1, Ordering::Relaxed);
        self.counters.inserts.fetch_add(1, Ordering::Relaxed);
        if collision {
            self.counters.collisions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(value)
    }

    pub(crate) fn remove(&self, key: &[u8]) -> Option<V> {
        if key.is_empty() {
            return None;
        }
        let hash = self.hash_key(key);

        let root = self.operate();
        let removed = root.line(hash).remove(hash, key).or_else(|| {
            root.old
                .as_ref()
                .and_then(|old| old.line(hash).remove(hash, key))
        });
        if removed.is_some() {
            self.counters.removes.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }
}
