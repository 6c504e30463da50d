use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::BuildHasher;
use std::marker::PhantomData;

use crate::error::Error;
use crate::raw;

/// A concurrent hash table keyed by byte strings, with online incremental
/// resize.
///
/// Keys are copied into the table on insert; values are owned by the table
/// and handed back by clone, so shared values are typically stored as
/// [`Arc<T>`](std::sync::Arc). The table is sharded into buckets, each
/// behind its own reader-writer lock, and grows by doubling once a bucket's
/// depth exceeds `⌊√buckets⌋`. Growth is cooperative: entries migrate from
/// the previous bucket array a few at a time inside ordinary operations,
/// with no background thread.
///
/// # Examples
///
/// ```
/// use troika::ShardMap;
///
/// let map: ShardMap<&str> = ShardMap::new();
/// map.insert(b"apollo", "eleven")?;
/// assert_eq!(map.get(b"apollo"), Some("eleven"));
/// assert_eq!(map.get(b"gemini"), None);
/// # Ok::<(), troika::Error>(())
/// ```
pub struct ShardMap<V, S = RandomState> {
    raw: raw::Table<V, S>,
}

/// A builder for a [`ShardMap`].
///
/// # Examples
///
/// ```rust
/// use troika::ShardMap;
///
/// let map: ShardMap<u64> = ShardMap::builder()
///     // Set the initial bucket count.
///     .buckets(512)
///     // Migrate one entry per foreground operation.
///     .gc_batch(1)
///     .build();
/// # drop(map);
/// ```
pub struct ShardMapBuilder<V, S = RandomState> {
    buckets: usize,
    gc_batch: usize,
    hasher: S,
    _v: PhantomData<V>,
}

impl<V> ShardMapBuilder<V> {
    /// Set the hash builder used to hash keys.
    pub fn hasher<S>(self, hasher: S) -> ShardMapBuilder<V, S> {
        ShardMapBuilder {
            buckets: self.buckets,
            gc_batch: self.gc_batch,
            hasher,
            _v: PhantomData,
        }
    }
}

impl<V, S> ShardMapBuilder<V, S> {
    /// Set the initial bucket count.
    ///
    /// The count is used as-is, it is not rounded to a power of two.
    /// Zero selects the default of 100 buckets.
    pub fn buckets(self, buckets: usize) -> Self {
        ShardMapBuilder { buckets, ..self }
    }

    /// Set the number of migration steps folded into each foreground
    /// operation while a resize is in flight (default 10).
    pub fn gc_batch(self, gc_batch: usize) -> Self {
        ShardMapBuilder { gc_batch, ..self }
    }

    /// Construct a [`ShardMap`] from the builder.
    pub fn build(self) -> ShardMap<V, S> {
        ShardMap {
            raw: raw::Table::new(self.buckets, self.gc_batch, self.hasher),
        }
    }
}

impl<V> ShardMap<V> {
    /// Creates a map with the default bucket count.
    pub fn new() -> ShardMap<V> {
        Self::builder().build()
    }

    /// Returns a builder for configuring the initial bucket count, the
    /// migration batch size and the hasher.
    pub fn builder() -> ShardMapBuilder<V> {
        ShardMapBuilder {
            buckets: raw::DEFAULT_BUCKETS,
            gc_batch: raw::DEFAULT_GC_BATCH,
            hasher: RandomState::new(),
            _v: PhantomData,
        }
    }
}

impl<V> Default for ShardMap<V> {
    fn default() -> ShardMap<V> {
        ShardMap::new()
    }
}

impl<V, S: BuildHasher> ShardMap<V, S> {
    /// Inserts a value for the given key.
    ///
    /// Duplicate keys are not deduplicated: every call adds a new entry,
    /// and [`get`](Self::get) returns the most recently inserted value.
    /// Empty keys are rejected.
    pub fn insert(&self, key: &[u8], value: V) -> Result<(), Error> {
        self.raw.insert(key, value)
    }

    /// Returns a clone of the most recently inserted value for the key,
    /// if any. While a resize is in flight this checks the current bucket
    /// array first and falls back to the old one.
    pub fn get(&self, key: &[u8]) -> Option<V>
    where
        V: Clone,
    {
        self.raw.get(key)
    }

    /// Atomic get-or-insert. Returns the existing value for the key if one
    /// is present in either generation of the table, otherwise inserts
    /// `value` and returns it. Concurrent callers racing on an absent key
    /// all receive the single winning value.
    ///
    /// # Examples
    ///
    /// ```
    /// use troika::ShardMap;
    ///
    /// let map = ShardMap::new();
    /// assert_eq!(map.get_or_insert(b"a", 3)?, 3);
    /// assert_eq!(map.get_or_insert(b"a", 6)?, 3);
    /// # Ok::<(), troika::Error>(())
    /// ```
    pub fn get_or_insert(&self, key: &[u8], value: V) -> Result<V, Error>
    where
        V: Clone,
    {
        self.raw.get_or_insert(key, value)
    }

    /// Removes the most recently inserted entry for the key, returning its
    /// value, or `None` if the key is absent from both generations.
    pub fn remove(&self, key: &[u8]) -> Option<V> {
        self.raw.remove(key)
    }
}

impl<V, S> ShardMap<V, S> {
    /// Manually drains up to `max_steps` migration steps from the old
    /// bucket array, returning the number of steps performed. A step
    /// either moves one entry or retires one emptied bucket. Returns 0
    /// when no resize is in flight or another thread is already draining.
    pub fn gc(&self, max_steps: usize) -> usize {
        self.raw.gc(max_steps)
    }

    /// Returns the advisory number of entries in the map.
    ///
    /// The count is a sum of per-bucket counters read without
    /// synchronization, so it may be stale under concurrent writes.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Returns `true` if the advisory entry count is zero.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the current bucket count.
    pub fn buckets(&self) -> usize {
        self.raw.buckets()
    }

    /// Returns a snapshot of the map's advisory counters.
    pub fn stats(&self) -> MapStats {
        self.raw.stats()
    }
}

impl<V, S> fmt::Debug for ShardMap<V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardMap")
            .field("buckets", &self.buckets())
            .field("len", &self.len())
            .finish()
    }
}

/// A point-in-time snapshot of a map's advisory counters.
///
/// Counters are incremented with relaxed atomics on both success and
/// failure paths; they are best-effort under concurrency and carry no
/// ordering guarantees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct MapStats {
    /// Lookups, counting both `get` and `get_or_insert`.
    pub lookups: u64,
    /// Entries inserted, excluding migration moves.
    pub inserts: u64,
    /// Entries removed.
    pub removes: u64,
    /// Inserts that landed in a non-empty bucket.
    pub collisions: u64,
    /// Completed bucket-array doublings.
    pub resizes: u64,
    /// Grow attempts declined because a migration was still in flight.
    pub resize_fails: u64,
}
