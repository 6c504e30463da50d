use std::hash::{BuildHasherDefault, Hasher};

use troika::{Error, ExpiryQueue, ShardMap, TimerWheel};

mod common;
use common::with_map;

// Deterministic FNV-1a, for driving the table through a caller-supplied
// hasher.
struct Fnv(u64);

impl Default for Fnv {
    fn default() -> Fnv {
        Fnv(0xcbf2_9ce4_8422_2325)
    }
}

impl Hasher for Fnv {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.0 ^= u64::from(byte);
            self.0 = self.0.wrapping_mul(0x100_0000_01b3);
        }
    }
}

#[test]
fn send_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<ShardMap<usize>>();
    assert_send_sync::<ExpiryQueue<usize>>();
    assert_send_sync::<TimerWheel<usize>>();
}

#[test]
fn new() {
    with_map::<usize>(|map| drop(map()));
}

#[test]
fn insert_lookup_remove() {
    with_map::<u32>(|map| {
        let map = map();
        map.insert(&[0x2a, 0, 0, 0], 23).unwrap();
        assert_eq!(map.get(&[0x2a, 0, 0, 0]), Some(23));
        assert_eq!(map.get(&[0x17, 0, 0, 0]), None);
        assert_eq!(map.remove(&[0x2a, 0, 0, 0]), Some(23));
        assert_eq!(map.get(&[0x2a, 0, 0, 0]), None);
    });
}

#[test]
fn remove_missing() {
    with_map::<u32>(|map| {
        let map = map();
        assert_eq!(map.remove(b"missing"), None);
        map.insert(b"present", 1).unwrap();
        assert_eq!(map.remove(b"missing"), None);
        assert_eq!(map.remove(b"present"), Some(1));
        // The entry is gone; a second remove reports not-found again.
        assert_eq!(map.remove(b"present"), None);
    });
}

#[test]
fn empty_key_rejected() {
    with_map::<u32>(|map| {
        let map = map();
        assert_eq!(map.insert(b"", 1), Err(Error::EmptyKey));
        assert_eq!(map.get_or_insert(b"", 1), Err(Error::EmptyKey));
        assert_eq!(map.get(b""), None);
        assert_eq!(map.remove(b""), None);
    });
}

#[test]
fn duplicate_inserts_are_lifo() {
    with_map::<u32>(|map| {
        let map = map();
        map.insert(b"key", 1).unwrap();
        map.insert(b"key", 2).unwrap();
        map.insert(b"key", 3).unwrap();

        // The most recent insert wins lookups.
        assert_eq!(map.get(b"key"), Some(3));
        assert_eq!(map.len(), 3);

        // Removal peels the chain back one winner at a time.
        assert_eq!(map.remove(b"key"), Some(3));
        assert_eq!(map.get(b"key"), Some(2));
        assert_eq!(map.remove(b"key"), Some(2));
        assert_eq!(map.remove(b"key"), Some(1));
        assert_eq!(map.remove(b"key"), None);
    });
}

#[test]
fn get_or_insert_returns_existing() {
    with_map::<u32>(|map| {
        let map = map();
        assert_eq!(map.get_or_insert(b"a", 3).unwrap(), 3);
        assert_eq!(map.get_or_insert(b"a", 6).unwrap(), 3);
        assert_eq!(map.get(b"a"), Some(3));
        assert_eq!(map.len(), 1);
    });
}

#[test]
fn get_or_insert_sees_plain_inserts() {
    with_map::<u32>(|map| {
        let map = map();
        map.insert(b"a", 1).unwrap();
        assert_eq!(map.get_or_insert(b"a", 2).unwrap(), 1);
    });
}

// Inserting far more keys than a tiny table can hold must trigger growth
// and never lose an entry, however the migration interleaves.
#[test]
fn resize_preserves_entries() {
    let map = ShardMap::builder().buckets(10).build();
    for i in 0..10_000u32 {
        map.insert(&i.to_le_bytes(), i).unwrap();
    }

    assert!(map.stats().resizes >= 1);
    assert!(map.buckets() > 10);

    for i in 0..10_000u32 {
        assert_eq!(map.get(&i.to_le_bytes()), Some(i), "key {i} lost");
    }
    assert_eq!(map.len(), 10_000);
}

// Lookups drive the cooperative migration, so reading the whole map
// repeatedly finishes the drain without any manual gc calls.
#[test]
fn foreground_operations_finish_migration() {
    let map = ShardMap::builder().buckets(4).gc_batch(1).build();
    for i in 0..512u32 {
        map.insert(&i.to_le_bytes(), i).unwrap();
    }
    assert!(map.stats().resizes >= 1);

    for _ in 0..3 {
        for i in 0..512u32 {
            assert_eq!(map.get(&i.to_le_bytes()), Some(i));
        }
    }
    // Whatever is left can be drained manually.
    while map.gc(64) != 0 {}
    for i in 0..512u32 {
        assert_eq!(map.get(&i.to_le_bytes()), Some(i));
    }
}

#[test]
fn manual_gc_drains_old_table() {
    let map = ShardMap::builder().buckets(4).build();

    // Stop right after the first grow: the old bucket array still holds
    // every pre-resize entry, so the manual drain below has work to do.
    let mut inserted = 0u32;
    while map.stats().resizes == 0 {
        map.insert(&inserted.to_le_bytes(), inserted).unwrap();
        inserted += 1;
        assert!(inserted < 10_000, "resize never triggered");
    }

    let mut steps = 0;
    loop {
        let n = map.gc(16);
        if n == 0 {
            break;
        }
        assert!(n <= 16);
        steps += n;
    }
    assert!(steps > 0);
    // A drained table has nothing left to migrate.
    assert_eq!(map.gc(16), 0);
    for i in 0..inserted {
        assert_eq!(map.get(&i.to_le_bytes()), Some(i));
    }
}

#[test]
fn removes_find_entries_parked_in_old_table() {
    let map = ShardMap::builder().buckets(4).gc_batch(1).build();
    for i in 0..64u32 {
        map.insert(&i.to_le_bytes(), i).unwrap();
    }
    assert!(map.stats().resizes >= 1);

    // Some of these still live in the old bucket array.
    for i in 0..64u32 {
        assert_eq!(map.remove(&i.to_le_bytes()), Some(i), "key {i} lost");
    }
    assert!(map.is_empty());
}

#[test]
fn len_and_stats() {
    let map = ShardMap::builder().buckets(16).build();
    assert!(map.is_empty());
    for i in 0..8u32 {
        map.insert(&i.to_le_bytes(), i).unwrap();
    }
    assert_eq!(map.len(), 8);
    map.get(&0u32.to_le_bytes());
    map.remove(&0u32.to_le_bytes());

    let stats = map.stats();
    assert_eq!(stats.inserts, 8);
    assert_eq!(stats.lookups, 1);
    assert_eq!(stats.removes, 1);
    assert_eq!(map.len(), 7);
}

// Every operation goes through the builder-supplied hasher, including the
// rehash of migrated entries.
#[test]
fn custom_hasher() {
    let map: ShardMap<u32, BuildHasherDefault<Fnv>> = ShardMap::builder()
        .buckets(4)
        .hasher(BuildHasherDefault::<Fnv>::default())
        .build();

    for i in 0..128u32 {
        map.insert(&i.to_le_bytes(), i).unwrap();
    }
    assert!(map.stats().resizes >= 1);

    for i in 0..128u32 {
        assert_eq!(map.get(&i.to_le_bytes()), Some(i), "key {i} lost");
    }
    assert_eq!(map.get_or_insert(b"present", 1).unwrap(), 1);
    assert_eq!(map.get_or_insert(b"present", 2).unwrap(), 1);
    assert_eq!(map.remove(b"present"), Some(1));

    // Finish the migration and take everything back out, all through the
    // same hasher.
    while map.gc(64) != 0 {}
    for i in 0..128u32 {
        assert_eq!(map.remove(&i.to_le_bytes()), Some(i));
    }
    assert!(map.is_empty());
}

#[test]
fn values_with_drop_semantics() {
    use std::sync::Arc;

    let value = Arc::new(42);
    let map: ShardMap<Arc<i32>> = ShardMap::new();
    map.insert(b"shared", Arc::clone(&value)).unwrap();
    assert_eq!(Arc::strong_count(&value), 2);

    let got = map.get(b"shared").unwrap();
    assert!(Arc::ptr_eq(&got, &value));
    drop(got);

    drop(map);
    // Dropping the map drains its entries.
    assert_eq!(Arc::strong_count(&value), 1);
}

#[test]
fn debug_and_default() {
    let map: ShardMap<u32> = ShardMap::default();
    map.insert(b"k", 1).unwrap();
    let repr = format!("{map:?}");
    assert!(repr.contains("ShardMap"));
    assert!(repr.contains("len"));
}
