use troika::ShardMap;

// Number of threads for stress tests.
#[allow(dead_code)]
pub fn threads() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(4)
        .clamp(2, 8)
}

// Run the test on different configurations of a `ShardMap`.
pub fn with_map<V>(mut test: impl FnMut(&dyn Fn() -> ShardMap<V>)) {
    // Default table.
    test(&(|| ShardMap::new()));

    // Tiny table so inserts trip the resize threshold almost immediately.
    test(&(|| ShardMap::builder().buckets(4).build()));

    // Single-step migration batches to stretch the resize window.
    test(&(|| ShardMap::builder().buckets(4).gc_batch(1).build()));
}
