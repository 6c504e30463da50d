use criterion::{black_box, criterion_group, criterion_main, Criterion};

use troika::{ExpiryQueue, ShardMap, TimerWheel};

fn map_ops(c: &mut Criterion) {
    let mut group = c.benchmark_group("map");

    group.bench_function("insert", |b| {
        let map = ShardMap::new();
        let mut i = 0u64;
        b.iter(|| {
            map.insert(&i.to_le_bytes(), i).unwrap();
            i += 1;
        });
    });

    group.bench_function("get", |b| {
        let map = ShardMap::new();
        for i in 0..100_000u64 {
            map.insert(&i.to_le_bytes(), i).unwrap();
        }
        let mut i = 0u64;
        b.iter(|| {
            black_box(map.get(&(i % 100_000).to_le_bytes()));
            i += 1;
        });
    });

    group.bench_function("get_or_insert", |b| {
        let map = ShardMap::new();
        let mut i = 0u64;
        b.iter(|| {
            black_box(map.get_or_insert(&(i % 1024).to_le_bytes(), i).unwrap());
            i += 1;
        });
    });

    group.finish();
}

fn queue_ops(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");

    group.bench_function("insert_expire", |b| {
        let queue = ExpiryQueue::new(|v: &u64| {
            black_box(v);
        });
        let mut now = 0u64;
        b.iter(|| {
            queue.insert(now, now, 64);
            queue.expire(now, 16);
            now += 1;
        });
    });

    group.finish();
}

fn wheel_ops(c: &mut Criterion) {
    let mut group = c.benchmark_group("wheel");

    group.bench_function("add_tick", |b| {
        let wheel = TimerWheel::with_config(1024, 1_000, |v: u64| {
            black_box(v);
        });
        let mut now = 0u64;
        b.iter(|| {
            wheel.add(16_000, now);
            now += 1_000;
            wheel.tick(now);
        });
    });

    group.finish();
}

criterion_group!(benches, map_ops, queue_ops, wheel_ops);
criterion_main!(benches);
