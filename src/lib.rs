//! Concurrent in-memory building blocks for pipeline runtimes.
//!
//! The crate provides three independent primitives sharing a common
//! fine-grained locking discipline: [`ShardMap`], a byte-keyed hash table
//! with online incremental resize; [`ExpiryQueue`], an earliest-deadline
//! priority queue with TTL-based expiration; and [`TimerWheel`], a hashed
//! timer wheel with per-slot locking.

mod error;
mod map;
mod queue;
mod raw;
mod wheel;

pub use error::Error;
pub use map::{MapStats, ShardMap, ShardMapBuilder};
pub use queue::{ExpiryQueue, Item, QueueStats};
pub use wheel::{TimerWheel, WheelStats};
