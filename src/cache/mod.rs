//! Stale-while-revalidate caching with durable snapshots.
//!
//! This module provides a payload-agnostic cache that:
//! - Serves the last known value immediately, fresh or not
//! - Refreshes missing or stale keys in the background, one fetch per key
//! - Persists every successful refresh under a versioned storage key
//! - Hydrates persisted snapshots on start, unless corrupt, mismatched or too old

mod storage;
mod store;
mod traits;

pub use storage::{KvStorage, MemoryStorage, NoopStorage, SqliteStorage};
pub use store::{CacheOptions, CacheStore, SCHEMA_VERSION};
pub use traits::{CacheEntry, CacheEvent, CacheEventKind, Cacheable, Clock, ReadResult, SystemClock};

#[cfg(test)]
pub use traits::ManualClock;
