//! Concurrent, capacity-bounded LRU cache with pinnable entries.
//!
//! Entries carry an arbitrary `charge` counted against the cache capacity and
//! stay pinned in memory while the caller holds a [PinnedEntry] handle to
//! them. Pinned entries are never evicted, even if overwritten or removed
//! from the index in the meantime. An optional per-entry deleter observes the
//! owned key and value exactly once, when the entry is finally destroyed.
//!
//! The cache is internally split into shards selected by key hash, so
//! operations on different shards proceed without contention.
//!
//! # Example
//!
//! ```rust
//! use pin_cache::sync::Cache;
//!
//! let cache: Cache<&str, u32> = Cache::new(1000);
//! cache.insert("square", 2u32.pow(2), 4).release();
//! let pinned = cache.get("square").unwrap();
//! assert_eq!(pinned.value(), 4);
//! drop(pinned);
//! ```
//!
//! # Features
//!
//! * `ahash`: Use the ahash hasher by default.
//! * `parking_lot`: Use parking_lot locks for the shards.
//! * `stats`: Keeps track of hits and misses.

mod arena;
mod options;
mod rw_lock;
mod shard;
mod shim;
pub mod sync;

#[cfg(all(test, feature = "shuttle"))]
mod shuttle_tests;

pub use options::{Options, OptionsBuilder};
pub use shard::Deleter;
pub use sync::{Cache, PinnedEntry};

#[cfg(feature = "ahash")]
pub type DefaultHashBuilder = ahash::RandomState;
#[cfg(not(feature = "ahash"))]
pub type DefaultHashBuilder = std::collections::hash_map::RandomState;
