//! Tally Cache - read-through cache for backend queries
//!
//! A [`CacheManager`] owns every cached entry and mirrors it into an
//! optional [`DurableStore`]. A [`ReadThroughCache`] sits in front of the
//! backend: fresh entries are served directly, stale ones are served while a
//! single background refresh runs, and expired or missing ones are fetched
//! synchronously with the cached copy as a fallback when the backend fails.

pub mod entry;
pub mod error;
pub mod freshness;
pub mod lmdb_store;
pub mod manager;
pub mod memory_store;
pub mod observer;
pub mod read_through;
pub mod traits;

pub use entry::{CacheEntry, PersistedEntry};
pub use error::CacheError;
pub use freshness::{CacheRead, EntryState, ReadSource};
pub use lmdb_store::LmdbStore;
pub use manager::CacheManager;
pub use memory_store::InMemoryStore;
pub use observer::TracingObserver;
pub use read_through::ReadThroughCache;
pub use traits::{CacheObserver, CacheStats, Cacheable, DurableStore, Fetcher, PersistOp};

// Re-export the core vocabulary so most callers need one dependency.
pub use tally_core::{
    derive_key, CacheConfig, CacheKey, Clock, FreshnessPolicy, KeyError, KeySpace, ManualClock,
    StoreError, SystemClock, TallyError, TallyResult,
};
