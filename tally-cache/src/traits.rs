//! Cache collaborator traits and the cacheable payload marker.
//!
//! This module defines the seams of the cache: payloads it can hold,
//! fetchers it refreshes from, durable stores it mirrors into, and observers
//! it reports swallowed failures to.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tally_core::{CacheKey, StoreError};

/// Marker trait for payloads that can be cached.
///
/// # Implementation Requirements
///
/// - `Clone`: readers receive their own copy, the manager keeps the original
/// - `Serialize` / `DeserializeOwned`: entries are mirrored into the durable
///   store as JSON and read back after a restart
/// - `Send + Sync + 'static`: values cross into background refresh tasks
///
/// Blanket-implemented for every type meeting these bounds.
pub trait Cacheable: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Cacheable for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Backend fetcher for one logical query.
///
/// The closure form accepted by `ReadThroughCache::resolve` covers most call
/// sites; this trait exists for services that keep a long-lived fetcher
/// object (e.g. a backend client bound to a user).
#[async_trait]
pub trait Fetcher<T: Cacheable>: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Perform the real backend call.
    async fn fetch(&self) -> Result<T, Self::Error>;
}

/// Durable key-value store used for cross-session persistence.
///
/// Every method is best-effort from the cache's point of view: the manager
/// reports failures to its [`CacheObserver`] and carries on. Values are
/// serialized entries (see `PersistedEntry`).
pub trait DurableStore: Send + Sync {
    /// Write (or overwrite) the serialized entry for `key`.
    fn persist(&self, key: &str, serialized_entry: &str) -> Result<(), StoreError>;

    /// Read the serialized entry for `key`.
    fn load(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Remove one key. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Remove every key starting with `prefix`, returning how many were removed.
    fn remove_prefix(&self, prefix: &str) -> Result<u64, StoreError>;

    /// Read every stored entry.
    fn load_all(&self) -> Result<Vec<(String, String)>, StoreError>;

    /// Remove everything.
    fn clear(&self) -> Result<(), StoreError>;
}

/// Which durable store call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOp {
    /// Writing one entry after a `set`.
    Persist,
    /// Reading entries during hydration or a durable fallback.
    Load,
    /// Deleting one entry, a whole operation, or an evicted entry.
    Remove,
    /// Wiping the store.
    Clear,
}

impl std::fmt::Display for PersistOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Persist => "persist",
            Self::Load => "load",
            Self::Remove => "remove",
            Self::Clear => "clear",
        };
        f.write_str(name)
    }
}

/// Receives failures the cache deliberately swallows.
///
/// None of these callbacks may fail or block for long; they run inline with
/// cache operations.
pub trait CacheObserver: Send + Sync {
    /// A durable store call failed. `key` is `None` for whole-store calls.
    fn on_persist_failure(&self, _key: Option<&CacheKey>, _op: PersistOp, _error: &StoreError) {}

    /// A background refresh failed; the stale entry was left in place.
    fn on_refresh_failure(&self, _key: &CacheKey, _error: &(dyn std::error::Error + 'static)) {}

    /// An entry was evicted to stay within capacity.
    fn on_eviction(&self, _key: &CacheKey) {}
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served from a fresh entry.
    pub hits: u64,
    /// Reads served from a stale entry (a refresh may have been started).
    pub stale_hits: u64,
    /// Reads that found no entry.
    pub misses: u64,
    /// Reads that found an expired entry.
    pub expired_reads: u64,
    /// Synchronous fetches performed.
    pub fetches: u64,
    /// Synchronous fetches that failed.
    pub fetch_failures: u64,
    /// Failed fetches answered from an expired or persisted entry.
    pub fallbacks: u64,
    /// Background refreshes started.
    pub refreshes_started: u64,
    /// Background refreshes that failed.
    pub refresh_failures: u64,
    /// Durable store calls that failed.
    pub persist_failures: u64,
    /// Entries evicted to stay within capacity.
    pub evictions: u64,
    /// Number of entries currently in memory.
    pub entry_count: u64,
}

impl CacheStats {
    /// Fraction of reads answered without a synchronous fetch (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.stale_hits;
        let total = served + self.misses + self.expired_reads;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}
