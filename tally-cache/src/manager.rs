//! Cache manager: sole owner of the key to entry map.
//!
//! Every create, overwrite and delete of an entry goes through here. Lookups
//! and invalidations never fail; durable store failures are reported to the
//! observer and otherwise ignored, because the in-memory map is the source of
//! truth for the running process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tally_core::{
    CacheConfig, CacheKey, Clock, FreshnessPolicy, StoreError, SystemClock, TallyResult,
    KEY_SEPARATOR,
};

use crate::entry::{CacheEntry, PersistedEntry, StoredEntry};
use crate::lmdb_store::LmdbStore;
use crate::observer::TracingObserver;
use crate::traits::{CacheObserver, CacheStats, Cacheable, DurableStore, PersistOp};

/// Atomic usage counters; snapshotted into [`CacheStats`].
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) hits: AtomicU64,
    pub(crate) stale_hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) expired_reads: AtomicU64,
    pub(crate) fetches: AtomicU64,
    pub(crate) fetch_failures: AtomicU64,
    pub(crate) fallbacks: AtomicU64,
    pub(crate) refreshes_started: AtomicU64,
    pub(crate) refresh_failures: AtomicU64,
    pub(crate) persist_failures: AtomicU64,
    pub(crate) evictions: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

type PersistFailure = (Option<CacheKey>, PersistOp, StoreError);

/// Owner of all cache entries.
///
/// Constructed explicitly and shared by `Arc`; there is no global instance,
/// so independent caches (one per test, one per signed-in user) never see
/// each other's entries.
///
/// # Example
///
/// ```ignore
/// let manager = Arc::new(
///     CacheManager::new(CacheConfig::from_env()?)
///         .with_store(Arc::new(LmdbStore::open(path, 64)?)),
/// );
/// manager.hydrate();
/// ```
pub struct CacheManager {
    entries: RwLock<HashMap<CacheKey, StoredEntry>>,
    store: Option<Arc<dyn DurableStore>>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn CacheObserver>,
    config: CacheConfig,
    counters: StatsCounters,
}

impl CacheManager {
    /// Create an in-memory manager with the system clock and tracing observer.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            store: None,
            clock: Arc::new(SystemClock),
            observer: Arc::new(TracingObserver),
            config,
            counters: StatsCounters::default(),
        }
    }

    /// Create a manager from configuration, opening and hydrating the LMDB
    /// store when `lmdb_path` is set and persistence is enabled.
    pub fn open(config: CacheConfig) -> TallyResult<Self> {
        config.validate()?;

        let lmdb = match (&config.lmdb_path, config.persist) {
            (Some(path), true) => Some(LmdbStore::open(path, config.lmdb_max_size_mb)?),
            _ => None,
        };

        let mut manager = Self::new(config);
        if let Some(store) = lmdb {
            manager = manager.with_store(Arc::new(store));
            manager.hydrate();
        }
        Ok(manager)
    }

    /// Attach a durable store.
    pub fn with_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn CacheObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Current time according to the cache clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ========================================================================
    // ENTRY OPERATIONS
    // ========================================================================

    /// Look up an entry.
    ///
    /// Pure lookup: no eviction, no refresh. An entry that is present but
    /// expired is returned as is; the caller decides what that means. A
    /// payload of a different type than `T` reads as absent.
    ///
    /// A hydrated entry is decoded from JSON on its first typed read and kept
    /// as a live value from then on, so it is parsed once and later reads of
    /// another type miss just as they would for a value written by `set`.
    pub fn get<T: Cacheable>(&self, key: &CacheKey) -> Option<CacheEntry<T>> {
        let (decoded, serialized) = {
            let entries = self.read_entries();
            let stored = entries.get(key)?;
            (stored.decode::<T>(), stored.is_serialized())
        };

        let Some(decoded) = decoded else {
            tracing::debug!(
                key = %key,
                expected = std::any::type_name::<T>(),
                "Cached payload does not match requested type"
            );
            return None;
        };

        if serialized {
            let mut entries = self.write_entries();
            // Skip if the entry was replaced while unlocked.
            if let Some(stored) = entries.get_mut(key) {
                if stored.is_serialized() && stored.stored_at == decoded.stored_at() {
                    stored.promote(decoded.value().clone());
                    tracing::trace!(key = %key, "Promoted hydrated entry to live value");
                }
            }
        }
        Some(decoded)
    }

    /// Store a value, replacing any existing entry and resetting its age.
    ///
    /// Also mirrors the entry into the durable store when one is attached.
    /// Persistence is best-effort: failures go to the observer, never to the
    /// caller.
    pub fn set<T: Cacheable>(&self, key: &CacheKey, value: T, policy: FreshnessPolicy) {
        let stored_at = self.clock.now();
        let serialized = self.store().map(|store| {
            let raw = PersistedEntry::from_value(&value, stored_at, policy)
                .and_then(|entry| entry.encode());
            (store, raw)
        });

        let mut failures: Vec<PersistFailure> = Vec::new();
        let mut entries = self.write_entries();

        let evicted = if !entries.contains_key(key) && entries.len() >= self.capacity() {
            evict_oldest(&mut entries)
        } else {
            None
        };
        entries.insert(key.clone(), StoredEntry::live(value, stored_at, policy));

        // Store writes stay under the map lock so disk order matches memory order.
        if let Some((store, raw)) = serialized {
            if let Err(e) = raw.and_then(|raw| store.persist(key.as_str(), &raw)) {
                failures.push((Some(key.clone()), PersistOp::Persist, e));
            }
            if let Some(evicted) = &evicted {
                if let Err(e) = store.remove(evicted.as_str()) {
                    failures.push((Some(evicted.clone()), PersistOp::Remove, e));
                }
            }
        }
        drop(entries);

        if let Some(evicted) = evicted {
            StatsCounters::bump(&self.counters.evictions);
            self.observer.on_eviction(&evicted);
        }
        self.report(failures);
        tracing::trace!(key = %key, "Cache entry stored");
    }

    /// Remove one entry. Removing an absent key is a no-op.
    pub fn invalidate(&self, key: &CacheKey) {
        let mut failures: Vec<PersistFailure> = Vec::new();
        let mut entries = self.write_entries();
        let removed = entries.remove(key).is_some();

        if let Some(store) = self.store() {
            if let Err(e) = store.remove(key.as_str()) {
                failures.push((Some(key.clone()), PersistOp::Remove, e));
            }
        }
        drop(entries);

        self.report(failures);
        tracing::debug!(key = %key, removed, "Invalidated cache entry");
    }

    /// Remove every entry belonging to `operation`, whatever its parameters.
    ///
    /// Returns the number of in-memory entries removed. Persisted entries for
    /// the operation are removed as well. An empty name, or one containing
    /// `:`, can never be an operation and removes nothing.
    pub fn invalidate_by_operation(&self, operation: &str) -> usize {
        if operation.is_empty() || operation.contains(KEY_SEPARATOR) {
            tracing::debug!(operation, "Ignoring invalidation of invalid operation name");
            return 0;
        }

        let mut failures: Vec<PersistFailure> = Vec::new();
        let mut entries = self.write_entries();
        let before = entries.len();
        entries.retain(|key, _| !key.belongs_to(operation));
        let removed = before - entries.len();

        if let Some(store) = self.store() {
            let prefix = format!("{}{}", operation, KEY_SEPARATOR);
            if let Err(e) = store.remove_prefix(&prefix) {
                failures.push((None, PersistOp::Remove, e));
            }
            // Raw keys without a separator are their own operation.
            if let Err(e) = store.remove(operation) {
                failures.push((Some(CacheKey::from_raw(operation)), PersistOp::Remove, e));
            }
        }
        drop(entries);

        self.report(failures);
        tracing::debug!(operation, removed, "Invalidated cache entries by operation");
        removed
    }

    /// Remove every entry, in memory and in the durable store.
    pub fn clear(&self) {
        let mut failures: Vec<PersistFailure> = Vec::new();
        let mut entries = self.write_entries();
        let removed = entries.len();
        entries.clear();

        if let Some(store) = self.store() {
            if let Err(e) = store.clear() {
                failures.push((None, PersistOp::Clear, e));
            }
        }
        drop(entries);

        self.report(failures);
        tracing::info!(removed, "Cache cleared");
    }

    /// Evict every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut failures: Vec<PersistFailure> = Vec::new();
        let mut entries = self.write_entries();

        let expired: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            entries.remove(key);
            if let Some(store) = self.store() {
                if let Err(e) = store.remove(key.as_str()) {
                    failures.push((Some(key.clone()), PersistOp::Remove, e));
                }
            }
        }
        drop(entries);

        self.report(failures);
        if !expired.is_empty() {
            tracing::debug!(purged = expired.len(), "Purged expired cache entries");
        }
        expired.len()
    }

    // ========================================================================
    // PERSISTENCE
    // ========================================================================

    /// Load every persisted entry into memory, keeping its original
    /// `stored_at`, so an old entry may already be stale or expired.
    ///
    /// Entries already in memory with the same or a newer timestamp win.
    /// Newest entries are loaded first until capacity is reached. Returns the
    /// number of entries loaded.
    pub fn hydrate(&self) -> usize {
        let Some(store) = self.store() else {
            return 0;
        };

        let raw = match store.load_all() {
            Ok(raw) => raw,
            Err(e) => {
                self.report(vec![(None, PersistOp::Load, e)]);
                return 0;
            }
        };

        let mut failures: Vec<PersistFailure> = Vec::new();
        let mut loaded: Vec<(CacheKey, StoredEntry)> = Vec::with_capacity(raw.len());
        for (key, value) in raw {
            let key = CacheKey::from_raw(key);
            match PersistedEntry::decode(&value).and_then(StoredEntry::from_persisted) {
                Ok(entry) => loaded.push((key, entry)),
                Err(e) => failures.push((Some(key), PersistOp::Load, e)),
            }
        }
        loaded.sort_by(|a, b| b.1.stored_at.cmp(&a.1.stored_at));

        let capacity = self.capacity();
        let mut hydrated = 0usize;
        let mut entries = self.write_entries();
        for (key, entry) in loaded {
            match entries.get(&key) {
                Some(existing) if existing.stored_at >= entry.stored_at => continue,
                None if entries.len() >= capacity => continue,
                _ => {}
            }
            entries.insert(key, entry);
            hydrated += 1;
        }
        drop(entries);

        self.report(failures);
        tracing::info!(hydrated, "Hydrated cache from durable store");
        hydrated
    }

    /// Read an entry straight from the durable store.
    ///
    /// Used as the last-resort fallback when a fetch fails and memory holds
    /// nothing for the key.
    pub fn load_persisted<T: Cacheable>(&self, key: &CacheKey) -> Option<CacheEntry<T>> {
        let store = self.store()?;

        let raw = match store.load(key.as_str()) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                self.report(vec![(Some(key.clone()), PersistOp::Load, e)]);
                return None;
            }
        };

        match PersistedEntry::decode(&raw).and_then(StoredEntry::from_persisted) {
            Ok(stored) => stored.decode::<T>(),
            Err(e) => {
                self.report(vec![(Some(key.clone()), PersistOp::Load, e)]);
                None
            }
        }
    }

    // ========================================================================
    // INSPECTION
    // ========================================================================

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.read_entries().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.read_entries().keys().cloned().collect()
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            stale_hits: c.stale_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            expired_reads: c.expired_reads.load(Ordering::Relaxed),
            fetches: c.fetches.load(Ordering::Relaxed),
            fetch_failures: c.fetch_failures.load(Ordering::Relaxed),
            fallbacks: c.fallbacks.load(Ordering::Relaxed),
            refreshes_started: c.refreshes_started.load(Ordering::Relaxed),
            refresh_failures: c.refresh_failures.load(Ordering::Relaxed),
            persist_failures: c.persist_failures.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            entry_count: self.len() as u64,
        }
    }

    pub(crate) fn counters(&self) -> &StatsCounters {
        &self.counters
    }

    pub(crate) fn observer(&self) -> &dyn CacheObserver {
        self.observer.as_ref()
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn store(&self) -> Option<&Arc<dyn DurableStore>> {
        if self.config.persist {
            self.store.as_ref()
        } else {
            None
        }
    }

    fn capacity(&self) -> usize {
        self.config.max_entries.max(1)
    }

    fn report(&self, failures: Vec<PersistFailure>) {
        for (key, op, error) in failures {
            StatsCounters::bump(&self.counters.persist_failures);
            self.observer.on_persist_failure(key.as_ref(), op, &error);
        }
    }

    // The map holds no cross-entry invariants, so a poisoned lock is still usable.
    fn read_entries(&self) -> RwLockReadGuard<'_, HashMap<CacheKey, StoredEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, HashMap<CacheKey, StoredEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("entries", &self.len())
            .field("persistent", &self.store().is_some())
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish()
    }
}

fn evict_oldest(entries: &mut HashMap<CacheKey, StoredEntry>) -> Option<CacheKey> {
    let oldest = entries
        .iter()
        .min_by_key(|(_, entry)| entry.stored_at)
        .map(|(key, _)| key.clone())?;
    entries.remove(&oldest);
    Some(oldest)
}
