//! Read-through coordinator with stale-while-revalidate refresh.
//!
//! Routes every read through the cache manager and decides, from the
//! entry's age, whether to serve it, serve it and refresh in the background,
//! or fetch synchronously.
//!
//! | Entry     | Action                                   | Returns               |
//! |-----------|------------------------------------------|-----------------------|
//! | absent    | await fetch, store result                | fetched value         |
//! | fresh     | none                                     | cached value          |
//! | stale     | start one background refresh per key     | cached value          |
//! | expired   | await fetch, store result                | fetched, or expired   |
//!
//! A failed synchronous fetch falls back to the expired entry, then to the
//! durable store copy; the fetch error only surfaces when neither exists.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tally_core::{CacheKey, FreshnessPolicy, KeySpace};
use tokio::sync::Notify;

use crate::entry::CacheEntry;
use crate::error::CacheError;
use crate::freshness::{CacheRead, EntryState, ReadSource};
use crate::manager::{CacheManager, StatsCounters};
use crate::traits::{Cacheable, Fetcher};

/// Read-through cache over a shared [`CacheManager`].
///
/// Cloning is cheap; clones share the manager and the in-flight refresh set.
///
/// # Example
///
/// ```ignore
/// let cache = ReadThroughCache::new(Arc::new(CacheManager::new(config)));
/// let wallets = KeySpace::<Vec<Wallet>>::new("fetchWallets", policy)?;
///
/// let list = cache
///     .resolve_in(&wallets, &json!({ "userId": user }), move || async move {
///         client.fetch_wallets(user).await
///     })
///     .await?;
/// ```
#[derive(Clone)]
pub struct ReadThroughCache {
    inner: Arc<Inner>,
}

struct Inner {
    manager: Arc<CacheManager>,
    /// Keys with a background refresh in flight.
    in_flight: Mutex<HashSet<CacheKey>>,
    refresh_done: Notify,
}

impl Inner {
    fn lock_in_flight(&self) -> MutexGuard<'_, HashSet<CacheKey>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ReadThroughCache {
    pub fn new(manager: Arc<CacheManager>) -> Self {
        Self {
            inner: Arc::new(Inner {
                manager,
                in_flight: Mutex::new(HashSet::new()),
                refresh_done: Notify::new(),
            }),
        }
    }

    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.inner.manager
    }

    // ========================================================================
    // RESOLVE
    // ========================================================================

    /// Resolve a value for `key`, fetching through `fetch` when needed.
    ///
    /// `policy` applies to the value stored after a fetch. Entries already
    /// cached are classified by the policy they were stored with.
    pub async fn resolve<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        fetch: F,
        policy: FreshnessPolicy,
    ) -> Result<T, CacheError<E>>
    where
        T: Cacheable,
        E: std::error::Error + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.resolve_read(key, fetch, policy)
            .await
            .map(CacheRead::into_value)
    }

    /// Like [`resolve`](Self::resolve), but reports where the value came from.
    pub async fn resolve_read<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        fetch: F,
        policy: FreshnessPolicy,
    ) -> Result<CacheRead<T>, CacheError<E>>
    where
        T: Cacheable,
        E: std::error::Error + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let manager = &self.inner.manager;
        let counters = manager.counters();

        let Some(entry) = manager.get::<T>(key) else {
            StatsCounters::bump(&counters.misses);
            tracing::debug!(key = %key, "Cache miss");
            return self.fetch_and_store(key, fetch, policy, None).await;
        };

        let stored_at = entry.stored_at();
        match entry.state(manager.now()) {
            EntryState::Fresh => {
                StatsCounters::bump(&counters.hits);
                tracing::trace!(key = %key, "Cache hit");
                Ok(CacheRead::new(entry.into_value(), ReadSource::Cache, stored_at))
            }
            EntryState::Stale => {
                StatsCounters::bump(&counters.stale_hits);
                tracing::debug!(key = %key, "Serving stale entry");
                self.spawn_refresh(key, fetch, policy);
                Ok(CacheRead::new(entry.into_value(), ReadSource::Stale, stored_at))
            }
            EntryState::Expired => {
                StatsCounters::bump(&counters.expired_reads);
                tracing::debug!(key = %key, "Cache entry expired, fetching");
                self.fetch_and_store(key, fetch, policy, Some(entry)).await
            }
        }
    }

    /// Resolve within a key space: derives the key from `params` and uses
    /// the space's freshness policy.
    pub async fn resolve_in<T, P, E, F, Fut>(
        &self,
        space: &KeySpace<T>,
        params: &P,
        fetch: F,
    ) -> Result<T, CacheError<E>>
    where
        T: Cacheable,
        P: serde::Serialize + ?Sized,
        E: std::error::Error + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let key = space.key(params)?;
        self.resolve(&key, fetch, space.policy()).await
    }

    /// Resolve through a long-lived [`Fetcher`].
    pub async fn resolve_with<T, Fe>(
        &self,
        key: &CacheKey,
        fetcher: Arc<Fe>,
        policy: FreshnessPolicy,
    ) -> Result<T, CacheError<Fe::Error>>
    where
        T: Cacheable,
        Fe: Fetcher<T> + 'static,
    {
        self.resolve(key, move || async move { fetcher.fetch().await }, policy)
            .await
    }

    // ========================================================================
    // REFRESH TRACKING
    // ========================================================================

    /// Whether a background refresh for `key` is in flight.
    pub fn is_refreshing(&self, key: &CacheKey) -> bool {
        self.inner.lock_in_flight().contains(key)
    }

    pub fn refreshes_in_flight(&self) -> usize {
        self.inner.lock_in_flight().len()
    }

    /// Wait until no background refresh is in flight.
    ///
    /// Refreshes started while waiting are waited for too.
    pub async fn wait_for_refreshes(&self) {
        loop {
            let notified = self.inner.refresh_done.notified();
            let mut notified = std::pin::pin!(notified);
            // Register before checking so a completion in between is not missed.
            notified.as_mut().enable();

            if self.refreshes_in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    // ========================================================================
    // INVALIDATION
    // ========================================================================

    pub fn invalidate(&self, key: &CacheKey) {
        self.inner.manager.invalidate(key);
    }

    /// Drop every cached result of `operation`. Call after a mutation that
    /// makes its results obsolete.
    pub fn invalidate_by_operation(&self, operation: &str) -> usize {
        self.inner.manager.invalidate_by_operation(operation)
    }

    pub fn clear(&self) {
        self.inner.manager.clear();
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    async fn fetch_and_store<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        fetch: F,
        policy: FreshnessPolicy,
        expired: Option<CacheEntry<T>>,
    ) -> Result<CacheRead<T>, CacheError<E>>
    where
        T: Cacheable,
        E: std::error::Error + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let manager = &self.inner.manager;
        let counters = manager.counters();
        StatsCounters::bump(&counters.fetches);

        match fetch().await {
            Ok(value) => {
                let fetched_at = manager.now();
                manager.set(key, value.clone(), policy);
                Ok(CacheRead::fetched(value, fetched_at))
            }
            Err(error) => {
                StatsCounters::bump(&counters.fetch_failures);

                let fallback = expired.or_else(|| manager.load_persisted::<T>(key));
                match fallback {
                    Some(entry) => {
                        StatsCounters::bump(&counters.fallbacks);
                        tracing::warn!(
                            key = %key,
                            error = %error,
                            stored_at = %entry.stored_at(),
                            "Fetch failed, serving expired cached value"
                        );
                        let stored_at = entry.stored_at();
                        Ok(CacheRead::new(
                            entry.into_value(),
                            ReadSource::Fallback,
                            stored_at,
                        ))
                    }
                    None => {
                        tracing::warn!(
                            key = %key,
                            error = %error,
                            "Fetch failed with nothing cached"
                        );
                        Err(CacheError::FetchFailed {
                            key: key.clone(),
                            source: error,
                        })
                    }
                }
            }
        }
    }

    fn spawn_refresh<T, E, F, Fut>(&self, key: &CacheKey, fetch: F, policy: FreshnessPolicy)
    where
        T: Cacheable,
        E: std::error::Error + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key = %key, "No async runtime, skipping background refresh");
            return;
        };

        if !self.inner.lock_in_flight().insert(key.clone()) {
            tracing::trace!(key = %key, "Refresh already in flight");
            return;
        }

        StatsCounters::bump(&self.inner.manager.counters().refreshes_started);
        tracing::debug!(key = %key, "Starting background refresh");

        let guard = RefreshGuard {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
        };

        runtime.spawn(async move {
            let result = fetch().await;
            let manager = &guard.inner.manager;
            match result {
                Ok(value) => {
                    manager.set(&guard.key, value, policy);
                    tracing::debug!(key = %guard.key, "Background refresh completed");
                }
                Err(error) => {
                    StatsCounters::bump(&manager.counters().refresh_failures);
                    manager.observer().on_refresh_failure(&guard.key, &error);
                }
            }
        });
    }
}

impl std::fmt::Debug for ReadThroughCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadThroughCache")
            .field("manager", &self.inner.manager)
            .field("refreshes_in_flight", &self.refreshes_in_flight())
            .finish()
    }
}

/// Clears a key's in-flight marker when its refresh task ends, panics included.
struct RefreshGuard {
    inner: Arc<Inner>,
    key: CacheKey,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.inner.lock_in_flight().remove(&self.key);
        self.inner.refresh_done.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tally_core::{CacheConfig, Clock, ManualClock};
    use thiserror::Error;

    use crate::memory_store::InMemoryStore;

    #[derive(Debug, Error)]
    #[error("backend unavailable")]
    struct Offline;

    const HOUR: Duration = Duration::from_secs(3600);

    fn policy() -> FreshnessPolicy {
        FreshnessPolicy::new(HOUR, HOUR / 2).unwrap()
    }

    fn cache_with_clock() -> (ReadThroughCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let manager = CacheManager::new(CacheConfig::default()).with_clock(clock.clone());
        (ReadThroughCache::new(Arc::new(manager)), clock)
    }

    fn counting(
        calls: &Arc<AtomicUsize>,
        value: &'static str,
    ) -> impl FnOnce() -> std::future::Ready<Result<String, Offline>> + Send + 'static {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(value.to_string()))
        }
    }

    fn failing() -> impl FnOnce() -> std::future::Ready<Result<String, Offline>> + Send + 'static {
        || std::future::ready(Err(Offline))
    }

    #[tokio::test]
    async fn test_miss_fetches_and_stores() {
        let (cache, _clock) = cache_with_clock();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::from_raw("fetchWallets:a");

        let read = cache
            .resolve_read(&key, counting(&calls, "v1"), policy())
            .await
            .expect("resolve should succeed");

        assert_eq!(read.value(), "v1");
        assert_eq!(read.source(), ReadSource::Fetched);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.manager().contains(&key));
    }

    #[tokio::test]
    async fn test_fresh_hit_skips_fetch() {
        let (cache, clock) = cache_with_clock();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::from_raw("fetchWallets:a");

        cache.resolve(&key, counting(&calls, "v1"), policy()).await.unwrap();
        clock.advance(Duration::from_secs(60));

        let read = cache
            .resolve_read(&key, counting(&calls, "v2"), policy())
            .await
            .unwrap();
        assert_eq!(read.value(), "v1");
        assert_eq!(read.source(), ReadSource::Cache);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.refreshes_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_stale_serves_then_refreshes_once() {
        let (cache, clock) = cache_with_clock();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::from_raw("fetchWallets:a");

        cache.resolve(&key, counting(&calls, "v1"), policy()).await.unwrap();
        clock.advance(Duration::from_secs(31 * 60));

        // Hold the refresh open until both reads have happened.
        let gate = Arc::new(Notify::new());
        let make_gated = |value: &'static str| {
            let gate = Arc::clone(&gate);
            let calls = Arc::clone(&calls);
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
                Ok::<_, Offline>(value.to_string())
            }
        };

        let first = cache.resolve_read(&key, make_gated("v2"), policy()).await.unwrap();
        let second = cache.resolve_read(&key, make_gated("v3"), policy()).await.unwrap();

        assert_eq!(first.value(), "v1");
        assert_eq!(first.source(), ReadSource::Stale);
        assert_eq!(second.value(), "v1");
        assert!(cache.is_refreshing(&key));
        assert_eq!(cache.refreshes_in_flight(), 1);

        gate.notify_one();
        cache.wait_for_refreshes().await;

        assert!(!cache.is_refreshing(&key));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.manager().get::<String>(&key).unwrap().into_value(), "v2");
        assert_eq!(cache.manager().stats().refreshes_started, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_stale_reads_start_one_refresh() {
        let (cache, clock) = cache_with_clock();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::from_raw("fetchWallets:a");

        cache.resolve(&key, counting(&calls, "v1"), policy()).await.unwrap();
        clock.advance(Duration::from_secs(31 * 60));

        const READERS: usize = 16;
        let gate = Arc::new(Notify::new());
        let start = Arc::new(tokio::sync::Barrier::new(READERS));
        let mut handles = Vec::with_capacity(READERS);
        for _ in 0..READERS {
            let cache = cache.clone();
            let key = key.clone();
            let gate = Arc::clone(&gate);
            let calls = Arc::clone(&calls);
            let start = Arc::clone(&start);
            handles.push(tokio::spawn(async move {
                start.wait().await;
                let fetch = move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                    Ok::<_, Offline>("v2".to_string())
                };
                cache.resolve_read(&key, fetch, policy()).await
            }));
        }

        for handle in handles {
            let read = handle
                .await
                .expect("reader task should not panic")
                .expect("stale read should succeed");
            assert_eq!(read.value(), "v1");
            assert_eq!(read.source(), ReadSource::Stale);
        }
        assert_eq!(cache.refreshes_in_flight(), 1);

        gate.notify_one();
        cache.wait_for_refreshes().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.manager().stats().refreshes_started, 1);
        assert_eq!(cache.manager().stats().stale_hits, READERS as u64);
        assert_eq!(cache.manager().get::<String>(&key).unwrap().into_value(), "v2");
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_stale_entry() {
        let (cache, clock) = cache_with_clock();
        let key = CacheKey::from_raw("fetchCategories:a");
        let calls = Arc::new(AtomicUsize::new(0));

        cache.resolve(&key, counting(&calls, "v1"), policy()).await.unwrap();
        clock.advance(Duration::from_secs(45 * 60));

        let value = cache.resolve(&key, failing(), policy()).await.unwrap();
        assert_eq!(value, "v1");
        cache.wait_for_refreshes().await;

        assert_eq!(cache.manager().get::<String>(&key).unwrap().into_value(), "v1");
        assert_eq!(cache.manager().stats().refresh_failures, 1);
        assert!(!cache.is_refreshing(&key));
    }

    #[tokio::test]
    async fn test_expired_fetch_failure_falls_back() {
        let (cache, clock) = cache_with_clock();
        let key = CacheKey::from_raw("fetchWallets:a");
        let calls = Arc::new(AtomicUsize::new(0));

        cache.resolve(&key, counting(&calls, "old"), policy()).await.unwrap();
        clock.advance(HOUR * 2);

        let read = cache.resolve_read(&key, failing(), policy()).await.unwrap();
        assert_eq!(read.value(), "old");
        assert!(read.is_fallback());
        assert_eq!(cache.manager().stats().fallbacks, 1);
    }

    #[tokio::test]
    async fn test_expired_fetch_success_replaces_entry() {
        let (cache, clock) = cache_with_clock();
        let key = CacheKey::from_raw("fetchWallets:a");
        let calls = Arc::new(AtomicUsize::new(0));

        cache.resolve(&key, counting(&calls, "old"), policy()).await.unwrap();
        clock.advance(HOUR + Duration::from_secs(1));

        let read = cache
            .resolve_read(&key, counting(&calls, "new"), policy())
            .await
            .unwrap();
        assert_eq!(read.source(), ReadSource::Fetched);
        assert_eq!(read.value(), "new");
        let entry = cache.manager().get::<String>(&key).unwrap();
        assert!(!entry.is_stale(clock.now()));
    }

    #[tokio::test]
    async fn test_miss_with_failing_fetch_errors() {
        let (cache, _clock) = cache_with_clock();
        let key = CacheKey::from_raw("fetchWallets:a");

        let err = cache.resolve(&key, failing(), policy()).await.unwrap_err();
        assert!(matches!(err, CacheError::FetchFailed { ref key, .. } if key.as_str() == "fetchWallets:a"));
        assert!(!cache.manager().contains(&CacheKey::from_raw("fetchWallets:a")));
    }

    #[tokio::test]
    async fn test_miss_with_failing_fetch_uses_durable_copy() {
        let store = Arc::new(InMemoryStore::new());
        let writer = CacheManager::new(CacheConfig::default()).with_store(store.clone());
        let key = CacheKey::from_raw("fetchDefaultWallet:a");
        writer.set(&key, "persisted".to_string(), policy());

        let cache = ReadThroughCache::new(Arc::new(
            CacheManager::new(CacheConfig::default()).with_store(store),
        ));
        let read = cache.resolve_read(&key, failing(), policy()).await.unwrap();
        assert_eq!(read.value(), "persisted");
        assert_eq!(read.source(), ReadSource::Fallback);
    }

    #[tokio::test]
    async fn test_resolve_in_key_space() {
        let (cache, _clock) = cache_with_clock();
        let space = KeySpace::<String>::new("fetchWallets", policy()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let value = cache
            .resolve_in(&space, &serde_json::json!({"userId": 1}), counting(&calls, "w"))
            .await
            .unwrap();
        assert_eq!(value, "w");

        let key = space.key(&serde_json::json!({"userId": 1})).unwrap();
        assert!(cache.manager().contains(&key));
    }

    #[tokio::test]
    async fn test_resolve_in_rejects_bad_params() {
        let (cache, _clock) = cache_with_clock();
        let space = KeySpace::<String>::new("fetchWallets", policy()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let err = cache
            .resolve_in(&space, &vec![1, 2, 3], counting(&calls, "w"))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Key(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    struct StaticFetcher(AtomicUsize);

    #[async_trait::async_trait]
    impl Fetcher<Vec<u32>> for StaticFetcher {
        type Error = Offline;

        async fn fetch(&self) -> Result<Vec<u32>, Offline> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(vec![1, 2])
        }
    }

    #[tokio::test]
    async fn test_resolve_with_fetcher() {
        let (cache, _clock) = cache_with_clock();
        let fetcher = Arc::new(StaticFetcher(AtomicUsize::new(0)));
        let key = CacheKey::from_raw("fetchBudgets:a");

        for _ in 0..3 {
            let value: Vec<u32> = cache
                .resolve_with(&key, fetcher.clone(), policy())
                .await
                .unwrap();
            assert_eq!(value, vec![1, 2]);
        }
        assert_eq!(fetcher.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_by_operation_forces_fetch() {
        let (cache, _clock) = cache_with_clock();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::from_raw("fetchWallets:a");

        cache.resolve(&key, counting(&calls, "v1"), policy()).await.unwrap();
        assert_eq!(cache.invalidate_by_operation("fetchWallets"), 1);

        let value = cache.resolve(&key, counting(&calls, "v2"), policy()).await.unwrap();
        assert_eq!(value, "v2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
