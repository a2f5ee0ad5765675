//! Tally Test Utilities
//!
//! Shared test infrastructure for the Tally workspace:
//! - Scripted backend fetchers with call counting and gating
//! - Failing durable stores
//! - Wallet and category fixtures
//! - Proptest generators for operations, parameters and policies
//! - Tracing setup for tests

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tally_cache::{Cacheable, DurableStore, Fetcher};
use tokio::sync::Semaphore;

// Re-export core types for convenience
pub use tally_cache::{CacheManager, InMemoryStore, ReadThroughCache};
pub use tally_core::{
    CacheConfig, CacheKey, FreshnessPolicy, KeySpace, ManualClock, StoreError, Timestamp,
};

// ============================================================================
// TRACING
// ============================================================================

/// Install a test-friendly `tracing` subscriber.
///
/// Honors `RUST_LOG`, defaulting to `warn`. Safe to call from every test;
/// only the first call installs anything.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// MOCK BACKEND
// ============================================================================

/// Error returned by [`MockBackend`].
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend unreachable")]
    Offline,

    #[error("Backend returned status {0}")]
    Status(u16),
}

/// Boxed fetch future handed to `ReadThroughCache::resolve`.
pub type FetchFuture<T> = Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send>>;

/// Scripted backend for one query.
///
/// Returns its current value (or error) and counts calls. Fetches can be
/// held open with [`hold`](Self::hold) to observe in-flight behavior.
#[derive(Debug)]
pub struct MockBackend<T> {
    value: Mutex<T>,
    failure: Mutex<Option<BackendError>>,
    calls: AtomicUsize,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl<T: Cacheable> MockBackend<T> {
    pub fn new(value: T) -> Arc<Self> {
        Arc::new(Self {
            value: Mutex::new(value),
            failure: Mutex::new(None),
            calls: AtomicUsize::new(0),
            gate: Mutex::new(None),
        })
    }

    /// Number of fetches started so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Change what later fetches return.
    pub fn set_value(&self, value: T) {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }

    /// Make later fetches fail with `error`, or succeed again with `None`.
    pub fn set_failure(&self, error: Option<BackendError>) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    pub fn go_offline(&self) {
        self.set_failure(Some(BackendError::Offline));
    }

    pub fn come_online(&self) {
        self.set_failure(None);
    }

    /// Block fetches started from now on until [`release`](Self::release).
    pub fn hold(&self) {
        *self.gate.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let held fetches complete.
    pub fn release(&self) {
        if let Some(gate) = self.gate.lock().unwrap_or_else(PoisonError::into_inner).take() {
            gate.close();
        }
    }

    /// A one-shot fetch closure for `ReadThroughCache::resolve`.
    pub fn fetch_fn(self: &Arc<Self>) -> impl FnOnce() -> FetchFuture<T> + Send + 'static {
        let backend = Arc::clone(self);
        move || -> FetchFuture<T> { Box::pin(async move { backend.respond().await }) }
    }

    async fn respond(&self) -> Result<T, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let gate = self
            .gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(gate) = gate {
            // Closing the semaphore is the release signal.
            let _ = gate.acquire().await;
        }

        let failure = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(error) = failure {
            return Err(error);
        }
        Ok(self
            .value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

#[async_trait]
impl<T: Cacheable> Fetcher<T> for MockBackend<T> {
    type Error = BackendError;

    async fn fetch(&self) -> Result<T, BackendError> {
        self.respond().await
    }
}

// ============================================================================
// MOCK STORES
// ============================================================================

/// Durable store that can be switched into failing every call.
///
/// Wraps an [`InMemoryStore`] and counts rejected calls.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    failing: AtomicBool,
    rejected: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that starts out failing.
    pub fn broken() -> Self {
        let store = Self::default();
        store.set_failing(true);
        store
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of calls rejected while failing.
    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }
}

impl DurableStore for FlakyStore {
    fn persist(&self, key: &str, serialized_entry: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.persist(key, serialized_entry)
    }

    fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        self.inner.load(key)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.remove(key)
    }

    fn remove_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        self.check()?;
        self.inner.remove_prefix(prefix)
    }

    fn load_all(&self) -> Result<Vec<(String, String)>, StoreError> {
        self.check()?;
        self.inner.load_all()
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.check()?;
        self.inner.clear()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys, parameters and policies.

    use super::*;
    use proptest::prelude::*;
    use serde_json::{Map, Value};

    /// A valid operation name.
    pub fn arb_operation() -> impl Strategy<Value = String> {
        "[a-z][a-zA-Z0-9_]{0,23}"
    }

    /// A JSON scalar parameter value.
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            "[a-zA-Z0-9 ]{0,16}".prop_map(Value::String),
        ]
    }

    /// A parameter object with up to 6 scalar fields.
    pub fn arb_params() -> impl Strategy<Value = Value> {
        proptest::collection::btree_map("[a-zA-Z]{1,8}", arb_scalar(), 0..6)
            .prop_map(|fields| Value::Object(fields.into_iter().collect::<Map<String, Value>>()))
    }

    /// A valid freshness policy between one second and one day.
    pub fn arb_policy() -> impl Strategy<Value = FreshnessPolicy> {
        (1u64..86_400)
            .prop_flat_map(|ttl| (Just(ttl), 1u64..=ttl))
            .prop_map(|(ttl, stale)| {
                FreshnessPolicy::new(Duration::from_secs(ttl), Duration::from_secs(stale))
                    .unwrap_or_default()
            })
    }

    pub fn arb_wallet() -> impl Strategy<Value = fixtures::Wallet> {
        (any::<u32>(), "[A-Z][a-z]{2,10}", -1_000_000i64..1_000_000)
            .prop_map(|(id, name, balance_cents)| fixtures::Wallet {
                id: u64::from(id),
                name,
                balance_cents,
                currency: "EUR".to_string(),
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common cache scenarios.

    use super::*;

    pub const WALLETS_OPERATION: &str = "fetchWallets";
    pub const CATEGORIES_OPERATION: &str = "fetchCategories";

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Wallet {
        pub id: u64,
        pub name: String,
        pub balance_cents: i64,
        pub currency: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Category {
        pub id: u64,
        pub name: String,
        pub is_expense: bool,
    }

    pub fn wallet(id: u64, name: &str, balance_cents: i64) -> Wallet {
        Wallet {
            id,
            name: name.to_string(),
            balance_cents,
            currency: "EUR".to_string(),
        }
    }

    pub fn wallets() -> Vec<Wallet> {
        vec![wallet(1, "Cash", 12_050), wallet(2, "Checking", 250_000)]
    }

    pub fn categories() -> Vec<Category> {
        vec![
            Category {
                id: 1,
                name: "Groceries".to_string(),
                is_expense: true,
            },
            Category {
                id: 2,
                name: "Salary".to_string(),
                is_expense: false,
            },
        ]
    }

    /// One hour TTL, stale after thirty minutes.
    pub fn hourly_policy() -> FreshnessPolicy {
        FreshnessPolicy::default()
    }

    pub fn wallets_space() -> KeySpace<Vec<Wallet>> {
        KeySpace::new(WALLETS_OPERATION, hourly_policy())
            .unwrap_or_else(|e| panic!("fixture key space is valid: {e}"))
    }

    pub fn categories_space() -> KeySpace<Vec<Category>> {
        KeySpace::new(CATEGORIES_OPERATION, hourly_policy())
            .unwrap_or_else(|e| panic!("fixture key space is valid: {e}"))
    }

    /// Parameters identifying one user's query.
    pub fn user_params(user_id: u64) -> serde_json::Value {
        serde_json::json!({ "userId": user_id })
    }

    /// In-memory manager driven by a manual clock.
    pub fn manual_manager() -> (Arc<CacheManager>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let manager = CacheManager::new(CacheConfig::default()).with_clock(clock.clone());
        (Arc::new(manager), clock)
    }

    /// Manager mirroring into `store`, driven by `clock`.
    pub fn persistent_manager(
        store: Arc<dyn DurableStore>,
        clock: Arc<ManualClock>,
    ) -> Arc<CacheManager> {
        Arc::new(
            CacheManager::new(CacheConfig::default())
                .with_store(store)
                .with_clock(clock),
        )
    }

    /// Read-through cache over a fresh manual-clock manager.
    pub fn manual_cache() -> (ReadThroughCache, Arc<ManualClock>) {
        let (manager, clock) = manual_manager();
        (ReadThroughCache::new(manager), clock)
    }
}
