//! Default observer: log swallowed failures through `tracing`.

use tally_core::{CacheKey, StoreError};

use crate::traits::{CacheObserver, PersistOp};

/// Observer used when none is configured.
///
/// Persistence and refresh failures are logged at `warn`, evictions at
/// `debug`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl CacheObserver for TracingObserver {
    fn on_persist_failure(&self, key: Option<&CacheKey>, op: PersistOp, error: &StoreError) {
        match key {
            Some(key) => tracing::warn!(
                key = %key,
                op = %op,
                error = %error,
                "Durable cache store call failed, continuing in memory"
            ),
            None => tracing::warn!(
                op = %op,
                error = %error,
                "Durable cache store call failed, continuing in memory"
            ),
        }
    }

    fn on_refresh_failure(&self, key: &CacheKey, error: &(dyn std::error::Error + 'static)) {
        tracing::warn!(
            key = %key,
            error = %error,
            "Background refresh failed, keeping stale entry"
        );
    }

    fn on_eviction(&self, key: &CacheKey) {
        tracing::debug!(key = %key, "Evicted oldest cache entry to stay within capacity");
    }
}
