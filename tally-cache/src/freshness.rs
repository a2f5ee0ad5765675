//! Entry freshness states and read results.
//!
//! Reads return [`CacheRead<T>`], which says where the value came from so
//! calling code can tell "fresh from the backend" apart from "stale cache
//! served while refreshing" and "expired cache served because the backend
//! failed".

use std::time::Duration;

use chrono::{DateTime, Utc};
use tally_core::age_of;

/// Freshness of an entry at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Younger than `stale_after`: serve as is.
    Fresh,
    /// Older than `stale_after` but within `ttl`: serve and refresh in the background.
    Stale,
    /// Older than `ttl`: fetch synchronously, serve only as a last resort.
    Expired,
}

impl EntryState {
    /// Classify an entry by age.
    ///
    /// Both thresholds are exclusive: an entry exactly `ttl` old is not yet
    /// expired.
    pub fn classify(age: Duration, ttl: Duration, stale_after: Duration) -> Self {
        if age > ttl {
            Self::Expired
        } else if age > stale_after {
            Self::Stale
        } else {
            Self::Fresh
        }
    }

    pub fn is_usable(&self) -> bool {
        !matches!(self, Self::Expired)
    }
}

/// Where a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// Fetched from the backend during this call.
    Fetched,
    /// Served from a fresh cache entry.
    Cache,
    /// Served from a stale cache entry.
    Stale,
    /// The fetch failed; served from an expired or persisted entry.
    Fallback,
}

/// Result of a resolve, carrying provenance metadata.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: T,
    source: ReadSource,
    stored_at: DateTime<Utc>,
}

impl<T> CacheRead<T> {
    pub fn new(value: T, source: ReadSource, stored_at: DateTime<Utc>) -> Self {
        Self {
            value,
            source,
            stored_at,
        }
    }

    /// A value fetched from the backend at `fetched_at`.
    pub fn fetched(value: T, fetched_at: DateTime<Utc>) -> Self {
        Self::new(value, ReadSource::Fetched, fetched_at)
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn source(&self) -> ReadSource {
        self.source
    }

    /// When the returned value was written to the cache (or fetched).
    pub fn stored_at(&self) -> DateTime<Utc> {
        self.stored_at
    }

    /// Age of the value relative to `now`.
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        age_of(self.stored_at, now)
    }

    /// Served without waiting on the backend.
    pub fn was_cache_hit(&self) -> bool {
        matches!(self.source, ReadSource::Cache | ReadSource::Stale)
    }

    /// Served from an expired or persisted entry after a failed fetch.
    pub fn is_fallback(&self) -> bool {
        self.source == ReadSource::Fallback
    }

    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            source: self.source,
            stored_at: self.stored_at,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}
