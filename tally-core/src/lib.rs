//! Tally Core - keys, freshness policies, configuration and errors
//!
//! Leaf crate of the Tally cache. Everything here is synchronous and free
//! of I/O; the cache manager and read-through coordinator live in
//! `tally-cache`.

pub mod clock;
pub mod config;
pub mod error;
pub mod key;

pub use clock::{age_of, Clock, ManualClock, SystemClock};
pub use config::{
    CacheConfig, FreshnessPolicy, DEFAULT_LMDB_MAX_SIZE_MB, DEFAULT_MAX_ENTRIES,
    DEFAULT_STALE_AFTER_SECS, DEFAULT_TTL_SECS,
};
pub use error::{ConfigError, KeyError, StoreError, TallyError, TallyResult};
pub use key::{canonical_params, derive_key, CacheKey, KeySpace, KEY_SEPARATOR};

/// Timestamp type used throughout Tally.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
