//! Cache configuration and freshness policies.
//!
//! Configuration is loaded from environment variables with sensible
//! defaults. TTL and staleness are tunable per key space; the defaults here
//! only apply where a caller does not choose its own policy.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_TTL_SECS: u64 = 60 * 60;
pub const DEFAULT_STALE_AFTER_SECS: u64 = 30 * 60;
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;
pub const DEFAULT_LMDB_MAX_SIZE_MB: usize = 64;

// ============================================================================
// FRESHNESS POLICY
// ============================================================================

/// How long a cached value is usable, and when it should be refreshed.
///
/// Both durations are positive and `stale_after <= ttl`. An entry older than
/// `stale_after` is still served but triggers a background refresh; an entry
/// older than `ttl` is expired and only served as a last resort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessPolicy {
    ttl: Duration,
    stale_after: Duration,
}

impl FreshnessPolicy {
    pub fn new(ttl: Duration, stale_after: Duration) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidPolicy {
            ttl,
            stale_after,
            reason: reason.to_string(),
        };

        if ttl.is_zero() {
            return Err(invalid("ttl must be positive"));
        }
        if stale_after.is_zero() {
            return Err(invalid("stale_after must be positive"));
        }
        if stale_after > ttl {
            return Err(invalid("stale_after must not exceed ttl"));
        }

        Ok(Self { ttl, stale_after })
    }

    /// A policy that never triggers background refresh before expiry.
    pub fn ttl_only(ttl: Duration) -> Result<Self, ConfigError> {
        Self::new(ttl, ttl)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Length of the serve-stale-while-refreshing window.
    pub fn stale_window(&self) -> Duration {
        self.ttl - self.stale_after
    }
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            stale_after: Duration::from_secs(DEFAULT_STALE_AFTER_SECS),
        }
    }
}

// ============================================================================
// CACHE CONFIGURATION
// ============================================================================

/// Cache manager configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// TTL used by [`CacheConfig::default_policy`].
    pub default_ttl: Duration,
    /// Staleness threshold used by [`CacheConfig::default_policy`].
    pub default_stale_after: Duration,
    /// Maximum number of in-memory entries before the oldest is evicted.
    pub max_entries: usize,
    /// Whether writes are mirrored into the durable store.
    pub persist: bool,
    /// Directory for the LMDB store, if one should be opened.
    pub lmdb_path: Option<PathBuf>,
    /// LMDB map size in megabytes.
    pub lmdb_max_size_mb: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            default_stale_after: Duration::from_secs(DEFAULT_STALE_AFTER_SECS),
            max_entries: DEFAULT_MAX_ENTRIES,
            persist: true,
            lmdb_path: None,
            lmdb_max_size_mb: DEFAULT_LMDB_MAX_SIZE_MB,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a CacheConfig from environment variables.
    ///
    /// Environment variables:
    /// - `TALLY_CACHE_TTL_SECS`: Default TTL (default: 3600)
    /// - `TALLY_CACHE_STALE_AFTER_SECS`: Default staleness threshold (default: 1800)
    /// - `TALLY_CACHE_MAX_ENTRIES`: In-memory capacity (default: 10000)
    /// - `TALLY_CACHE_PERSIST`: "true" or "false" (default: true)
    /// - `TALLY_CACHE_LMDB_PATH`: LMDB directory (default: unset, no LMDB)
    /// - `TALLY_CACHE_LMDB_MAX_MB`: LMDB map size (default: 64)
    ///
    /// Unparseable numbers fall back to the default; the result is validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let default_ttl = env_parse::<u64>("TALLY_CACHE_TTL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.default_ttl);

        let default_stale_after = env_parse::<u64>("TALLY_CACHE_STALE_AFTER_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.default_stale_after);

        let max_entries =
            env_parse::<usize>("TALLY_CACHE_MAX_ENTRIES").unwrap_or(defaults.max_entries);

        let persist = std::env::var("TALLY_CACHE_PERSIST")
            .ok()
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(defaults.persist);

        let lmdb_path = std::env::var("TALLY_CACHE_LMDB_PATH")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let lmdb_max_size_mb =
            env_parse::<usize>("TALLY_CACHE_LMDB_MAX_MB").unwrap_or(defaults.lmdb_max_size_mb);

        let config = Self {
            default_ttl,
            default_stale_after,
            max_entries,
            persist,
            lmdb_path,
            lmdb_max_size_mb,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_default_stale_after(mut self, stale_after: Duration) -> Self {
        self.default_stale_after = stale_after;
        self
    }

    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn with_lmdb_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lmdb_path = Some(path.into());
        self
    }

    pub fn with_lmdb_max_size_mb(mut self, mb: usize) -> Self {
        self.lmdb_max_size_mb = mb;
        self
    }

    /// The validated default freshness policy.
    pub fn default_policy(&self) -> Result<FreshnessPolicy, ConfigError> {
        FreshnessPolicy::new(self.default_ttl, self.default_stale_after)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.default_policy()?;

        if self.max_entries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_entries".to_string(),
                value: self.max_entries.to_string(),
                reason: "must be positive".to_string(),
            });
        }

        if self.lmdb_path.is_some() && self.lmdb_max_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "lmdb_max_size_mb".to_string(),
                value: self.lmdb_max_size_mb.to_string(),
                reason: "must be positive when lmdb_path is set".to_string(),
            });
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}
