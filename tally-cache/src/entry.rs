//! Cache entries.
//!
//! The manager stores entries type-erased: a value written by `set` is kept
//! live behind `Arc<dyn Any>`, while a value loaded from the durable store
//! stays as JSON until a typed read decodes it.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tally_core::{age_of, FreshnessPolicy, StoreError};

use crate::freshness::EntryState;
use crate::traits::Cacheable;

/// A typed snapshot of one cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    value: T,
    stored_at: DateTime<Utc>,
    policy: FreshnessPolicy,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, stored_at: DateTime<Utc>, policy: FreshnessPolicy) -> Self {
        Self {
            value,
            stored_at,
            policy,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn stored_at(&self) -> DateTime<Utc> {
        self.stored_at
    }

    pub fn ttl(&self) -> Duration {
        self.policy.ttl()
    }

    pub fn stale_after(&self) -> Duration {
        self.policy.stale_after()
    }

    pub fn policy(&self) -> FreshnessPolicy {
        self.policy
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        age_of(self.stored_at, now)
    }

    pub fn state(&self, now: DateTime<Utc>) -> EntryState {
        EntryState::classify(self.age(now), self.ttl(), self.stale_after())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.age(now) > self.ttl()
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.age(now) > self.stale_after()
    }
}

/// Stored payload: live value or JSON loaded from the durable store.
#[derive(Clone)]
pub(crate) enum Payload {
    Live(Arc<dyn Any + Send + Sync>),
    Serialized(Value),
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live(_) => f.write_str("Live(..)"),
            Self::Serialized(v) => f.debug_tuple("Serialized").field(v).finish(),
        }
    }
}

/// Type-erased entry owned by the manager.
#[derive(Debug, Clone)]
pub(crate) struct StoredEntry {
    pub(crate) payload: Payload,
    pub(crate) stored_at: DateTime<Utc>,
    pub(crate) policy: FreshnessPolicy,
}

impl StoredEntry {
    pub(crate) fn live<T: Cacheable>(
        value: T,
        stored_at: DateTime<Utc>,
        policy: FreshnessPolicy,
    ) -> Self {
        Self {
            payload: Payload::Live(Arc::new(value)),
            stored_at,
            policy,
        }
    }

    pub(crate) fn is_expired(&self, now: DateTime<Utc>) -> bool {
        age_of(self.stored_at, now) > self.policy.ttl()
    }

    /// Decode into `T`. Returns `None` when the payload is of another type.
    pub(crate) fn decode<T: Cacheable>(&self) -> Option<CacheEntry<T>> {
        let value = match &self.payload {
            Payload::Live(any) => any.downcast_ref::<T>()?.clone(),
            Payload::Serialized(json) => serde_json::from_value::<T>(json.clone()).ok()?,
        };
        Some(CacheEntry::new(value, self.stored_at, self.policy))
    }

    pub(crate) fn is_serialized(&self) -> bool {
        matches!(self.payload, Payload::Serialized(_))
    }

    /// Replace a JSON payload with its decoded value.
    pub(crate) fn promote<T: Cacheable>(&mut self, value: T) {
        self.payload = Payload::Live(Arc::new(value));
    }

    pub(crate) fn from_persisted(persisted: PersistedEntry) -> Result<Self, StoreError> {
        let policy = FreshnessPolicy::new(
            Duration::from_millis(persisted.ttl_ms),
            Duration::from_millis(persisted.stale_after_ms),
        )
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;

        Ok(Self {
            payload: Payload::Serialized(persisted.value),
            stored_at: persisted.stored_at,
            policy,
        })
    }
}

/// On-disk form of an entry.
///
/// Format: `{"value": <json>, "stored_at": <RFC 3339>, "ttl_ms": u64, "stale_after_ms": u64}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub value: Value,
    pub stored_at: DateTime<Utc>,
    pub ttl_ms: u64,
    pub stale_after_ms: u64,
}

impl PersistedEntry {
    pub fn from_value<T: Cacheable>(
        value: &T,
        stored_at: DateTime<Utc>,
        policy: FreshnessPolicy,
    ) -> Result<Self, StoreError> {
        let value =
            serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Self {
            value,
            stored_at,
            ttl_ms: duration_millis(policy.ttl()),
            stale_after_ms: duration_millis(policy.stale_after()),
        })
    }

    pub fn encode(&self) -> Result<String, StoreError> {
        serde_json::to_string(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, StoreError> {
        serde_json::from_str(raw).map_err(|e| StoreError::Deserialization(e.to_string()))
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> FreshnessPolicy {
        FreshnessPolicy::new(Duration::from_secs(3600), Duration::from_secs(1800)).unwrap()
    }

    #[test]
    fn test_entry_state_by_age() {
        let stored_at = Utc::now();
        let entry = CacheEntry::new("v", stored_at, policy());

        assert_eq!(entry.state(stored_at), EntryState::Fresh);
        assert!(!entry.is_stale(stored_at + chrono::Duration::minutes(30)));
        assert!(entry.is_stale(stored_at + chrono::Duration::minutes(31)));
        assert!(!entry.is_expired(stored_at + chrono::Duration::minutes(59)));
        assert!(entry.is_expired(stored_at + chrono::Duration::minutes(61)));
    }

    #[test]
    fn test_live_decode_checks_type() {
        let stored = StoredEntry::live(vec![1u32, 2, 3], Utc::now(), policy());
        assert_eq!(stored.decode::<Vec<u32>>().unwrap().into_value(), vec![1, 2, 3]);
        assert!(stored.decode::<String>().is_none());
    }

    #[test]
    fn test_serialized_decode() {
        let persisted = PersistedEntry {
            value: json!({"name": "Cash", "balance": 12}),
            stored_at: Utc::now(),
            ttl_ms: 60_000,
            stale_after_ms: 30_000,
        };
        let stored = StoredEntry::from_persisted(persisted).unwrap();

        #[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
        struct Wallet {
            name: String,
            balance: i64,
        }

        let entry = stored.decode::<Wallet>().unwrap();
        assert_eq!(entry.value().name, "Cash");
        assert_eq!(entry.ttl(), Duration::from_secs(60));
        assert!(stored.decode::<Vec<String>>().is_none());
    }

    #[test]
    fn test_promoted_entry_reads_like_live() {
        let persisted = PersistedEntry {
            value: json!([5]),
            stored_at: Utc::now(),
            ttl_ms: 60_000,
            stale_after_ms: 30_000,
        };
        let mut stored = StoredEntry::from_persisted(persisted).unwrap();
        assert!(stored.is_serialized());
        // JSON is untyped, so any compatible type decodes.
        assert!(stored.decode::<Vec<u64>>().is_some());

        let value = stored.decode::<Vec<u32>>().unwrap().into_value();
        stored.promote(value);
        assert!(!stored.is_serialized());
        assert_eq!(stored.decode::<Vec<u32>>().unwrap().into_value(), vec![5]);
        assert!(stored.decode::<Vec<u64>>().is_none());
    }

    #[test]
    fn test_persisted_entry_rejects_invalid_policy() {
        let persisted = PersistedEntry {
            value: json!(1),
            stored_at: Utc::now(),
            ttl_ms: 1_000,
            stale_after_ms: 5_000,
        };
        assert!(matches!(
            StoredEntry::from_persisted(persisted),
            Err(StoreError::Deserialization(_))
        ));
    }

    #[test]
    fn test_persisted_entry_keeps_stored_at() {
        let stored_at = Utc::now() - chrono::Duration::hours(2);
        let persisted = PersistedEntry::from_value(&"cached".to_string(), stored_at, policy()).unwrap();
        let raw = persisted.encode().unwrap();
        let decoded = PersistedEntry::decode(&raw).unwrap();
        assert_eq!(decoded.stored_at, stored_at);
        assert_eq!(decoded.ttl_ms, 3_600_000);
        assert_eq!(decoded.stale_after_ms, 1_800_000);
    }

    #[test]
    fn test_persisted_entry_decode_garbage() {
        assert!(matches!(
            PersistedEntry::decode("not json"),
            Err(StoreError::Deserialization(_))
        ));
    }
}
