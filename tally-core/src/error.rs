//! Error types for Tally cache operations

use std::time::Duration;
use thiserror::Error;

/// Key derivation errors.
///
/// These are caller bugs (a malformed operation name or a parameter object
/// that has no canonical form) and are never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Operation name must not be empty")]
    EmptyOperation,

    #[error("Invalid operation name {operation:?}: {reason}")]
    InvalidOperation { operation: String, reason: String },

    #[error("Unserializable parameter for {operation}: {reason}")]
    UnserializableParameter { operation: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Invalid freshness policy (ttl {ttl:?}, stale_after {stale_after:?}): {reason}")]
    InvalidPolicy {
        ttl: Duration,
        stale_after: Duration,
        reason: String,
    },
}

/// Durable store errors.
///
/// The cache manager never propagates these; they are reported to the
/// observer and logged.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    #[error("Failed to open database: {0}")]
    DbOpen(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Master error type for non-fetch Tally errors.
#[derive(Debug, Error)]
pub enum TallyError {
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type alias for Tally operations.
pub type TallyResult<T> = Result<T, TallyError>;

// =============================================================================
// TESTS
// =============================================================================
