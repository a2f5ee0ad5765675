//! Errors returned by the read-through coordinator.

use tally_core::{CacheKey, KeyError};
use thiserror::Error;

/// Error from a cache read, generic over the fetcher's own error type.
///
/// Persistence problems never show up here. A fetch failure only surfaces
/// when there was nothing cached for the key, in memory or on disk.
#[derive(Debug, Error)]
pub enum CacheError<E> {
    /// The key could not be derived from the operation and parameters.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// The fetch failed and neither memory nor the durable store held a
    /// value for `key`, not even an expired one.
    #[error("Fetch failed for {key} and no cached value is available")]
    FetchFailed {
        key: CacheKey,
        #[source]
        source: E,
    },
}

impl<E> CacheError<E> {
    pub fn is_fetch_failed(&self) -> bool {
        matches!(self, Self::FetchFailed { .. })
    }

    /// The fetcher's error, if this is a fetch failure.
    pub fn fetch_error(&self) -> Option<&E> {
        match self {
            Self::FetchFailed { source, .. } => Some(source),
            Self::Key(_) => None,
        }
    }

    /// Unwrap into the fetcher's error, handing back `self` otherwise.
    pub fn into_fetch_error(self) -> Result<E, Self> {
        match self {
            Self::FetchFailed { source, .. } => Ok(source),
            other => Err(other),
        }
    }
}
