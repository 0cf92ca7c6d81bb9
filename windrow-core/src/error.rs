//! Error types for windrow provider operations

use thiserror::Error;

/// Fetch path errors.
///
/// Errors from a wrapped provider are propagated to the caller unchanged;
/// the caching layers add no retry or stale-data fallback of their own.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Fetch failed: {reason}")]
    Failed { reason: String },

    #[error("Fetch aborted: {reason}")]
    Aborted { reason: String },

    #[error("Fetch iterator closed before completion: {reason}")]
    IteratorClosed { reason: String },
}

/// Cache bookkeeping errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache lock poisoned")]
    LockPoisoned,

    #[error("Cache detached: {reason}")]
    Detached { reason: String },
}

/// Master error type for all windrow operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

impl ProviderError {
    /// Shorthand for a failed fetch with the given reason.
    pub fn fetch_failed(reason: impl Into<String>) -> Self {
        ProviderError::Fetch(FetchError::Failed {
            reason: reason.into(),
        })
    }

    /// Shorthand for an aborted fetch with the given reason.
    pub fn aborted(reason: impl Into<String>) -> Self {
        ProviderError::Fetch(FetchError::Aborted {
            reason: reason.into(),
        })
    }

    /// True when the error came from an abort signal rather than a failure.
    pub fn is_abort(&self) -> bool {
        matches!(self, ProviderError::Fetch(FetchError::Aborted { .. }))
    }
}

/// Result type alias for windrow operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

// =============================================================================
// TESTS
// =============================================================================
