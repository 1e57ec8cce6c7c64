//! Error taxonomy for the dispatch and persistence core.
//!
//! Every failure that can reach the transport collaborator is a variant here,
//! so callers match exhaustively instead of parsing strings. Variants carry
//! owned strings rather than source errors to keep the type `Clone`: the
//! single-flight cache shares one failure with every waiter of a key.

use std::time::Duration;
use thiserror::Error;

use crate::source::SourceError;

/// Errors surfaced by the query dispatcher and its components.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Another write transaction currently holds the store's write lock.
    /// Transient: callers retry with bounded backoff.
    #[error("store is busy, another write transaction is active")]
    StoreBusy,

    /// The database failed an integrity check or is not a database at all.
    /// Fatal: new writes are halted, operator intervention required.
    #[error("store corrupt: {0}")]
    StoreCorrupt(String),

    /// Unexpected store failure that is neither busy nor corruption.
    #[error("store operation failed: {0}")]
    StoreFailed(String),

    /// The per-user (or global) quota for the current window is exhausted.
    #[error("rate limited, retry in {}s", .retry_after.as_secs())]
    RateLimited {
        /// Time until the window rolls over and a slot frees up.
        retry_after: Duration,
    },

    /// The external lookup collaborator failed after bounded retries.
    #[error("lookup failed: {0}")]
    LookupFailed(#[from] SourceError),

    /// Caller input rejected before reaching cache or store.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The user exists but has been soft-disabled.
    #[error("user {0} is disabled")]
    UserDisabled(i64),

    /// Infrastructure failure outside the taxonomy (task join, poisoned lock).
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether the condition is expected to clear on its own, making an
    /// automatic retry worthwhile.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::StoreBusy | Self::RateLimited { .. } => true,
            Self::LookupFailed(source) => source.is_retryable(),
            Self::StoreCorrupt(_)
            | Self::StoreFailed(_)
            | Self::InvalidQuery(_)
            | Self::UserDisabled(_)
            | Self::Internal(_) => false,
        }
    }
}
