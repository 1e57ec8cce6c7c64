//! External lookup collaborator contract.
//!
//! The core never knows what an OSINT data source actually is; it only drives
//! the [`LookupSource`] trait. The transport (or deployment) decides which
//! implementation to wire in. [`http::HttpLookupSource`] is the generic
//! HTTP adapter; tests use counting mocks.

/// Generic HTTP adapter over configured endpoint templates
pub mod http;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::query::Query;

/// Result of a completed external lookup.
///
/// `NotFound` is a successful answer ("the source has nothing for this
/// subject") and is cacheable with its own, shorter TTL.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The source returned a payload for the query.
    Found(Value),
    /// The source answered authoritatively that there is no data.
    NotFound,
}

impl Outcome {
    /// Whether this outcome carries a payload.
    #[must_use]
    pub const fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }
}

/// Errors produced by lookup source implementations.
///
/// Kept `Clone` so a single failure can be shared with every waiter of a
/// deduplicated in-flight lookup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// No endpoint is configured for the requested query kind.
    #[error("no lookup endpoint configured for kind '{0}'")]
    NotConfigured(String),
    /// The request did not complete within the configured timeout.
    #[error("lookup timed out")]
    Timeout,
    /// Connection or transport failure.
    #[error("network error: {0}")]
    Network(String),
    /// The source answered with an unexpected HTTP status.
    #[error("unexpected status {0} from lookup source")]
    Status(u16),
    /// The response body could not be decoded.
    #[error("failed to decode lookup response: {0}")]
    Decode(String),
}

impl SourceError {
    /// Whether a retry with backoff has a chance of succeeding.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Network(_) => true,
            Self::Status(code) => *code == 429 || *code >= 500,
            Self::NotConfigured(_) | Self::Decode(_) => false,
        }
    }
}

/// Capability contract for external OSINT data sources.
///
/// Implementations must be cheap to share behind an `Arc`; the dispatcher is
/// the only component that calls them, and never more than once concurrently
/// for the same cache key.
#[async_trait]
pub trait LookupSource: Send + Sync {
    /// Perform one external lookup for a normalized query.
    async fn lookup(&self, query: &Query) -> Result<Outcome, SourceError>;
}
