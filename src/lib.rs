//! Query dispatch and persistence core for a Telegram OSINT lookup bot.
//!
//! The crate accepts lookup requests from a messaging transport, serializes
//! access to a single-writer embedded SQLite database, deduplicates and
//! caches lookups against external data sources, and throttles per-user
//! traffic. The transport layer and the concrete data sources are external
//! collaborators wired in by the embedding application.

/// Result caching and in-flight lookup deduplication
pub mod cache;
/// Configuration and settings management
pub mod config;
/// Query dispatcher orchestrating cache, limiter, store, and source
pub mod dispatch;
/// Error taxonomy shared across the core
pub mod error;
/// Per-user and global rate limiting
pub mod limiter;
/// Query kinds, normalization, and validation
pub mod query;
/// External lookup collaborator contract and HTTP adapter
pub mod source;
/// Persistent single-writer SQLite store
pub mod store;
/// Logging initialization with secret redaction
pub mod telemetry;

pub use cache::{CachedLookup, QueryKey, ResultCache};
pub use config::Settings;
pub use dispatch::{Dispatcher, LookupRequest, Response};
pub use error::CoreError;
pub use limiter::{Decision, RateLimiter};
pub use query::{Query, QueryKind};
pub use source::{LookupSource, Outcome, SourceError};
pub use store::Store;
