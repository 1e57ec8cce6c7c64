//! Result caching and in-flight lookup deduplication.
//!
//! The cache is a performance layer in front of the store, never the source
//! of truth: every entry is reconstructible from persisted query records.
//! Keys are namespaced by (kind, normalized query). Entries carry their own
//! TTL so successful and negative ("not found") results can age differently,
//! and an expired entry is indistinguishable from a missing one.
//!
//! [`ResultCache::fetch_with`] is the deduplication point: for any key there
//! is at most one in-flight external lookup, and every concurrent requester
//! of that key awaits the same outstanding result. Failed fetches are shared
//! with all waiters but never cached.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use moka::future::Cache;
use moka::Expiry;

use crate::error::CoreError;
use crate::query::{Query, QueryKind};
use crate::source::Outcome;

/// Cache key: query kind plus normalized query string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    /// Namespace half of the key.
    pub kind: QueryKind,
    /// Normalized query value.
    pub query: String,
}

impl From<&Query> for QueryKey {
    fn from(query: &Query) -> Self {
        Self {
            kind: query.kind,
            query: query.value.clone(),
        }
    }
}

/// A cached lookup result together with its age and lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedLookup {
    /// The lookup outcome (payload or authoritative not-found).
    pub outcome: Outcome,
    /// When the external lookup completed.
    pub fetched_at: DateTime<Utc>,
    /// Lifetime assigned at store time; the cache evicts after this.
    pub ttl: Duration,
}

impl CachedLookup {
    /// Wrap an outcome fetched just now.
    #[must_use]
    pub fn new(outcome: Outcome, ttl: Duration) -> Self {
        Self {
            outcome,
            fetched_at: Utc::now(),
            ttl,
        }
    }
}

/// Per-entry expiration driven by the TTL stored inside each value.
struct PerEntryTtl;

impl Expiry<QueryKey, CachedLookup> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &QueryKey,
        value: &CachedLookup,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Deduplicating result cache.
#[derive(Clone)]
pub struct ResultCache {
    entries: Cache<QueryKey, CachedLookup>,
    success_ttl: Duration,
    negative_ttl: Duration,
}

impl ResultCache {
    /// Create a cache bounded by `capacity` entries, with default TTLs for
    /// successful and negative results.
    #[must_use]
    pub fn new(capacity: u64, success_ttl: Duration, negative_ttl: Duration) -> Self {
        let entries = Cache::builder()
            .max_capacity(capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self {
            entries,
            success_ttl,
            negative_ttl,
        }
    }

    /// Default TTL for an outcome: not-found answers age out sooner.
    #[must_use]
    pub const fn ttl_for(&self, outcome: &Outcome) -> Duration {
        match outcome {
            Outcome::Found(_) => self.success_ttl,
            Outcome::NotFound => self.negative_ttl,
        }
    }

    /// Fetch a live entry. Expired entries are absent by construction.
    pub async fn lookup(&self, key: &QueryKey) -> Option<CachedLookup> {
        self.entries.get(key).await
    }

    /// Insert a result, superseding any previous entry for the key.
    ///
    /// `ttl` overrides the outcome-based default when given.
    pub async fn store(&self, key: QueryKey, outcome: Outcome, ttl: Option<Duration>) -> CachedLookup {
        let ttl = ttl.unwrap_or_else(|| self.ttl_for(&outcome));
        let value = CachedLookup::new(outcome, ttl);
        self.entries.insert(key, value.clone()).await;
        value
    }

    /// Drop the entry for a key. Invalidating an absent key is a no-op, so
    /// repeated invalidation is idempotent.
    pub async fn invalidate(&self, key: &QueryKey) {
        self.entries.invalidate(key).await;
    }

    /// Get the cached value for `key`, or run `fetch` to produce it.
    ///
    /// Guarantees at most one in-flight `fetch` per key: concurrent callers
    /// for the same key await the single outstanding future. On success the
    /// value is cached (expiring per its own TTL); on failure the error is
    /// shared with every waiter and nothing is cached.
    ///
    /// The second tuple element is `true` when this call ran `fetch` itself
    /// rather than riding on a cached or in-flight result.
    pub async fn fetch_with<F>(
        &self,
        key: QueryKey,
        fetch: F,
    ) -> Result<(CachedLookup, bool), Arc<CoreError>>
    where
        F: std::future::Future<Output = Result<CachedLookup, CoreError>> + Send,
    {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let value = self
            .entries
            .try_get_with(key, async move {
                flag.store(true, Ordering::SeqCst);
                fetch.await
            })
            .await?;
        Ok((value, fired.load(Ordering::SeqCst)))
    }

    /// Number of live entries (approximate until pending tasks run).
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }
}
