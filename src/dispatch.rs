//! Query dispatcher: intake, cache check, rate check, lookup, persist.
//!
//! The dispatcher owns no state of its own. It composes the store, the
//! result cache, and the rate limiter, and is the only component allowed to
//! call the external [`LookupSource`] collaborator. Each request walks the
//! same path: validate, check the cache, check the quota, then run the
//! deduplicated lookup and persist its outcome before responding.
//!
//! The miss path runs in a spawned task: when the transport abandons a
//! request mid-flight, the lookup still completes and lands in cache and
//! store for the next requester, so its cost is never wasted.

use std::sync::Arc;
use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cache::{CachedLookup, QueryKey, ResultCache};
use crate::config::Settings;
use crate::error::CoreError;
use crate::limiter::{Decision, RateLimiter};
use crate::query::{log_digest, Query, QueryKind};
use crate::source::{LookupSource, Outcome, SourceError};
use crate::store::Store;

/// Initial backoff between lookup retry attempts.
const LOOKUP_RETRY_BASE_MS: u64 = 250;
/// Backoff ceiling between lookup retry attempts.
const LOOKUP_RETRY_MAX_MS: u64 = 2_000;

/// Inbound lookup request handed over by the messaging transport.
#[derive(Debug, Clone)]
pub struct LookupRequest {
    /// Platform-assigned user identifier.
    pub user_id: i64,
    /// Platform username, when the transport knows it.
    pub username: Option<String>,
    /// Display name, when the transport knows it.
    pub first_name: Option<String>,
    /// Query category.
    pub kind: QueryKind,
    /// Raw query string as typed by the user.
    pub query: String,
}

/// Terminal answer for one request.
///
/// The transport matches exhaustively and renders each arm; nothing here is
/// formatted for display.
#[derive(Debug, Clone)]
pub enum Response {
    /// The lookup answered (payload or authoritative not-found).
    Success {
        /// The result, including its fetch time and lifetime.
        result: CachedLookup,
        /// True when served from cache (or an already in-flight lookup)
        /// rather than a lookup fired for this request.
        cached: bool,
    },
    /// Quota exhausted; retry once the window rolls over.
    Denied {
        /// Time until a slot frees up.
        retry_after: Duration,
    },
    /// The request terminated with a typed error.
    Failed {
        /// What went wrong.
        error: CoreError,
    },
}

impl Response {
    /// Whether this is a successful answer.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Orchestrates one bot instance's lookup traffic.
pub struct Dispatcher {
    store: Arc<Store>,
    cache: ResultCache,
    limiter: Arc<RateLimiter>,
    source: Arc<dyn LookupSource>,
    lookup_retries: usize,
}

impl Dispatcher {
    /// Compose a dispatcher from already-built components.
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        cache: ResultCache,
        limiter: Arc<RateLimiter>,
        source: Arc<dyn LookupSource>,
        lookup_retries: usize,
    ) -> Self {
        Self {
            store,
            cache,
            limiter,
            source,
            lookup_retries,
        }
    }

    /// Build cache and limiter from settings and compose a dispatcher.
    #[must_use]
    pub fn from_settings(
        settings: &Settings,
        store: Arc<Store>,
        source: Arc<dyn LookupSource>,
    ) -> Self {
        let cache = ResultCache::new(
            settings.cache_capacity(),
            settings.cache_ttl(),
            settings.cache_negative_ttl(),
        );
        let limiter = Arc::new(RateLimiter::new(
            settings.rate_limit_quota(),
            settings.rate_limit_window(),
            settings.global_rate_limit_quota(),
        ));
        Self::new(store, cache, limiter, source, settings.lookup_retries())
    }

    /// The result cache, for transport-side invalidation and monitoring.
    #[must_use]
    pub const fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// The underlying store handle.
    #[must_use]
    pub const fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Handle one inbound request to a terminal [`Response`].
    pub async fn dispatch(&self, request: LookupRequest) -> Response {
        let span = info_span!(
            "dispatch",
            request_id = %Uuid::new_v4(),
            user_id = request.user_id,
            kind = %request.kind,
        );
        self.dispatch_inner(request).instrument(span).await
    }

    async fn dispatch_inner(&self, request: LookupRequest) -> Response {
        let query = match Query::parse(request.kind, &request.query) {
            Ok(query) => query,
            Err(error) => {
                info!(error = %error, "request rejected before dispatch");
                return Response::Failed { error };
            }
        };
        let digest = log_digest(&query.value);

        // Disabled users are turned away before anything else; a store read
        // failure is remembered but does not yet fail the request, because a
        // cached answer may still be serveable.
        let store_error = match self.store.get_user(request.user_id).await {
            Ok(Some(user)) if user.disabled => {
                info!(query = %digest, "request from disabled user rejected");
                return Response::Failed {
                    error: CoreError::UserDisabled(request.user_id),
                };
            }
            Ok(_) => None,
            Err(err) => {
                warn!(error = %err, "user lookup failed, trying cache");
                Some(CoreError::from(err))
            }
        };

        let key = QueryKey::from(&query);
        if let Some(hit) = self.cache.lookup(&key).await {
            self.touch_user_bookkeeping(&request).await;
            info!(query = %digest, "cache hit");
            return Response::Success {
                result: hit,
                cached: true,
            };
        }

        if let Some(error) = store_error {
            return Response::Failed { error };
        }

        match self.limiter.try_acquire(request.user_id) {
            Decision::Allowed => {}
            Decision::Denied { retry_after } => {
                info!(
                    query = %digest,
                    retry_after_secs = retry_after.as_secs(),
                    "rate limited"
                );
                return Response::Denied { retry_after };
            }
        }

        // Detach the miss path from this future: a transport-side
        // cancellation must not abort the in-flight lookup.
        let task = tokio::spawn(fetch_and_persist(
            Arc::clone(&self.store),
            self.cache.clone(),
            Arc::clone(&self.source),
            request.clone(),
            query,
            self.limiter.window(),
            self.lookup_retries,
        ));

        match task.await {
            Ok(Ok((result, fired))) => {
                if !fired {
                    // rode on another requester's in-flight lookup; that
                    // closure only touched the firing user's bookkeeping
                    self.touch_user_bookkeeping(&request).await;
                }
                Response::Success {
                    result,
                    cached: !fired,
                }
            }
            Ok(Err(shared)) => Response::Failed {
                error: (*shared).clone(),
            },
            Err(join_error) => Response::Failed {
                error: CoreError::Internal(join_error.to_string()),
            },
        }
    }

    /// Update user activity counters for a served request. Failures only
    /// lose bookkeeping, never the answer, so they are logged and dropped.
    async fn touch_user_bookkeeping(&self, request: &LookupRequest) {
        let outcome = Store::with_busy_retry(|| {
            self.store.touch_user(
                request.user_id,
                request.username.clone(),
                request.first_name.clone(),
            )
        })
        .await;
        if let Err(err) = outcome {
            warn!(error = %err, "user bookkeeping update failed");
        }
    }
}

/// The deduplicated miss path: at most one of these runs per cache key.
///
/// Persists the pending record before calling out, so a crash mid-lookup
/// leaves an auditable `pending` row, and finalizes it exactly once after.
async fn fetch_and_persist(
    store: Arc<Store>,
    cache: ResultCache,
    source: Arc<dyn LookupSource>,
    request: LookupRequest,
    query: Query,
    window: Duration,
    retries: usize,
) -> Result<(CachedLookup, bool), Arc<CoreError>> {
    let key = QueryKey::from(&query);
    let ttl_cache = cache.clone();

    cache
        .fetch_with(key, async move {
            let digest = log_digest(&query.value);

            Store::with_busy_retry(|| {
                store.touch_user(
                    request.user_id,
                    request.username.clone(),
                    request.first_name.clone(),
                )
            })
            .await?;
            let record_id =
                Store::with_busy_retry(|| store.begin_lookup(request.user_id, &query, window))
                    .await?;

            match lookup_with_retry(source.as_ref(), &query, retries).await {
                Ok(outcome) => {
                    let payload = match &outcome {
                        Outcome::Found(value) => Some(value.clone()),
                        Outcome::NotFound => None,
                    };
                    Store::with_busy_retry(|| store.complete_lookup(record_id, payload.clone()))
                        .await?;
                    let ttl = ttl_cache.ttl_for(&outcome);
                    info!(
                        query = %digest,
                        record_id,
                        found = outcome.is_found(),
                        "lookup persisted"
                    );
                    Ok(CachedLookup::new(outcome, ttl))
                }
                Err(err) => {
                    warn!(query = %digest, record_id, error = %err, "lookup failed");
                    if let Err(store_err) =
                        Store::with_busy_retry(|| store.fail_lookup(record_id)).await
                    {
                        warn!(error = %store_err, record_id, "could not finalize failed lookup");
                    }
                    Err(CoreError::LookupFailed(err))
                }
            }
        })
        .await
}

/// Call the source, retrying transient failures a bounded number of times
/// with exponential backoff and jitter.
async fn lookup_with_retry(
    source: &dyn LookupSource,
    query: &Query,
    retries: usize,
) -> Result<Outcome, SourceError> {
    let strategy = ExponentialBackoff::from_millis(LOOKUP_RETRY_BASE_MS)
        .max_delay(Duration::from_millis(LOOKUP_RETRY_MAX_MS))
        .map(jitter)
        .take(retries);

    RetryIf::spawn(strategy, || source.lookup(query), SourceError::is_retryable).await
}
