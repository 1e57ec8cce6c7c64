//! Quota enforcement at the dispatcher level: the fourth distinct query in a
//! 3-per-minute window is denied with a positive retry-after, and a denied
//! request leaves no trace in cache or store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use datatrace_core::cache::ResultCache;
use datatrace_core::dispatch::{Dispatcher, LookupRequest, Response};
use datatrace_core::limiter::RateLimiter;
use datatrace_core::query::{Query, QueryKind};
use datatrace_core::source::{LookupSource, Outcome, SourceError};
use datatrace_core::store::Store;

struct CountingSource {
    calls: AtomicUsize,
}

#[async_trait]
impl LookupSource for CountingSource {
    async fn lookup(&self, query: &Query) -> Result<Outcome, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Outcome::Found(json!({ "subject": query.value })))
    }
}

fn build_dispatcher(source: Arc<CountingSource>, quota: u32) -> Dispatcher {
    datatrace_core::telemetry::init_logging();
    let path = std::env::temp_dir().join(format!("datatrace-test-{}.db", Uuid::new_v4()));
    let store = Arc::new(Store::open(path).expect("open store"));
    let cache = ResultCache::new(100, Duration::from_secs(60), Duration::from_secs(5));
    let limiter = Arc::new(RateLimiter::new(quota, Duration::from_secs(60), None));
    Dispatcher::new(store, cache, limiter, source, 1)
}

fn phone_request(user_id: i64, number: &str) -> LookupRequest {
    LookupRequest {
        user_id,
        username: None,
        first_name: None,
        kind: QueryKind::Phone,
        query: number.into(),
    }
}

#[tokio::test]
async fn fourth_query_in_window_is_denied() {
    let source = Arc::new(CountingSource {
        calls: AtomicUsize::new(0),
    });
    let dispatcher = build_dispatcher(Arc::clone(&source), 3);

    let numbers = ["9876543210", "9876543211", "9876543212", "9876543213"];
    for number in &numbers[..3] {
        let response = dispatcher.dispatch(phone_request(7, number)).await;
        assert!(response.is_success(), "first three must dispatch normally");
    }

    match dispatcher.dispatch(phone_request(7, numbers[3])).await {
        Response::Denied { retry_after } => {
            assert!(retry_after > Duration::ZERO);
            assert!(retry_after <= Duration::from_secs(60));
        }
        other => panic!("expected denial, got {other:?}"),
    }

    // the denied request reached neither the source nor the store
    assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    let records = dispatcher
        .store()
        .list_by_user(7, 10)
        .await
        .expect("list records");
    assert_eq!(records.len(), 3);
}

#[tokio::test]
async fn quota_is_per_user() {
    let source = Arc::new(CountingSource {
        calls: AtomicUsize::new(0),
    });
    let dispatcher = build_dispatcher(Arc::clone(&source), 1);

    assert!(dispatcher
        .dispatch(phone_request(1, "9876543210"))
        .await
        .is_success());
    assert!(matches!(
        dispatcher.dispatch(phone_request(1, "9876543211")).await,
        Response::Denied { .. }
    ));

    // a different user still has a full window
    assert!(dispatcher
        .dispatch(phone_request(2, "9876543212"))
        .await
        .is_success());
}

#[tokio::test]
async fn cache_hits_are_served_despite_exhausted_quota() {
    let source = Arc::new(CountingSource {
        calls: AtomicUsize::new(0),
    });
    let dispatcher = build_dispatcher(Arc::clone(&source), 1);

    assert!(dispatcher
        .dispatch(phone_request(7, "9876543210"))
        .await
        .is_success());

    // quota is spent, but the cached answer does not need a dispatch slot
    match dispatcher.dispatch(phone_request(7, "9876543210")).await {
        Response::Success { cached, .. } => assert!(cached),
        other => panic!("expected cached success, got {other:?}"),
    }
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
}
