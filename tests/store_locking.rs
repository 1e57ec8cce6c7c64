//! Write-lock contention behavior: a held write transaction makes concurrent
//! writes fail fast with a busy error, and the bounded-backoff retry helper
//! rides out short contention windows.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use datatrace_core::query::{Query, QueryKind};
use datatrace_core::store::models::QueryStatus;
use datatrace_core::store::{queries, Store, StoreError};

fn open_store() -> Arc<Store> {
    datatrace_core::telemetry::init_logging();
    let path: PathBuf = std::env::temp_dir().join(format!("datatrace-test-{}.db", Uuid::new_v4()));
    Arc::new(Store::open(path).expect("open store"))
}

/// Hold the write lock inside an open transaction for `hold`.
fn hold_write_lock(store: &Arc<Store>, hold: Duration) -> tokio::task::JoinHandle<()> {
    let store = Arc::clone(store);
    tokio::spawn(async move {
        store
            .transaction(move |tx| {
                queries::set_disabled(tx, 1, false)?;
                std::thread::sleep(hold);
                Ok(())
            })
            .await
            .expect("holder transaction");
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_write_fails_busy_then_succeeds_after_release() {
    let store = open_store();
    store.touch_user(1, None, None).await.expect("seed user");

    let holder = hold_write_lock(&store, Duration::from_millis(300));
    tokio::time::sleep(Duration::from_millis(50)).await;

    // second writer while the transaction is held open
    let contended = store.set_disabled(1, true).await;
    assert!(matches!(contended, Err(StoreError::Busy)));

    holder.await.expect("holder task");

    let released = store.set_disabled(1, true).await.expect("after release");
    assert!(released);
    let user = store.get_user(1).await.expect("read").expect("exists");
    assert!(user.disabled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn busy_retry_rides_out_short_contention() {
    let store = open_store();
    store.touch_user(1, None, None).await.expect("seed user");

    let holder = hold_write_lock(&store, Duration::from_millis(25));
    tokio::time::sleep(Duration::from_millis(5)).await;

    let result = Store::with_busy_retry(|| store.set_disabled(1, true)).await;
    assert!(result.expect("retried write"));

    holder.await.expect("holder task");
}

#[tokio::test]
async fn readers_are_not_blocked_by_an_open_write_transaction() {
    let store = open_store();
    store.touch_user(1, None, None).await.expect("seed user");

    let holder = hold_write_lock(&store, Duration::from_millis(200));
    tokio::time::sleep(Duration::from_millis(50)).await;

    // read path uses its own connection and WAL snapshot
    let user = store.get_user(1).await.expect("read").expect("exists");
    assert_eq!(user.user_id, 1);

    holder.await.expect("holder task");
}

#[tokio::test]
async fn query_record_round_trip_is_identical() -> anyhow::Result<()> {
    let store = open_store();
    store.touch_user(7, Some("alice".into()), None).await?;

    let query = Query::parse(QueryKind::Email, "Alice@Example.com")?;
    let id = store.begin_lookup(7, &query, Duration::from_secs(60)).await?;
    store
        .complete_lookup(id, Some(json!({"name": "Alice", "city": "Pune"})))
        .await?;

    let by_id = store.record_by_id(id).await?.expect("record exists");
    let by_user = store.list_by_user(7, 10).await?;

    assert_eq!(by_user, vec![by_id.clone()]);
    assert_eq!(by_id.user_id, 7);
    assert_eq!(by_id.kind, QueryKind::Email);
    assert_eq!(by_id.query, "alice@example.com");
    assert_eq!(by_id.status, QueryStatus::Success);
    assert_eq!(by_id.result, Some(json!({"name": "Alice", "city": "Pune"})));
    assert!(by_id.finalized_at.is_some());
    Ok(())
}

#[tokio::test]
async fn backup_snapshot_survives_reopen() -> anyhow::Result<()> {
    let store = open_store();
    store.touch_user(7, None, None).await?;
    let query = Query::parse(QueryKind::Ip, "8.8.8.8")?;
    let id = store.begin_lookup(7, &query, Duration::from_secs(60)).await?;
    store.complete_lookup(id, None).await?;

    let dest = std::env::temp_dir().join(format!("datatrace-backup-{}.db", Uuid::new_v4()));
    store.backup_to(dest.clone()).await?;
    drop(store);

    let snapshot = Store::open(&dest)?;
    let records = snapshot.list_by_user(7, 10).await?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, QueryStatus::Success);
    Ok(())
}
