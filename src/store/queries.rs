//! SQL for users, the query log, and stats.
//!
//! Free functions over a borrowed connection (or transaction), composed by
//! the async wrappers in the parent module. Timestamps are RFC 3339 UTC text
//! so they stay human-readable in the file and compare lexicographically.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use thiserror::Error;

use super::models::{QueryRecord, QueryStatus, StoreStats, User};
use super::StoreError;
use crate::query::{Query, QueryKind};

#[derive(Debug, Error)]
#[error("unexpected column value: {0}")]
struct ColumnError(String);

/// Create the user on first contact, or refresh activity bookkeeping.
///
/// Every served request lands here: `last_active` moves forward and
/// `query_count` grows whether the answer came from cache or a fresh lookup.
/// Name fields only ever improve (NULL input never erases a known value).
pub fn touch_user(
    conn: &Connection,
    user_id: i64,
    username: Option<&str>,
    first_name: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO users (user_id, username, first_name, joined_at, last_active, query_count)
         VALUES (?1, ?2, ?3, ?4, ?4, 1)
         ON CONFLICT(user_id) DO UPDATE SET
             username = COALESCE(excluded.username, users.username),
             first_name = COALESCE(excluded.first_name, users.first_name),
             last_active = excluded.last_active,
             query_count = users.query_count + 1",
        params![user_id, username, first_name, now.to_rfc3339()],
    )?;
    Ok(())
}

pub fn get_user(conn: &Connection, user_id: i64) -> Result<Option<User>, StoreError> {
    let user = conn
        .query_row(
            "SELECT user_id, username, first_name, joined_at, last_active,
                    query_count, disabled, window_started_at, window_count
             FROM users WHERE user_id = ?1",
            params![user_id],
            map_user,
        )
        .optional()?;
    Ok(user)
}

/// Persist the audit copy of the user's rate window: roll it over when the
/// stored window has aged out, otherwise bump the in-window counter.
pub fn record_window(
    conn: &Connection,
    user_id: i64,
    window: Duration,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let threshold = (now - window).to_rfc3339();
    conn.execute(
        "UPDATE users SET
             window_started_at = CASE
                 WHEN window_started_at IS NULL OR window_started_at <= ?2
                 THEN ?3 ELSE window_started_at END,
             window_count = CASE
                 WHEN window_started_at IS NULL OR window_started_at <= ?2
                 THEN 1 ELSE window_count + 1 END
         WHERE user_id = ?1",
        params![user_id, threshold, now.to_rfc3339()],
    )?;
    Ok(())
}

/// Flip the soft-disable flag. Returns false when the user does not exist.
pub fn set_disabled(conn: &Connection, user_id: i64, disabled: bool) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE users SET disabled = ?2 WHERE user_id = ?1",
        params![user_id, i64::from(disabled)],
    )?;
    Ok(changed > 0)
}

/// Insert a pending query record and return its id.
pub fn insert_query(
    conn: &Connection,
    user_id: i64,
    query: &Query,
    now: DateTime<Utc>,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO query_log (user_id, kind, query, status, created_at)
         VALUES (?1, ?2, ?3, 'pending', ?4)",
        params![user_id, query.kind.as_str(), query.value, now.to_rfc3339()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Finalize a pending record exactly once.
///
/// The `status = 'pending'` guard makes finalized rows immutable: a second
/// finalization attempt changes nothing and returns false.
pub fn finalize_query(
    conn: &Connection,
    id: i64,
    status: QueryStatus,
    result: Option<&Value>,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let payload = result.map(Value::to_string);
    let changed = conn.execute(
        "UPDATE query_log SET status = ?2, result = ?3, finalized_at = ?4
         WHERE id = ?1 AND status = 'pending'",
        params![id, status.as_str(), payload, now.to_rfc3339()],
    )?;
    Ok(changed > 0)
}

pub fn query_by_id(conn: &Connection, id: i64) -> Result<Option<QueryRecord>, StoreError> {
    let record = conn
        .query_row(
            "SELECT id, user_id, kind, query, status, result, created_at, finalized_at
             FROM query_log WHERE id = ?1",
            params![id],
            map_record,
        )
        .optional()?;
    Ok(record)
}

/// Most recent records for a user, newest first.
pub fn list_by_user(
    conn: &Connection,
    user_id: i64,
    limit: u32,
) -> Result<Vec<QueryRecord>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, kind, query, status, result, created_at, finalized_at
         FROM query_log WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
    )?;
    let records = stmt
        .query_map(params![user_id, limit], map_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

pub fn stats(conn: &Connection) -> Result<StoreStats, StoreError> {
    let stats = conn.query_row(
        "SELECT
             (SELECT COUNT(*) FROM users),
             (SELECT COUNT(*) FROM users WHERE disabled = 1),
             (SELECT COUNT(*) FROM query_log),
             (SELECT COUNT(*) FROM query_log WHERE status = 'pending')",
        [],
        |row| {
            Ok(StoreStats {
                total_users: row.get(0)?,
                disabled_users: row.get(1)?,
                total_queries: row.get(2)?,
                pending_queries: row.get(3)?,
            })
        },
    )?;
    Ok(stats)
}

fn map_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        user_id: row.get(0)?,
        username: row.get(1)?,
        first_name: row.get(2)?,
        joined_at: parse_ts(3, &row.get::<_, String>(3)?)?,
        last_active: parse_ts(4, &row.get::<_, String>(4)?)?,
        query_count: row.get(5)?,
        disabled: row.get::<_, i64>(6)? != 0,
        window_started_at: row
            .get::<_, Option<String>>(7)?
            .map(|raw| parse_ts(7, &raw))
            .transpose()?,
        window_count: row.get(8)?,
    })
}

fn map_record(row: &Row<'_>) -> rusqlite::Result<QueryRecord> {
    let kind_raw: String = row.get(2)?;
    let status_raw: String = row.get(4)?;
    let result_raw: Option<String> = row.get(5)?;

    Ok(QueryRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: QueryKind::from_str(&kind_raw).map_err(|e| conversion(2, e))?,
        query: row.get(3)?,
        status: QueryStatus::from_column(&status_raw)
            .ok_or_else(|| conversion(4, ColumnError(status_raw)))?,
        result: result_raw
            .map(|raw| serde_json::from_str(&raw).map_err(|e| conversion(5, e)))
            .transpose()?,
        created_at: parse_ts(6, &row.get::<_, String>(6)?)?,
        finalized_at: row
            .get::<_, Option<String>>(7)?
            .map(|raw| parse_ts(7, &raw))
            .transpose()?,
    })
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion(idx, e))
}

fn conversion<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::migrations;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        migrations::run(&conn).expect("schema");
        conn
    }

    #[test]
    fn test_touch_user_creates_then_updates() {
        let conn = conn();
        let now = Utc::now();

        touch_user(&conn, 7, Some("alice"), None, now).expect("insert");
        touch_user(&conn, 7, None, Some("Alice"), now).expect("update");

        let user = get_user(&conn, 7).expect("query").expect("exists");
        assert_eq!(user.username.as_deref(), Some("alice"));
        assert_eq!(user.first_name.as_deref(), Some("Alice"));
        assert_eq!(user.query_count, 2);
        assert!(!user.disabled);
    }

    #[test]
    fn test_query_record_round_trip() {
        let conn = conn();
        let now = Utc::now();
        touch_user(&conn, 7, None, None, now).expect("user");

        let query = Query::parse(QueryKind::Email, "alice@example.com").expect("valid");
        let id = insert_query(&conn, 7, &query, now).expect("insert");
        let payload = serde_json::json!({"name": "Alice"});
        assert!(finalize_query(&conn, id, QueryStatus::Success, Some(&payload), now)
            .expect("finalize"));

        let by_id = query_by_id(&conn, id).expect("query").expect("exists");
        let listed = list_by_user(&conn, 7, 10).expect("list");
        assert_eq!(listed, vec![by_id.clone()]);
        assert_eq!(by_id.status, QueryStatus::Success);
        assert_eq!(by_id.result, Some(payload));
        assert_eq!(by_id.query, "alice@example.com");
    }

    #[test]
    fn test_finalized_records_are_immutable() {
        let conn = conn();
        let now = Utc::now();
        touch_user(&conn, 7, None, None, now).expect("user");
        let query = Query::parse(QueryKind::Ip, "8.8.8.8").expect("valid");
        let id = insert_query(&conn, 7, &query, now).expect("insert");

        assert!(finalize_query(&conn, id, QueryStatus::Failed, None, now).expect("first"));
        assert!(!finalize_query(&conn, id, QueryStatus::Success, None, now).expect("second"));

        let record = query_by_id(&conn, id).expect("query").expect("exists");
        assert_eq!(record.status, QueryStatus::Failed);
    }

    #[test]
    fn test_record_window_rolls_over() {
        let conn = conn();
        let now = Utc::now();
        touch_user(&conn, 7, None, None, now).expect("user");
        let window = Duration::from_secs(60);

        record_window(&conn, 7, window, now).expect("first");
        record_window(&conn, 7, window, now).expect("second");
        let user = get_user(&conn, 7).expect("query").expect("exists");
        assert_eq!(user.window_count, 2);

        let later = now + chrono::Duration::seconds(120);
        record_window(&conn, 7, window, later).expect("rollover");
        let user = get_user(&conn, 7).expect("query").expect("exists");
        assert_eq!(user.window_count, 1);
        assert_eq!(user.window_started_at, Some(parse_rfc(&later)));
    }

    fn parse_rfc(dt: &DateTime<Utc>) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(&dt.to_rfc3339())
            .expect("rfc3339")
            .with_timezone(&Utc)
    }

    #[test]
    fn test_disable_and_stats() {
        let conn = conn();
        let now = Utc::now();
        touch_user(&conn, 1, None, None, now).expect("user 1");
        touch_user(&conn, 2, None, None, now).expect("user 2");
        assert!(set_disabled(&conn, 2, true).expect("disable"));
        assert!(!set_disabled(&conn, 99, true).expect("missing user"));

        let query = Query::parse(QueryKind::Phone, "9876543210").expect("valid");
        insert_query(&conn, 1, &query, now).expect("insert");

        let stats = stats(&conn).expect("stats");
        assert_eq!(stats.total_users, 2);
        assert_eq!(stats.disabled_users, 1);
        assert_eq!(stats.total_queries, 1);
        assert_eq!(stats.pending_queries, 1);
    }
}
