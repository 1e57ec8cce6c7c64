//! Schema creation and forward-only column backfill.
//!
//! Runs on every open. Tables are created idempotently; columns added in
//! later versions are backfilled with `ALTER TABLE` after a `PRAGMA
//! table_info` probe, so a database written by an older build upgrades in
//! place without a migration table.

use rusqlite::Connection;
use tracing::info;

use super::StoreError;

const BASE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    user_id      INTEGER PRIMARY KEY,
    username     TEXT,
    first_name   TEXT,
    joined_at    TEXT NOT NULL,
    last_active  TEXT NOT NULL,
    query_count  INTEGER NOT NULL DEFAULT 0,
    disabled     INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS query_log (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id      INTEGER NOT NULL REFERENCES users(user_id),
    kind         TEXT NOT NULL,
    query        TEXT NOT NULL,
    status       TEXT NOT NULL DEFAULT 'pending',
    result       TEXT,
    created_at   TEXT NOT NULL,
    finalized_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_query_log_user ON query_log(user_id, id);
";

/// Apply the schema to a freshly opened connection.
pub fn run(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(BASE_SCHEMA)?;

    ensure_column(conn, "users", "window_started_at", "TEXT")?;
    ensure_column(conn, "users", "window_count", "INTEGER NOT NULL DEFAULT 0")?;

    Ok(())
}

/// Add a column if the table does not have it yet.
fn ensure_column(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<(), StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let existing: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<_, _>>()?;

    if !existing.iter().any(|name| name == column) {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"))?;
        info!(table, column, "added missing column");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_is_idempotent() {
        let conn = Connection::open_in_memory().expect("open");
        run(&conn).expect("first run");
        run(&conn).expect("second run");
    }

    #[test]
    fn test_backfills_window_columns_on_old_schema() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "CREATE TABLE users (
                user_id INTEGER PRIMARY KEY,
                username TEXT,
                first_name TEXT,
                joined_at TEXT NOT NULL,
                last_active TEXT NOT NULL,
                query_count INTEGER NOT NULL DEFAULT 0,
                disabled INTEGER NOT NULL DEFAULT 0
            )",
        )
        .expect("old schema");

        run(&conn).expect("migrate");

        conn.execute(
            "UPDATE users SET window_count = 3 WHERE user_id = 1",
            [],
        )
        .expect("window_count column exists");
    }
}
