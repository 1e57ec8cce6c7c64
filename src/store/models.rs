//! Row types for the persistent store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::query::QueryKind;

/// A registered bot user.
///
/// Created on first message, mutated on every served query, never
/// hard-deleted: `disabled` is the soft-disable flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Platform-assigned user identifier.
    pub user_id: i64,
    /// Platform username, if known.
    pub username: Option<String>,
    /// Display name, if known.
    pub first_name: Option<String>,
    /// Registration timestamp.
    pub joined_at: DateTime<Utc>,
    /// Last time the user was served.
    pub last_active: DateTime<Utc>,
    /// Total served queries (cache hits included).
    pub query_count: i64,
    /// Soft-disable flag.
    pub disabled: bool,
    /// Start of the persisted rate window, audit copy of limiter state.
    pub window_started_at: Option<DateTime<Utc>>,
    /// Dispatches within the persisted window.
    pub window_count: i64,
}

/// Lifecycle state of a query record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    /// Lookup dispatched, not yet finalized.
    Pending,
    /// Lookup completed (payload or authoritative not-found).
    Success,
    /// Lookup failed after bounded retries.
    Failed,
}

impl QueryStatus {
    /// Stable identifier stored in the `status` column.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub(crate) fn from_column(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One audited lookup request.
///
/// Inserted as `Pending`, finalized exactly once; finalized rows are never
/// mutated again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    /// Row id.
    pub id: i64,
    /// Owning user; always references an existing `users` row.
    pub user_id: i64,
    /// Query category.
    pub kind: QueryKind,
    /// Normalized query string.
    pub query: String,
    /// Lifecycle state.
    pub status: QueryStatus,
    /// Inline result payload; NULL while pending, for not-found, and for
    /// failures.
    pub result: Option<Value>,
    /// Insertion timestamp.
    pub created_at: DateTime<Utc>,
    /// Finalization timestamp.
    pub finalized_at: Option<DateTime<Utc>>,
}

/// Aggregate counters for operator visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoreStats {
    /// Registered users.
    pub total_users: i64,
    /// Soft-disabled users.
    pub disabled_users: i64,
    /// All query records.
    pub total_queries: i64,
    /// Records still pending finalization.
    pub pending_queries: i64,
}
