//! Configuration and settings management
//!
//! Loads settings from environment variables (with optional layered config
//! files) and defines the core's tuning constants. Numeric knobs arrive as
//! strings from the environment; typed accessors parse them and fall back to
//! the documented defaults.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::query::QueryKind;

/// Database file used when `DATABASE_PATH` is unset.
pub const DEFAULT_DATABASE_PATH: &str = "osint_bot.db";
/// Per-user dispatch quota per window.
pub const RATE_LIMIT_QUOTA_DEFAULT: u32 = 30;
/// Rate window size in seconds (one day, matching the free daily allowance).
pub const RATE_LIMIT_WINDOW_SECS_DEFAULT: u64 = 86_400;
/// TTL for cached successful lookups.
pub const CACHE_TTL_SECS_DEFAULT: u64 = 3_600;
/// Shorter TTL for cached not-found answers.
pub const CACHE_NEGATIVE_TTL_SECS_DEFAULT: u64 = 300;
/// Maximum number of cached results.
pub const CACHE_CAPACITY_DEFAULT: u64 = 10_000;
/// External lookup request timeout in seconds.
pub const LOOKUP_TIMEOUT_SECS_DEFAULT: u64 = 15;
/// Automatic retries for transient lookup failures.
pub const LOOKUP_RETRIES_DEFAULT: usize = 2;

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Bot API token. Opaque secret: consumed by the transport collaborator,
    /// redacted from logs, never written to the store.
    pub bot_token: String,

    /// Path of the SQLite database file
    pub database_path: Option<String>,

    /// Per-user quota per window
    #[serde(rename = "rate_limit_quota")]
    pub rate_limit_quota_str: Option<String>,

    /// Window size in seconds
    #[serde(rename = "rate_limit_window_secs")]
    pub rate_limit_window_secs_str: Option<String>,

    /// Optional cross-user quota over the same window
    #[serde(rename = "global_rate_limit_quota")]
    pub global_rate_limit_quota_str: Option<String>,

    /// Success TTL in seconds
    #[serde(rename = "cache_ttl_secs")]
    pub cache_ttl_secs_str: Option<String>,

    /// Negative (not-found) TTL in seconds
    #[serde(rename = "cache_negative_ttl_secs")]
    pub cache_negative_ttl_secs_str: Option<String>,

    /// Cache capacity in entries
    #[serde(rename = "cache_capacity")]
    pub cache_capacity_str: Option<String>,

    /// Lookup timeout in seconds
    #[serde(rename = "lookup_timeout_secs")]
    pub lookup_timeout_secs_str: Option<String>,

    /// Bounded retries for transient lookup failures
    #[serde(rename = "lookup_retries")]
    pub lookup_retries_str: Option<String>,

    /// Endpoint templates, `kind=url` pairs separated by `;`, each url
    /// containing a `{query}` placeholder
    #[serde(rename = "lookup_endpoints")]
    pub lookup_endpoints_str: Option<String>,

    /// Backup cadence in seconds; unset disables periodic backups
    #[serde(rename = "backup_interval_secs")]
    pub backup_interval_secs_str: Option<String>,

    /// Directory receiving backup snapshots
    pub backup_dir: Option<String>,
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails or `BOT_TOKEN` is missing.
    pub fn new() -> Result<Self, ConfigError> {
        // Pull in a .env file when present; real environment variables win
        dotenvy::dotenv().ok();

        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start off by merging in the "default" configuration file
            .add_source(File::with_name("config/default").required(false))
            // Add in the current environment file
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Add in a local configuration file, not checked into git
            .add_source(File::with_name("config/local").required(false))
            // Environment variables win; empty values count as unset
            .add_source(Environment::default().ignore_empty(true))
            .build()?;

        s.try_deserialize()
    }

    /// Database file path.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(
            self.database_path
                .as_deref()
                .unwrap_or(DEFAULT_DATABASE_PATH),
        )
    }

    /// Per-user dispatch quota per window.
    #[must_use]
    pub fn rate_limit_quota(&self) -> u32 {
        parse_or(&self.rate_limit_quota_str, RATE_LIMIT_QUOTA_DEFAULT)
    }

    /// Rate window size.
    #[must_use]
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(parse_or(
            &self.rate_limit_window_secs_str,
            RATE_LIMIT_WINDOW_SECS_DEFAULT,
        ))
    }

    /// Optional cross-user quota over the same window.
    #[must_use]
    pub fn global_rate_limit_quota(&self) -> Option<u32> {
        self.global_rate_limit_quota_str
            .as_deref()
            .and_then(|s| s.trim().parse().ok())
    }

    /// TTL for cached successful lookups.
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(parse_or(&self.cache_ttl_secs_str, CACHE_TTL_SECS_DEFAULT))
    }

    /// TTL for cached not-found answers.
    #[must_use]
    pub fn cache_negative_ttl(&self) -> Duration {
        Duration::from_secs(parse_or(
            &self.cache_negative_ttl_secs_str,
            CACHE_NEGATIVE_TTL_SECS_DEFAULT,
        ))
    }

    /// Maximum number of cached results.
    #[must_use]
    pub fn cache_capacity(&self) -> u64 {
        parse_or(&self.cache_capacity_str, CACHE_CAPACITY_DEFAULT)
    }

    /// External lookup request timeout.
    #[must_use]
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(parse_or(
            &self.lookup_timeout_secs_str,
            LOOKUP_TIMEOUT_SECS_DEFAULT,
        ))
    }

    /// Bounded retries for transient lookup failures.
    #[must_use]
    pub fn lookup_retries(&self) -> usize {
        parse_or(&self.lookup_retries_str, LOOKUP_RETRIES_DEFAULT)
    }

    /// Endpoint templates by query kind.
    ///
    /// Unknown kinds and malformed pairs are skipped, matching how other
    /// list-valued settings tolerate noise.
    #[must_use]
    pub fn lookup_endpoints(&self) -> HashMap<QueryKind, String> {
        self.lookup_endpoints_str
            .as_deref()
            .map(|raw| {
                raw.split(';')
                    .filter_map(|pair| {
                        let (kind, url) = pair.split_once('=')?;
                        let kind: QueryKind = kind.trim().parse().ok()?;
                        let url = url.trim();
                        if url.is_empty() {
                            return None;
                        }
                        Some((kind, url.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Backup cadence; `None` disables periodic backups.
    #[must_use]
    pub fn backup_interval(&self) -> Option<Duration> {
        self.backup_interval_secs_str
            .as_deref()
            .and_then(|s| s.trim().parse().ok())
            .map(Duration::from_secs)
    }

    /// Directory receiving backup snapshots (defaults beside the database).
    #[must_use]
    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir.as_deref().map_or_else(
            || {
                self.database_path()
                    .parent()
                    .map_or_else(|| PathBuf::from("."), std::path::Path::to_path_buf)
            },
            PathBuf::from,
        )
    }
}

fn parse_or<T: std::str::FromStr>(raw: &Option<String>, default: T) -> T {
    raw.as_deref()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}
