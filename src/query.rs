//! Query categories, normalization, and validation.
//!
//! Every inbound lookup is normalized here before it is allowed to touch the
//! cache or the store: the cache key is the (kind, normalized string) pair, so
//! `"+91 98765-43210"` and `"919876543210"` must collapse to one entry.
//! Validation failures are rejected up front with [`CoreError::InvalidQuery`].

// lazy_regex! stores patterns in once_cell-backed statics, validated at compile time
#![allow(clippy::non_std_lazy_statics)]

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use lazy_regex::lazy_regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CoreError;

/// Hard cap on raw input length, applied before any other validation.
const MAX_RAW_LEN: usize = 256;

static RE_EMAIL: lazy_regex::Lazy<regex::Regex> =
    lazy_regex!(r"^[a-z0-9][a-z0-9._%+\-]*@[a-z0-9.\-]+\.[a-z]{2,}$");

/// UPI virtual payment addresses look like emails but carry a bare handle
/// instead of a domain (`name@bank`).
static RE_UPI: lazy_regex::Lazy<regex::Regex> =
    lazy_regex!(r"^[a-z0-9][a-z0-9._\-]*@[a-z][a-z0-9]{1,63}$");

static RE_USERNAME: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"^[a-z0-9][a-z0-9._]{1,31}$");

static RE_VEHICLE: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"^[A-Z0-9]{4,12}$");

static RE_DOCUMENT: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"^[A-Z0-9]{4,20}$");

/// Category of a lookup query.
///
/// The category selects the normalization rules and, for the HTTP adapter,
/// which endpoint template serves the lookup. It is also the namespace half
/// of every cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    /// Phone number, digits only after normalization.
    Phone,
    /// E-mail address.
    Email,
    /// IPv4 or IPv6 address.
    Ip,
    /// Social/platform handle.
    Username,
    /// Vehicle registration plate.
    Vehicle,
    /// Identity document number.
    Document,
    /// UPI virtual payment address.
    Upi,
}

impl QueryKind {
    /// Stable identifier used in the store and for endpoint template lookup.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Phone => "phone",
            Self::Email => "email",
            Self::Ip => "ip",
            Self::Username => "username",
            Self::Vehicle => "vehicle",
            Self::Document => "document",
            Self::Upi => "upi",
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "phone" | "number" | "mobile" => Ok(Self::Phone),
            "email" => Ok(Self::Email),
            "ip" => Ok(Self::Ip),
            "username" | "handle" => Ok(Self::Username),
            "vehicle" | "plate" | "rc" => Ok(Self::Vehicle),
            "document" | "doc" => Ok(Self::Document),
            "upi" | "vpa" => Ok(Self::Upi),
            other => Err(CoreError::InvalidQuery(format!(
                "unknown query kind: {other}"
            ))),
        }
    }
}

/// A validated, normalized lookup query.
///
/// Construction goes through [`Query::parse`]; the `value` field is always in
/// canonical form for its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Query {
    /// Query category.
    pub kind: QueryKind,
    /// Normalized query string.
    pub value: String,
}

impl Query {
    /// Validate and normalize raw user input for the given kind.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidQuery`] when the input is empty, too long,
    /// or does not match the kind's shape after normalization.
    pub fn parse(kind: QueryKind, raw: &str) -> Result<Self, CoreError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CoreError::InvalidQuery("empty query".into()));
        }
        if trimmed.len() > MAX_RAW_LEN {
            return Err(CoreError::InvalidQuery(format!(
                "query longer than {MAX_RAW_LEN} bytes"
            )));
        }

        let value = match kind {
            QueryKind::Phone => normalize_phone(trimmed)?,
            QueryKind::Email => normalize_matching(trimmed, &RE_EMAIL, "email")?,
            QueryKind::Upi => normalize_matching(trimmed, &RE_UPI, "UPI address")?,
            QueryKind::Ip => normalize_ip(trimmed)?,
            QueryKind::Username => normalize_username(trimmed)?,
            QueryKind::Vehicle => normalize_compact(trimmed, &RE_VEHICLE, "vehicle plate")?,
            QueryKind::Document => normalize_compact(trimmed, &RE_DOCUMENT, "document number")?,
        };

        Ok(Self { kind, value })
    }
}

fn normalize_phone(raw: &str) -> Result<String, CoreError> {
    let digits: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.' | '+'))
        .collect();
    if digits.len() < 7 || digits.len() > 15 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(CoreError::InvalidQuery(
            "phone number must be 7 to 15 digits".into(),
        ));
    }
    Ok(digits)
}

fn normalize_matching(raw: &str, re: &regex::Regex, label: &str) -> Result<String, CoreError> {
    let value = raw.to_ascii_lowercase();
    if !re.is_match(&value) {
        return Err(CoreError::InvalidQuery(format!("not a valid {label}")));
    }
    Ok(value)
}

fn normalize_ip(raw: &str) -> Result<String, CoreError> {
    let addr: IpAddr = raw
        .parse()
        .map_err(|_| CoreError::InvalidQuery("not a valid IP address".into()))?;
    Ok(addr.to_string())
}

fn normalize_username(raw: &str) -> Result<String, CoreError> {
    let stripped = raw.strip_prefix('@').unwrap_or(raw).to_ascii_lowercase();
    if !RE_USERNAME.is_match(&stripped) {
        return Err(CoreError::InvalidQuery("not a valid username".into()));
    }
    Ok(stripped)
}

fn normalize_compact(raw: &str, re: &regex::Regex, label: &str) -> Result<String, CoreError> {
    let compact: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-'))
        .collect::<String>()
        .to_ascii_uppercase();
    if !re.is_match(&compact) {
        return Err(CoreError::InvalidQuery(format!("not a valid {label}")));
    }
    Ok(compact)
}

/// Short SHA-256 digest of a query value, safe to put in log lines.
///
/// Raw lookup values never appear in logs; this digest still lets an operator
/// correlate repeated lookups of the same subject.
#[must_use]
pub fn log_digest(value: &str) -> String {
    let hash = Sha256::digest(value.as_bytes());
    let mut out = String::with_capacity(12);
    for byte in hash.iter().take(6) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
