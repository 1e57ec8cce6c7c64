//! Generic HTTP lookup adapter.
//!
//! Endpoint URLs are configuration, not code: each query kind maps to a URL
//! template containing a `{query}` placeholder. The adapter substitutes the
//! normalized query (percent-encoded), performs a GET with a timeout, and
//! classifies the response. It never hardcodes a data source.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;

use super::{LookupSource, Outcome, SourceError};
use crate::query::{Query, QueryKind};

/// Placeholder substituted with the percent-encoded query value.
const QUERY_PLACEHOLDER: &str = "{query}";

/// HTTP-backed [`LookupSource`] driven by per-kind URL templates.
pub struct HttpLookupSource {
    client: Client,
    endpoints: HashMap<QueryKind, String>,
}

impl HttpLookupSource {
    /// Build an adapter from endpoint templates and a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns the underlying `reqwest` error if the client cannot be
    /// constructed (TLS backend initialization).
    pub fn new(
        endpoints: HashMap<QueryKind, String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoints })
    }

    fn build_url(&self, query: &Query) -> Result<String, SourceError> {
        let template = self
            .endpoints
            .get(&query.kind)
            .ok_or_else(|| SourceError::NotConfigured(query.kind.to_string()))?;
        Ok(template.replace(QUERY_PLACEHOLDER, &percent_encode(&query.value)))
    }
}

#[async_trait]
impl LookupSource for HttpLookupSource {
    async fn lookup(&self, query: &Query) -> Result<Outcome, SourceError> {
        let url = self.build_url(query)?;

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                SourceError::Timeout
            } else {
                SourceError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Outcome::NotFound);
        }
        if !status.is_success() {
            return Err(SourceError::Status(status.as_u16()));
        }

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                SourceError::Timeout
            } else {
                SourceError::Network(e.to_string())
            }
        })?;

        let outcome = classify_body(&body);
        debug!(kind = %query.kind, found = outcome.is_found(), "lookup completed");
        Ok(outcome)
    }
}

/// Decode a response body as JSON, falling back to plain text.
///
/// Empty payloads (`null`, `{}`, `[]`, blank text) are authoritative
/// not-found answers, matching how the upstream sources signal "no data".
fn classify_body(body: &[u8]) -> Outcome {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        let empty = match &value {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            Value::Array(items) => items.is_empty(),
            _ => false,
        };
        return if empty {
            Outcome::NotFound
        } else {
            Outcome::Found(value)
        };
    }

    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        Outcome::NotFound
    } else {
        Outcome::Found(Value::String(trimmed.to_string()))
    }
}

/// Minimal percent-encoding: everything outside the unreserved set is
/// escaped. Normalized queries are close to unreserved already; this covers
/// the `@` in emails and UPI addresses.
fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_with(kind: QueryKind, template: &str) -> HttpLookupSource {
        let mut endpoints = HashMap::new();
        endpoints.insert(kind, template.to_string());
        HttpLookupSource::new(endpoints, Duration::from_secs(5)).expect("client")
    }

    #[test]
    fn test_build_url_substitutes_encoded_query() {
        let source = source_with(QueryKind::Email, "https://api.example/lookup?q={query}");
        let query = Query::parse(QueryKind::Email, "alice@example.com").expect("valid");
        let url = source.build_url(&query).expect("url");
        assert_eq!(url, "https://api.example/lookup?q=alice%40example.com");
    }

    #[test]
    fn test_unconfigured_kind_is_rejected() {
        let source = source_with(QueryKind::Email, "https://api.example/{query}");
        let query = Query::parse(QueryKind::Phone, "9876543210").expect("valid");
        assert!(matches!(
            source.build_url(&query),
            Err(SourceError::NotConfigured(_))
        ));
    }

    #[test]
    fn test_percent_encode_unreserved_untouched() {
        assert_eq!(percent_encode("abc-123_.~"), "abc-123_.~");
        assert_eq!(percent_encode("a b"), "a%20b");
    }

    #[test]
    fn test_classify_json_payloads() {
        assert_eq!(classify_body(b"null"), Outcome::NotFound);
        assert_eq!(classify_body(b"{}"), Outcome::NotFound);
        assert_eq!(classify_body(b"[]"), Outcome::NotFound);
        assert!(matches!(
            classify_body(br#"{"name": "Alice"}"#),
            Outcome::Found(Value::Object(_))
        ));
    }

    #[test]
    fn test_classify_text_payloads() {
        assert_eq!(classify_body(b"   "), Outcome::NotFound);
        assert_eq!(
            classify_body(b"plain text result"),
            Outcome::Found(Value::String("plain text result".into()))
        );
    }
}
