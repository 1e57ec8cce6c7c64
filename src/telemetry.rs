//! Logging initialization with secret redaction.
//!
//! The bot token must never reach a log line, an error trace, or a crash
//! report. Instead of trusting every call site, the subscriber's writer
//! scrubs known token shapes from the byte stream itself, so even a token
//! embedded in an upstream error message comes out masked.

// lazy_regex! stores patterns in once_cell-backed statics, validated at compile time
#![allow(clippy::non_std_lazy_statics)]

use std::io::{self, Write};

use lazy_regex::lazy_regex;
use tracing_subscriber::{prelude::*, EnvFilter};

/// Bot API URLs carrying the token in the path.
static RE_TOKEN_URL: lazy_regex::Lazy<regex::Regex> =
    lazy_regex!(r"(https?://[^/]+/bot)([0-9]+:[A-Za-z0-9_-]+)");

/// Bare token shape: numeric id, colon, 35-char secret.
static RE_TOKEN_BARE: lazy_regex::Lazy<regex::Regex> =
    lazy_regex!(r"[0-9]{8,10}:[A-Za-z0-9_-]{35}");

/// `bot<id>:` prefix followed by the secret part.
static RE_TOKEN_PREFIXED: lazy_regex::Lazy<regex::Regex> =
    lazy_regex!(r"(bot[0-9]{8,10}:)[A-Za-z0-9_-]+");

/// Environment-style assignment of the token.
static RE_TOKEN_ASSIGNMENT: lazy_regex::Lazy<regex::Regex> =
    lazy_regex!(r"BOT_TOKEN=[^\s&]+");

/// Replace every known token shape in `input` with a placeholder.
#[must_use]
pub fn redact(input: &str) -> String {
    let output = RE_TOKEN_URL.replace_all(input, "$1[BOT_TOKEN]");
    let output = RE_TOKEN_BARE.replace_all(&output, "[BOT_TOKEN]");
    let output = RE_TOKEN_PREFIXED.replace_all(&output, "$1[BOT_TOKEN]");
    let output = RE_TOKEN_ASSIGNMENT.replace_all(&output, "BOT_TOKEN=[MASKED]");
    output.into_owned()
}

struct RedactingWriter<W: Write> {
    inner: W,
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        self.inner.write_all(redact(&text).as_bytes())?;
        // Report the original length to satisfy the contract even though the
        // redacted output may differ in size.
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter<F> {
    make_inner: F,
}

impl<'a, F, W> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'static,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: (self.make_inner)(),
        }
    }
}

/// Install the global tracing subscriber: `RUST_LOG`-style filtering (info
/// by default) over a redacting stderr writer.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let make_writer = RedactingMakeWriter {
        make_inner: io::stderr,
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(make_writer))
        .try_init();
}
