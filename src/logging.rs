//! Structured logging for the provider bridge.
//!
//! Provides a layered `tracing` subscriber with:
//! - **stderr** output for interactive use (respects `RUST_LOG`).
//! - **file appender** writing JSON lines to `~/.unhosted/logs/` with daily
//!   rotation and bounded retention.
//! - **Redaction** of key material and credentials in captured output.
//! - **Correlation fields** via `tracing::Span` for `channel_name`, `method`
//!   and `ident`.
//! - **Test capture** helpers for asserting on log output in tests.

use std::path::{Path, PathBuf};
use tracing::Span;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

// ─── Configuration ──────────────────────────────────────────────────────────

const LOG_DIR_RELATIVE: &str = ".unhosted/logs";

const LOG_FILE_PREFIX: &str = "unhosted-provider";

/// Maximum number of daily log files to retain.
const MAX_LOG_FILES: usize = 7;

const REDACTED_FIELD_NAMES: &[&str] = &[
    "private_key",
    "mnemonic",
    "seed",
    "password",
    "secret",
    "token",
    "authorization",
];

// ─── Subscriber Initialization ──────────────────────────────────────────────

/// Install the global subscriber: stderr filtered by `RUST_LOG` (default
/// `warn`) plus a JSON file layer at `debug`.
///
/// Call once at startup. Panics if a global subscriber is already set.
pub fn init_logging() {
    let stderr_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(make_file_layer())
        .init();
}

// ─── File Layer ─────────────────────────────────────────────────────────────

fn log_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(LOG_DIR_RELATIVE))
}

fn make_file_layer<S>() -> Option<Box<dyn Layer<S> + Send + Sync>>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let dir = log_dir()?;
    let _ = std::fs::create_dir_all(&dir);

    let file_appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    // Writer must outlive every span; keep it for the process lifetime.
    std::mem::forget(guard);

    let layer = fmt::layer()
        .json()
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    Some(layer.boxed())
}

// ─── Pruning ────────────────────────────────────────────────────────────────

/// Drop all but the newest [`MAX_LOG_FILES`] rotated files from the default
/// log directory. Errors are ignored.
pub fn prune_old_logs() {
    if let Some(dir) = log_dir() {
        let _ = prune_logs_in(&dir, MAX_LOG_FILES);
    }
}

/// Returns the number of files removed.
fn prune_logs_in(dir: &Path, keep: usize) -> std::io::Result<usize> {
    let mut log_files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(LOG_FILE_PREFIX))
        })
        .collect();

    // Daily rotation suffixes sort chronologically.
    log_files.sort();

    let excess = log_files.len().saturating_sub(keep);
    for path in &log_files[..excess] {
        std::fs::remove_file(path)?;
    }
    Ok(excess)
}

// ─── Redaction ──────────────────────────────────────────────────────────────

pub fn is_sensitive_field(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    REDACTED_FIELD_NAMES.iter().any(|&pat| lower.contains(pat))
}

pub fn redact_if_sensitive<'a>(field_name: &str, value: &'a str) -> std::borrow::Cow<'a, str> {
    if is_sensitive_field(field_name) {
        std::borrow::Cow::Borrowed("[REDACTED]")
    } else {
        std::borrow::Cow::Borrowed(value)
    }
}

// ─── Correlation Spans ──────────────────────────────────────────────────────

/// Span covering the lifetime of one correlated channel.
pub fn channel_span(channel_name: &str) -> Span {
    tracing::info_span!("unhosted_channel", channel_name = channel_name)
}

/// Span for a single outbound provider request.
pub fn request_span(method: &str, ident: Option<u32>) -> Span {
    tracing::debug_span!("unhosted_request", method = method, ident = ident)
}

// ─── Test Capture ───────────────────────────────────────────────────────────

/// In-memory log capture for test assertions.
#[cfg(test)]
pub struct LogCapture {
    buffer: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
}

#[cfg(test)]
impl LogCapture {
    pub fn new() -> Self {
        Self {
            buffer: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    fn layer<S>(&self) -> impl Layer<S>
    where
        S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        CaptureLayer {
            buffer: self.buffer.clone(),
        }
    }

    /// Capture events on the current thread until the guard drops.
    pub fn set_default(&self) -> tracing::subscriber::DefaultGuard {
        tracing_subscriber::registry()
            .with(self.layer())
            .set_default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.count_containing(needle) > 0
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        let buf = self.buffer.lock().expect("capture mutex poisoned");
        buf.iter().filter(|line| line.contains(needle)).count()
    }

    pub fn lines(&self) -> Vec<String> {
        self.buffer.lock().expect("capture mutex poisoned").clone()
    }
}

#[cfg(test)]
struct CaptureLayer {
    buffer: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
}

#[cfg(test)]
impl<S> Layer<S> for CaptureLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut visitor = StringVisitor::default();
        event.record(&mut visitor);
        let level = event.metadata().level();
        let target = event.metadata().target();
        let line = format!("[{level}] {target}: {}", visitor.output);
        self.buffer
            .lock()
            .expect("capture mutex poisoned")
            .push(line);
    }
}

#[cfg(test)]
#[derive(Default)]
struct StringVisitor {
    output: String,
}

#[cfg(test)]
impl tracing::field::Visit for StringVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        use std::fmt::Write as _;
        if !self.output.is_empty() {
            self.output.push(' ');
        }
        let _ = write!(self.output, "{}={:?}", field.name(), value);
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        use std::fmt::Write as _;
        if !self.output.is_empty() {
            self.output.push(' ');
        }
        let redacted = redact_if_sensitive(field.name(), value);
        let _ = write!(self.output, "{}=\"{}\"", field.name(), redacted);
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
