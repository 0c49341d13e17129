//! Process-wide tracing setup shared by publishers and consumers.
//!
//! Every `init*` function is safe to call more than once; only the first
//! subscriber installed in a process wins.

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

/// Environment variable selecting the log format (`json` or `pretty`).
pub const LOG_FORMAT_VAR: &str = "SWITCHYARD_LOG_FORMAT";

const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable output for local development.
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

/// JSON logs filtered by `RUST_LOG` (default `info`).
pub fn init() {
    init_with(LogFormat::Json);
}

/// Returns whether this call installed the global subscriber.
pub fn init_with(format: LogFormat) -> bool {
    let filter = env_filter();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    let installed = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    }
    .is_ok();
    if installed {
        tracing::debug!(?format, "logging initialized");
    }
    installed
}

/// Format from [`LOG_FORMAT_VAR`]; an unset or unreadable value falls back
/// to JSON.
pub fn init_from_env() {
    let raw = std::env::var(LOG_FORMAT_VAR).ok();
    init_with(format_from(raw.as_deref()));
    if let Some(raw) = raw.filter(|v| v.parse::<LogFormat>().is_err()) {
        tracing::warn!(value = %raw, "unknown {LOG_FORMAT_VAR}, logging as json");
    }
}

/// Compact output captured by the test harness.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_test_writer()
        .try_init();
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn format_from(value: Option<&str>) -> LogFormat {
    value.and_then(|v| v.parse().ok()).unwrap_or_default()
}
