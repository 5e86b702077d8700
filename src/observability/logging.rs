//! Structured logging using the tracing crate
//!
//! ## Log Format Options
//!
//! The output format is chosen by the `LOG_FORMAT` environment variable:
//!
//! - `json` - Structured JSON, one event per line
//! - `pretty` - Multi-line, coloured, for development
//! - `compact` - Coloured single-line terminal output
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG or TRACE (default INFO)
//! - `LOG_FORMAT`: json, pretty or compact (default json)
//! - `LOG_SPANS`: emit span open/close events (default false)
//! - `RUST_LOG`: replaces the whole filter
//!
//! ```bash
//! LOG_FORMAT=compact LOG_LEVEL=DEBUG picontrol-mqtt devices
//! ```

use std::env;
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies that are noisy below WARN
const QUIET_TARGETS: &[&str] = &["rumqttc", "tokio", "mio"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Unknown values fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Level from its name; unknown values fall back to INFO
pub fn parse_level(s: &str) -> Level {
    match s.trim().to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log filter: {0}")]
    Filter(String),
    #[error("A global subscriber is already installed")]
    AlreadyInitialized,
}

fn build_filter(level: Level) -> Result<EnvFilter, LoggingError> {
    if let Ok(rust_log) = env::var("RUST_LOG") {
        return EnvFilter::try_new(&rust_log).map_err(|e| LoggingError::Filter(e.to_string()));
    }

    let mut directives = vec![level.to_string().to_lowercase()];
    directives.extend(QUIET_TARGETS.iter().map(|target| format!("{target}=warn")));
    EnvFilter::try_new(directives.join(",")).map_err(|e| LoggingError::Filter(e.to_string()))
}

/// Install the global subscriber
pub fn init_logging(
    level: Level,
    format: LogFormat,
    include_spans: bool,
) -> Result<(), LoggingError> {
    let filter = build_filter(level)?;
    let span_events = if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_span_events(span_events))
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(fmt::layer().pretty().with_ansi(true).with_span_events(span_events))
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events),
            )
            .try_init(),
    };
    installed.map_err(|_| LoggingError::AlreadyInitialized)
}

/// Install the global subscriber as configured by the environment
pub fn init_default_logging() -> Result<(), LoggingError> {
    let level = parse_level(&env::var("LOG_LEVEL").unwrap_or_default());
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_default());
    let include_spans = env::var("LOG_SPANS")
        .map(|value| value.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    init_logging(level, format, include_spans)
}

/// Span around one broker operation (connect, subscribe, publish)
#[macro_export]
macro_rules! mqtt_span {
    ($($field:tt)*) => {
        tracing::info_span!("mqtt_operation", $($field)*)
    };
}

/// Span around fan-out of one inbound message
#[macro_export]
macro_rules! dispatch_span {
    ($($field:tt)*) => {
        tracing::debug_span!("dispatch", $($field)*)
    };
}

pub use {dispatch_span, mqtt_span};
