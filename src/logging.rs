//! Logging bootstrap for binaries and tests.
//!
//! The framework logs through [`tracing`] and works with whatever
//! subscriber the application installs. For applications that do not
//! bring their own, [`init`] installs a formatting subscriber whose
//! minimum severity comes from the `LOG_LEVEL` environment variable.

use tracing::level_filters::LevelFilter;

/// Environment variable that configures the default subscriber.
pub const LOG_LEVEL_VAR: &str = "LOG_LEVEL";

/// Resolve the minimum severity from a `LOG_LEVEL` value.
///
/// Accepted values (case-insensitive): `none|0|false` (off),
/// `debug|d|5`, `info|i|4` or empty, `warn|w|3`, `error|e|2`,
/// `fatal|f|1` (mapped to error; `tracing` has no fatal level).
///
/// Unknown values select `Debug` and return a warning message to emit
/// once the subscriber is installed; emitting eagerly would race the
/// subscriber installation and be dropped.
pub fn parse_level(value: &str) -> (LevelFilter, Option<String>) {
    match value.trim().to_lowercase().as_str() {
        "none" | "0" | "false" => (LevelFilter::OFF, None),
        "debug" | "d" | "5" => (LevelFilter::DEBUG, None),
        "info" | "i" | "4" | "" => (LevelFilter::INFO, None),
        "warn" | "w" | "3" => (LevelFilter::WARN, None),
        "error" | "e" | "2" => (LevelFilter::ERROR, None),
        "fatal" | "f" | "1" => (LevelFilter::ERROR, None),
        other => (
            LevelFilter::DEBUG,
            Some(format!(
                "unknown {LOG_LEVEL_VAR} value {other:?}, falling back to debug"
            )),
        ),
    }
}

/// Resolve the minimum severity from the process environment.
///
/// An unset `LOG_LEVEL` selects `Info`.
pub fn level_from_env() -> (LevelFilter, Option<String>) {
    match std::env::var(LOG_LEVEL_VAR) {
        Ok(value) => parse_level(&value),
        Err(_) => (LevelFilter::INFO, None),
    }
}

/// Install the default formatting subscriber honoring `LOG_LEVEL`.
///
/// Does nothing if a global subscriber is already installed, so it is
/// safe to call from tests and library consumers alike.
pub fn init() {
    let (level, warning) = level_from_env();
    let installed = tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .is_ok();
    if let (true, Some(message)) = (installed, warning) {
        tracing::warn!("{message}");
    }
}
