//! Logging configuration for checkline.
//!
//! This module provides initialization and configuration for the tracing-based
//! logging system used throughout checkline.

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Verbosity level for logging output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Suppress all output except errors.
    Quiet,
    /// Normal output level (info and above).
    #[default]
    Normal,
    /// Verbose output (debug and above).
    Verbose,
    /// Very verbose output (trace level).
    Trace,
}

impl Verbosity {
    /// Convert verbosity to tracing level filter.
    #[must_use]
    pub fn to_level_filter(&self) -> Level {
        match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => Level::INFO,
            Self::Verbose => Level::DEBUG,
            Self::Trace => Level::TRACE,
        }
    }
}

/// Build the filter used when `RUST_LOG` is not set.
///
/// The HTTP client stack is held at `warn` unless tracing, where request
/// lifecycles become useful for diagnosing a stuck sync.
#[must_use]
pub fn default_filter(verbosity: Verbosity) -> String {
    let http_level = match verbosity {
        Verbosity::Trace => Level::DEBUG,
        _ => Level::WARN,
    };
    format!(
        "checkline={},reqwest={http_level},hyper={http_level}",
        verbosity.to_level_filter()
    )
}

/// Initialize the logging system.
///
/// Call once at startup. `RUST_LOG` overrides [`default_filter`].
///
/// # Examples
///
/// ```no_run
/// use checkline::{init_logging, logging::Verbosity};
///
/// init_logging(Verbosity::Verbose);
/// ```
pub fn init_logging(verbosity: Verbosity) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbosity)));

    // Logs go to stderr so `--json` output on stdout stays machine-readable.
    let subscriber = tracing_subscriber::registry().with(env_filter).with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact(),
    );

    let _ = subscriber.try_init();
}

/// Initialize logging for tests.
#[cfg(test)]
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}
