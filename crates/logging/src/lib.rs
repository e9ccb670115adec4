//! Veilgate Logging
//!
//! Unified tracing-subscriber setup for the veilgate binaries. The
//! `RUST_LOG` environment variable, when present, overrides the level
//! passed by the CLI.

use tracing_subscriber::EnvFilter;

/// Log level for the application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Map the common `--verbose` CLI flag to a level.
    pub fn from_verbose(verbose: bool) -> Self {
        if verbose {
            Self::Debug
        } else {
            Self::Info
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Initialize logging once at startup.
///
/// # Panics
///
/// Panics if a subscriber is already installed; use [`try_init`] to
/// handle that case.
pub fn init(level: LogLevel) {
    try_init(level).expect("failed to initialize logging");
}

/// Initialize logging, returning an error if already initialized.
pub fn try_init(level: LogLevel) -> Result<(), String> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| e.to_string())
}
