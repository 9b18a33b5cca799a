//! PayPipe Logging
//!
//! One logging setup for the relay, the client and the CLI.
//!
//! ## Usage
//!
//! ```no_run
//! use paypipe_logging::{init, LogLevel};
//!
//! // Info level unless RUST_LOG says otherwise
//! init(LogLevel::Info);
//!
//! // Or from a repeated -v flag
//! init(LogLevel::from_verbosity(2));
//! ```

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

/// Log level for the application
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
    /// Create a log level from a verbosity count
    ///
    /// - `0` → `Info`
    /// - `1` → `Debug`
    /// - `2+` → `Trace`
    pub fn from_verbosity(count: u8) -> Self {
        match count {
            0 => Self::Info,
            1 => Self::Debug,
            _ => Self::Trace,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

/// Initialize logging with the specified level.
///
/// `RUST_LOG` overrides `level` when set. A second call is reported on
/// stderr and otherwise ignored.
pub fn init(level: LogLevel) {
    if let Err(e) = try_init(level) {
        eprintln!("logging already initialized: {}", e);
    }
}

/// Try to initialize logging, returning an error if already initialized
pub fn try_init(level: LogLevel) -> Result<(), String> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| e.to_string())
}

/// Initialize logging for tests (output captured by the test harness).
/// Safe to call from every test.
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}
