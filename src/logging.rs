//! Logging setup for xreply.
//!
//! Structured `tracing` output on stderr, so command output on stdout stays
//! pipeable. `RUST_LOG` overrides the configured level when set.
//!
//! # Usage
//!
//! ```rust
//! use xreply::logging::{init_logging, LogConfig};
//!
//! init_logging(&LogConfig::default());
//! tracing::info!(post_id = "123", "processing candidate");
//! ```

use crate::config::LoggingConfig;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub timestamps: bool,
    /// Include the module path in each line.
    pub target: bool,
    /// Emit span enter/exit events.
    pub spans: bool,
    pub colors: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human-readable.
    Pretty,
    /// One line per event.
    Compact,
    /// Thread ids, file, and line number included.
    Full,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            timestamps: true,
            target: false,
            spans: false,
            colors: true,
        }
    }
}

impl LogConfig {
    /// Build from the `[logging]` config section; unknown values fall back
    /// to the defaults.
    #[must_use]
    pub fn from_settings(settings: &LoggingConfig) -> Self {
        let defaults = Self::default();
        Self {
            level: settings.level.parse().unwrap_or(defaults.level),
            format: settings.format.parse().unwrap_or(defaults.format),
            colors: std::env::var_os("NO_COLOR").is_none(),
            ..defaults
        }
    }

    /// Errors only.
    #[must_use]
    pub const fn quiet() -> Self {
        Self {
            level: LogLevel::Error,
            format: LogFormat::Compact,
            timestamps: false,
            target: false,
            spans: false,
            colors: true,
        }
    }

    /// Debug level with module targets.
    #[must_use]
    pub const fn verbose() -> Self {
        Self {
            level: LogLevel::Debug,
            format: LogFormat::Pretty,
            timestamps: true,
            target: true,
            spans: false,
            colors: true,
        }
    }

    /// Maximum verbosity, including span events.
    #[must_use]
    pub const fn trace() -> Self {
        Self {
            level: LogLevel::Trace,
            format: LogFormat::Full,
            timestamps: true,
            target: true,
            spans: true,
            colors: true,
        }
    }
}

impl LogLevel {
    const fn to_filter_string(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
            Self::Off => "off",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" | "e" => Ok(Self::Error),
            "warn" | "warning" | "w" => Ok(Self::Warn),
            "info" | "i" => Ok(Self::Info),
            "debug" | "d" => Ok(Self::Debug),
            "trace" | "t" => Ok(Self::Trace),
            "off" | "none" | "quiet" => Ok(Self::Off),
            _ => Err(format!("Invalid log level: {s}")),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "p" => Ok(Self::Pretty),
            "compact" | "c" => Ok(Self::Compact),
            "full" | "f" => Ok(Self::Full),
            _ => Err(format!("Invalid log format: {s}")),
        }
    }
}

/// Install the global subscriber. Later calls are ignored.
pub fn init_logging(config: &LogConfig) {
    let env_filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(format!("xreply={}", config.level.to_filter_string()))
    };

    let span_events = if config.spans {
        FmtSpan::ENTER | FmtSpan::EXIT
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(config.colors)
        .with_target(config.target)
        .with_span_events(span_events);

    let registry = tracing_subscriber::registry().with(env_filter);
    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => registry.with(base.pretty()).try_init().ok(),
        (LogFormat::Pretty, false) => registry.with(base.pretty().without_time()).try_init().ok(),
        (LogFormat::Compact, true) => registry.with(base.compact()).try_init().ok(),
        (LogFormat::Compact, false) => registry.with(base.compact().without_time()).try_init().ok(),
        (LogFormat::Full, _) => registry
            .with(
                base.with_thread_ids(true)
                    .with_thread_names(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
            .ok(),
    };
}

/// Initialize logging for tests (silent unless `RUST_LOG` is set).
pub fn init_test_logging() {
    init_logging(&LogConfig {
        level: LogLevel::Off,
        ..LogConfig::default()
    });
}

/// CLI flags win over the `[logging]` section.
pub fn init_cli_logging(quiet: bool, verbose: bool, settings: &LoggingConfig) {
    let config = if quiet {
        LogConfig::quiet()
    } else if verbose {
        LogConfig::verbose()
    } else {
        LogConfig::from_settings(settings)
    };
    init_logging(&config);
}

/// Logs the start and outcome of an operation with its duration.
pub struct OperationGuard {
    name: String,
    start: std::time::Instant,
}

impl OperationGuard {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        tracing::debug!(operation = %name, "Starting operation");
        Self {
            name,
            start: std::time::Instant::now(),
        }
    }

    pub fn complete(self) {
        tracing::info!(
            operation = %self.name,
            duration_ms = self.start.elapsed().as_millis(),
            "Operation completed"
        );
    }

    pub fn fail(self, error: &dyn std::error::Error) {
        tracing::error!(
            operation = %self.name,
            duration_ms = self.start.elapsed().as_millis(),
            error = %error,
            "Operation failed"
        );
    }
}

/// Log a named metric.
#[macro_export]
macro_rules! log_metric {
    ($name:expr, $value:expr) => {
        tracing::info!(metric = $name, value = $value, "metric");
    };
    ($name:expr, $value:expr, $unit:expr) => {
        tracing::info!(metric = $name, value = $value, unit = $unit, "metric");
    };
}
