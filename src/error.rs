//! Custom error types for xreply.
//!
//! Every failure in the pipeline is contained to a unit of work (one candidate
//! post, one query). The variants here let callers decide whether to skip,
//! surface, or log an error without string matching.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Primary error type for xreply operations.
#[derive(Error, Debug)]
pub enum XrError {
    // =========================================================================
    // Channel / Pipeline Errors
    // =========================================================================
    /// Social channel fetch or post failed. The unit of work is skipped.
    #[error("Channel {operation} failed: {reason}")]
    TransientIo {
        operation: &'static str,
        reason: String,
    },

    /// Generated text could not be turned into usable content.
    #[error("Generated content unusable: {reason}")]
    MalformedGeneratedContent { reason: String },

    /// Upstream API answered with a non-success status.
    #[error("{service} returned HTTP {status}: {body}")]
    Api {
        service: &'static str,
        status: u16,
        body: String,
    },

    // =========================================================================
    // Data Access Errors
    // =========================================================================
    /// Sliding-window limiter rejected the call before any network I/O.
    #[error("Rate limit exceeded: {limit} requests per {window:?}")]
    RateLimitExceeded { limit: usize, window: Duration },

    /// No connection became available within the acquire timeout.
    #[error("Timed out after {timeout:?} waiting for a warehouse connection")]
    AcquireTimeout { timeout: Duration },

    /// The pool has been closed and no longer hands out leases.
    #[error("Connection pool is closed")]
    PoolClosed,

    /// Warehouse could not open a connection.
    #[error("Warehouse connection failed: {reason}")]
    WarehouseConnect { reason: String },

    /// Warehouse reported a failure while running a query.
    #[error("Query execution failed: {reason}")]
    QueryExecution { reason: String },

    /// Generated SQL was rejected before execution.
    #[error("Refusing to run query: {reason}")]
    UnsafeQuery { reason: String },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    /// Database schema is newer than this binary understands.
    #[error("Database schema version {found} is newer than supported version {expected}")]
    SchemaMismatch { expected: i32, found: i32 },

    // =========================================================================
    // IO / Serialization Errors
    // =========================================================================
    /// File read/write error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Path-specific IO error with context.
    #[error("Failed to {operation} '{path}': {source}")]
    PathError {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// JSON encode/decode error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration file parsing error.
    #[error("Invalid configuration in '{path}': {reason}")]
    ConfigError { path: PathBuf, reason: String },

    /// A configuration value is out of range or inconsistent.
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    /// A required setting is missing.
    #[error("Missing required setting {field}")]
    MissingSetting { field: &'static str },

    // =========================================================================
    // Lookup / CLI Errors
    // =========================================================================
    /// Data not found.
    #[error("{item_type} with ID '{id}' not found")]
    NotFound { item_type: &'static str, id: String },

    /// Invalid command-line argument.
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Catch-all for other errors with context.
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Wrapped anyhow error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for xreply operations.
pub type Result<T> = std::result::Result<T, XrError>;

impl XrError {
    /// Create a transient channel error.
    pub fn transient(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::TransientIo {
            operation,
            reason: reason.into(),
        }
    }

    /// Create a malformed generated content error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedGeneratedContent {
            reason: reason.into(),
        }
    }

    /// Create a query execution error.
    pub fn query_execution(reason: impl Into<String>) -> Self {
        Self::QueryExecution {
            reason: reason.into(),
        }
    }

    /// Create an unsafe query error.
    pub fn unsafe_query(reason: impl Into<String>) -> Self {
        Self::UnsafeQuery {
            reason: reason.into(),
        }
    }

    /// Create a warehouse connect error.
    pub fn warehouse_connect(reason: impl Into<String>) -> Self {
        Self::WarehouseConnect {
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }

    /// Create a not found error.
    pub fn not_found(item_type: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            item_type,
            id: id.into(),
        }
    }

    /// Create a path error with context.
    pub fn path_error(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::PathError {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Wrap an error with additional context.
    pub fn with_context<E>(context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::WithContext {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Whether a later attempt at the same unit of work may succeed.
    ///
    /// Nothing in the pipeline retries on its own; this only informs logging
    /// and callers that own a retry policy.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::TransientIo { .. }
            | Self::HttpError(_)
            | Self::RateLimitExceeded { .. }
            | Self::AcquireTimeout { .. }
            | Self::WarehouseConnect { .. } => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Get a suggestion for how to fix this error, if applicable.
    #[must_use]
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::RateLimitExceeded { .. } => {
                Some("Wait for the window to pass or raise query.rate_limit_count.")
            }
            Self::AcquireTimeout { .. } => {
                Some("Raise pool.max_size or pool.acquire_timeout_ms, or check warehouse health.")
            }
            Self::WarehouseConnect { .. } => {
                Some("Check [warehouse] settings and that the warehouse is reachable.")
            }
            Self::MissingSetting { .. } | Self::InvalidConfig { .. } | Self::ConfigError { .. } => {
                Some("Run 'xreply config --init' and edit the generated file.")
            }
            Self::SchemaMismatch { .. } => Some("Upgrade xreply or point storage.db at a new file."),
            Self::UnsafeQuery { .. } => Some("Use the rule planner: set query.planner = \"rules\"."),
            _ => None,
        }
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Add context to an error.
    ///
    /// # Errors
    ///
    /// Returns the original error wrapped with additional context.
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily (only evaluated on error).
    ///
    /// # Errors
    ///
    /// Returns the original error wrapped with additional context.
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| XrError::with_context(context, e))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| XrError::with_context(f(), e))
    }
}

// =============================================================================
// CLI Error Formatting
// =============================================================================

use colored::Colorize;

/// Format a structured CLI error with explanation and suggestions.
#[must_use]
pub fn format_error(title: &str, explanation: &str, suggestions: &[&str]) -> String {
    use std::fmt::Write;

    let mut output = format!("{} {}", "✗".red().bold(), title.bold());

    if !explanation.is_empty() {
        let _ = write!(output, "\n\n   {explanation}");
    }

    if !suggestions.is_empty() {
        output.push_str("\n\n   ");
        if suggestions.len() == 1 {
            let _ = write!(output, "{} {}", "Hint:".cyan(), suggestions[0]);
        } else {
            let _ = write!(output, "{}:", "Try".cyan());
            for suggestion in suggestions {
                let _ = write!(output, "\n     {} {}", "•".dimmed(), suggestion);
            }
        }
    }

    output
}

/// Render any pipeline error for the terminal, attaching its suggestion.
#[must_use]
pub fn format_xr_error(err: &XrError) -> String {
    let suggestions: Vec<&str> = err.suggestion().into_iter().collect();
    format_error("Command failed", &err.to_string(), &suggestions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = XrError::transient("search", "connection reset");
        assert!(err.to_string().contains("search"));
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(XrError::transient("post", "503").is_transient());
        assert!(
            XrError::AcquireTimeout {
                timeout: Duration::from_millis(10)
            }
            .is_transient()
        );
        assert!(!XrError::query_execution("syntax error").is_transient());
        assert!(!XrError::malformed("empty").is_transient());

        let throttled = XrError::Api {
            service: "x",
            status: 429,
            body: String::new(),
        };
        assert!(throttled.is_transient());
        let forbidden = XrError::Api {
            service: "x",
            status: 403,
            body: String::new(),
        };
        assert!(!forbidden.is_transient());
    }

    #[test]
    fn test_error_suggestions() {
        let err = XrError::RateLimitExceeded {
            limit: 60,
            window: Duration::from_secs(60),
        };
        assert!(err.suggestion().is_some());
        assert!(XrError::not_found("post", "1").suggestion().is_none());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let xr_err: XrError = io_err.into();
        assert!(matches!(xr_err, XrError::IoError(_)));
    }

    #[test]
    fn test_from_rusqlite_error() {
        fn accepts_xr_error(_: XrError) {}
        let sqlite_err = rusqlite::Error::InvalidQuery;
        accepts_xr_error(sqlite_err.into());
    }

    #[test]
    fn test_result_ext_context() {
        let res: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::other("disk full"));
        let err = res.context("writing cache").unwrap_err();
        assert_eq!(err.to_string(), "writing cache: disk full");
    }

    #[test]
    fn format_error_single_suggestion() {
        let output = format_error("Test Error", "Something went wrong", &["Try this"]);
        assert!(output.contains("Test Error"));
        assert!(output.contains("Something went wrong"));
        assert!(output.contains("Try this"));
    }

    #[test]
    fn format_error_multiple_suggestions() {
        let output = format_error(
            "Test Error",
            "Something went wrong",
            &["First option", "Second option"],
        );
        assert!(output.contains("First option"));
        assert!(output.contains("Second option"));
    }
}
