//! xreply - idempotent X interaction pipeline
//!
//! Discovers mentions and posts from watched accounts, reconstructs their
//! conversation threads, decides whether to answer, turns the question into
//! a bounded SQL query against a token-metrics warehouse, and replies with
//! generated text. Every handled post is recorded so it is never answered
//! twice.
//!
//! # Modules
//!
//! - [`interactions`] - discovery, dedup, and the per-candidate pipeline
//! - [`thread`] - cycle-safe conversation reconstruction
//! - [`query`] - question-to-SQL synthesis and SQL validation
//! - [`analytics`] - rate limiter, cache, and pooled warehouse execution
//! - [`metrics`], [`search`] - single-token lookups and web search
//! - [`pool`], [`rate_limit`], [`cache`] - the resource primitives behind it
//! - [`actions`], [`posting`], [`scheduler`] - timeline actions, data posts,
//!   and the loops that drive everything
//! - [`memory`] / [`storage`] - `SQLite` persistence

pub mod actions;
pub mod agent;
pub mod analytics;
pub mod cache;
pub mod canonicalize;
pub mod channel;
pub mod cli;
pub mod config;
pub mod error;
pub mod interactions;
pub mod llm;
pub mod logging;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod pool;
pub mod posting;
pub mod prompts;
pub mod query;
pub mod rate_limit;
pub mod scheduler;
pub mod search;
pub mod storage;
pub mod thread;
pub mod warehouse;

pub use agent::AgentContext;
pub use analytics::{AnalyticsService, QueryAnswer, QueryEngine};
pub use channel::{InMemoryChannel, SocialChannel, XApiChannel};
pub use cli::*;
pub use config::Config;
pub use error::{Result, ResultExt, XrError, format_error, format_xr_error};
pub use interactions::{CandidateOutcome, InteractionClient, PassSummary};
pub use llm::{OpenAiGenerator, TextGenerator};
pub use memory::{MemoryStore, SqliteMemoryStore};
pub use metrics::{TokenMetrics, format_token_metrics};
pub use model::*;
pub use query::{PreparedQuery, QueryPlan, QueryPlanner};
pub use search::{SearchResult, TavilySearch, WebSearch, format_search_results};
pub use storage::Storage;

/// Default memory database filename
pub const DEFAULT_DB_NAME: &str = "xreply.db";

/// Standard width for content dividers in CLI output
pub const CONTENT_DIVIDER_WIDTH: usize = 60;

/// Get the default data directory for xreply
#[must_use]
pub fn default_data_dir() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("xreply")
}

/// Get the default memory database path
#[must_use]
pub fn default_db_path() -> std::path::PathBuf {
    default_data_dir().join(DEFAULT_DB_NAME)
}

/// Format a long identifier as a short token (e.g., 1234...6789).
#[must_use]
pub fn format_short_id(id: &str) -> String {
    let chars: Vec<char> = id.chars().collect();
    if chars.len() <= 10 {
        return id.to_string();
    }
    let start: String = chars.iter().take(4).collect();
    let end: String = chars.iter().rev().take(4).rev().collect();
    format!("{start}...{end}")
}

#[cfg(test)]
mod tests {
    use super::{default_db_path, format_short_id};

    #[test]
    fn format_short_id_truncates_long_ids() {
        assert_eq!(format_short_id("short"), "short");
        assert_eq!(format_short_id("1790000000000000001"), "1790...0001");
    }

    #[test]
    fn default_db_path_is_under_data_dir() {
        let path = default_db_path();
        assert!(path.ends_with("xreply/xreply.db"));
    }
}
