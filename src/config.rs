//! Configuration system for xreply.
//!
//! Provides layered configuration from multiple sources:
//!
//! 1. **Compiled defaults** - Sensible defaults built into the binary
//! 2. **Config file** - `~/.config/xreply/config.toml` or `--config <path>`
//! 3. **Environment variables** - `XREPLY_*` prefix
//! 4. **CLI arguments** - Highest priority, always wins
//!
//! Configuration is read once at startup; there is no hot reload.
//!
//! # Example Configuration File
//!
//! ```toml
//! [channel]
//! username = "tokenbot"
//! bearer_token = "..."
//!
//! [warehouse]
//! kind = "http"
//! url = "https://warehouse.example.com"
//! table = "TOKEN_METRICS"
//!
//! [interactions]
//! poll_interval_secs = 120
//! target_users = ["alice", "bob"]
//!
//! [query]
//! planner = "rules"
//! max_results = 10
//!
//! [search]
//! api_key = "..."
//! search_type = "news"
//! ```

use crate::error::{Result, XrError};
use crate::query::DEFAULT_TABLE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Main configuration structure for xreply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub channel: ChannelConfig,
    pub llm: LlmConfig,
    pub warehouse: WarehouseConfig,
    pub storage: StorageConfig,
    pub interactions: InteractionsConfig,
    pub posting: PostingConfig,
    pub actions: ActionsConfig,
    pub query: QueryConfig,
    pub pool: PoolConfig,
    pub search: SearchConfig,
    pub logging: LoggingConfig,
}

/// Social channel access.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Account handle without the `@`.
    /// Environment variable: `XREPLY_USERNAME`
    pub username: Option<String>,

    /// X API base URL.
    pub api_base: String,

    /// Environment variable: `XREPLY_BEARER_TOKEN`
    pub bearer_token: Option<String>,

    /// Agent id used for memory and room ids. Defaults to the account id.
    pub agent_id: Option<String>,

    pub timeout_secs: u64,

    /// Serve the channel from a JSON fixture instead of the X API.
    /// Environment variable: `XREPLY_FIXTURE`
    pub fixture: Option<PathBuf>,
}

/// Text generation endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenAI-compatible base URL.
    /// Environment variable: `XREPLY_LLM_ENDPOINT`
    pub endpoint: String,

    /// Environment variable: `XREPLY_LLM_API_KEY`
    pub api_key: Option<String>,

    pub small_model: String,
    pub large_model: String,
    pub temperature: f32,

    /// Request timeout for a single generation call.
    pub timeout_secs: u64,
}

/// Which warehouse adapter to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarehouseKind {
    #[default]
    Sqlite,
    Http,
}

/// Token metrics warehouse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    pub kind: WarehouseKind,

    /// Database file for the `sqlite` warehouse.
    /// Environment variable: `XREPLY_WAREHOUSE_PATH`
    pub path: Option<PathBuf>,

    /// Base URL for the `http` warehouse.
    /// Environment variable: `XREPLY_WAREHOUSE_URL`
    pub url: Option<String>,

    /// Environment variable: `XREPLY_WAREHOUSE_API_KEY`
    pub api_key: Option<String>,

    pub table: String,
    pub timeout_secs: u64,
}

/// Local persistence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the `SQLite` memory database.
    /// Environment variable: `XREPLY_DB`
    pub db: Option<PathBuf>,
}

/// Mention and target-user polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InteractionsConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,

    /// Accounts whose recent posts are considered even without a mention.
    pub target_users: Vec<String>,

    pub max_thread_depth: usize,
    pub mention_count: usize,
    pub target_fetch_count: usize,
    pub target_recency_mins: i64,

    /// Shorter remainders fall back to the most recent thread text.
    pub min_question_chars: usize,

    pub max_reply_length: usize,

    /// Generate and log replies without posting them.
    /// Environment variable: `XREPLY_DRY_RUN`
    pub dry_run: bool,
}

/// Periodic data-driven posts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostingConfig {
    pub enabled: bool,
    pub min_interval_mins: u64,
    pub max_interval_mins: u64,
    pub post_immediately: bool,
    pub max_post_length: usize,
}

/// Home timeline engagement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionsConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeline_count: usize,
}

/// How questions become SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlannerKind {
    /// Deterministic rule table.
    #[default]
    Rules,
    /// Generated SQL, validated, with the rule table as fallback.
    Llm,
}

/// Query synthesis and execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub planner: PlannerKind,
    pub max_results: usize,
    pub cache_ttl_secs: u64,
    /// Shared by warehouse queries and web searches.
    pub rate_limit_count: usize,
    pub rate_limit_window_secs: u64,

    /// Freshness of single-token lookups.
    pub metrics_cache_ttl_secs: u64,
}

/// Kind of web search to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    #[default]
    Search,
    News,
    Academic,
}

impl SearchType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::News => "news",
            Self::Academic => "academic",
        }
    }
}

/// Web search provider (Tavily-compatible).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub endpoint: String,

    /// Environment variable: `XREPLY_SEARCH_API_KEY`
    pub api_key: Option<String>,

    pub search_type: SearchType,
    pub max_results: usize,
    pub timeout_secs: u64,
}

/// Warehouse connection pool bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub acquire_timeout_ms: u64,
    pub idle_timeout_secs: u64,
}

/// Log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error.
    /// Environment variable: `XREPLY_LOG_LEVEL`
    pub level: String,

    /// pretty, compact, full.
    pub format: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            username: None,
            api_base: "https://api.x.com".to_string(),
            bearer_token: None,
            agent_id: None,
            timeout_secs: 30,
            fixture: None,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com".to_string(),
            api_key: None,
            small_model: "gpt-4o-mini".to_string(),
            large_model: "gpt-4o".to_string(),
            temperature: 0.7,
            timeout_secs: 120,
        }
    }
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            kind: WarehouseKind::Sqlite,
            path: None,
            url: None,
            api_key: None,
            table: DEFAULT_TABLE.to_string(),
            timeout_secs: 30,
        }
    }
}

impl Default for InteractionsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 120,
            target_users: vec![],
            max_thread_depth: 10,
            mention_count: 20,
            target_fetch_count: 3,
            target_recency_mins: 120,
            min_question_chars: 10,
            max_reply_length: 280,
            dry_run: false,
        }
    }
}

impl Default for PostingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_interval_mins: 90,
            max_interval_mins: 180,
            post_immediately: false,
            max_post_length: 280,
        }
    }
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 300,
            timeline_count: 15,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            planner: PlannerKind::Rules,
            max_results: 10,
            cache_ttl_secs: 300,
            rate_limit_count: 60,
            rate_limit_window_secs: 60,
            metrics_cache_ttl_secs: 300,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.tavily.com".to_string(),
            api_key: None,
            search_type: SearchType::Search,
            max_results: 5,
            timeout_secs: 30,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 5,
            acquire_timeout_ms: 30_000,
            idle_timeout_secs: 300,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl QueryConfig {
    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    #[must_use]
    pub const fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    #[must_use]
    pub const fn metrics_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.metrics_cache_ttl_secs)
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. `explicit` file, or the user config file (~/.config/xreply/config.toml)
    /// 3. Compiled defaults
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly named file cannot be read or parsed.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = explicit {
            config.merge(Self::read_file(path)?);
        } else if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        config.apply_env_overrides();

        debug!(?config, "Configuration loaded");
        Ok(config)
    }

    /// Load configuration from a specific file, warning on problems.
    #[must_use]
    pub fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            debug!("Config file not found: {}", path.display());
            return None;
        }

        match Self::read_file(path) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Ignoring config file {}: {}", path.display(), e);
                None
            }
        }
    }

    fn read_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| XrError::path_error("read config", path, e))?;
        let config = toml::from_str(&content).map_err(|e| XrError::ConfigError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        info!("Loaded config from: {}", path.display());
        Ok(config)
    }

    fn load_user_config() -> Option<Self> {
        let config_path = Self::user_config_path()?;
        Self::load_from_file(&config_path)
    }

    /// Get the path to the user configuration file.
    #[must_use]
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("xreply").join("config.toml"))
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        // Channel
        if let Some(username) = var("XREPLY_USERNAME") {
            self.channel.username = Some(username.trim_start_matches('@').to_string());
        }
        if let Some(token) = var("XREPLY_BEARER_TOKEN") {
            self.channel.bearer_token = Some(token);
        }
        if let Some(fixture) = var("XREPLY_FIXTURE") {
            self.channel.fixture = Some(PathBuf::from(fixture));
        }

        // LLM
        if let Some(endpoint) = var("XREPLY_LLM_ENDPOINT") {
            self.llm.endpoint = endpoint;
        }
        if let Some(key) = var("XREPLY_LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }

        // Warehouse
        if let Some(path) = var("XREPLY_WAREHOUSE_PATH") {
            self.warehouse.path = Some(PathBuf::from(path));
        }
        if let Some(url) = var("XREPLY_WAREHOUSE_URL") {
            self.warehouse.url = Some(url);
        }
        if let Some(key) = var("XREPLY_WAREHOUSE_API_KEY") {
            self.warehouse.api_key = Some(key);
        }

        // Search
        if let Some(key) = var("XREPLY_SEARCH_API_KEY") {
            self.search.api_key = Some(key);
        }

        // Storage
        if let Some(db) = var("XREPLY_DB") {
            self.storage.db = Some(PathBuf::from(db));
        }

        // Interactions
        if let Some(dry_run) = var("XREPLY_DRY_RUN") {
            self.interactions.dry_run = matches!(dry_run.as_str(), "1" | "true" | "yes");
        }
        if let Some(n) = var("XREPLY_POLL_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.interactions.poll_interval_secs = n;
        }

        // Query
        if let Some(n) = var("XREPLY_MAX_RESULTS").and_then(|v| v.parse().ok()) {
            self.query.max_results = n;
        }

        // Logging
        if let Some(level) = var("XREPLY_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Merge another config into this one (other takes precedence).
    fn merge(&mut self, other: Self) {
        // Channel: optional values only override when present
        let Self {
            channel,
            llm,
            warehouse,
            storage,
            interactions,
            posting,
            actions,
            query,
            pool,
            search,
            logging,
        } = other;

        if channel.username.is_some() {
            self.channel.username = channel.username;
        }
        if channel.bearer_token.is_some() {
            self.channel.bearer_token = channel.bearer_token;
        }
        if channel.agent_id.is_some() {
            self.channel.agent_id = channel.agent_id;
        }
        if channel.fixture.is_some() {
            self.channel.fixture = channel.fixture;
        }
        self.channel.api_base = channel.api_base;
        self.channel.timeout_secs = channel.timeout_secs;

        // LLM
        if llm.api_key.is_some() {
            self.llm.api_key = llm.api_key;
        }
        self.llm.endpoint = llm.endpoint;
        self.llm.small_model = llm.small_model;
        self.llm.large_model = llm.large_model;
        self.llm.temperature = llm.temperature;
        self.llm.timeout_secs = llm.timeout_secs;

        // Warehouse
        if warehouse.path.is_some() {
            self.warehouse.path = warehouse.path;
        }
        if warehouse.url.is_some() {
            self.warehouse.url = warehouse.url;
        }
        if warehouse.api_key.is_some() {
            self.warehouse.api_key = warehouse.api_key;
        }
        self.warehouse.kind = warehouse.kind;
        self.warehouse.table = warehouse.table;
        self.warehouse.timeout_secs = warehouse.timeout_secs;

        if storage.db.is_some() {
            self.storage.db = storage.db;
        }

        // Search
        if search.api_key.is_some() {
            self.search.api_key = search.api_key;
        }
        self.search.endpoint = search.endpoint;
        self.search.search_type = search.search_type;
        self.search.max_results = search.max_results;
        self.search.timeout_secs = search.timeout_secs;

        // Scalar sections (always override if present in other)
        self.interactions = interactions;
        self.posting = posting;
        self.actions = actions;
        self.query = query;
        self.pool = pool;
        self.logging = logging;
    }

    /// Reject values the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`XrError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_size == 0 {
            return Err(XrError::invalid_config("pool.max_size", "must be at least 1"));
        }
        if self.pool.min_size > self.pool.max_size {
            return Err(XrError::invalid_config(
                "pool.min_size",
                format!("{} exceeds pool.max_size {}", self.pool.min_size, self.pool.max_size),
            ));
        }
        if self.query.max_results == 0 {
            return Err(XrError::invalid_config("query.max_results", "must be at least 1"));
        }
        if self.query.rate_limit_count == 0 || self.query.rate_limit_window_secs == 0 {
            return Err(XrError::invalid_config(
                "query.rate_limit_count",
                "rate limit count and window must be non-zero",
            ));
        }
        if self.search.max_results == 0 {
            return Err(XrError::invalid_config("search.max_results", "must be at least 1"));
        }
        if self.posting.min_interval_mins > self.posting.max_interval_mins {
            return Err(XrError::invalid_config(
                "posting.min_interval_mins",
                "must not exceed posting.max_interval_mins",
            ));
        }
        if self.interactions.max_thread_depth == 0 {
            return Err(XrError::invalid_config(
                "interactions.max_thread_depth",
                "must be at least 1",
            ));
        }
        if self.warehouse.table.is_empty()
            || !self
                .warehouse
                .table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            return Err(XrError::invalid_config(
                "warehouse.table",
                "must be a plain identifier",
            ));
        }
        if self.warehouse.kind == WarehouseKind::Http && self.warehouse.url.is_none() {
            return Err(XrError::MissingSetting {
                field: "warehouse.url",
            });
        }
        Ok(())
    }

    /// Get the memory database path, using defaults if not configured.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.storage
            .db
            .clone()
            .unwrap_or_else(crate::default_db_path)
    }

    /// Get the sqlite warehouse path, using defaults if not configured.
    #[must_use]
    pub fn warehouse_path(&self) -> PathBuf {
        self.warehouse
            .path
            .clone()
            .unwrap_or_else(|| crate::default_data_dir().join("warehouse.db"))
    }

    /// Save the current configuration to the user config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the config directory cannot be determined,
    /// the parent directory cannot be created, or the file cannot be written.
    pub fn save(&self, path: Option<&Path>) -> Result<PathBuf> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::user_config_path().ok_or_else(|| {
                XrError::InvalidArgument {
                    reason: "could not determine config directory".to_string(),
                }
            })?,
        };

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| XrError::path_error("create config directory", parent, e))?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| XrError::ConfigError {
            path: config_path.clone(),
            reason: e.to_string(),
        })?;

        std::fs::write(&config_path, content)
            .map_err(|e| XrError::path_error("write config", &config_path, e))?;
        info!("Saved config to: {}", config_path.display());
        Ok(config_path)
    }

    /// Generate a default configuration file content.
    #[must_use]
    pub fn default_config_content() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}
