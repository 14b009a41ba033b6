//! Query execution service.
//!
//! [`AnalyticsService`] is the application-scoped handle in front of the
//! warehouse. Every execution goes through the same gates, in order:
//!
//! 1. the sliding-window rate limiter (rejects before any I/O)
//! 2. the TTL result cache, keyed by a hash of the normalized SQL
//! 3. a pooled connection lease, released on every exit path
//!
//! Single-token lookups and searches take the same path with fixed SQL.
//! Web searches share the rate limiter but skip the cache and pool.
//!
//! Nothing here retries. Errors reach the caller, which owns that decision.

use crate::cache::{CacheStats, TtlCache};
use crate::config::{Config, PlannerKind};
use crate::error::{Result, XrError};
use crate::llm::TextGenerator;
use crate::metrics::{self, TokenMetrics};
use crate::model::Row;
use crate::pool::{Pool, PoolOptions, PoolStatus};
use crate::query::{LlmPlanner, PlanOrigin, PreparedQuery, QueryPlan, QueryPlanner};
use crate::rate_limit::RateLimiter;
use crate::search::{SearchResult, WebSearch};
use crate::warehouse::Warehouse;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Rows returned for a question, with the SQL that produced them.
#[derive(Debug, Clone, Serialize)]
pub struct QueryAnswer {
    pub sql: String,
    #[serde(skip)]
    pub origin: PlanOrigin,
    pub rows: Vec<Row>,
}

/// What the pipeline needs from the analytics layer.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Plan `question` (with the conversation as context) and run it.
    async fn answer(&self, question: &str, context: &str) -> Result<QueryAnswer>;

    /// Top tokens by trader grade.
    async fn top_tokens(&self) -> Result<Vec<Row>>;

    /// Metrics for one token by name or symbol. Engines without a token
    /// table find nothing.
    async fn token_metrics(&self, _name: &str) -> Result<Option<TokenMetrics>> {
        Ok(None)
    }

    /// Tokens whose name or symbol contains `text`.
    async fn search_tokens(&self, _text: &str) -> Result<Vec<TokenMetrics>> {
        Ok(Vec::new())
    }

    /// Search the web.
    async fn web_search(&self, _query: &str) -> Result<Vec<SearchResult>> {
        Err(XrError::MissingSetting {
            field: "search.api_key",
        })
    }

    /// Release warehouse resources. Further queries fail.
    async fn close(&self) {}
}

pub struct AnalyticsService<W: Warehouse> {
    pool: Pool<W>,
    limiter: RateLimiter,
    cache: TtlCache<Vec<Row>>,
    cache_ttl: Duration,
    metrics_ttl: Duration,
    planner: QueryPlanner,
    llm_planner: Option<LlmPlanner>,
    web: Option<Arc<dyn WebSearch>>,
}

/// Default freshness of single-token lookups.
pub const DEFAULT_METRICS_TTL: Duration = Duration::from_secs(300);

impl<W: Warehouse> AnalyticsService<W> {
    #[must_use]
    pub fn new(
        pool: Pool<W>,
        planner: QueryPlanner,
        limiter: RateLimiter,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            pool,
            limiter,
            cache: TtlCache::new(),
            cache_ttl,
            metrics_ttl: DEFAULT_METRICS_TTL,
            planner,
            llm_planner: None,
            web: None,
        }
    }

    /// Build the service from `[query]`, `[pool]`, and `[warehouse]` settings.
    ///
    /// A generator is only used when `query.planner = "llm"`.
    #[must_use]
    pub fn from_config(
        warehouse: W,
        config: &Config,
        generator: Option<Arc<dyn TextGenerator>>,
    ) -> Self {
        let pool = Pool::new(
            warehouse,
            PoolOptions {
                min_size: config.pool.min_size,
                max_size: config.pool.max_size,
                acquire_timeout: config.pool.acquire_timeout(),
                idle_timeout: config.pool.idle_timeout(),
            },
        );
        let planner = QueryPlanner::new(&config.warehouse.table, config.query.max_results);
        let limiter = RateLimiter::new(
            config.query.rate_limit_count,
            config.query.rate_limit_window(),
        );
        let service = Self::new(pool, planner, limiter, config.query.cache_ttl())
            .with_metrics_ttl(config.query.metrics_cache_ttl());
        match (config.query.planner, generator) {
            (PlannerKind::Llm, Some(generator)) => service.with_llm_planner(generator),
            _ => service,
        }
    }

    /// Prefer generated SQL, keeping the rule planner as fallback.
    #[must_use]
    pub fn with_llm_planner(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.llm_planner = Some(LlmPlanner::new(self.planner.clone(), generator));
        self
    }

    #[must_use]
    pub const fn with_metrics_ttl(mut self, ttl: Duration) -> Self {
        self.metrics_ttl = ttl;
        self
    }

    /// Answer [`QueryEngine::web_search`] with `provider`.
    #[must_use]
    pub fn with_web_search(mut self, provider: Arc<dyn WebSearch>) -> Self {
        self.web = Some(provider);
        self
    }

    #[must_use]
    pub const fn planner(&self) -> &QueryPlanner {
        &self.planner
    }

    #[must_use]
    pub const fn pool(&self) -> &Pool<W> {
        &self.pool
    }

    #[must_use]
    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Turn a question into SQL without running it.
    pub async fn prepare(&self, question: &str, context: &str) -> PreparedQuery {
        match &self.llm_planner {
            Some(llm) => llm.prepare(question, context).await,
            None => self.planner.prepare(question, context),
        }
    }

    /// Run a prepared statement through limiter, cache, and pool.
    ///
    /// # Errors
    ///
    /// `RateLimitExceeded` before any I/O, `AcquireTimeout` when the pool is
    /// saturated, `QueryExecution` when the warehouse rejects the statement.
    pub async fn execute(&self, prepared: &PreparedQuery) -> Result<Vec<Row>> {
        self.execute_with_ttl(prepared, self.cache_ttl).await
    }

    async fn execute_with_ttl(&self, prepared: &PreparedQuery, ttl: Duration) -> Result<Vec<Row>> {
        self.limiter.check()?;

        if let Some(rows) = self.cache.get(&prepared.cache_key) {
            debug!(key = %prepared.cache_key, rows = rows.len(), "query cache hit");
            return Ok(rows);
        }

        let mut conn = self.pool.acquire().await?;
        let rows = match self.pool.factory().execute(&mut *conn, &prepared.sql).await {
            Ok(rows) => rows,
            Err(e) => {
                // A rejected statement says nothing about the connection.
                if !matches!(e, XrError::QueryExecution { .. }) {
                    conn.mark_broken();
                }
                return Err(e);
            }
        };
        drop(conn);

        info!(sql = %prepared.sql, rows = rows.len(), "query executed");
        let purged = self.cache.purge_expired();
        if purged > 0 {
            debug!(purged, "dropped expired query results");
        }
        self.cache.set(prepared.cache_key.clone(), rows.clone(), ttl);
        Ok(rows)
    }

    /// Look up one token by name or symbol, cached for the metrics TTL.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for empty or overlong names, otherwise the same
    /// errors as [`execute`](Self::execute).
    pub async fn token_metrics(&self, name: &str) -> Result<Option<TokenMetrics>> {
        let prepared = metrics::lookup_query(self.planner.table(), name)?;
        let rows = self.execute_with_ttl(&prepared, self.metrics_ttl).await?;
        Ok(rows.first().map(TokenMetrics::from_row))
    }

    /// Tokens whose name or symbol contains `text`, at most `max_results`.
    ///
    /// # Errors
    ///
    /// Same as [`token_metrics`](Self::token_metrics).
    pub async fn search_tokens(&self, text: &str) -> Result<Vec<TokenMetrics>> {
        let prepared = metrics::search_query(self.planner.table(), text, self.planner.max_results())?;
        let rows = self.execute(&prepared).await?;
        Ok(rows.iter().map(TokenMetrics::from_row).collect())
    }

    /// Run a web search through the shared rate limiter.
    ///
    /// # Errors
    ///
    /// `MissingSetting` without a provider, `RateLimitExceeded` before any
    /// I/O, or the provider's error.
    pub async fn web_search(&self, query: &str) -> Result<Vec<SearchResult>> {
        let provider = self.web.as_ref().ok_or(XrError::MissingSetting {
            field: "search.api_key",
        })?;
        let query = query.trim();
        if query.is_empty() {
            return Err(XrError::InvalidArgument {
                reason: "search query is empty".to_string(),
            });
        }
        self.limiter.check()?;
        provider.search(query).await
    }

    /// Stop handing out connections and close idle ones.
    pub async fn shutdown(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl<W: Warehouse> QueryEngine for AnalyticsService<W> {
    async fn answer(&self, question: &str, context: &str) -> Result<QueryAnswer> {
        let prepared = self.prepare(question, context).await;
        let rows = self.execute(&prepared).await?;
        Ok(QueryAnswer {
            sql: prepared.sql,
            origin: prepared.origin,
            rows,
        })
    }

    async fn top_tokens(&self) -> Result<Vec<Row>> {
        let plan = QueryPlan::top_by_trader_grade(self.planner.max_results());
        self.execute(&PreparedQuery::from_plan(plan, self.planner.table()))
            .await
    }

    async fn token_metrics(&self, name: &str) -> Result<Option<TokenMetrics>> {
        Self::token_metrics(self, name).await
    }

    async fn search_tokens(&self, text: &str) -> Result<Vec<TokenMetrics>> {
        Self::search_tokens(self, text).await
    }

    async fn web_search(&self, query: &str) -> Result<Vec<SearchResult>> {
        Self::web_search(self, query).await
    }

    async fn close(&self) {
        self.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelClass;
    use crate::pool::ConnectionFactory;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeWarehouse {
        connects: AtomicUsize,
        executions: AtomicUsize,
        last_sql: parking_lot::Mutex<Option<String>>,
    }

    #[async_trait]
    impl ConnectionFactory for Arc<FakeWarehouse> {
        type Connection = usize;

        async fn connect(&self) -> Result<usize> {
            Ok(self.connects.fetch_add(1, Ordering::SeqCst))
        }

        async fn health_check(&self, _conn: &mut usize) -> bool {
            true
        }

        async fn destroy(&self, _conn: usize) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Warehouse for Arc<FakeWarehouse> {
        async fn execute(&self, _conn: &mut usize, sql: &str) -> Result<Vec<Row>> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            *self.last_sql.lock() = Some(sql.to_string());
            if sql.contains("BROKEN") {
                return Err(XrError::query_execution("no such column: BROKEN"));
            }
            let mut row = Row::new();
            row.insert("TOKEN_SYMBOL".into(), json!("BTC"));
            Ok(vec![row])
        }
    }

    fn create_test_service(
        limit: usize,
        max_size: usize,
    ) -> (Arc<FakeWarehouse>, AnalyticsService<Arc<FakeWarehouse>>) {
        let warehouse = Arc::new(FakeWarehouse::default());
        let pool = Pool::new(
            Arc::clone(&warehouse),
            PoolOptions {
                max_size,
                acquire_timeout: Duration::from_millis(50),
                ..PoolOptions::default()
            },
        );
        let service = AnalyticsService::new(
            pool,
            QueryPlanner::new("tokens", 10),
            RateLimiter::new(limit, Duration::from_secs(60)),
            Duration::from_secs(60),
        );
        (warehouse, service)
    }

    fn prepared(sql: &str) -> PreparedQuery {
        PreparedQuery {
            sql: sql.to_string(),
            cache_key: crate::canonicalize::sql_cache_key(sql),
            origin: PlanOrigin::Rules,
            plan: None,
        }
    }

    #[tokio::test]
    async fn test_cache_hit_skips_warehouse() {
        let (warehouse, service) = create_test_service(10, 2);
        let query = prepared("SELECT 1");
        assert_eq!(service.execute(&query).await.unwrap().len(), 1);
        assert_eq!(service.execute(&query).await.unwrap().len(), 1);
        assert_eq!(warehouse.executions.load(Ordering::SeqCst), 1);
        assert_eq!(service.cache_stats().hits, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_before_io() {
        let (warehouse, service) = create_test_service(1, 2);
        service.execute(&prepared("SELECT 1")).await.unwrap();
        let err = service.execute(&prepared("SELECT 2")).await.unwrap_err();
        assert!(matches!(err, XrError::RateLimitExceeded { limit: 1, .. }));
        assert_eq!(warehouse.executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_query_error_releases_lease_and_keeps_connection() {
        let (warehouse, service) = create_test_service(10, 1);
        let err = service.execute(&prepared("SELECT BROKEN")).await.unwrap_err();
        assert!(matches!(err, XrError::QueryExecution { .. }));
        let status = service.pool_status();
        assert_eq!(status.in_use, 0);
        assert_eq!(status.idle, 1);

        // The lease came back, so a second query can run on max_size 1.
        service.execute(&prepared("SELECT 1")).await.unwrap();
        assert_eq!(warehouse.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_saturated_pool_times_out() {
        let (_warehouse, service) = create_test_service(10, 1);
        let _held = service.pool().acquire().await.unwrap();
        let err = service.execute(&prepared("SELECT 1")).await.unwrap_err();
        assert!(matches!(err, XrError::AcquireTimeout { .. }));
    }

    #[tokio::test]
    async fn test_answer_uses_rule_plan() {
        let (warehouse, service) = create_test_service(10, 2);
        let answer = service.answer("top value tokens", "").await.unwrap();
        assert_eq!(answer.origin, PlanOrigin::Rules);
        assert!(answer.sql.contains("ORDER BY MARKET_CAP DESC NULLS LAST"));
        assert_eq!(warehouse.last_sql.lock().as_deref(), Some(answer.sql.as_str()));
    }

    #[tokio::test]
    async fn test_top_tokens_sorts_by_trader_grade() {
        let (warehouse, service) = create_test_service(10, 2);
        service.top_tokens().await.unwrap();
        let sql = warehouse.last_sql.lock().clone().unwrap();
        assert!(sql.contains("ORDER BY TM_TRADER_GRADE DESC NULLS LAST LIMIT 10"));
    }

    #[tokio::test]
    async fn test_closed_service_rejects_queries() {
        let (_warehouse, service) = create_test_service(10, 2);
        QueryEngine::close(&service).await;
        let err = service.execute(&prepared("SELECT 1")).await.unwrap_err();
        assert!(matches!(err, XrError::PoolClosed));
    }

    #[tokio::test]
    async fn test_token_metrics_cached_by_name() {
        let (warehouse, service) = create_test_service(10, 2);
        let first = service.token_metrics("BTC").await.unwrap().unwrap();
        assert_eq!(first.symbol.as_deref(), Some("BTC"));
        let sql = warehouse.last_sql.lock().clone().unwrap();
        assert!(sql.contains("LOWER(TOKEN_SYMBOL) = 'btc'"));

        // Case and cashtag variants hit the same cache entry.
        service.token_metrics("$btc").await.unwrap();
        assert_eq!(warehouse.executions.load(Ordering::SeqCst), 1);

        let err = service.token_metrics("  ").await.unwrap_err();
        assert!(matches!(err, XrError::InvalidArgument { .. }));
        assert_eq!(warehouse.executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_token_metrics_ttl_is_separate() {
        let (warehouse, service) = create_test_service(10, 2);
        let service = service.with_metrics_ttl(Duration::ZERO);
        service.token_metrics("eth").await.unwrap();
        service.token_metrics("eth").await.unwrap();
        assert_eq!(warehouse.executions.load(Ordering::SeqCst), 2);

        // Planner queries still use the regular TTL.
        service.top_tokens().await.unwrap();
        service.top_tokens().await.unwrap();
        assert_eq!(warehouse.executions.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_search_tokens_uses_max_results() {
        let (warehouse, service) = create_test_service(10, 2);
        let found = service.search_tokens("bit").await.unwrap();
        assert_eq!(found.len(), 1);
        let sql = warehouse.last_sql.lock().clone().unwrap();
        assert!(sql.contains("LIKE '%bit%'"));
        assert!(sql.ends_with("LIMIT 10"));
    }

    #[derive(Default)]
    struct FakeSearch {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl WebSearch for FakeSearch {
        async fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![SearchResult {
                title: query.to_string(),
                url: "https://example.com".into(),
                snippet: "snippet".into(),
                source: "test".into(),
            }])
        }
    }

    #[tokio::test]
    async fn test_web_search_shares_rate_limit() {
        let (_warehouse, service) = create_test_service(2, 2);
        let search = Arc::new(FakeSearch::default());
        let service = service.with_web_search(Arc::clone(&search) as Arc<dyn WebSearch>);

        let results = QueryEngine::web_search(&service, " eth news ").await.unwrap();
        assert_eq!(results[0].title, "eth news");
        service.execute(&prepared("SELECT 1")).await.unwrap();

        // Both slots are used; the search is rejected before reaching the provider.
        let err = service.web_search("sol news").await.unwrap_err();
        assert!(matches!(err, XrError::RateLimitExceeded { limit: 2, .. }));
        assert_eq!(search.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_web_search_without_provider() {
        let (_warehouse, service) = create_test_service(10, 2);
        assert!(matches!(
            service.web_search("eth").await,
            Err(XrError::MissingSetting { field: "search.api_key" })
        ));
    }

    struct FixedSql;

    #[async_trait]
    impl TextGenerator for FixedSql {
        async fn generate(&self, _context: &str, _class: ModelClass) -> Result<String> {
            Ok("```sql\nSELECT TOKEN_SYMBOL FROM tokens LIMIT 1;\n```".to_string())
        }
    }

    #[tokio::test]
    async fn test_llm_planner_from_config() {
        let mut config = Config::default();
        config.query.planner = PlannerKind::Llm;
        config.warehouse.table = "tokens".into();
        let service = AnalyticsService::from_config(
            Arc::new(FakeWarehouse::default()),
            &config,
            Some(Arc::new(FixedSql)),
        );
        let answer = service.answer("anything", "").await.unwrap();
        assert_eq!(answer.origin, PlanOrigin::Generated);
        assert_eq!(answer.sql, "SELECT TOKEN_SYMBOL FROM tokens LIMIT 1");
    }
}
