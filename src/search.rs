//! Web search adapters.
//!
//! [`WebSearch`] is the seam; [`TavilySearch`] posts to a Tavily-compatible
//! `/search` endpoint. Adapters do no admission control of their own: calls
//! go through [`AnalyticsService::web_search`](crate::AnalyticsService),
//! which charges them to the same rate limiter as warehouse queries.

use crate::config::{SearchConfig, SearchType};
use crate::error::{Result, XrError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt::Write;
use std::time::Duration;
use tracing::debug;

/// One hit from a web search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub source: String,
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>>;
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyHit>,
}

#[derive(Debug, Deserialize)]
struct TavilyHit {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
}

/// Tavily search API client.
#[derive(Debug, Clone)]
pub struct TavilySearch {
    http: Client,
    endpoint: String,
    api_key: String,
    search_type: SearchType,
    max_results: usize,
}

impl TavilySearch {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        search_type: SearchType,
        max_results: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            search_type,
            max_results: max_results.max(1),
        })
    }

    /// # Errors
    ///
    /// `MissingSetting` when `search.api_key` is unset.
    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or(XrError::MissingSetting {
                field: "search.api_key",
            })?;
        Self::new(
            &config.endpoint,
            api_key,
            config.search_type,
            config.max_results,
            Duration::from_secs(config.timeout_secs),
        )
    }
}

#[async_trait]
impl WebSearch for TavilySearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        let body = json!({
            "query": query,
            "search_type": self.search_type.as_str(),
            "max_results": self.max_results,
        });
        let response = self
            .http
            .post(format!("{}/search", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(XrError::Api {
                service: "search",
                status: status.as_u16(),
                body,
            });
        }

        let payload: TavilyResponse = response.json().await?;
        debug!(query, hits = payload.results.len(), "web search finished");
        Ok(payload
            .results
            .into_iter()
            .take(self.max_results)
            .map(|hit| SearchResult {
                title: hit.title,
                url: hit.url,
                snippet: hit.content,
                source: "tavily".to_string(),
            })
            .collect())
    }
}

/// Numbered markdown list: `1. [title](url)` followed by the snippet.
#[must_use]
pub fn format_search_results(results: &[SearchResult]) -> String {
    let mut out = String::new();
    for (n, result) in results.iter().enumerate() {
        if n > 0 {
            out.push_str("\n\n");
        }
        let _ = write!(out, "{}. [{}]({})\n{}", n + 1, result.title, result.url, result.snippet);
    }
    out
}
