//! Periodic original posts built from top-token data.

use crate::agent::{AgentContext, CACHE_NAMESPACE};
use crate::canonicalize::{clean_generated_text, truncate_to_complete_sentence};
use crate::config::PostingConfig;
use crate::error::{Result, XrError};
use crate::logging::OperationGuard;
use crate::model::{MemoryKind, ModelClass, PostedPost};
use crate::prompts;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

const LAST_POST_KEY: &str = "lastPost";

/// Last published original post. `timestamp` is Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastPost {
    pub id: String,
    pub timestamp: i64,
}

/// Whether a post is due `delay` after `last`, at `now_ms`.
#[must_use]
pub fn is_due(last: Option<&LastPost>, delay: Duration, now_ms: i64) -> bool {
    let Some(last) = last else {
        return true;
    };
    let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    now_ms > last.timestamp.saturating_add(delay_ms)
}

pub struct PostPublisher {
    agent: AgentContext,
    settings: PostingConfig,
    dry_run: bool,
}

impl PostPublisher {
    #[must_use]
    pub const fn new(agent: AgentContext, settings: PostingConfig, dry_run: bool) -> Self {
        Self {
            agent,
            settings,
            dry_run,
        }
    }

    #[must_use]
    pub const fn settings(&self) -> &PostingConfig {
        &self.settings
    }

    /// Random delay between the configured bounds, inclusive.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        let (min, max) = (self.settings.min_interval_mins, self.settings.max_interval_mins);
        let minutes = if min >= max {
            min
        } else {
            rand::thread_rng().gen_range(min..=max)
        };
        Duration::from_secs(minutes * 60)
    }

    pub async fn last_post(&self) -> Option<LastPost> {
        let raw = match self
            .agent
            .memory
            .cache_get(CACHE_NAMESPACE, LAST_POST_KEY, self.agent.handle())
            .await
        {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(error = %e, "failed to load last post marker");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(last) => Some(last),
            Err(e) => {
                warn!(error = %e, "ignoring unreadable last post marker");
                None
            }
        }
    }

    /// Publish if due, then return how long to wait before the next check.
    pub async fn tick(&self) -> Duration {
        let delay = self.next_delay();
        let last = self.last_post().await;
        if is_due(last.as_ref(), delay, chrono::Utc::now().timestamp_millis()) {
            if let Err(e) = self.publish().await {
                warn!(error = %e, transient = e.is_transient(), "scheduled post failed");
            }
        } else {
            debug!(?last, "post not due yet");
        }
        delay
    }

    /// Generate and publish one post. Returns `None` in dry-run mode.
    ///
    /// # Errors
    ///
    /// Propagates query, generation, and publish failures. Empty data or
    /// empty generated text is a `MalformedGeneratedContent` error.
    pub async fn publish(&self) -> Result<Option<PostedPost>> {
        let guard = OperationGuard::new("data post");
        let result = self.publish_inner().await;
        match &result {
            Ok(_) => guard.complete(),
            Err(e) => guard.fail(e),
        }
        result
    }

    async fn publish_inner(&self) -> Result<Option<PostedPost>> {
        let rows = self.agent.queries.top_tokens().await?;
        if rows.is_empty() {
            return Err(XrError::malformed("no token data to post about"));
        }

        let max = self.settings.max_post_length;
        let prompt = prompts::data_post(self.agent.handle(), &rows, max);
        let raw = self.agent.generator.generate(&prompt, ModelClass::Large).await?;
        let text = truncate_to_complete_sentence(&clean_generated_text(&raw), max);
        if text.is_empty() {
            return Err(XrError::malformed("generated post was empty"));
        }

        if self.dry_run {
            info!(text = %text, "dry run; post not published");
            return Ok(None);
        }

        let posted = self.agent.channel.post_original(&text).await?;
        let last = LastPost {
            id: posted.id.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        let encoded = serde_json::to_string(&last)?;
        if let Err(e) = self
            .agent
            .memory
            .cache_set(CACHE_NAMESPACE, LAST_POST_KEY, self.agent.handle(), &encoded, None)
            .await
        {
            warn!(post_id = %posted.id, error = %e, "failed to persist last post marker");
        }
        self.agent
            .remember_published(MemoryKind::Post, &posted, &text, None, None, None)
            .await;

        info!(post_id = %posted.id, url = %posted.permanent_url, "data post published");
        Ok(Some(posted))
    }
}
