//! Home timeline engagement.
//!
//! Each cycle fetches the home timeline, skips posts we already have a
//! memory for, asks the generator which of like/retweet/quote/reply to do,
//! and executes each chosen action independently. The post is then stored
//! as a memory carrying the list of actions that actually succeeded.

use crate::agent::{AgentContext, CACHE_NAMESPACE};
use crate::canonicalize::{clean_generated_text, truncate_to_complete_sentence};
use crate::config::ActionsConfig;
use crate::error::Result;
use crate::model::{ActionFlags, CandidatePost, MemoryKind, MemoryRecord, ModelClass, memory_id};
use crate::prompts;
use crate::thread::{SOURCE, ThreadBuilder};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CONTEXT_DEPTH: usize = 10;

/// Actions chosen and executed for one timeline post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionResult {
    pub post_id: String,
    pub chosen: ActionFlags,
    pub executed: Vec<&'static str>,
}

/// Clears the processing flag on drop.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ActionProcessor {
    agent: AgentContext,
    threads: ThreadBuilder,
    settings: ActionsConfig,
    max_length: usize,
    dry_run: bool,
    processing: AtomicBool,
    stopped: AtomicBool,
}

impl ActionProcessor {
    #[must_use]
    pub fn new(agent: AgentContext, settings: ActionsConfig, max_length: usize, dry_run: bool) -> Self {
        Self {
            threads: agent.thread_builder(),
            agent,
            settings,
            max_length,
            dry_run,
            processing: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn settings(&self) -> &ActionsConfig {
        &self.settings
    }

    /// Ask the loop to end after the current cycle.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Run one cycle. Returns `None` if a cycle is already running.
    ///
    /// # Errors
    ///
    /// Fails only when the timeline cannot be fetched.
    pub async fn process_timeline(&self) -> Result<Option<Vec<ActionResult>>> {
        self.process_timeline_until(&CancellationToken::new()).await
    }

    /// Like [`process_timeline`](Self::process_timeline), but stops before
    /// the next post once `cancel` fires. The post in progress finishes,
    /// including its action memory.
    ///
    /// # Errors
    ///
    /// Fails only when the timeline cannot be fetched.
    pub async fn process_timeline_until(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<ActionResult>>> {
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("already processing timeline actions; skipping");
            return Ok(None);
        }
        let _guard = ProcessingGuard(&self.processing);

        let timeline = self
            .agent
            .channel
            .fetch_timeline(self.settings.timeline_count)
            .await?;
        debug!(posts = timeline.len(), "fetched home timeline");

        let mut results = Vec::new();
        for post in &timeline {
            if cancel.is_cancelled() {
                info!(post_id = %post.id, "cancelled; stopping timeline actions");
                break;
            }
            if post.author_id == self.agent.profile.id {
                continue;
            }
            match self.process_post(post).await {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(e) => warn!(post_id = %post.id, error = %e, "failed to process timeline post"),
            }
        }

        info!(processed = results.len(), "timeline actions finished");
        Ok(Some(results))
    }

    async fn process_post(&self, post: &CandidatePost) -> Result<Option<ActionResult>> {
        let memory_key = memory_id(&post.id, &self.agent.agent_id);
        if self.agent.memory.get_memory(&memory_key).await?.is_some() {
            debug!(post_id = %post.id, "already processed");
            return Ok(None);
        }

        let chosen = self
            .agent
            .generator
            .decide_actions(&prompts::timeline_actions(self.agent.handle(), post))
            .await?;
        if !chosen.any() {
            debug!(post_id = %post.id, "no actions chosen");
            return Ok(None);
        }

        if self.dry_run {
            info!(post_id = %post.id, ?chosen, "dry run; actions not executed");
            return Ok(Some(ActionResult {
                post_id: post.id.clone(),
                chosen,
                executed: Vec::new(),
            }));
        }

        let mut executed = Vec::new();
        if chosen.like {
            match self.agent.channel.like(&post.id).await {
                Ok(()) => executed.push("like"),
                Err(e) => warn!(post_id = %post.id, error = %e, "like failed"),
            }
        }
        if chosen.retweet {
            match self.agent.channel.retweet(&post.id).await {
                Ok(()) => executed.push("retweet"),
                Err(e) => warn!(post_id = %post.id, error = %e, "retweet failed"),
            }
        }
        if chosen.quote && self.publish(post, "quote").await {
            executed.push("quote");
        }
        if chosen.reply && self.publish(post, "reply").await {
            executed.push("reply");
        }

        self.remember_actions(post, &executed).await;
        info!(post_id = %post.id, actions = ?executed, "timeline actions executed");
        Ok(Some(ActionResult {
            post_id: post.id.clone(),
            chosen,
            executed,
        }))
    }

    /// Generate and publish a quote or reply. Returns whether it was posted.
    async fn publish(&self, post: &CandidatePost, kind: &'static str) -> bool {
        let thread = self.threads.build_context(post, CONTEXT_DEPTH).await;
        let prompt = prompts::action_content(self.agent.handle(), kind, post, &thread, self.max_length);
        let raw = match self.agent.generator.generate(&prompt, ModelClass::Large).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(post_id = %post.id, kind, error = %e, "content generation failed");
                return false;
            }
        };
        let text = truncate_to_complete_sentence(&clean_generated_text(&raw), self.max_length);
        if text.is_empty() {
            warn!(post_id = %post.id, kind, "generated content was empty");
            return false;
        }

        let posted = if kind == "quote" {
            self.agent.channel.post_quote(&text, &post.id).await
        } else {
            self.agent.channel.post_reply(&text, &post.id).await
        };
        let posted = match posted {
            Ok(posted) => posted,
            Err(e) => {
                warn!(post_id = %post.id, kind, error = %e, "publish failed");
                return false;
            }
        };

        let (memory_kind, parent) = if kind == "quote" {
            (MemoryKind::Post, None)
        } else {
            (MemoryKind::Reply, Some(post.id.as_str()))
        };
        self.agent
            .remember_published(
                memory_kind,
                &posted,
                &text,
                Some(post.conversation_id.as_str()),
                parent,
                Some(kind.to_uppercase()),
            )
            .await;

        let generation = format!("Context:\n{prompt}\n\nGenerated {kind}:\n{text}");
        if let Err(e) = self
            .agent
            .memory
            .cache_set(
                CACHE_NAMESPACE,
                &format!("{kind}_generation_{}", post.id),
                &self.agent.agent_id,
                &generation,
                None,
            )
            .await
        {
            warn!(post_id = %post.id, error = %e, "failed to cache generation context");
        }
        true
    }

    async fn remember_actions(&self, post: &CandidatePost, executed: &[&str]) {
        let mut record = MemoryRecord::observed(post, &self.agent.agent_id);
        record.kind = MemoryKind::Action;
        record.action = Some(executed.join(","));

        if let Err(e) = self
            .agent
            .memory
            .ensure_connection(
                &record.user_id,
                &record.room_id,
                &post.author_handle,
                post.author_name.as_deref(),
                SOURCE,
            )
            .await
        {
            warn!(post_id = %post.id, error = %e, "failed to link author to room");
        }
        if let Err(e) = self.agent.memory.create_memory(&record).await {
            warn!(post_id = %post.id, error = %e, "failed to store action memory");
        }
    }
}
