//! Interaction orchestrator.
//!
//! One pass discovers candidate posts (mentions plus a sample of recent posts
//! from target users), then handles every candidate newer than the persisted
//! marker in ascending id order:
//!
//! 1. skip if an idempotency record exists or the id is already in flight
//! 2. link the author to the conversation room and rebuild the thread
//! 3. ask the generator whether to respond
//! 4. on RESPOND: extract the question, query the warehouse, generate and
//!    post the reply, then persist the reply memory and idempotency record
//! 5. on IGNORE or STOP: record the decision, post nothing
//!
//! A failure on one candidate is logged and the pass moves on; the marker
//! advances after every attempt and never moves backwards.
//!
//! Cancellation is observed only between candidates. A candidate whose reply
//! is already on its way is always followed through to its idempotency
//! record.

use crate::agent::{AgentContext, CACHE_NAMESPACE};
use crate::canonicalize::{
    clean_generated_text, strip_mentions_and_links, truncate_to_complete_sentence,
};
use crate::config::InteractionsConfig;
use crate::error::{Result, XrError};
use crate::log_metric;
use crate::logging::OperationGuard;
use crate::model::{
    CandidatePost, ConversationThread, Decision, IdempotencyRecord, MemoryKind, ModelClass,
    SearchMode, compare_post_ids, room_id,
};
use crate::prompts;
use crate::thread::{SOURCE, ThreadBuilder};
use chrono::Utc;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) const LAST_CHECKED_KEY: &str = "last_checked_tweet_id";

/// What happened to one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// An idempotency record already existed.
    AlreadyHandled,
    /// Another task in this process is handling the same post.
    InFlight,
    SelfAuthored,
    /// IGNORE or STOP was recorded; nothing was posted.
    Declined(Decision),
    Responded { response_id: String },
    /// Reply generated but not posted.
    DryRun { text: String },
}

/// Totals for one interaction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub discovered: usize,
    pub processed: usize,
    pub skipped: usize,
    pub responded: usize,
    pub failed: usize,
    /// Marker after the pass.
    pub last_checked: Option<String>,
}

impl PassSummary {
    fn record(&mut self, outcome: &CandidateOutcome) {
        match outcome {
            CandidateOutcome::AlreadyHandled
            | CandidateOutcome::InFlight
            | CandidateOutcome::SelfAuthored => self.skipped += 1,
            CandidateOutcome::Declined(_) | CandidateOutcome::DryRun { .. } => self.processed += 1,
            CandidateOutcome::Responded { .. } => {
                self.processed += 1;
                self.responded += 1;
            }
        }
    }
}

/// Removes an id from the in-flight set when dropped.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

pub struct InteractionClient {
    agent: AgentContext,
    threads: ThreadBuilder,
    settings: InteractionsConfig,
    in_flight: Mutex<HashSet<String>>,
    /// Serializes read-compare-write of the persisted marker.
    marker_lock: tokio::sync::Mutex<()>,
}

impl InteractionClient {
    #[must_use]
    pub fn new(agent: AgentContext, settings: InteractionsConfig) -> Self {
        Self {
            threads: agent.thread_builder(),
            agent,
            settings,
            in_flight: Mutex::new(HashSet::new()),
            marker_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub const fn settings(&self) -> &InteractionsConfig {
        &self.settings
    }

    /// Run one pass over mentions and target-user posts.
    ///
    /// # Errors
    ///
    /// Fails only when the mention search fails; per-candidate errors are
    /// logged and counted in [`PassSummary::failed`].
    pub async fn handle_interactions(&self) -> Result<PassSummary> {
        self.handle_interactions_until(&CancellationToken::new())
            .await
    }

    /// Like [`handle_interactions`](Self::handle_interactions), but stops
    /// before the next candidate once `cancel` fires. The candidate being
    /// processed when it fires runs to completion.
    ///
    /// # Errors
    ///
    /// Fails only when the mention search fails.
    pub async fn handle_interactions_until(&self, cancel: &CancellationToken) -> Result<PassSummary> {
        let guard = OperationGuard::new("interaction pass");
        let last_checked = self.load_last_checked().await;

        let candidates = match self.discover_candidates(last_checked.as_deref()).await {
            Ok(candidates) => candidates,
            Err(e) => {
                guard.fail(&e);
                return Err(e);
            }
        };

        let mut summary = PassSummary {
            discovered: candidates.len(),
            last_checked,
            ..PassSummary::default()
        };

        for post in candidates {
            if cancel.is_cancelled() {
                info!(post_id = %post.id, "cancelled; leaving remaining candidates for the next pass");
                break;
            }
            if !is_newer(&post.id, summary.last_checked.as_deref()) {
                continue;
            }

            match self.process_candidate(&post).await {
                Ok(outcome) => {
                    debug!(post_id = %post.id, ?outcome, "candidate handled");
                    summary.record(&outcome);
                }
                Err(e) => {
                    warn!(post_id = %post.id, error = %e, transient = e.is_transient(), "candidate failed");
                    summary.failed += 1;
                }
            }

            summary.last_checked = Some(post.id.clone());
            self.save_last_checked(&post.id).await;
        }

        log_metric!("interactions.responded", summary.responded);
        info!(
            discovered = summary.discovered,
            processed = summary.processed,
            skipped = summary.skipped,
            failed = summary.failed,
            "interaction pass finished"
        );
        guard.complete();
        Ok(summary)
    }

    /// Mentions plus one random recent post per target user, deduplicated,
    /// ascending by id, excluding our own posts.
    ///
    /// # Errors
    ///
    /// Returns the channel error if the mention search fails. Failures for
    /// individual target users are logged and skipped.
    pub async fn discover_candidates(&self, last_checked: Option<&str>) -> Result<Vec<CandidatePost>> {
        let mut candidates = self
            .agent
            .channel
            .search(
                &format!("@{}", self.agent.handle()),
                self.settings.mention_count,
                SearchMode::Latest,
            )
            .await?;
        debug!(mentions = candidates.len(), "fetched mentions");

        let now = Utc::now();
        let recency = chrono::Duration::minutes(self.settings.target_recency_mins);
        for user in self.target_users() {
            let posts = match self
                .agent
                .channel
                .search(
                    &format!("from:{user}"),
                    self.settings.target_fetch_count,
                    SearchMode::Latest,
                )
                .await
            {
                Ok(posts) => posts,
                Err(e) => {
                    warn!(user, error = %e, "failed to fetch target user posts");
                    continue;
                }
            };

            let valid: Vec<CandidatePost> = posts
                .into_iter()
                .filter(|post| {
                    is_newer(&post.id, last_checked)
                        && !post.is_reply
                        && !post.is_retweet
                        && now.signed_duration_since(post.created_at) < recency
                })
                .collect();

            if let Some(selected) = valid.choose(&mut rand::thread_rng()).cloned() {
                debug!(user, post_id = %selected.id, "selected target user post");
                candidates.push(selected);
            }
        }

        let mut seen = HashSet::new();
        candidates.retain(|post| post.author_id != self.agent.profile.id && seen.insert(post.id.clone()));
        candidates.sort_by(|a, b| compare_post_ids(&a.id, &b.id));
        Ok(candidates)
    }

    /// Handle one candidate end to end.
    ///
    /// # Errors
    ///
    /// Returns channel, query, or generation errors; the caller logs them.
    pub async fn process_candidate(&self, post: &CandidatePost) -> Result<CandidateOutcome> {
        if post.author_id == self.agent.profile.id {
            return Ok(CandidateOutcome::SelfAuthored);
        }
        if !self.in_flight.lock().insert(post.id.clone()) {
            return Ok(CandidateOutcome::InFlight);
        }
        let _in_flight = InFlightGuard {
            set: &self.in_flight,
            id: post.id.clone(),
        };

        if self.agent.memory.get_idempotency(&post.id).await?.is_some() {
            debug!(post_id = %post.id, "already handled");
            return Ok(CandidateOutcome::AlreadyHandled);
        }

        let room = room_id(&post.conversation_id, &self.agent.agent_id);
        if let Err(e) = self
            .agent
            .memory
            .ensure_connection(
                &post.author_id,
                &room,
                &post.author_handle,
                post.author_name.as_deref(),
                SOURCE,
            )
            .await
        {
            warn!(post_id = %post.id, error = %e, "failed to link author to room");
        }

        if post.text.trim().is_empty() {
            info!(post_id = %post.id, "skipping post with no text");
            self.record(post, None, Decision::Ignore).await;
            return Ok(CandidateOutcome::Declined(Decision::Ignore));
        }

        let thread = self
            .threads
            .build_thread(post, self.settings.max_thread_depth)
            .await;
        let gate = prompts::should_respond(
            self.agent.handle(),
            &self.target_users(),
            post,
            &thread,
        );
        let decision = self.agent.generator.decide(&gate).await?;
        info!(post_id = %post.id, %decision, "decision");

        if decision != Decision::Respond {
            self.record(post, None, decision).await;
            return Ok(CandidateOutcome::Declined(decision));
        }

        let question = self.extract_question(post, &thread);
        let context = thread.format_conversation();
        let answer = self.agent.queries.answer(&question, &context).await?;
        debug!(post_id = %post.id, sql = %answer.sql, rows = answer.rows.len(), "query answered");

        let prompt = prompts::data_reply(
            self.agent.handle(),
            post,
            &thread,
            &question,
            &answer.rows,
            self.settings.max_reply_length,
        );
        let raw = self.agent.generator.generate(&prompt, ModelClass::Large).await?;
        let text = truncate_to_complete_sentence(
            &clean_generated_text(&raw),
            self.settings.max_reply_length,
        );
        if text.is_empty() {
            return Err(XrError::malformed("reply was empty after cleanup"));
        }

        if self.settings.dry_run {
            info!(post_id = %post.id, reply = %text, "dry run; reply not posted");
            return Ok(CandidateOutcome::DryRun { text });
        }

        let posted = self.agent.channel.post_reply(&text, &post.id).await?;
        info!(post_id = %post.id, response_id = %posted.id, url = %posted.permanent_url, "replied");

        self.agent
            .remember_published(
                MemoryKind::Reply,
                &posted,
                &text,
                Some(&post.conversation_id),
                Some(&post.id),
                Some(Decision::Respond.to_string()),
            )
            .await;
        self.record(post, Some(posted.id.clone()), Decision::Respond)
            .await;

        let generation = format!(
            "Context:\n\n{prompt}\n\nSelected Post: {} - {}: {}\nAgent's Output:\n{text}",
            post.id, post.author_handle, post.text
        );
        if let Err(e) = self
            .agent
            .memory
            .cache_set(
                CACHE_NAMESPACE,
                &format!("tweet_generation_{}", post.id),
                &self.agent.agent_id,
                &generation,
                None,
            )
            .await
        {
            warn!(post_id = %post.id, error = %e, "failed to cache generation context");
        }

        Ok(CandidateOutcome::Responded {
            response_id: posted.id,
        })
    }

    /// The question a post asks, with mentions and links removed.
    ///
    /// Falls back to the most recent other post in the thread when the
    /// remainder is too short or has no words.
    #[must_use]
    pub fn extract_question(&self, post: &CandidatePost, thread: &ConversationThread) -> String {
        let stripped = strip_mentions_and_links(&post.text);
        if is_question_like(&stripped, self.settings.min_question_chars) {
            return stripped;
        }

        thread
            .posts()
            .iter()
            .rev()
            .filter(|p| p.id != post.id)
            .map(|p| strip_mentions_and_links(&p.text))
            .find(|text| has_words(text))
            .unwrap_or(stripped)
    }

    fn target_users(&self) -> Vec<String> {
        self.settings
            .target_users
            .iter()
            .map(|u| u.trim().trim_start_matches('@').to_string())
            .filter(|u| !u.is_empty())
            .collect()
    }

    /// Persist the decision for `post`. Failures are logged, not retried.
    async fn record(&self, post: &CandidatePost, response_id: Option<String>, decision: Decision) {
        let record = IdempotencyRecord {
            post_id: post.id.clone(),
            response_id,
            decision,
            created_at: Utc::now(),
        };
        match self.agent.memory.record_idempotency(&record).await {
            Ok(true) => {}
            Ok(false) => warn!(post_id = %post.id, "idempotency record already existed"),
            Err(e) => warn!(post_id = %post.id, error = %e, "failed to record idempotency"),
        }
    }

    async fn load_last_checked(&self) -> Option<String> {
        match self
            .agent
            .memory
            .cache_get(CACHE_NAMESPACE, LAST_CHECKED_KEY, self.agent.handle())
            .await
        {
            Ok(marker) => marker,
            Err(e) => {
                warn!(error = %e, "failed to load last checked marker");
                None
            }
        }
    }

    /// Persist `id` as the marker unless the stored marker is already newer.
    async fn save_last_checked(&self, id: &str) {
        let _lock = self.marker_lock.lock().await;
        let stored = self.load_last_checked().await;
        if !is_newer(id, stored.as_deref()) {
            debug!(post_id = id, stored = ?stored, "marker already ahead");
            return;
        }
        if let Err(e) = self
            .agent
            .memory
            .cache_set(CACHE_NAMESPACE, LAST_CHECKED_KEY, self.agent.handle(), id, None)
            .await
        {
            warn!(post_id = id, error = %e, "failed to persist last checked marker");
        }
    }
}

fn is_newer(id: &str, marker: Option<&str>) -> bool {
    marker.is_none_or(|marker| compare_post_ids(id, marker) == Ordering::Greater)
}

fn has_words(text: &str) -> bool {
    text.chars().any(char::is_alphanumeric)
}

fn is_question_like(text: &str, min_chars: usize) -> bool {
    has_words(text) && text.chars().count() >= min_chars
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::{QueryAnswer, QueryEngine};
    use crate::channel::{InMemoryChannel, SocialChannel};
    use crate::llm::TextGenerator;
    use crate::memory::{MemoryStore, SqliteMemoryStore};
    use crate::model::{Profile, Row, memory_id};
    use crate::query::PlanOrigin;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    struct ScriptedGenerator {
        decision: &'static str,
        reply: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn generate(&self, context: &str, _class: ModelClass) -> Result<String> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            if context.contains("[RESPOND], [IGNORE], or [STOP]") {
                Ok(self.decision.to_string())
            } else {
                Ok(self.reply.to_string())
            }
        }
    }

    #[derive(Default)]
    struct RecordingEngine {
        questions: Mutex<Vec<String>>,
        /// Questions containing this text fail.
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl QueryEngine for RecordingEngine {
        async fn answer(&self, question: &str, _context: &str) -> Result<QueryAnswer> {
            self.questions.lock().push(question.to_string());
            if self.fail_on.is_some_and(|needle| question.contains(needle)) {
                return Err(XrError::query_execution("warehouse unavailable"));
            }
            Ok(QueryAnswer {
                sql: "SELECT 1".into(),
                origin: PlanOrigin::Rules,
                rows: vec![Row::new()],
            })
        }

        async fn top_tokens(&self) -> Result<Vec<Row>> {
            Ok(Vec::new())
        }
    }

    struct Harness {
        channel: Arc<InMemoryChannel>,
        memory: Arc<SqliteMemoryStore>,
        engine: Arc<RecordingEngine>,
        generator: Arc<ScriptedGenerator>,
        client: InteractionClient,
    }

    fn create_harness(decision: &'static str, settings: InteractionsConfig) -> Harness {
        create_harness_with_engine(decision, settings, RecordingEngine::default())
    }

    fn create_harness_with_engine(
        decision: &'static str,
        settings: InteractionsConfig,
        engine: RecordingEngine,
    ) -> Harness {
        let profile = Profile {
            id: "self".into(),
            handle: "bot".into(),
            name: "Bot".into(),
        };
        let channel = Arc::new(InMemoryChannel::new(profile.clone()));
        let memory = Arc::new(SqliteMemoryStore::open_memory().unwrap());
        let engine = Arc::new(engine);
        let generator = Arc::new(ScriptedGenerator {
            decision,
            reply: "\"BTC leads with a trader grade of 88.\"",
            calls: AtomicUsize::new(0),
        });
        let agent = AgentContext {
            channel: Arc::clone(&channel) as Arc<dyn SocialChannel>,
            memory: Arc::clone(&memory) as Arc<dyn MemoryStore>,
            generator: Arc::clone(&generator) as Arc<dyn TextGenerator>,
            queries: Arc::clone(&engine) as Arc<dyn QueryEngine>,
            profile,
            agent_id: "agent".into(),
        };
        Harness {
            channel,
            memory,
            engine,
            generator,
            client: InteractionClient::new(agent, settings),
        }
    }

    fn mention(id: &str, text: &str) -> CandidatePost {
        CandidatePost::new(id, "u1", "alice", text)
    }

    #[tokio::test]
    async fn test_respond_posts_and_records() {
        let h = create_harness("[RESPOND]", InteractionsConfig::default());
        let post = mention("10", "@bot which token has the best trader grade?");
        h.channel.add_post(post.clone());

        let outcome = h.client.process_candidate(&post).await.unwrap();
        let CandidateOutcome::Responded { response_id } = outcome else {
            panic!("expected a reply, got {outcome:?}");
        };

        let published = h.channel.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].text, "BTC leads with a trader grade of 88.");
        assert_eq!(published[0].in_reply_to.as_deref(), Some("10"));

        let record = h.memory.get_idempotency("10").await.unwrap().unwrap();
        assert_eq!(record.response_id.as_deref(), Some(response_id.as_str()));
        assert_eq!(record.decision, Decision::Respond);
        assert!(
            h.memory
                .get_memory(&memory_id(&response_id, "agent"))
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            h.memory
                .cache_get(CACHE_NAMESPACE, "tweet_generation_10", "agent")
                .await
                .unwrap()
                .is_some()
        );
        assert_eq!(
            h.engine.questions.lock().as_slice(),
            ["which token has the best trader grade?"]
        );
    }

    #[tokio::test]
    async fn test_ignore_records_without_posting() {
        let h = create_harness("[IGNORE]", InteractionsConfig::default());
        let post = mention("11", "@bot gm");

        let outcome = h.client.process_candidate(&post).await.unwrap();
        assert_eq!(outcome, CandidateOutcome::Declined(Decision::Ignore));
        assert!(h.channel.published().is_empty());
        let record = h.memory.get_idempotency("11").await.unwrap().unwrap();
        assert_eq!(record.response_id, None);
        assert_eq!(record.decision, Decision::Ignore);
    }

    #[tokio::test]
    async fn test_empty_text_skips_gate() {
        let h = create_harness("[RESPOND]", InteractionsConfig::default());
        let outcome = h.client.process_candidate(&mention("12", "  ")).await.unwrap();
        assert_eq!(outcome, CandidateOutcome::Declined(Decision::Ignore));
        assert_eq!(h.generator.calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_second_attempt_is_noop() {
        let h = create_harness("[RESPOND]", InteractionsConfig::default());
        let post = mention("13", "@bot top volume tokens today?");
        h.client.process_candidate(&post).await.unwrap();
        let again = h.client.process_candidate(&post).await.unwrap();
        assert_eq!(again, CandidateOutcome::AlreadyHandled);
        assert_eq!(h.channel.published().len(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_posts_nothing_and_records_nothing() {
        let settings = InteractionsConfig {
            dry_run: true,
            ..InteractionsConfig::default()
        };
        let h = create_harness("[RESPOND]", settings);
        let outcome = h
            .client
            .process_candidate(&mention("14", "@bot best coin by grade?"))
            .await
            .unwrap();
        assert!(matches!(outcome, CandidateOutcome::DryRun { .. }));
        assert!(h.channel.published().is_empty());
        assert!(h.memory.get_idempotency("14").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_extract_question_falls_back_to_thread() {
        let h = create_harness("[RESPOND]", InteractionsConfig::default());
        let root = CandidatePost::new("1", "u2", "carol", "what is the highest grade token?");
        let leaf = mention("2", "@bot ^").replying_to("1");
        let thread = ConversationThread::from_posts(vec![root, leaf.clone()]);
        assert_eq!(
            h.client.extract_question(&leaf, &thread),
            "what is the highest grade token?"
        );

        let direct = mention("3", "@bot top tokens by volume https://t.co/x");
        assert_eq!(
            h.client
                .extract_question(&direct, &ConversationThread::default()),
            "top tokens by volume"
        );
    }

    #[tokio::test]
    async fn test_discovery_filters_and_orders() {
        let settings = InteractionsConfig {
            target_users: vec!["whale".into(), " ".into()],
            ..InteractionsConfig::default()
        };
        let h = create_harness("[IGNORE]", settings);
        h.channel.add_post(mention("30", "@bot hi"));
        h.channel.add_post(mention("25", "@bot again"));
        h.channel
            .add_post(CandidatePost::new("31", "self", "bot", "@bot talking to myself"));
        // Target user: one fresh original post, one reply, one stale post.
        h.channel
            .add_post(CandidatePost::new("40", "w", "whale", "big moves"));
        h.channel
            .add_post(CandidatePost::new("41", "w", "whale", "reply").replying_to("1"));
        h.channel.add_post(
            CandidatePost::new("20", "w", "whale", "old")
                .with_created_at(Utc::now() - chrono::Duration::hours(5)),
        );

        let candidates = h.client.discover_candidates(None).await.unwrap();
        let ids: Vec<_> = candidates.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["25", "30", "40"]);
    }

    #[tokio::test]
    async fn test_target_user_failure_is_skipped() {
        let settings = InteractionsConfig {
            target_users: vec!["whale".into()],
            ..InteractionsConfig::default()
        };
        let h = create_harness("[IGNORE]", settings);
        h.channel.add_post(mention("30", "@bot hi"));
        h.channel.fail_search("from:whale");
        let candidates = h.client.discover_candidates(None).await.unwrap();
        assert_eq!(candidates.len(), 1);

        h.channel.fail_search("@bot");
        assert!(matches!(
            h.client.discover_candidates(None).await,
            Err(XrError::TransientIo { .. })
        ));
    }

    #[tokio::test]
    async fn test_pass_advances_marker() {
        let h = create_harness("[IGNORE]", InteractionsConfig::default());
        h.channel.add_post(mention("100", "@bot one"));
        h.channel.add_post(mention("101", "@bot two"));

        let summary = h.client.handle_interactions().await.unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.last_checked.as_deref(), Some("101"));

        // Nothing newer than the marker on the next pass.
        let summary = h.client.handle_interactions().await.unwrap();
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.skipped, 0);
    }

    #[tokio::test]
    async fn test_failed_candidate_does_not_stop_pass() {
        let engine = RecordingEngine {
            fail_on: Some("volume"),
            ..RecordingEngine::default()
        };
        let h = create_harness_with_engine("[RESPOND]", InteractionsConfig::default(), engine);
        h.channel.add_post(mention("500", "@bot which token has the best trader grade?"));
        h.channel.add_post(mention("501", "@bot what are the top volume tokens?"));
        h.channel.add_post(mention("502", "@bot which coin has the highest market cap?"));

        let summary = h.client.handle_interactions().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.responded, 2);
        assert_eq!(summary.last_checked.as_deref(), Some("502"));

        let targets: Vec<_> = h
            .channel
            .published()
            .into_iter()
            .filter_map(|p| p.in_reply_to)
            .collect();
        assert_eq!(targets, vec!["500", "502"]);
        // The failed post has no record, so it is retried only if it
        // reappears below a lower marker.
        assert!(h.memory.get_idempotency("501").await.unwrap().is_none());
        assert_eq!(
            h.memory
                .cache_get(CACHE_NAMESPACE, LAST_CHECKED_KEY, "bot")
                .await
                .unwrap()
                .as_deref(),
            Some("502")
        );
    }

    #[tokio::test]
    async fn test_marker_never_moves_backwards() {
        let h = create_harness("[IGNORE]", InteractionsConfig::default());
        h.client.save_last_checked("305").await;
        h.client.save_last_checked("302").await;
        assert_eq!(h.client.load_last_checked().await.as_deref(), Some("305"));

        h.client.save_last_checked("1000").await;
        assert_eq!(h.client.load_last_checked().await.as_deref(), Some("1000"));
    }

    #[tokio::test]
    async fn test_cancelled_pass_handles_no_candidates() {
        let h = create_harness("[IGNORE]", InteractionsConfig::default());
        h.channel.add_post(mention("600", "@bot one"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = h.client.handle_interactions_until(&cancel).await.unwrap();
        assert_eq!(summary.discovered, 1);
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.last_checked, None);
        assert!(h.memory.get_idempotency("600").await.unwrap().is_none());
    }
}
