//! Conversation thread reconstruction.
//!
//! Walks parent links from a leaf post toward the root with an explicit
//! loop, a call-scoped visited set, and a depth bound, so cyclic or very long
//! reply chains always terminate. Every post on the walk is persisted as a
//! memory (insert-or-ignore). A failed or empty parent lookup ends the walk
//! with whatever was collected so far.

use crate::channel::SocialChannel;
use crate::memory::MemoryStore;
use crate::model::{CandidatePost, ConversationThread, MemoryRecord, memory_id};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Source label recorded with author/room linkage.
pub const SOURCE: &str = "twitter";

pub struct ThreadBuilder {
    channel: Arc<dyn SocialChannel>,
    memory: Arc<dyn MemoryStore>,
    agent_id: String,
    self_user_id: String,
}

impl ThreadBuilder {
    /// `self_user_id` is the channel account id; its posts are stored under
    /// `agent_id`.
    pub fn new(
        channel: Arc<dyn SocialChannel>,
        memory: Arc<dyn MemoryStore>,
        agent_id: impl Into<String>,
        self_user_id: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            memory,
            agent_id: agent_id.into(),
            self_user_id: self_user_id.into(),
        }
    }

    /// Root-to-leaf thread ending at `leaf`, at most `max_depth` posts long.
    pub async fn build_thread(&self, leaf: &CandidatePost, max_depth: usize) -> ConversationThread {
        self.walk(leaf, max_depth, true).await
    }

    /// Same walk as [`Self::build_thread`], but `leaf` is not stored, so the
    /// caller can record its own memory for it.
    pub async fn build_context(&self, leaf: &CandidatePost, max_depth: usize) -> ConversationThread {
        self.walk(leaf, max_depth, false).await
    }

    async fn walk(&self, leaf: &CandidatePost, max_depth: usize, remember_leaf: bool) -> ConversationThread {
        let mut visited: HashSet<String> = HashSet::new();
        let mut posts: VecDeque<CandidatePost> = VecDeque::new();
        let mut current = Some(leaf.clone());
        let mut depth = 0;

        while let Some(post) = current.take() {
            if depth >= max_depth {
                debug!(post_id = %post.id, depth, "reached maximum thread depth");
                break;
            }
            if !visited.insert(post.id.clone()) {
                debug!(post_id = %post.id, "post already in thread; stopping walk");
                break;
            }

            if remember_leaf || depth > 0 {
                self.remember(&post).await;
            }
            let parent_id = post.in_reply_to.clone();
            posts.push_front(post);

            let Some(parent_id) = parent_id else {
                break;
            };
            current = match self.channel.get_post(&parent_id).await {
                Ok(Some(parent)) => Some(parent),
                Ok(None) => {
                    debug!(parent_id = %parent_id, "parent post not found");
                    None
                }
                Err(e) => {
                    warn!(parent_id = %parent_id, error = %e, "failed to fetch parent post");
                    None
                }
            };
            depth += 1;
        }

        debug!(
            leaf = %leaf.id,
            length = posts.len(),
            "thread built"
        );
        ConversationThread::from_posts(posts.into())
    }

    /// Persist `post` as a memory unless one exists. Failures are logged.
    pub async fn remember(&self, post: &CandidatePost) {
        let id = memory_id(&post.id, &self.agent_id);
        match self.memory.get_memory(&id).await {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => {
                warn!(post_id = %post.id, error = %e, "memory lookup failed");
                return;
            }
        }

        let mut record = MemoryRecord::observed(post, &self.agent_id);
        if post.author_id == self.self_user_id {
            record.user_id.clone_from(&self.agent_id);
        }

        if let Err(e) = self
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
        if let Err(e) = self.memory.create_memory(&record).await {
            warn!(post_id = %post.id, error = %e, "failed to store memory");
        }
    }
}
