//! Collaborators shared by the interaction, action, and posting loops.

use crate::analytics::QueryEngine;
use crate::channel::SocialChannel;
use crate::llm::TextGenerator;
use crate::memory::MemoryStore;
use crate::model::{MemoryKind, MemoryRecord, PostedPost, Profile, memory_id, room_id};
use crate::thread::ThreadBuilder;
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;

/// Cache namespace for channel state (markers, last post, generation logs).
pub const CACHE_NAMESPACE: &str = "twitter";

/// Application-scoped handles. Cloning is cheap.
#[derive(Clone)]
pub struct AgentContext {
    pub channel: Arc<dyn SocialChannel>,
    pub memory: Arc<dyn MemoryStore>,
    pub generator: Arc<dyn TextGenerator>,
    pub queries: Arc<dyn QueryEngine>,
    pub profile: Profile,
    /// Identity used for memory and room ids.
    pub agent_id: String,
}

impl AgentContext {
    #[must_use]
    pub fn thread_builder(&self) -> ThreadBuilder {
        ThreadBuilder::new(
            Arc::clone(&self.channel),
            Arc::clone(&self.memory),
            &self.agent_id,
            &self.profile.id,
        )
    }

    #[must_use]
    pub fn handle(&self) -> &str {
        &self.profile.handle
    }

    /// Store a memory for something we published. Failures are logged.
    pub async fn remember_published(
        &self,
        kind: MemoryKind,
        posted: &PostedPost,
        text: &str,
        conversation_id: Option<&str>,
        in_reply_to: Option<&str>,
        action: Option<String>,
    ) {
        let record = MemoryRecord {
            id: memory_id(&posted.id, &self.agent_id),
            external_id: posted.id.clone(),
            kind,
            user_id: self.agent_id.clone(),
            room_id: room_id(conversation_id.unwrap_or(&posted.id), &self.agent_id),
            text: text.to_string(),
            url: Some(posted.permanent_url.clone()),
            in_reply_to: in_reply_to.map(|parent| memory_id(parent, &self.agent_id)),
            action,
            created_at: Utc::now(),
        };
        if let Err(e) = self.memory.create_memory(&record).await {
            warn!(post_id = %posted.id, error = %e, "failed to store memory for published post");
        }
    }
}
