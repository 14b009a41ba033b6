//! Data models shared across the interaction pipeline.
//!
//! Posts are immutable once fetched from the channel; everything downstream
//! (threads, memories, idempotency markers) refers to them by external id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A post fetched from the social channel that may be processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePost {
    pub id: String,
    pub author_id: String,
    pub author_handle: String,
    pub author_name: Option<String>,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub in_reply_to: Option<String>,
    pub conversation_id: String,
    pub permanent_url: Option<String>,
    #[serde(default)]
    pub is_reply: bool,
    #[serde(default)]
    pub is_retweet: bool,
}

impl CandidatePost {
    /// Build a plain post. Conversation id defaults to the post id.
    pub fn new(
        id: impl Into<String>,
        author_id: impl Into<String>,
        author_handle: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            conversation_id: id.clone(),
            id,
            author_id: author_id.into(),
            author_handle: author_handle.into(),
            author_name: None,
            text: text.into(),
            created_at: Utc::now(),
            in_reply_to: None,
            permanent_url: None,
            is_reply: false,
            is_retweet: false,
        }
    }

    /// Mark this post as a reply to `parent_id`.
    #[must_use]
    pub fn replying_to(mut self, parent_id: impl Into<String>) -> Self {
        self.in_reply_to = Some(parent_id.into());
        self.is_reply = true;
        self
    }

    #[must_use]
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    #[must_use]
    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = conversation_id.into();
        self
    }

    /// Display name, falling back to the handle.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.author_name.as_deref().unwrap_or(&self.author_handle)
    }
}

/// Root-to-leaf sequence of posts with no duplicate ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversationThread {
    posts: Vec<CandidatePost>,
}

impl ConversationThread {
    #[must_use]
    pub const fn from_posts(posts: Vec<CandidatePost>) -> Self {
        Self { posts }
    }

    #[must_use]
    pub fn posts(&self) -> &[CandidatePost] {
        &self.posts
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.posts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }

    #[must_use]
    pub fn root(&self) -> Option<&CandidatePost> {
        self.posts.first()
    }

    #[must_use]
    pub fn leaf(&self) -> Option<&CandidatePost> {
        self.posts.last()
    }

    /// Render the thread as prompt context, one block per post.
    #[must_use]
    pub fn format_conversation(&self) -> String {
        self.posts
            .iter()
            .map(|post| {
                format!(
                    "@{} ({}):\n{}",
                    post.author_handle,
                    post.created_at.format("%b %d, %H:%M"),
                    post.text
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Output of the respond/ignore/stop gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Respond,
    Ignore,
    Stop,
}

impl Decision {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Respond => "RESPOND",
            Self::Ignore => "IGNORE",
            Self::Stop => "STOP",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "RESPOND" => Ok(Self::Respond),
            "IGNORE" => Ok(Self::Ignore),
            "STOP" => Ok(Self::Stop),
            other => Err(format!("Unknown decision: {other}")),
        }
    }
}

/// Timeline actions chosen for one post.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct ActionFlags {
    pub like: bool,
    pub retweet: bool,
    pub quote: bool,
    pub reply: bool,
}

impl ActionFlags {
    #[must_use]
    pub const fn any(&self) -> bool {
        self.like || self.retweet || self.quote || self.reply
    }
}

/// Persisted marker preventing duplicate handling of a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub post_id: String,
    pub response_id: Option<String>,
    pub decision: Decision,
    pub created_at: DateTime<Utc>,
}

/// Where a memory came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    /// A post observed on the channel.
    Observed,
    /// A reply we published.
    Reply,
    /// An original post we published.
    Post,
    /// Timeline actions we took on a post.
    Action,
}

impl MemoryKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Observed => "observed",
            Self::Reply => "reply",
            Self::Post => "post",
            Self::Action => "action",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "reply" => Self::Reply,
            "post" => Self::Post,
            "action" => Self::Action,
            _ => Self::Observed,
        }
    }
}

/// Long-term memory entry keyed by a deterministic id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub external_id: String,
    pub kind: MemoryKind,
    pub user_id: String,
    pub room_id: String,
    pub text: String,
    pub url: Option<String>,
    pub in_reply_to: Option<String>,
    pub action: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MemoryRecord {
    /// Memory for a post seen on the channel.
    #[must_use]
    pub fn observed(post: &CandidatePost, agent_id: &str) -> Self {
        Self {
            id: memory_id(&post.id, agent_id),
            external_id: post.id.clone(),
            kind: MemoryKind::Observed,
            user_id: post.author_id.clone(),
            room_id: room_id(&post.conversation_id, agent_id),
            text: post.text.clone(),
            url: post.permanent_url.clone(),
            in_reply_to: post
                .in_reply_to
                .as_ref()
                .map(|parent| memory_id(parent, agent_id)),
            action: None,
            created_at: post.created_at,
        }
    }
}

/// A post we published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostedPost {
    pub id: String,
    pub permanent_url: String,
    #[serde(default)]
    pub raw: serde_json::Value,
}

/// Search ordering requested from the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchMode {
    Latest,
    Top,
}

/// Quality/cost tier for text generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelClass {
    Small,
    Medium,
    Large,
}

/// Authenticated account profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub handle: String,
    pub name: String,
}

/// One result row from the warehouse.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Compare snowflake-style numeric ids without parsing them.
///
/// Shorter ids are older; equal-length ids compare lexicographically.
#[must_use]
pub fn compare_post_ids(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Deterministic memory id for an external post seen by an agent.
#[must_use]
pub fn memory_id(external_id: &str, agent_id: &str) -> String {
    crate::canonicalize::content_hash_hex(&format!("{external_id}-{agent_id}"))[..32].to_string()
}

/// Deterministic room id for a conversation.
#[must_use]
pub fn room_id(conversation_id: &str, agent_id: &str) -> String {
    memory_id(conversation_id, agent_id)
}
