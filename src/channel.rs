//! Social channel adapters.
//!
//! [`SocialChannel`] is what the pipeline needs from X: search, timeline,
//! single-post lookup, posting, and engagement. Every transport failure is
//! reported as [`XrError::TransientIo`] so callers can skip the unit of work.
//!
//! - [`XApiChannel`] talks to the X API v2 with a bearer token.
//! - [`InMemoryChannel`] serves posts from memory (or a JSON fixture file)
//!   and records what would have been published.

use crate::error::{Result, XrError};
use crate::model::{CandidatePost, PostedPost, Profile, SearchMode, compare_post_ids};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Minimal contract with the social channel.
#[async_trait]
pub trait SocialChannel: Send + Sync {
    /// The authenticated account.
    async fn profile(&self) -> Result<Profile>;

    async fn search(&self, query: &str, count: usize, mode: SearchMode)
    -> Result<Vec<CandidatePost>>;

    async fn fetch_timeline(&self, count: usize) -> Result<Vec<CandidatePost>>;

    /// `Ok(None)` when the post does not exist or is not visible.
    async fn get_post(&self, id: &str) -> Result<Option<CandidatePost>>;

    async fn post_reply(&self, text: &str, in_reply_to: &str) -> Result<PostedPost>;

    async fn post_quote(&self, text: &str, quoted_id: &str) -> Result<PostedPost>;

    async fn post_original(&self, text: &str) -> Result<PostedPost>;

    async fn like(&self, id: &str) -> Result<()>;

    async fn retweet(&self, id: &str) -> Result<()>;
}

/// Canonical web URL for a post.
#[must_use]
pub fn permanent_url(handle: &str, id: &str) -> String {
    format!("https://x.com/{handle}/status/{id}")
}

// =============================================================================
// X API v2
// =============================================================================

const TWEET_FIELDS: &str = "author_id,created_at,conversation_id,referenced_tweets";
const USER_FIELDS: &str = "username,name";

#[derive(Debug, Deserialize)]
struct ApiReference {
    #[serde(rename = "type")]
    kind: String,
    id: String,
}

#[derive(Debug, Deserialize)]
struct ApiTweet {
    id: String,
    text: String,
    author_id: Option<String>,
    created_at: Option<DateTime<Utc>>,
    conversation_id: Option<String>,
    #[serde(default)]
    referenced_tweets: Vec<ApiReference>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiUser {
    id: String,
    username: String,
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiIncludes {
    #[serde(default)]
    users: Vec<ApiUser>,
}

#[derive(Debug, Deserialize)]
struct ApiList {
    #[serde(default)]
    data: Vec<ApiTweet>,
    #[serde(default)]
    includes: ApiIncludes,
}

#[derive(Debug, Deserialize)]
struct ApiSingle {
    data: Option<ApiTweet>,
    #[serde(default)]
    includes: ApiIncludes,
}

#[derive(Debug, Deserialize)]
struct ApiCreated {
    data: ApiCreatedData,
}

#[derive(Debug, Deserialize)]
struct ApiCreatedData {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ApiMe {
    data: ApiUser,
}

impl ApiTweet {
    fn into_candidate(self, users: &HashMap<String, ApiUser>) -> CandidatePost {
        let author_id = self.author_id.unwrap_or_default();
        let author = users.get(&author_id);
        let handle = author.map_or_else(|| author_id.clone(), |u| u.username.clone());
        let in_reply_to = self
            .referenced_tweets
            .iter()
            .find(|r| r.kind == "replied_to")
            .map(|r| r.id.clone());
        let is_retweet = self.referenced_tweets.iter().any(|r| r.kind == "retweeted");

        CandidatePost {
            permanent_url: Some(permanent_url(&handle, &self.id)),
            conversation_id: self.conversation_id.unwrap_or_else(|| self.id.clone()),
            is_reply: in_reply_to.is_some(),
            in_reply_to,
            is_retweet,
            author_name: author.and_then(|u| u.name.clone()),
            author_handle: handle,
            author_id,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            text: self.text,
            id: self.id,
        }
    }
}

fn users_by_id(includes: ApiIncludes) -> HashMap<String, ApiUser> {
    includes
        .users
        .into_iter()
        .map(|u| (u.id.clone(), u))
        .collect()
}

/// X API v2 client.
pub struct XApiChannel {
    http: Client,
    base_url: String,
    bearer_token: String,
    me: Mutex<Option<Profile>>,
}

impl XApiChannel {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        base_url: impl Into<String>,
        bearer_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token: bearer_token.into(),
            me: Mutex::new(None),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>> {
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(&self.bearer_token)
            .query(query)
            .send()
            .await
            .map_err(|e| XrError::transient(operation, e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(XrError::transient(operation, format!("HTTP {status}: {body}")));
        }
        let parsed = response
            .json::<T>()
            .await
            .map_err(|e| XrError::transient(operation, format!("bad payload: {e}")))?;
        Ok(Some(parsed))
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.bearer_token)
            .json(body)
            .send()
            .await
            .map_err(|e| XrError::transient(operation, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(XrError::transient(operation, format!("HTTP {status}: {body}")));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| XrError::transient(operation, format!("bad payload: {e}")))
    }

    async fn list(
        &self,
        operation: &'static str,
        path: &str,
        mut query: Vec<(&str, String)>,
    ) -> Result<Vec<CandidatePost>> {
        query.push(("tweet.fields", TWEET_FIELDS.to_string()));
        query.push(("expansions", "author_id".to_string()));
        query.push(("user.fields", USER_FIELDS.to_string()));
        let list: Option<ApiList> = self.get_json(operation, path, &query).await?;
        let Some(list) = list else {
            return Ok(Vec::new());
        };
        let users = users_by_id(list.includes);
        Ok(list
            .data
            .into_iter()
            .map(|t| t.into_candidate(&users))
            .collect())
    }

    async fn create_post(&self, operation: &'static str, body: serde_json::Value) -> Result<PostedPost> {
        let created: ApiCreated = self.post_json(operation, "/2/tweets", &body).await?;
        let me = self.profile().await?;
        Ok(PostedPost {
            permanent_url: permanent_url(&me.handle, &created.data.id),
            id: created.data.id,
            raw: body,
        })
    }
}

#[async_trait]
impl SocialChannel for XApiChannel {
    async fn profile(&self) -> Result<Profile> {
        if let Some(me) = self.me.lock().clone() {
            return Ok(me);
        }
        let me: ApiMe = self
            .get_json("profile", "/2/users/me", &[])
            .await?
            .ok_or_else(|| XrError::transient("profile", "authenticated user not found"))?;
        let profile = Profile {
            id: me.data.id,
            name: me.data.name.unwrap_or_else(|| me.data.username.clone()),
            handle: me.data.username,
        };
        *self.me.lock() = Some(profile.clone());
        Ok(profile)
    }

    async fn search(
        &self,
        query: &str,
        count: usize,
        mode: SearchMode,
    ) -> Result<Vec<CandidatePost>> {
        let sort_order = match mode {
            SearchMode::Latest => "recency",
            SearchMode::Top => "relevancy",
        };
        debug!(query, count, "searching channel");
        let mut posts = self
            .list(
                "search",
                "/2/tweets/search/recent",
                vec![
                    ("query", query.to_string()),
                    ("max_results", count.clamp(10, 100).to_string()),
                    ("sort_order", sort_order.to_string()),
                ],
            )
            .await?;
        posts.truncate(count);
        Ok(posts)
    }

    async fn fetch_timeline(&self, count: usize) -> Result<Vec<CandidatePost>> {
        let me = self.profile().await?;
        let mut posts = self
            .list(
                "timeline",
                &format!("/2/users/{}/timelines/reverse_chronological", me.id),
                vec![("max_results", count.clamp(1, 100).to_string())],
            )
            .await?;
        posts.truncate(count);
        Ok(posts)
    }

    async fn get_post(&self, id: &str) -> Result<Option<CandidatePost>> {
        let query = [
            ("tweet.fields", TWEET_FIELDS.to_string()),
            ("expansions", "author_id".to_string()),
            ("user.fields", USER_FIELDS.to_string()),
        ];
        let single: Option<ApiSingle> = self
            .get_json("get_post", &format!("/2/tweets/{id}"), &query)
            .await?;
        Ok(single.and_then(|s| {
            let users = users_by_id(s.includes);
            s.data.map(|t| t.into_candidate(&users))
        }))
    }

    async fn post_reply(&self, text: &str, in_reply_to: &str) -> Result<PostedPost> {
        self.create_post(
            "post_reply",
            json!({ "text": text, "reply": { "in_reply_to_tweet_id": in_reply_to } }),
        )
        .await
    }

    async fn post_quote(&self, text: &str, quoted_id: &str) -> Result<PostedPost> {
        self.create_post("post_quote", json!({ "text": text, "quote_tweet_id": quoted_id }))
            .await
    }

    async fn post_original(&self, text: &str) -> Result<PostedPost> {
        self.create_post("post_original", json!({ "text": text })).await
    }

    async fn like(&self, id: &str) -> Result<()> {
        let me = self.profile().await?;
        let _: serde_json::Value = self
            .post_json("like", &format!("/2/users/{}/likes", me.id), &json!({ "tweet_id": id }))
            .await?;
        Ok(())
    }

    async fn retweet(&self, id: &str) -> Result<()> {
        let me = self.profile().await?;
        let _: serde_json::Value = self
            .post_json(
                "retweet",
                &format!("/2/users/{}/retweets", me.id),
                &json!({ "tweet_id": id }),
            )
            .await?;
        Ok(())
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Something the in-memory channel was asked to publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Published {
    pub id: String,
    pub text: String,
    pub in_reply_to: Option<String>,
    pub quote_of: Option<String>,
}

/// Fixture file layout for [`InMemoryChannel::from_fixture_file`].
#[derive(Debug, Deserialize)]
struct Fixture {
    profile: Profile,
    #[serde(default)]
    posts: Vec<CandidatePost>,
    #[serde(default)]
    timeline: Vec<String>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    posts: HashMap<String, CandidatePost>,
    timeline: Vec<String>,
    published: Vec<Published>,
    likes: Vec<String>,
    retweets: Vec<String>,
    failing_lookups: HashSet<String>,
    failing_searches: HashSet<String>,
    search_calls: usize,
    next_id: u64,
}

/// Channel that lives entirely in process memory.
pub struct InMemoryChannel {
    profile: Profile,
    state: Mutex<InMemoryState>,
}

impl InMemoryChannel {
    #[must_use]
    pub fn new(profile: Profile) -> Self {
        Self {
            profile,
            state: Mutex::new(InMemoryState {
                next_id: 9_000_000_000_000_000_000,
                ..InMemoryState::default()
            }),
        }
    }

    /// Load a profile, posts, and timeline ids from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_fixture_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| XrError::path_error("read fixture", path, e))?;
        let fixture: Fixture = serde_json::from_str(&content)?;
        let channel = Self::new(fixture.profile);
        for post in fixture.posts {
            channel.add_post(post);
        }
        channel.state.lock().timeline = fixture.timeline;
        Ok(channel)
    }

    pub fn add_post(&self, post: CandidatePost) {
        self.state.lock().posts.insert(post.id.clone(), post);
    }

    /// Add a post and put it on the home timeline.
    pub fn add_timeline_post(&self, post: CandidatePost) {
        let mut state = self.state.lock();
        state.timeline.push(post.id.clone());
        state.posts.insert(post.id.clone(), post);
    }

    /// Make lookups of `id` fail with a transient error.
    pub fn fail_lookup(&self, id: impl Into<String>) {
        self.state.lock().failing_lookups.insert(id.into());
    }

    /// Make searches for exactly `query` fail with a transient error.
    pub fn fail_search(&self, query: impl Into<String>) {
        self.state.lock().failing_searches.insert(query.into());
    }

    #[must_use]
    pub fn published(&self) -> Vec<Published> {
        self.state.lock().published.clone()
    }

    #[must_use]
    pub fn likes(&self) -> Vec<String> {
        self.state.lock().likes.clone()
    }

    #[must_use]
    pub fn retweets(&self) -> Vec<String> {
        self.state.lock().retweets.clone()
    }

    #[must_use]
    pub fn search_calls(&self) -> usize {
        self.state.lock().search_calls
    }

    fn publish(&self, text: &str, in_reply_to: Option<&str>, quote_of: Option<&str>) -> PostedPost {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id.to_string();
        let conversation_id = in_reply_to
            .and_then(|parent| state.posts.get(parent))
            .map_or_else(|| id.clone(), |parent| parent.conversation_id.clone());

        let mut post = CandidatePost::new(&id, &self.profile.id, &self.profile.handle, text)
            .with_conversation(conversation_id);
        post.author_name = Some(self.profile.name.clone());
        post.permanent_url = Some(permanent_url(&self.profile.handle, &id));
        if let Some(parent) = in_reply_to {
            post = post.replying_to(parent);
        }
        state.posts.insert(id.clone(), post);
        state.published.push(Published {
            id: id.clone(),
            text: text.to_string(),
            in_reply_to: in_reply_to.map(str::to_string),
            quote_of: quote_of.map(str::to_string),
        });

        PostedPost {
            permanent_url: permanent_url(&self.profile.handle, &id),
            raw: json!({ "id": id, "text": text }),
            id,
        }
    }
}

#[async_trait]
impl SocialChannel for InMemoryChannel {
    async fn profile(&self) -> Result<Profile> {
        Ok(self.profile.clone())
    }

    /// Supports `@handle` (mention text match) and `from:handle` queries.
    async fn search(
        &self,
        query: &str,
        count: usize,
        _mode: SearchMode,
    ) -> Result<Vec<CandidatePost>> {
        let mut state = self.state.lock();
        state.search_calls += 1;
        if state.failing_searches.contains(query) {
            return Err(XrError::transient("search", format!("simulated failure for {query}")));
        }

        let query_lower = query.to_lowercase();
        let mut hits: Vec<CandidatePost> = state
            .posts
            .values()
            .filter(|post| {
                query_lower.strip_prefix("from:").map_or_else(
                    || post.text.to_lowercase().contains(&query_lower),
                    |handle| post.author_handle.eq_ignore_ascii_case(handle),
                )
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| compare_post_ids(&b.id, &a.id));
        hits.truncate(count);
        Ok(hits)
    }

    async fn fetch_timeline(&self, count: usize) -> Result<Vec<CandidatePost>> {
        let state = self.state.lock();
        Ok(state
            .timeline
            .iter()
            .rev()
            .filter_map(|id| state.posts.get(id).cloned())
            .take(count)
            .collect())
    }

    async fn get_post(&self, id: &str) -> Result<Option<CandidatePost>> {
        let state = self.state.lock();
        if state.failing_lookups.contains(id) {
            return Err(XrError::transient("get_post", format!("simulated failure for {id}")));
        }
        Ok(state.posts.get(id).cloned())
    }

    async fn post_reply(&self, text: &str, in_reply_to: &str) -> Result<PostedPost> {
        Ok(self.publish(text, Some(in_reply_to), None))
    }

    async fn post_quote(&self, text: &str, quoted_id: &str) -> Result<PostedPost> {
        Ok(self.publish(text, None, Some(quoted_id)))
    }

    async fn post_original(&self, text: &str) -> Result<PostedPost> {
        Ok(self.publish(text, None, None))
    }

    async fn like(&self, id: &str) -> Result<()> {
        self.state.lock().likes.push(id.to_string());
        Ok(())
    }

    async fn retweet(&self, id: &str) -> Result<()> {
        self.state.lock().retweets.push(id.to_string());
        Ok(())
    }
}
