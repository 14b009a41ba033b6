//! Text-generation collaborator.
//!
//! [`TextGenerator`] is the only contract the pipeline has with a language
//! model: free-form generation, the respond/ignore/stop gate, and timeline
//! action selection. The gate and action methods have default
//! implementations that parse tagged output from `generate`.

use crate::error::{Result, XrError};
use crate::model::{ActionFlags, Decision, ModelClass};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

/// Produces text and decisions from a prompt context.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, context: &str, class: ModelClass) -> Result<String>;

    /// Respond/ignore/stop gate. Unparseable output is treated as `Ignore`.
    async fn decide(&self, context: &str) -> Result<Decision> {
        let text = self.generate(context, ModelClass::Small).await?;
        Ok(parse_decision(&text).unwrap_or_else(|| {
            warn!(output = %text, "no decision tag in output; ignoring");
            Decision::Ignore
        }))
    }

    /// Which timeline actions to take on a post.
    async fn decide_actions(&self, context: &str) -> Result<ActionFlags> {
        let text = self.generate(context, ModelClass::Small).await?;
        Ok(parse_action_flags(&text))
    }
}

/// Last `[RESPOND]`, `[IGNORE]`, or `[STOP]` tag in `text`.
#[must_use]
pub fn parse_decision(text: &str) -> Option<Decision> {
    let upper = text.to_uppercase();
    [Decision::Respond, Decision::Ignore, Decision::Stop]
        .into_iter()
        .filter_map(|decision| {
            upper
                .rfind(&format!("[{}]", decision.as_str()))
                .map(|pos| (pos, decision))
        })
        .max_by_key(|(pos, _)| *pos)
        .map(|(_, decision)| decision)
        .or_else(|| upper.trim().trim_matches(['[', ']', '.']).parse().ok())
}

/// Action tags present anywhere in `text`.
#[must_use]
pub fn parse_action_flags(text: &str) -> ActionFlags {
    let upper = text.to_uppercase();
    ActionFlags {
        like: upper.contains("[LIKE]"),
        retweet: upper.contains("[RETWEET]"),
        quote: upper.contains("[QUOTE]"),
        reply: upper.contains("[REPLY]"),
    }
}

/// OpenAI-compatible chat completions client.
#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
    small_model: String,
    large_model: String,
    temperature: f32,
}

impl OpenAiGenerator {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        small_model: impl Into<String>,
        large_model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key,
            small_model: small_model.into(),
            large_model: large_model.into(),
            temperature: 0.7,
        })
    }

    #[must_use]
    pub const fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn model_for(&self, class: ModelClass) -> &str {
        match class {
            ModelClass::Small => &self.small_model,
            ModelClass::Medium | ModelClass::Large => &self.large_model,
        }
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    async fn generate(&self, context: &str, class: ModelClass) -> Result<String> {
        let model = self.model_for(class);
        let body = json!({
            "model": model,
            "messages": [{"role": "user", "content": context}],
            "temperature": self.temperature,
        });

        let mut req = self
            .http
            .post(format!("{}/v1/chat/completions", self.endpoint))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(XrError::Api {
                service: "llm",
                status: status.as_u16(),
                body,
            });
        }

        let payload: serde_json::Value = response.json().await?;
        let text = payload
            .pointer("/choices/0/message/content")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| XrError::malformed("completion has no message content"))?;
        debug!(model, chars = text.len(), "generated text");
        Ok(text.to_string())
    }
}
