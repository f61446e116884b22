//! Response generation
//!
//! The [`ResponseDispatcher`] wraps an external [`ResponseGenerator`] with a
//! per-attempt timeout and bounded retries. It never fails: when every
//! attempt is exhausted the configured fallback text is returned so the
//! voice pipeline always has something to say.

pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

pub use retry::RetryPolicy;

use crate::config::LlmConfig;
use crate::context::ConversationContext;
use crate::session::TurnRole;
use crate::{Error, Result};

/// External text response generator
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Produce a reply to `user_text` given prior conversation
    async fn generate(&self, context: &ConversationContext, user_text: &str) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible `/chat/completions` client
pub struct HttpResponseGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
    system_prompt: String,
    max_tokens: u32,
}

impl HttpResponseGenerator {
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            endpoint: format!(
                "{}/chat/completions",
                config.base_url.trim_end_matches('/')
            ),
            api_key: config
                .api_key
                .as_ref()
                .map(|k| SecretString::from(k.expose_secret().to_owned())),
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl ResponseGenerator for HttpResponseGenerator {
    async fn generate(&self, context: &ConversationContext, user_text: &str) -> Result<String> {
        let mut messages = Vec::with_capacity(context.turns.len() + 2);
        if !self.system_prompt.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: &self.system_prompt,
            });
        }
        messages.extend(context.turns.iter().map(|turn| ChatMessage {
            role: match turn.role {
                TurnRole::User => "user",
                TurnRole::Assistant => "assistant",
            },
            content: &turn.text,
        }));
        messages.push(ChatMessage {
            role: "user",
            content: user_text,
        });

        let body = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: self.max_tokens,
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "LLM API error");
            if retry::is_recoverable_status(status.as_u16()) {
                return Err(Error::Overloaded(format!("LLM API {status}")));
            }
            return Err(Error::Llm(format!("LLM API error {status}: {body}")));
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| Error::Llm("empty completion".to_string()))
    }
}

/// Timeout, retry and fallback around a [`ResponseGenerator`]
pub struct ResponseDispatcher {
    engine: Arc<dyn ResponseGenerator>,
    timeout: Duration,
    policy: RetryPolicy,
    fallback_text: String,
}

impl ResponseDispatcher {
    #[must_use]
    pub fn new(
        engine: Arc<dyn ResponseGenerator>,
        timeout: Duration,
        policy: RetryPolicy,
        fallback_text: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            timeout,
            policy,
            fallback_text: fallback_text.into(),
        }
    }

    /// Build from config with the HTTP engine
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        Ok(Self::new(
            Arc::new(HttpResponseGenerator::new(config)?),
            config.timeout,
            RetryPolicy::with_retries(config.retries),
            config.fallback_text.clone(),
        ))
    }

    /// Produce a reply, falling back to the designated text on failure
    pub async fn generate(&self, context: &ConversationContext, user_text: &str) -> String {
        match self.try_generate(context, user_text).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "response generation failed, using fallback");
                self.fallback_text.clone()
            }
        }
    }

    /// Produce a reply, surfacing the last error instead of the fallback
    ///
    /// # Errors
    ///
    /// Returns the last attempt's error once retries are exhausted, or
    /// immediately for errors that are not retryable
    pub async fn try_generate(&self, context: &ConversationContext, user_text: &str) -> Result<String> {
        let mut attempt = 0;
        loop {
            let result = tokio::time::timeout(self.timeout, self.engine.generate(context, user_text))
                .await
                .unwrap_or_else(|_| {
                    Err(Error::Timeout(format!(
                        "response generator after {:?}",
                        self.timeout
                    )))
                });

            match result {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() && attempt < self.policy.max_retries => {
                    let delay = retry::delay_for_attempt(&self.policy, attempt);
                    tracing::debug!(attempt, error = %e, ?delay, "retrying response generation");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[must_use]
    pub fn fallback_text(&self) -> &str {
        &self.fallback_text
    }
}
