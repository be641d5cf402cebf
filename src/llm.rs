//! Text generation providers.
//!
//! Handlers that need free text (general chat, SQL drafting) go through the
//! [`TextGenerator`] trait. Two providers exist:
//!
//! - **`disabled`** ([`DisabledGenerator`]): every call fails, so the
//!   dispatcher moves on to the next candidate.
//! - **`openai`** ([`OpenAiGenerator`]): any OpenAI-compatible
//!   `/chat/completions` endpoint.
//!
//! # Retry Strategy
//!
//! The OpenAI provider uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use shelfwise_core::models::Turn;

use crate::config::LlmConfig;

/// System instruction sent ahead of every conversation.
pub const ASSISTANT_PROMPT: &str = "You are an inventory assistant. Be concise and factual. \
Use the provided context to answer the user and say 'I don't know' if unsure.";

/// An opaque `generate` capability.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Produce a completion for `prompt` after `history`.
    ///
    /// `context` is extra system text, e.g. a schema description.
    async fn generate(&self, prompt: &str, history: &[Turn], context: Option<&str>) -> Result<String>;
}

/// Stand-in used when no provider is configured.
#[derive(Debug, Clone, Default)]
pub struct DisabledGenerator;

#[async_trait]
impl TextGenerator for DisabledGenerator {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn generate(&self, _prompt: &str, _history: &[Turn], _context: Option<&str>) -> Result<String> {
        bail!("text generation is disabled (llm.provider = \"disabled\")")
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Client for an OpenAI-compatible chat completion endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f64,
    max_tokens: u32,
    max_retries: u32,
    backoff: Duration,
}

impl OpenAiGenerator {
    /// Build a client from `[llm]`. The API key is read from the configured
    /// environment variable; endpoints that need none may leave it unset.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| anyhow!("llm.model required"))?;

        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());
        if api_key.is_none() {
            warn!(env = %config.api_key_env, "no API key set; sending unauthenticated requests");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
            backoff: Duration::from_secs(1),
        })
    }

    /// Base delay before the first retry; doubles on every further attempt.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn messages(prompt: &str, history: &[Turn], context: Option<&str>) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage {
            role: "system".to_string(),
            content: ASSISTANT_PROMPT.to_string(),
        }];
        if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: context.to_string(),
            });
        }
        for turn in history {
            let role = if turn.role == "assistant" { "assistant" } else { "user" };
            messages.push(ChatMessage {
                role: role.to_string(),
                content: turn.text.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        });
        messages
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn generate(&self, prompt: &str, history: &[Turn], context: Option<&str>) -> Result<String> {
        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages: Self::messages(prompt, history, context),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1x, 2x, 4x, ... the base delay
                let delay = self.backoff * (1u32 << (attempt - 1).min(5));
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying completion");
                tokio::time::sleep(delay).await;
            }

            let mut request = self
                .client
                .post(self.endpoint())
                .header("Content-Type", "application/json");
            if let Some(key) = &self.api_key {
                request = request.header("Authorization", format!("Bearer {}", key));
            }

            match request.json(&body).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let completion: ChatCompletionResponse = response
                            .json()
                            .await
                            .context("Failed to parse completion response")?;
                        return completion
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.message.content)
                            .map(|text| text.trim().to_string())
                            .ok_or_else(|| anyhow!("Completion response had no content"));
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(anyhow!("LLM API error {}: {}", status, body_text));
                        continue;
                    }

                    bail!("LLM API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("Completion failed after retries")))
    }
}

/// Instantiate the provider named in `[llm]`.
pub fn create_generator(config: &LlmConfig) -> Result<Arc<dyn TextGenerator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "openai" => Ok(Arc::new(OpenAiGenerator::new(config)?)),
        other => bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct Mock {
        calls: Arc<AtomicUsize>,
        failures: usize,
        fail_status: StatusCode,
        seen: Arc<parking_lot::Mutex<Vec<serde_json::Value>>>,
    }

    async fn completions(
        State(mock): State<Mock>,
        Json(body): Json<serde_json::Value>,
    ) -> (StatusCode, Json<serde_json::Value>) {
        let n = mock.calls.fetch_add(1, Ordering::SeqCst);
        mock.seen.lock().push(body);
        if n < mock.failures {
            return (mock.fail_status, Json(serde_json::json!({"error": "nope"})));
        }
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "  We stock vodka.  "}}]
            })),
        )
    }

    async fn serve(failures: usize, fail_status: StatusCode) -> (String, Mock) {
        let mock = Mock {
            calls: Arc::new(AtomicUsize::new(0)),
            failures,
            fail_status,
            seen: Arc::new(parking_lot::Mutex::new(Vec::new())),
        };
        let app = Router::new()
            .route("/v1/chat/completions", post(completions))
            .with_state(mock.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/v1", addr), mock)
    }

    fn generator(base_url: &str) -> OpenAiGenerator {
        let config = LlmConfig {
            provider: "openai".into(),
            model: Some("test-model".into()),
            base_url: base_url.into(),
            api_key_env: "SHELFWISE_TEST_UNSET_KEY".into(),
            max_retries: 2,
            ..LlmConfig::default()
        };
        OpenAiGenerator::new(&config)
            .unwrap()
            .with_api_key("sk-test")
            .with_backoff(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_disabled_generator_errors() {
        let gen = DisabledGenerator;
        assert!(!gen.is_enabled());
        assert!(gen.generate("hi", &[], None).await.is_err());
    }

    #[tokio::test]
    async fn test_generate_sends_history_and_context() {
        let (url, mock) = serve(0, StatusCode::OK).await;
        let history = vec![Turn::user("hello"), Turn::assistant("hi there")];
        let text = generator(&url)
            .generate("any vodka?", &history, Some("schema: app_inventory"))
            .await
            .unwrap();
        assert_eq!(text, "We stock vodka.");

        let seen = mock.seen.lock();
        let messages = seen[0]["messages"].as_array().unwrap();
        let roles: Vec<&str> = messages.iter().map(|m| m["role"].as_str().unwrap()).collect();
        assert_eq!(roles, vec!["system", "system", "user", "assistant", "user"]);
        assert_eq!(messages[4]["content"], "any vodka?");
        assert_eq!(seen[0]["model"], "test-model");
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let (url, mock) = serve(2, StatusCode::SERVICE_UNAVAILABLE).await;
        let text = generator(&url).generate("q", &[], None).await.unwrap();
        assert_eq!(text, "We stock vodka.");
        assert_eq!(mock.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let (url, mock) = serve(10, StatusCode::TOO_MANY_REQUESTS).await;
        let err = generator(&url).generate("q", &[], None).await.unwrap_err();
        assert!(err.to_string().contains("429"));
        assert_eq!(mock.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_errors_fail_fast() {
        let (url, mock) = serve(10, StatusCode::BAD_REQUEST).await;
        assert!(generator(&url).generate("q", &[], None).await.is_err());
        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_create_generator_rejects_unknown_provider() {
        let config = LlmConfig {
            provider: "bedrock".into(),
            ..LlmConfig::default()
        };
        assert!(create_generator(&config).is_err());
        assert!(!create_generator(&LlmConfig::default()).unwrap().is_enabled());
    }
}
