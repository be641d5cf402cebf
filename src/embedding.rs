//! Embedding providers for semantic product search.
//!
//! - **`disabled`** ([`DisabledEmbedder`]): every call fails.
//! - **`openai`** ([`OpenAiEmbedder`]): any OpenAI-compatible `/embeddings`
//!   endpoint, batched, with the same retry strategy as text generation
//!   (429 and 5xx and network errors retried with exponential backoff,
//!   other 4xx fail immediately).

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;

/// Turns text into vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn is_enabled(&self) -> bool;

    fn model_name(&self) -> &str;

    /// Vector length, 0 when disabled.
    fn dims(&self) -> usize;

    /// One vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Empty embedding response"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn is_enabled(&self) -> bool {
        false
    }

    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("embeddings are disabled (embedding.provider = \"disabled\")")
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

/// Client for an OpenAI-compatible embeddings endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dims: usize,
    max_retries: u32,
    backoff: Duration,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| anyhow!("embedding.model required"))?;
        let dims = config
            .dims
            .filter(|d| *d > 0)
            .ok_or_else(|| anyhow!("embedding.dims required"))?;

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
            dims,
            max_retries: config.max_retries,
            backoff: Duration::from_secs(1),
        })
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/embeddings", self.base_url)
    }

    fn into_vectors(&self, response: EmbeddingResponse, expected: usize) -> Result<Vec<Vec<f32>>> {
        let mut items = response.data;
        if items.len() != expected {
            bail!(
                "Embedding response has {} vectors for {} inputs",
                items.len(),
                expected
            );
        }
        items.sort_by_key(|item| item.index.unwrap_or(usize::MAX));

        let vectors: Vec<Vec<f32>> = items.into_iter().map(|item| item.embedding).collect();
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dims) {
            bail!(
                "Embedding has {} dimensions, expected {} (embedding.dims)",
                bad.len(),
                self.dims
            );
        }
        Ok(vectors)
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn is_enabled(&self) -> bool {
        true
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.backoff * (1u32 << (attempt - 1).min(5));
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying embedding");
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
                        let parsed: EmbeddingResponse = response
                            .json()
                            .await
                            .context("Failed to parse embedding response")?;
                        return self.into_vectors(parsed, texts.len());
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(anyhow!("Embedding API error {}: {}", status, body_text));
                        continue;
                    }

                    bail!("Embedding API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("Embedding failed after retries")))
    }
}

/// Instantiate the provider named in `[embedding]`.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
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
    }

    /// Answers each input with `[len, index, 1]`, listed in reverse order.
    async fn embeddings(
        State(mock): State<Mock>,
        Json(body): Json<serde_json::Value>,
    ) -> (StatusCode, Json<serde_json::Value>) {
        let n = mock.calls.fetch_add(1, Ordering::SeqCst);
        if n < mock.failures {
            return (mock.fail_status, Json(serde_json::json!({"error": "nope"})));
        }
        let inputs = body["input"].as_array().cloned().unwrap_or_default();
        let data: Vec<serde_json::Value> = inputs
            .iter()
            .enumerate()
            .rev()
            .map(|(i, text)| {
                let len = text.as_str().map_or(0, str::len) as f32;
                serde_json::json!({"index": i, "embedding": [len, i as f32, 1.0]})
            })
            .collect();
        (StatusCode::OK, Json(serde_json::json!({ "data": data })))
    }

    async fn serve(failures: usize, fail_status: StatusCode) -> (String, Mock) {
        let mock = Mock {
            calls: Arc::new(AtomicUsize::new(0)),
            failures,
            fail_status,
        };
        let app = Router::new()
            .route("/v1/embeddings", post(embeddings))
            .with_state(mock.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/v1", addr), mock)
    }

    fn embedder(base_url: &str, dims: usize) -> OpenAiEmbedder {
        let config = EmbeddingConfig {
            provider: "openai".into(),
            model: Some("test-embed".into()),
            dims: Some(dims),
            base_url: base_url.into(),
            api_key_env: "SHELFWISE_TEST_UNSET_KEY".into(),
            max_retries: 2,
            ..EmbeddingConfig::default()
        };
        OpenAiEmbedder::new(&config)
            .unwrap()
            .with_api_key("sk-test")
            .with_backoff(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_disabled_embedder_errors() {
        let embedder = DisabledEmbedder;
        assert!(!embedder.is_enabled());
        assert!(embedder.embed_query("gin").await.is_err());
    }

    #[tokio::test]
    async fn test_vectors_follow_input_order() {
        let (url, _mock) = serve(0, StatusCode::OK).await;
        let texts = vec!["gin".to_string(), "vodka".to_string()];
        let vectors = embedder(&url, 3).embed(&texts).await.unwrap();
        assert_eq!(vectors, vec![vec![3.0, 0.0, 1.0], vec![5.0, 1.0, 1.0]]);
    }

    #[tokio::test]
    async fn test_wrong_dimensions_rejected() {
        let (url, _mock) = serve(0, StatusCode::OK).await;
        let err = embedder(&url, 1536).embed_query("gin").await.unwrap_err();
        assert!(err.to_string().contains("expected 1536"));
    }

    #[tokio::test]
    async fn test_rate_limits_are_retried() {
        let (url, mock) = serve(2, StatusCode::TOO_MANY_REQUESTS).await;
        assert!(embedder(&url, 3).embed_query("gin").await.is_ok());
        assert_eq!(mock.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_errors_fail_fast() {
        let (url, mock) = serve(10, StatusCode::UNAUTHORIZED).await;
        assert!(embedder(&url, 3).embed_query("gin").await.is_err());
        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_makes_no_request() {
        let (url, mock) = serve(0, StatusCode::OK).await;
        assert!(embedder(&url, 3).embed(&[]).await.unwrap().is_empty());
        assert_eq!(mock.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_create_embedder_rejects_unknown_provider() {
        let config = EmbeddingConfig {
            provider: "local".into(),
            ..EmbeddingConfig::default()
        };
        assert!(create_embedder(&config).is_err());
        assert!(!create_embedder(&EmbeddingConfig::default()).unwrap().is_enabled());
    }
}
