use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

const INPUT_MAX_CHARS: usize = 8000;
const ATTEMPTS: u32 = 3;
const RETRY_SLEEP: Duration = Duration::from_secs(2);
const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/embeddings";

/// Single-call vectorizer. The bounded in-call retry loop is internal;
/// callers only ever see success or `None`, never an error to classify.
#[async_trait]
pub trait Embed: Send + Sync {
    async fn embed(&self, text: &str) -> Option<Vec<f32>>;
}

pub struct OpenAiEmbedder {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key,
            model,
        }
    }

    /// Point at a non-default endpoint (proxies, test servers).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn call_once(&self, input: &str) -> Result<Vec<f32>, String> {
        let body = serde_json::json!({ "model": self.model, "input": input });
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("transport: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {}", status.as_u16()));
        }
        let parsed: EmbeddingResponse =
            response.json().await.map_err(|e| format!("decode: {e}"))?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|row| row.embedding)
            .ok_or_else(|| "empty embedding response".to_string())
    }
}

#[async_trait]
impl Embed for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let input: String = text.trim().chars().take(INPUT_MAX_CHARS).collect();
        if input.is_empty() {
            tracing::warn!("refusing to embed empty input");
            return None;
        }

        for attempt in 1..=ATTEMPTS {
            match self.call_once(&input).await {
                Ok(vector) => return Some(vector),
                Err(reason) => {
                    tracing::warn!(attempt, error = %reason, "embedding call failed");
                    if attempt < ATTEMPTS {
                        tokio::time::sleep(RETRY_SLEEP).await;
                    }
                }
            }
        }
        None
    }
}
