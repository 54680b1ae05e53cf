//! Embedding provider abstraction and the OpenAI-compatible implementation.
//!
//! [`EmbeddingProvider`] is the seam between the pipeline and the network:
//! batches of chunk text go in, dense float vectors come out. The default
//! [`OpenAiProvider`] posts to an OpenAI-compatible `/embeddings` endpoint
//! with typed rate-limit handling and bounded exponential backoff.
//!
//! Also provides the vector utilities used by the index:
//! - [`vec_to_blob`] / [`blob_to_vec`] — fixed-width little-endian f32
//!   serialization for SQLite BLOB storage (round-trip exact)
//! - [`cosine_similarity`] — similarity between two embedding vectors
//!
//! # Failure semantics
//!
//! - HTTP 429 raises [`Error::RateLimit`], honoring a `Retry-After` header
//!   when present, otherwise backing off 1s, 2s, 4s … capped at the
//!   configured ceiling. Exhausting the attempt budget propagates the typed
//!   rate-limit error — never a silently empty result.
//! - A payload wrapped in extraneous formatting (e.g. a Markdown code
//!   fence) is unwrapped leniently once; persistent parse failure raises
//!   [`Error::Provider`].
//! - Every call logs model, batch size, duration, and outcome.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

/// Result of one batched embedding call.
#[derive(Debug, Clone)]
pub struct EmbeddingBatch {
    /// One vector per input text, in input order.
    pub vectors: Vec<Vec<f32>>,
    pub dims: usize,
    /// Token usage reported by the provider, when available.
    pub total_tokens: Option<u64>,
}

/// Interface all embedding backends implement.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider identifier recorded alongside stored vectors.
    fn provider_name(&self) -> &str;
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Vector dimensionality.
    fn dims(&self) -> usize;

    /// Embed a batch of texts.
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch>;

    /// Embed a single text (query-time convenience).
    async fn embed_single(&self, text: &str) -> Result<Vec<f32>> {
        let batch = self.embed(std::slice::from_ref(&text.to_string())).await?;
        batch
            .vectors
            .into_iter()
            .next()
            .ok_or_else(|| Error::Provider("empty embedding response".into()))
    }
}

/// Instantiate the provider named in the configuration.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiProvider::new(config)?)),
        "disabled" => Ok(Arc::new(DisabledProvider)),
        other => Err(Error::Provider(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

/// Placeholder provider used when embeddings are not configured. Every
/// call fails with a descriptive error.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn provider_name(&self) -> &str {
        "disabled"
    }
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }

    async fn embed(&self, _texts: &[String]) -> Result<EmbeddingBatch> {
        Err(Error::Provider(
            "embedding provider is disabled; set [embedding] provider in config".into(),
        ))
    }
}

/// Provider for OpenAI-compatible embedding APIs.
///
/// Requires `OPENAI_API_KEY` in the environment. The endpoint base is
/// configurable so self-hosted compatible services (and tests) can be
/// pointed at directly.
pub struct OpenAiProvider {
    client: reqwest::Client,
    model: String,
    dims: usize,
    base_url: String,
    api_key: String,
    max_retries: u32,
    max_backoff: Duration,
}

impl OpenAiProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| Error::Provider("embedding.model required for openai provider".into()))?;
        let dims = config
            .dims
            .ok_or_else(|| Error::Provider("embedding.dims required for openai provider".into()))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::Provider("OPENAI_API_KEY environment variable not set".into()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Provider(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            model,
            dims,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: config.max_retries.max(1),
            max_backoff: Duration::from_secs(config.max_backoff_secs),
        })
    }

    async fn call(&self, texts: &[String]) -> Result<EmbeddingBatch> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("embedding request failed: {}", e)))?;

        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(Error::RateLimit { retry_after });
        }

        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(Error::Provider(format!(
                "embedding API error {}: {}",
                status, body_text
            )));
        }

        let body_text = response
            .text()
            .await
            .map_err(|e| Error::Provider(format!("failed to read response body: {}", e)))?;
        let json = parse_lenient(&body_text)?;
        parse_embeddings(&json, texts.len(), self.dims)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    fn provider_name(&self) -> &str {
        "openai"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch> {
        if texts.is_empty() {
            return Ok(EmbeddingBatch {
                vectors: Vec::new(),
                dims: self.dims,
                total_tokens: Some(0),
            });
        }

        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self.call(texts).await {
                Ok(batch) => {
                    tracing::info!(
                        model = %self.model,
                        batch = texts.len(),
                        duration_ms = started.elapsed().as_millis() as u64,
                        attempt,
                        "embedding call succeeded"
                    );
                    return Ok(batch);
                }
                Err(Error::RateLimit { retry_after }) if attempt < self.max_retries => {
                    // Exponential backoff: 1s, 2s, 4s, ... capped; a
                    // provider-suggested delay wins when present.
                    let delay = retry_after
                        .unwrap_or_else(|| Duration::from_secs(1 << (attempt - 1).min(16)))
                        .min(self.max_backoff);
                    tracing::warn!(
                        model = %self.model,
                        attempt,
                        delay_secs = delay.as_secs(),
                        "rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    tracing::error!(
                        model = %self.model,
                        batch = texts.len(),
                        duration_ms = started.elapsed().as_millis() as u64,
                        attempt,
                        error = %err,
                        "embedding call failed"
                    );
                    return Err(err);
                }
            }
        }
    }
}

/// Parse a response body, unwrapping one layer of extraneous formatting
/// (a Markdown code fence) before giving up.
fn parse_lenient(body: &str) -> Result<serde_json::Value> {
    if let Ok(json) = serde_json::from_str(body) {
        return Ok(json);
    }
    let unwrapped = strip_code_fence(body);
    if unwrapped != body {
        if let Ok(json) = serde_json::from_str(unwrapped) {
            tracing::warn!("embedding response was fence-wrapped; unwrapped leniently");
            return Ok(json);
        }
    }
    Err(Error::Provider(format!(
        "unparseable embedding response: {}",
        truncate(body, 200)
    )))
}

/// Strip a surrounding ``` fence (with optional language tag) if present.
fn strip_code_fence(body: &str) -> &str {
    let trimmed = body.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return body;
    };
    let rest = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    rest.strip_suffix("```").map(str::trim).unwrap_or(body)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((pos, _)) => &s[..pos],
        None => s,
    }
}

/// Extract `data[].embedding` in input order, validating count and dims.
fn parse_embeddings(
    json: &serde_json::Value,
    expected_count: usize,
    expected_dims: usize,
) -> Result<EmbeddingBatch> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| Error::Provider("response missing data array".into()))?;

    if data.len() != expected_count {
        return Err(Error::Provider(format!(
            "expected {} embeddings, got {}",
            expected_count,
            data.len()
        )));
    }

    // The API is allowed to return entries out of order; restore input
    // order via the index field.
    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| Error::Provider("response entry missing embedding".into()))?;
        let vector: Vec<f32> = embedding
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| Error::Provider("non-numeric embedding value".into()))
            })
            .collect::<Result<_>>()?;
        if vector.len() != expected_dims {
            return Err(Error::Provider(format!(
                "expected {} dims, got {}",
                expected_dims,
                vector.len()
            )));
        }
        indexed.push((index, vector));
    }
    indexed.sort_by_key(|(i, _)| *i);

    let total_tokens = json
        .get("usage")
        .and_then(|u| u.get("total_tokens"))
        .and_then(|t| t.as_u64());

    Ok(EmbeddingBatch {
        vectors: indexed.into_iter().map(|(_, v)| v).collect(),
        dims: expected_dims,
        total_tokens,
    })
}

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for &value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`] back into floats.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`. Zero for empty or
/// mismatched-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_roundtrip_is_exact() {
        let vector = vec![1.0f32, -2.5, 3.125, 0.0, -0.001, f32::MIN_POSITIVE];
        let blob = vec_to_blob(&vector);
        assert_eq!(blob.len(), vector.len() * 4);
        assert_eq!(blob_to_vec(&blob), vector);
    }

    #[test]
    fn cosine_identical_orthogonal_opposite() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        let c = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
        assert!((cosine_similarity(&a, &c) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn parse_lenient_accepts_plain_json() {
        let json = parse_lenient(r#"{"data": []}"#).unwrap();
        assert!(json.get("data").is_some());
    }

    #[test]
    fn parse_lenient_unwraps_code_fence() {
        let body = "```json\n{\"data\": []}\n```";
        let json = parse_lenient(body).unwrap();
        assert!(json.get("data").is_some());
    }

    #[test]
    fn parse_lenient_rejects_garbage() {
        let err = parse_lenient("definitely not json").unwrap_err();
        assert_eq!(err.code(), "provider_error");
    }

    #[test]
    fn parse_embeddings_restores_input_order() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]},
            ],
            "usage": {"total_tokens": 7}
        });
        let batch = parse_embeddings(&json, 2, 2).unwrap();
        assert_eq!(batch.vectors[0], vec![1.0, 0.0]);
        assert_eq!(batch.vectors[1], vec![0.0, 1.0]);
        assert_eq!(batch.total_tokens, Some(7));
    }

    #[test]
    fn parse_embeddings_rejects_wrong_dims() {
        let json = serde_json::json!({
            "data": [{"index": 0, "embedding": [1.0, 0.0, 0.0]}]
        });
        assert!(parse_embeddings(&json, 1, 2).is_err());
    }

    #[test]
    fn parse_embeddings_rejects_count_mismatch() {
        let json = serde_json::json!({"data": []});
        assert!(parse_embeddings(&json, 2, 2).is_err());
    }
}
