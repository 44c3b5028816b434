//! Embedding model abstraction and vector utilities.
//!
//! Defines the [`EmbeddingModel`] trait and the [`RemoteEmbedder`]
//! implementation for OpenAI-compatible embeddings endpoints, with
//! batching, retry, and backoff. The same model instance serves
//! ingestion-time and query-time embedding, so dimensionality is checked
//! on every response and a mismatch fails fast as a configuration error.
//!
//! Also provides vector utilities for BLOB-backed storage:
//! - [`vec_to_blob`] — encode a `Vec<f32>` as little-endian bytes
//! - [`blob_to_vec`] — decode a BLOB back into a `Vec<f32>`
//! - [`cosine_similarity`] — similarity between two embedding vectors
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use async_trait::async_trait;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{AppError, Result};

/// Environment variable holding the embeddings API key.
const EMBEDDING_API_KEY_ENV: &str = "FACTWEAVE_EMBEDDING_API_KEY";

const SERVICE: &str = "embedding model";

/// Contract for embedding backends.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Fixed vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;

    /// Embed a single query text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts, returning vectors in input order.
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embedding client for OpenAI-compatible `POST /embeddings` endpoints.
pub struct RemoteEmbedder {
    client: reqwest::Client,
    config: EmbeddingConfig,
    api_key: Option<String>,
}

impl RemoteEmbedder {
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::internal(format!("failed to create HTTP client: {e}")))?;

        let api_key = std::env::var(EMBEDDING_API_KEY_ENV)
            .ok()
            .filter(|k| !k.is_empty());

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    async fn request_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.config.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut request = self
                .client
                .post(format!(
                    "{}/embeddings",
                    self.config.base_url.trim_end_matches('/')
                ))
                .header("Content-Type", "application/json")
                .json(&body);
            if let Some(ref key) = self.api_key {
                request = request.header("Authorization", format!("Bearer {key}"));
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await.map_err(|e| {
                            AppError::external(SERVICE, format!("failed to read response: {e}"))
                        })?;
                        let vectors = parse_embeddings_response(&json)?;
                        return self.check_dims(vectors);
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(AppError::external(
                            SERVICE,
                            format!("API error {status}: {body_text}"),
                        ));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(AppError::external(
                        SERVICE,
                        format!("API error {status}: {body_text}"),
                    ));
                }
                Err(e) => {
                    last_err = Some(AppError::external(SERVICE, format!("request failed: {e}")));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| AppError::external(SERVICE, "embedding failed after retries")))
    }

    /// Every returned vector must match the configured dimensionality;
    /// anything else means ingestion-time and query-time embeddings would
    /// disagree, which must never be handled silently.
    fn check_dims(&self, vectors: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        for vector in &vectors {
            if vector.len() != self.config.dims {
                return Err(AppError::Config(format!(
                    "embedding dimensionality mismatch: model '{}' returned {} dims, configured {}",
                    self.config.model,
                    vector.len(),
                    self.config.dims
                )));
            }
        }
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingModel for RemoteEmbedder {
    fn dims(&self) -> usize {
        self.config.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let results = self.embed_many(&[text.to_string()]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| AppError::external(SERVICE, "empty embedding response"))
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.batch_size.max(1)) {
            let vectors = self.request_embeddings(batch).await?;
            if vectors.len() != batch.len() {
                return Err(AppError::external(
                    SERVICE,
                    format!(
                        "embedding count mismatch: sent {}, received {}",
                        batch.len(),
                        vectors.len()
                    ),
                ));
            }
            all.extend(vectors);
        }
        Ok(all)
    }
}

/// Parse the embeddings API response, preserving input order.
fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| AppError::external(SERVICE, "invalid response: missing data array"))?;

    let mut embeddings = Vec::with_capacity(data.len());

    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| AppError::external(SERVICE, "invalid response: missing embedding"))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        embeddings.push(vec);
    }

    Ok(embeddings)
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`; `0.0` for empty vectors or vectors of
/// different lengths.
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
