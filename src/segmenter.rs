//! Client contract for the external document-segmentation service.
//!
//! The service receives a fetchable file URL, runs OCR/layout analysis out
//! of process, and exposes an async task API: submit, then poll until the
//! task completes. This crate never drives the chunking itself; it only
//! consumes the task status and the produced segments.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::config::IngestConfig;
use crate::error::{AppError, Result};
use crate::models::BoundingBox;

/// Environment variable holding the segmenter API key.
const SEGMENTER_API_KEY_ENV: &str = "FACTWEAVE_SEGMENTER_API_KEY";

const SERVICE: &str = "segmenter";

/// One positioned text segment produced by the segmenter, flattened out of
/// its parent chunk.
#[derive(Debug, Clone)]
pub struct Segment {
    pub chunk_index: i64,
    pub chunk_id: Option<String>,
    pub segment_id: Option<String>,
    pub page_number: Option<i64>,
    pub page_width: Option<f64>,
    pub page_height: Option<f64>,
    pub bbox: Option<BoundingBox>,
    pub content: String,
    pub embed_text: String,
}

/// Observed state of a segmentation task.
#[derive(Debug)]
pub enum TaskState {
    Processing,
    Succeeded(Vec<Segment>),
    Failed(String),
}

/// Contract for segmentation backends.
#[async_trait]
pub trait Segmenter: Send + Sync {
    /// Submit a file for segmentation; returns the task id.
    async fn submit(&self, file_url: &str) -> Result<String>;

    /// Fetch the current state of a task.
    async fn poll(&self, task_id: &str) -> Result<TaskState>;
}

// ============ Wire types ============

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    chunks: Vec<ChunkResponse>,
}

#[derive(Debug, Deserialize)]
struct ChunkResponse {
    #[serde(default)]
    chunk_id: Option<String>,
    #[serde(default)]
    segments: Vec<SegmentResponse>,
}

#[derive(Debug, Deserialize)]
struct SegmentResponse {
    #[serde(default)]
    segment_id: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    embed: Option<String>,
    #[serde(default)]
    page_number: Option<i64>,
    #[serde(default)]
    page_width: Option<f64>,
    #[serde(default)]
    page_height: Option<f64>,
    #[serde(default)]
    bbox: Option<BoundingBox>,
}

// ============ HTTP client ============

/// HTTP segmenter client.
pub struct HttpSegmenter {
    client: reqwest::Client,
    config: IngestConfig,
    api_key: Option<String>,
}

impl HttpSegmenter {
    pub fn new(config: IngestConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| AppError::internal(format!("failed to create HTTP client: {e}")))?;

        let api_key = std::env::var(SEGMENTER_API_KEY_ENV)
            .ok()
            .filter(|k| !k.is_empty());

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {key}")),
            None => builder,
        }
    }
}

#[async_trait]
impl Segmenter for HttpSegmenter {
    async fn submit(&self, file_url: &str) -> Result<String> {
        let url = format!(
            "{}/tasks",
            self.config.segmenter_base_url.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "file": file_url,
            "target_tokens": self.config.target_tokens,
        });

        let response = self
            .authorize(self.client.post(&url).json(&body))
            .send()
            .await
            .map_err(|e| AppError::external(SERVICE, format!("submit failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::external(
                SERVICE,
                format!("submit returned {status}: {text}"),
            ));
        }

        let parsed: SubmitResponse = response
            .json()
            .await
            .map_err(|e| AppError::external(SERVICE, format!("unparseable submit response: {e}")))?;
        Ok(parsed.task_id)
    }

    async fn poll(&self, task_id: &str) -> Result<TaskState> {
        let url = format!(
            "{}/tasks/{task_id}",
            self.config.segmenter_base_url.trim_end_matches('/')
        );

        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| AppError::external(SERVICE, format!("poll failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::external(
                SERVICE,
                format!("poll returned {status}: {text}"),
            ));
        }

        let parsed: TaskResponse = response
            .json()
            .await
            .map_err(|e| AppError::external(SERVICE, format!("unparseable task response: {e}")))?;

        match parsed.status.as_str() {
            "succeeded" => Ok(TaskState::Succeeded(flatten_segments(parsed.chunks))),
            "failed" => Ok(TaskState::Failed(
                parsed.message.unwrap_or_else(|| "segmentation failed".to_string()),
            )),
            _ => Ok(TaskState::Processing),
        }
    }
}

/// Flatten chunk→segment nesting into one segment list, skipping segments
/// with no embeddable text.
fn flatten_segments(chunks: Vec<ChunkResponse>) -> Vec<Segment> {
    chunks
        .into_iter()
        .enumerate()
        .flat_map(|(chunk_index, chunk)| {
            let chunk_id = chunk.chunk_id.clone();
            chunk.segments.into_iter().map(move |segment| {
                let content = segment
                    .content
                    .clone()
                    .or_else(|| segment.text.clone())
                    .or_else(|| segment.embed.clone())
                    .unwrap_or_default();
                let embed_text = segment
                    .embed
                    .clone()
                    .or_else(|| segment.content.clone())
                    .or_else(|| segment.text.clone())
                    .unwrap_or_default();
                Segment {
                    chunk_index: chunk_index as i64,
                    chunk_id: chunk_id.clone(),
                    segment_id: segment.segment_id,
                    page_number: segment.page_number,
                    page_width: segment.page_width,
                    page_height: segment.page_height,
                    bbox: segment.bbox,
                    content,
                    embed_text,
                }
            })
        })
        .filter(|segment| !segment.embed_text.trim().is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_prefers_content_then_text_then_embed() {
        let chunks = vec![ChunkResponse {
            chunk_id: Some("c0".into()),
            segments: vec![
                SegmentResponse {
                    segment_id: Some("s0".into()),
                    content: Some("full content".into()),
                    text: Some("plain".into()),
                    embed: Some("embed text".into()),
                    page_number: Some(1),
                    page_width: None,
                    page_height: None,
                    bbox: None,
                },
                SegmentResponse {
                    segment_id: Some("s1".into()),
                    content: None,
                    text: Some("text only".into()),
                    embed: None,
                    page_number: None,
                    page_width: None,
                    page_height: None,
                    bbox: None,
                },
            ],
        }];

        let segments = flatten_segments(chunks);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].content, "full content");
        assert_eq!(segments[0].embed_text, "embed text");
        assert_eq!(segments[1].content, "text only");
        assert_eq!(segments[1].embed_text, "text only");
        assert_eq!(segments[1].chunk_index, 0);
    }

    #[test]
    fn test_flatten_skips_empty_segments() {
        let chunks = vec![ChunkResponse {
            chunk_id: None,
            segments: vec![SegmentResponse {
                segment_id: None,
                content: Some("   ".into()),
                text: None,
                embed: None,
                page_number: None,
                page_width: None,
                page_height: None,
                bbox: None,
            }],
        }];
        assert!(flatten_segments(chunks).is_empty());
    }
}
