//! Generation backend for any OpenAI-compatible chat completions endpoint
//! (Ollama, vLLM, cloud gateways).
//!
//! Structured calls use JSON output mode (`response_format: json_object`);
//! the schema itself is enforced by the caller's prompt plus local
//! decoding. Retries cover HTTP 429/5xx and connection errors with
//! exponential backoff; a started token stream is never retried, since the
//! client may already have consumed partial output.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};

use super::{
    sse_chunk_stream, ChatMessage, ChatRequest, ChatResponse, ChatStream, GenerationModel,
    StreamChunk,
};
use crate::config::LlmConfig;
use crate::error::{AppError, Result};

/// Environment variable holding the API key (optional; local servers are
/// typically keyless).
const LLM_API_KEY_ENV: &str = "FACTWEAVE_LLM_API_KEY";

const SERVICE: &str = "generation model";

// ============ API types ============

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

impl From<&ChatMessage> for ApiMessage {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            role: msg.role.as_str(),
            content: msg.content.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiStreamChunk {
    choices: Vec<ApiStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiStreamChoice {
    delta: ApiDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiDelta {
    #[serde(default)]
    content: Option<String>,
}

// ============ Client ============

/// Generation model client for OpenAI-compatible endpoints.
pub struct OpenAiCompatibleModel {
    client: reqwest::Client,
    config: LlmConfig,
    api_key: Option<String>,
}

impl OpenAiCompatibleModel {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::internal(format!("failed to create HTTP client: {e}")))?;

        let api_key = std::env::var(LLM_API_KEY_ENV).ok().filter(|k| !k.is_empty());

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            endpoint
        )
    }

    fn build_request(&self, request: &ChatRequest, stream: bool, json_mode: bool) -> ApiRequest {
        ApiRequest {
            model: self.config.model.clone(),
            messages: request.messages.iter().map(ApiMessage::from).collect(),
            temperature: request.temperature.or(Some(self.config.temperature)),
            max_tokens: request.max_tokens,
            stream: stream.then_some(true),
            response_format: json_mode.then(|| serde_json::json!({ "type": "json_object" })),
        }
    }

    fn add_auth_header(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {key}")),
            None => builder,
        }
    }

    /// Send a completion request with bounded retry.
    ///
    /// 429 and 5xx responses and connection errors retry with exponential
    /// backoff (1s, 2s, 4s, ... capped at 2^5); other 4xx fail immediately.
    async fn send_with_retry(&self, body: &ApiRequest) -> Result<reqwest::Response> {
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let http_request = self
                .client
                .post(self.api_url("chat/completions"))
                .header("Content-Type", "application/json")
                .json(body);

            match self.add_auth_header(http_request).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    let body_text = response.text().await.unwrap_or_default();
                    let err = AppError::external(
                        SERVICE,
                        format!("API error {status}: {}", truncate(&body_text, 300)),
                    );
                    if retryable {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    if e.is_connect() || e.is_timeout() {
                        last_err = Some(AppError::external(
                            SERVICE,
                            format!("cannot reach {}: {e}", self.config.base_url),
                        ));
                        continue;
                    }
                    return Err(AppError::external(SERVICE, format!("request failed: {e}")));
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| AppError::external(SERVICE, "completion failed after retries")))
    }

    async fn complete_text(&self, request: &ChatRequest, json_mode: bool) -> Result<ChatResponse> {
        let body = self.build_request(request, false, json_mode);
        debug!(
            model = %body.model,
            messages = body.messages.len(),
            json_mode,
            "sending completion request"
        );

        let response = self.send_with_retry(&body).await?;
        let text = response
            .text()
            .await
            .map_err(|e| AppError::external(SERVICE, format!("failed to read response: {e}")))?;

        let parsed: ApiResponse = serde_json::from_str(&text).map_err(|e| {
            error!("unparseable completion response: {e}");
            AppError::external(SERVICE, format!("failed to parse response: {e}"))
        })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AppError::external(SERVICE, "API returned no choices"))?;

        Ok(ChatResponse {
            content: choice.message.content.unwrap_or_default(),
            finish_reason: choice.finish_reason,
        })
    }
}

#[async_trait]
impl GenerationModel for OpenAiCompatibleModel {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.complete_text(request, false).await
    }

    async fn complete_stream(&self, request: &ChatRequest) -> Result<ChatStream> {
        let body = self.build_request(request, true, false);
        debug!(
            model = %body.model,
            messages = body.messages.len(),
            "opening streaming completion"
        );

        let response = self.send_with_retry(&body).await?;
        let byte_stream = response.bytes_stream().boxed();

        Ok(sse_chunk_stream(byte_stream, parse_stream_payload, SERVICE))
    }

    async fn complete_structured(&self, request: &ChatRequest) -> Result<serde_json::Value> {
        let response = self.complete_text(request, true).await?;
        let content = strip_code_fences(&response.content);
        serde_json::from_str(content).map_err(|e| {
            AppError::external(
                SERVICE,
                format!(
                    "structured output is not valid JSON: {e} ({})",
                    truncate(content, 200)
                ),
            )
        })
    }
}

/// Parse one `data:` payload from the completion stream.
fn parse_stream_payload(payload: &str) -> Option<Result<StreamChunk>> {
    let chunk: ApiStreamChunk = match serde_json::from_str(payload) {
        Ok(chunk) => chunk,
        Err(e) => {
            return Some(Err(AppError::external(
                SERVICE,
                format!("unparseable stream chunk: {e}"),
            )))
        }
    };

    let choice = chunk.choices.into_iter().next()?;
    let delta = choice.delta.content.unwrap_or_default();
    let is_final = choice.finish_reason.is_some();
    if delta.is_empty() && !is_final {
        return None;
    }
    Some(Ok(StreamChunk {
        delta,
        is_final,
        finish_reason: choice.finish_reason,
    }))
}

/// Some models wrap JSON-mode output in markdown fences despite the
/// response_format hint. Strip them before decoding.
fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
    }

    #[test]
    fn test_parse_stream_payload_delta() {
        let payload = r#"{"choices":[{"delta":{"content":"hi"},"finish_reason":null}]}"#;
        let chunk = parse_stream_payload(payload).unwrap().unwrap();
        assert_eq!(chunk.delta, "hi");
        assert!(!chunk.is_final);
    }

    #[test]
    fn test_parse_stream_payload_skips_empty_delta() {
        let payload = r#"{"choices":[{"delta":{},"finish_reason":null}]}"#;
        assert!(parse_stream_payload(payload).is_none());
    }

    #[test]
    fn test_parse_stream_payload_final() {
        let payload = r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        let chunk = parse_stream_payload(payload).unwrap().unwrap();
        assert!(chunk.is_final);
        assert_eq!(chunk.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_parse_stream_payload_garbage_is_error() {
        assert!(parse_stream_payload("not json").unwrap().is_err());
    }
}
