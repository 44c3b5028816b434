//! Generation-model abstraction.
//!
//! Defines the message/request/response types and the [`GenerationModel`]
//! trait implemented by concrete backends. The service holds one model
//! client for its lifetime and passes it by reference into every call
//! site, so tests can substitute a scripted fake for all five call sites
//! (routing, extraction, adjudication, drafting, final generation).

mod openai_compatible;
mod sse;

pub use openai_compatible::OpenAiCompatibleModel;
pub use sse::{sse_chunk_stream, SseEvent, SseLineBuffer};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::pin::Pin;
use tokio_stream::Stream;

use crate::error::{AppError, Result};

/// Role of a chat message sent to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One message in a model conversation.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Request configuration for a model call.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Buffered completion result.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub finish_reason: Option<String>,
}

/// One streamed token delta.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub delta: String,
    pub is_final: bool,
    pub finish_reason: Option<String>,
}

/// Ordered stream of token deltas from a streaming completion.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Contract for generation backends.
#[async_trait]
pub trait GenerationModel: Send + Sync {
    /// Buffered text completion.
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Streaming completion; token order is preserved.
    async fn complete_stream(&self, request: &ChatRequest) -> Result<ChatStream>;

    /// Completion constrained to a single JSON object (JSON output mode).
    async fn complete_structured(&self, request: &ChatRequest) -> Result<serde_json::Value>;
}

/// Run a structured completion and decode it into a typed value.
///
/// A non-conforming model output is a fatal error for the turn — there is
/// no retry here beyond the transport's own transient-failure handling.
pub async fn generate_object<T: DeserializeOwned>(
    model: &dyn GenerationModel,
    request: &ChatRequest,
) -> Result<T> {
    let value = model.complete_structured(request).await?;
    serde_json::from_value(value)
        .map_err(|e| AppError::internal(format!("model output did not match schema: {e}")))
}
