//! Response assembler and persistence gate.
//!
//! Drives one inbound turn end to end: validate, persist the user turn,
//! route, run the branch (direct / fact-check summary / draft-verify-
//! rewrite), and emit an ordered event stream. Citation events always
//! precede model tokens so a client can render sources immediately.
//!
//! Generation and persistence run in a spawned task that feeds the
//! response through a channel. A client disconnect surfaces as channel
//! closure; the task stops generating and still persists the partial
//! assistant message tagged `aborted`. The persistence call sits at a
//! single point in the task, so it fires exactly once per turn on both
//! the happy path and the aborted path. Aborts before the stream starts
//! (while drafting or verifying) persist no assistant turn.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingModel;
use crate::error::{AppError, Result};
use crate::llm::{ChatMessage, ChatRequest, GenerationModel, MessageRole};
use crate::messages;
use crate::models::{
    message_text, strip_file_parts, ChatFileRecord, KnownPart, MessageMetadata, MessagePart,
    Role, Route, VerificationResult,
};
use crate::prompts;
use crate::route;
use crate::threads;
use crate::verify::{self, VerifyContext};

/// Fixed apology surfaced when generation fails after stream framing has
/// already been committed.
pub const STREAM_ERROR_MESSAGE: &str = "An unexpected error occurred. Please try again.";

const PDF_CONTENT_TYPE: &str = "application/pdf";

// ============ Wire types ============

/// Inbound turn request body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    #[serde(default)]
    pub messages: Vec<IncomingMessage>,
    pub thread_id: Option<String>,
    #[serde(default)]
    pub chat_file_ids: Vec<String>,
    pub trigger: Option<String>,
}

/// One message in the inbound batch.
#[derive(Debug, Deserialize)]
pub struct IncomingMessage {
    pub id: String,
    pub role: Role,
    pub parts: Vec<MessagePart>,
}

/// One framed event in the outgoing stream. Citation events precede
/// text deltas; exactly one `finish` frame terminates a non-aborted turn.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChatEvent {
    Source {
        source_id: String,
        title: String,
        media_type: String,
        provider_metadata: crate::models::SourceMetadata,
    },
    TextDelta {
        delta: String,
    },
    Error {
        message: String,
    },
    Finish,
}

// ============ Service ============

/// Everything one turn needs, constructed once at process start and
/// injected by reference into every component.
#[derive(Clone)]
pub struct ChatService {
    pub pool: SqlitePool,
    pub model: Arc<dyn GenerationModel>,
    pub embedder: Arc<dyn EmbeddingModel>,
    pub retrieval: RetrievalConfig,
    /// Wall-clock budget for the buffered phase of a turn (routing,
    /// drafting, verification).
    pub turn_timeout: Duration,
}

impl ChatService {
    /// Run one inbound turn. Validation and (for the fact-check and
    /// generate routes) drafting/verification complete before this
    /// returns; the returned stream then carries the generated response.
    pub async fn run_turn(
        &self,
        owner_id: &str,
        request: TurnRequest,
    ) -> Result<ReceiverStream<ChatEvent>> {
        let thread_id = request
            .thread_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| AppError::InvalidRequest("missing thread id or messages".into()))?
            .to_string();
        if request.messages.is_empty() {
            return Err(AppError::InvalidRequest(
                "missing thread id or messages".into(),
            ));
        }

        threads::require_thread(&self.pool, owner_id, &thread_id).await?;

        // Structural validation: drop empty-part messages, reject an empty batch
        let sanitized: Vec<IncomingMessage> = request
            .messages
            .into_iter()
            .filter(|message| !message.parts.is_empty())
            .collect();
        if sanitized.is_empty() {
            return Err(AppError::InvalidMessages(
                "no message carries any parts".into(),
            ));
        }

        let last_user_text = latest_user_text(&sanitized).ok_or_else(|| {
            AppError::InvalidMessages("batch contains no user message".into())
        })?;

        let attachments =
            messages::get_files_for_chat(&self.pool, owner_id, &request.chat_file_ids).await?;
        let pdf_context = build_pdf_context(&attachments);
        let attachment_notice = build_attachment_notice(&attachments);

        // Persist the newest user turn before generation begins, unless the
        // client is replaying for a regenerate.
        let is_regenerate = request.trigger.as_deref() == Some("regenerate");
        if let Some(last) = sanitized.last() {
            if last.role == Role::User && !is_regenerate {
                let metadata = (!request.chat_file_ids.is_empty()).then(|| MessageMetadata {
                    chat_file_ids: request.chat_file_ids.clone(),
                    ..Default::default()
                });
                messages::append_message(
                    &self.pool,
                    owner_id,
                    &thread_id,
                    Role::User,
                    &last.id,
                    last.parts.clone(),
                    metadata,
                )
                .await?;
            }
        }

        let conversation = to_model_messages(&sanitized);

        // Routing and any drafting/adjudication must fit the turn's
        // wall-clock budget; once streaming starts, the model client's own
        // timeout bounds the call.
        let (stream_request, source_parts) = tokio::time::timeout(
            self.turn_timeout,
            self.prepare_branch(
                owner_id,
                &last_user_text,
                conversation,
                &pdf_context,
                &attachment_notice,
            ),
        )
        .await
        .map_err(|_| AppError::internal("turn exceeded its time budget"))??;

        let (tx, rx) = mpsc::channel(32);
        let service = self.clone();
        let owner = owner_id.to_string();
        tokio::spawn(async move {
            service
                .stream_and_persist(tx, &owner, &thread_id, source_parts, stream_request)
                .await;
        });

        Ok(ReceiverStream::new(rx))
    }

    /// Route the turn and assemble the single token-generating request for
    /// its branch, plus any citation parts to emit ahead of the tokens.
    async fn prepare_branch(
        &self,
        owner_id: &str,
        last_user_text: &str,
        conversation: Vec<ChatMessage>,
        pdf_context: &str,
        attachment_notice: &str,
    ) -> Result<(ChatRequest, Vec<MessagePart>)> {
        let route = route::classify(self.model.as_ref(), last_user_text).await?;
        info!(?route, "turn routed");

        let branch = match route {
            Route::GeneralChat => {
                let system = join_sections(&[
                    &prompts::agent_instructions(chrono::Utc::now()),
                    pdf_context,
                    attachment_notice,
                ]);
                let mut msgs = vec![ChatMessage::system(system)];
                msgs.extend(conversation);
                (ChatRequest::new(msgs), Vec::new())
            }
            Route::FactCheckInput => {
                let results = self.verify(owner_id, last_user_text).await?;
                let source_parts = verify::to_source_parts(&results);
                let user = format!(
                    "Text to check:\n{last_user_text}\n\nVerdicts:\n{}",
                    render_verdicts(&results)
                );
                let msgs = vec![
                    ChatMessage::system(prompts::SUMMARY_PROMPT),
                    ChatMessage::user(user),
                ];
                (ChatRequest::new(msgs), source_parts)
            }
            Route::GenerateContent => {
                // Draft and adjudication are buffered sub-calls; nothing is
                // streamed to the client until the verdict is in.
                let system = join_sections(&[
                    prompts::DRAFT_PROMPT,
                    pdf_context,
                    attachment_notice,
                ]);
                let mut msgs = vec![ChatMessage::system(system)];
                msgs.extend(conversation);
                let draft = self.model.complete(&ChatRequest::new(msgs)).await?.content;

                let results = self.verify(owner_id, &draft).await?;
                let failed = verify::failed_claims(&results);

                if failed.is_empty() {
                    let source_parts = verify::to_source_parts(&results);
                    let user = format!(
                        "Draft:\n{draft}\n\nVerified claims:\n{}",
                        render_verdicts(&results)
                    );
                    let msgs = vec![
                        ChatMessage::system(prompts::APPROVED_DRAFT_PROMPT),
                        ChatMessage::user(user),
                    ];
                    (ChatRequest::new(msgs), source_parts)
                } else {
                    info!(failed = failed.len(), "draft failed verification; rewriting");
                    let user = format!(
                        "Draft:\n{draft}\n\nUnsupported claims:\n{}",
                        failed
                            .iter()
                            .enumerate()
                            .map(|(i, claim)| format!("{}. {claim}", i + 1))
                            .collect::<Vec<_>>()
                            .join("\n")
                    );
                    let msgs = vec![
                        ChatMessage::system(prompts::REWRITE_PROMPT),
                        ChatMessage::user(user),
                    ];
                    // Rewrite responses never carry citations
                    (ChatRequest::new(msgs), Vec::new())
                }
            }
        };

        Ok(branch)
    }

    async fn verify(&self, owner_id: &str, content: &str) -> Result<Vec<VerificationResult>> {
        let ctx = VerifyContext {
            model: self.model.as_ref(),
            embedder: self.embedder.as_ref(),
            pool: &self.pool,
            retrieval: &self.retrieval,
        };
        verify::verify(&ctx, owner_id, content).await
    }

    /// Emit citation events, stream model tokens, then persist the
    /// assembled assistant message exactly once.
    async fn stream_and_persist(
        &self,
        tx: mpsc::Sender<ChatEvent>,
        owner_id: &str,
        thread_id: &str,
        source_parts: Vec<MessagePart>,
        request: ChatRequest,
    ) {
        let mut aborted = false;
        let mut content = String::new();

        for part in &source_parts {
            if let Some(event) = source_event(part) {
                if tx.send(event).await.is_err() {
                    aborted = true;
                    break;
                }
            }
        }

        if !aborted {
            match self.model.complete_stream(&request).await {
                Ok(mut stream) => {
                    while let Some(item) = stream.next().await {
                        match item {
                            Ok(chunk) => {
                                if chunk.delta.is_empty() {
                                    continue;
                                }
                                content.push_str(&chunk.delta);
                                let event = ChatEvent::TextDelta { delta: chunk.delta };
                                if tx.send(event).await.is_err() {
                                    aborted = true;
                                    break;
                                }
                            }
                            Err(e) => {
                                // Stream framing is already committed; surface a
                                // fixed apology instead of a protocol error.
                                error!("generation failed mid-stream: {e}");
                                let _ = tx
                                    .send(ChatEvent::Error {
                                        message: STREAM_ERROR_MESSAGE.to_string(),
                                    })
                                    .await;
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("failed to open generation stream: {e}");
                    let _ = tx
                        .send(ChatEvent::Error {
                            message: STREAM_ERROR_MESSAGE.to_string(),
                        })
                        .await;
                }
            }
        }

        // The single persistence point for the assistant turn. A logging
        // failure here must not re-fail a response the client already has.
        let mut parts = source_parts;
        if !content.is_empty() {
            parts.push(MessagePart::text(content));
        }
        let metadata = aborted.then(|| MessageMetadata {
            aborted: true,
            ..Default::default()
        });
        if let Err(e) = messages::append_message(
            &self.pool,
            owner_id,
            thread_id,
            Role::Assistant,
            &Uuid::new_v4().to_string(),
            parts,
            metadata,
        )
        .await
        {
            warn!(thread = %thread_id, "failed to persist assistant turn: {e}");
        }

        if !aborted {
            let _ = tx.send(ChatEvent::Finish).await;
        }
    }
}

// ============ Helpers ============

/// Text of the newest user message in the batch.
fn latest_user_text(messages: &[IncomingMessage]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|message| message.role == Role::User)
        .map(|message| message_text(&message.parts))
        .filter(|text| !text.is_empty())
}

/// Convert the inbound batch into model messages, dropping file parts.
fn to_model_messages(batch: &[IncomingMessage]) -> Vec<ChatMessage> {
    batch
        .iter()
        .filter_map(|message| {
            let text = message_text(&strip_file_parts(message.parts.clone()));
            if text.is_empty() {
                return None;
            }
            let role = match message.role {
                Role::System => MessageRole::System,
                Role::User => MessageRole::User,
                Role::Assistant => MessageRole::Assistant,
            };
            Some(ChatMessage {
                role,
                content: text,
            })
        })
        .collect()
}

/// Extracted markdown of attached PDFs, for the system prompt.
fn build_pdf_context(files: &[ChatFileRecord]) -> String {
    files
        .iter()
        .filter(|file| file.content_type == PDF_CONTENT_TYPE)
        .filter_map(|file| {
            file.markdown
                .as_deref()
                .map(|markdown| format!("File: {}\n\n{markdown}", file.filename))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Human-readable notice listing attached files.
fn build_attachment_notice(files: &[ChatFileRecord]) -> String {
    if files.is_empty() {
        return String::new();
    }
    let mut lines = vec!["Attached files:".to_string()];
    lines.extend(
        files
            .iter()
            .map(|file| format!("- {} ({})", file.filename, file.content_type)),
    );
    lines.join("\n")
}

fn join_sections(sections: &[&str]) -> String {
    sections
        .iter()
        .filter(|section| !section.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Render verdicts for the summarizer, preserving claim order.
fn render_verdicts(results: &[VerificationResult]) -> String {
    results
        .iter()
        .enumerate()
        .map(|(index, result)| {
            let number = index + 1;
            if result.is_supported {
                match (&result.document_name, &result.matching_text) {
                    (Some(doc), Some(excerpt)) => format!(
                        "{number}. \"{}\" — supported by {doc}: \"{excerpt}\"",
                        result.claim
                    ),
                    (Some(doc), None) => {
                        format!("{number}. \"{}\" — supported by {doc}", result.claim)
                    }
                    _ => format!("{number}. \"{}\" — supported (no citation)", result.claim),
                }
            } else {
                format!(
                    "{number}. \"{}\" — not supported by the documents",
                    result.claim
                )
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn source_event(part: &MessagePart) -> Option<ChatEvent> {
    match part {
        MessagePart::Known(KnownPart::SourceDocument {
            source_id,
            title,
            media_type,
            provider_metadata,
        }) => Some(ChatEvent::Source {
            source_id: source_id.clone(),
            title: title.clone(),
            media_type: media_type.clone(),
            provider_metadata: provider_metadata.clone(),
        }),
        _ => None,
    }
}
