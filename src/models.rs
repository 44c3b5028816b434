//! Core data models used throughout Factweave.
//!
//! These types represent routes, claims, evidence, verification verdicts,
//! and the persisted thread/message/file records that flow through the
//! chat and verification pipeline.

use serde::{Deserialize, Serialize};

// ============ Routing ============

/// Classified intent of a user turn. Decided once per inbound turn and
/// never revisited mid-turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    GeneralChat,
    FactCheckInput,
    GenerateContent,
}

// ============ Evidence & verification ============

/// Bounding box of a segment in page-coordinate units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

/// One retrieved evidence chunk, hydrated into an attributable record.
///
/// `source_id` is deterministically derived from the chunk position
/// (`file_id:segment_id|chunk_id|ordinal`), so re-citing the same chunk
/// across claims yields the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceMatch {
    pub source_id: String,
    pub file_id: String,
    pub filename: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_number: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_width: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_height: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
}

/// Adjudication outcome for a single claim.
///
/// Invariant: `is_supported == false` implies `document_name`,
/// `matching_text`, and `source` are all `None`. A supported claim may
/// carry no `source` (supported-but-uncited); a source is never fabricated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub claim: String,
    pub is_supported: bool,
    pub document_name: Option<String>,
    pub matching_text: Option<String>,
    pub source: Option<EvidenceMatch>,
}

impl VerificationResult {
    /// An unsupported verdict with all citation fields nulled.
    pub fn unsupported(claim: impl Into<String>) -> Self {
        Self {
            claim: claim.into(),
            is_supported: false,
            document_name: None,
            matching_text: None,
            source: None,
        }
    }
}

// ============ Message parts ============

/// Citation metadata attached to a source-document part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub file_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_number: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_width: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_height: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// Recognized message part shapes, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum KnownPart {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    SourceDocument {
        source_id: String,
        title: String,
        media_type: String,
        provider_metadata: SourceMetadata,
    },
    /// Raw attachment part. Wire-only: stripped before persistence so large
    /// blobs are never stored twice; attachments are re-resolved from
    /// chat-file records at render time.
    File {
        media_type: String,
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
}

/// One item in a message's ordered `parts` sequence.
///
/// Unrecognized shapes are carried through verbatim rather than rejected,
/// so persisted history survives schema evolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessagePart {
    Known(KnownPart),
    Unknown(serde_json::Value),
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Known(KnownPart::Text { text: text.into() })
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Self::Known(KnownPart::File { .. }))
    }

    pub fn is_source(&self) -> bool {
        matches!(self, Self::Known(KnownPart::SourceDocument { .. }))
    }

    /// Text content if this is a text part.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Known(KnownPart::Text { text }) => Some(text),
            _ => None,
        }
    }
}

/// Drop raw file-attachment parts. Everything else passes through in order.
pub fn strip_file_parts(parts: Vec<MessagePart>) -> Vec<MessagePart> {
    parts.into_iter().filter(|part| !part.is_file()).collect()
}

/// Concatenated text content of a part sequence.
pub fn message_text(parts: &[MessagePart]) -> String {
    parts
        .iter()
        .filter_map(MessagePart::as_text)
        .collect::<Vec<_>>()
        .join("")
        .trim()
        .to_string()
}

// ============ Message metadata ============

/// Known metadata attached to persisted messages. Unknown keys are kept in
/// `extra` instead of being trusted (or lost) at read sites.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chat_file_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub aborted: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MessageMetadata {
    pub fn is_empty(&self) -> bool {
        self.chat_file_ids.is_empty() && !self.aborted && self.extra.is_empty()
    }
}

// ============ Persisted records ============

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// Persisted conversation container.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadRecord {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Persisted turn. Append-only after insert.
#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    pub id: String,
    pub thread_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub role: Role,
    pub message_id: String,
    pub parts: Vec<MessagePart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    pub created_at: i64,
}

/// Per-chat attachment file with extracted markdown context.
#[derive(Debug, Clone, Serialize)]
pub struct ChatFileRecord {
    pub id: String,
    pub owner_id: String,
    pub filename: String,
    pub content_type: String,
    pub size: i64,
    pub storage_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markdown: Option<String>,
    pub created_at: i64,
}

/// Knowledge-base file processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Processing,
    Ready,
    Failed,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "processing" => Some(Self::Processing),
            "ready" => Some(Self::Ready),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Knowledge-base file record.
#[derive(Debug, Clone, Serialize)]
pub struct KbFileRecord {
    pub id: String,
    pub owner_id: String,
    pub filename: String,
    pub content_type: String,
    pub size: i64,
    pub storage_ref: String,
    pub status: FileStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A new evidence chunk ready for insertion.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub owner_id: String,
    pub file_id: String,
    pub chunk_index: i64,
    pub chunk_id: Option<String>,
    pub segment_id: Option<String>,
    pub page_number: Option<i64>,
    pub page_width: Option<f64>,
    pub page_height: Option<f64>,
    pub bbox: Option<BoundingBox>,
    pub content: String,
    pub embed_text: String,
    pub embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_roundtrip_text() {
        let part = MessagePart::text("hello");
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "text");
        let back: MessagePart = serde_json::from_value(json).unwrap();
        assert_eq!(back, part);
    }

    #[test]
    fn test_part_roundtrip_source_document() {
        let json = serde_json::json!({
            "type": "source-document",
            "source_id": "f1:s1",
            "title": "report.pdf",
            "media_type": "application/pdf",
            "provider_metadata": { "file_id": "f1", "snippet": "quoted text" }
        });
        let part: MessagePart = serde_json::from_value(json.clone()).unwrap();
        assert!(part.is_source());
        assert_eq!(serde_json::to_value(&part).unwrap(), json);
    }

    #[test]
    fn test_unknown_part_preserved() {
        let json = serde_json::json!({ "type": "tool-weather", "state": "output-available" });
        let part: MessagePart = serde_json::from_value(json.clone()).unwrap();
        assert!(matches!(part, MessagePart::Unknown(_)));
        assert_eq!(serde_json::to_value(&part).unwrap(), json);
    }

    #[test]
    fn test_strip_file_parts() {
        let parts = vec![
            MessagePart::text("before"),
            MessagePart::Known(KnownPart::File {
                media_type: "application/pdf".into(),
                url: "https://example.com/a.pdf".into(),
                filename: Some("a.pdf".into()),
            }),
            MessagePart::text("after"),
        ];
        let stripped = strip_file_parts(parts);
        assert_eq!(stripped.len(), 2);
        assert!(stripped.iter().all(|p| !p.is_file()));
        assert_eq!(stripped[0].as_text(), Some("before"));
        assert_eq!(stripped[1].as_text(), Some("after"));
    }

    #[test]
    fn test_message_text_joins_text_parts() {
        let parts = vec![
            MessagePart::text("Hello, "),
            MessagePart::Unknown(serde_json::json!({"type": "step-start"})),
            MessagePart::text("world."),
        ];
        assert_eq!(message_text(&parts), "Hello, world.");
    }

    #[test]
    fn test_metadata_tolerates_unknown_keys() {
        let json = serde_json::json!({
            "chat_file_ids": ["cf1"],
            "aborted": true,
            "client_version": "2.4.1"
        });
        let meta: MessageMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(meta.chat_file_ids, vec!["cf1".to_string()]);
        assert!(meta.aborted);
        assert_eq!(meta.extra["client_version"], "2.4.1");
    }

    #[test]
    fn test_unsupported_verdict_has_no_citation() {
        let result = VerificationResult::unsupported("the sky is green");
        assert!(!result.is_supported);
        assert!(result.document_name.is_none());
        assert!(result.matching_text.is_none());
        assert!(result.source.is_none());
    }

    #[test]
    fn test_route_wire_names() {
        assert_eq!(
            serde_json::to_value(Route::FactCheckInput).unwrap(),
            serde_json::json!("fact_check_input")
        );
        let route: Route = serde_json::from_value(serde_json::json!("general_chat")).unwrap();
        assert_eq!(route, Route::GeneralChat);
    }
}
