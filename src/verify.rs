//! Claim extraction, adjudication, and the verification orchestrator.
//!
//! `verify` is the core of the fact-checking pipeline: extract atomic
//! claims from free text, retrieve evidence per claim from the caller's
//! knowledge base, and adjudicate support per claim against that
//! evidence. Adjudications fan out concurrently; results are reassembled
//! in extraction order, because the summarizer presents them in a stable
//! order. There is no partial-result policy — any sub-call failure fails
//! the whole verification.

use futures_util::future::try_join_all;
use sqlx::SqlitePool;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingModel;
use crate::error::Result;
use crate::llm::{generate_object, ChatMessage, ChatRequest, GenerationModel};
use crate::models::{
    EvidenceMatch, KnownPart, MessagePart, SourceMetadata, VerificationResult,
};
use crate::prompts;
use crate::retrieve;

/// Handles the orchestrator threads through every stage.
pub struct VerifyContext<'a> {
    pub model: &'a dyn GenerationModel,
    pub embedder: &'a dyn EmbeddingModel,
    pub pool: &'a SqlitePool,
    pub retrieval: &'a RetrievalConfig,
}

// ============ Claim extraction ============

#[derive(Debug, Deserialize)]
struct ClaimList {
    claims: Vec<String>,
}

/// Decompose text into atomic, self-contained, checkable claims.
/// Empty input and an empty result are both valid.
pub async fn extract_claims(model: &dyn GenerationModel, content: &str) -> Result<Vec<String>> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    let request = ChatRequest::new(vec![
        ChatMessage::system(prompts::EXTRACT_CLAIMS_PROMPT),
        ChatMessage::user(content.to_string()),
    ])
    .with_temperature(0.1);

    let list: ClaimList = generate_object(model, &request).await?;
    debug!(count = list.claims.len(), "extracted claims");
    Ok(list.claims)
}

// ============ Adjudication ============

#[derive(Debug, Deserialize)]
struct AdjudicationRaw {
    is_supported: bool,
    document_name: Option<String>,
    matching_text: Option<String>,
    source_id: Option<String>,
}

/// Decide support for one claim against its retrieved evidence.
///
/// The returned `source_id` is validated against the evidence actually
/// passed to this call: an id the model invented is dropped (the claim
/// stays supported-but-uncited) rather than propagated as a dangling
/// reference. Non-support always carries no partial citation.
pub async fn adjudicate_claim(
    model: &dyn GenerationModel,
    claim: &str,
    evidence: &[EvidenceMatch],
) -> Result<VerificationResult> {
    let context_text = evidence
        .iter()
        .map(|source| {
            format!(
                "source_id: {}\nDocument: {}\n{}",
                source.source_id, source.filename, source.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let request = ChatRequest::new(vec![
        ChatMessage::system(prompts::ADJUDICATE_PROMPT),
        ChatMessage::user(format!("Claim: {claim}\nContext: {context_text}")),
    ])
    .with_temperature(0.1);

    let raw: AdjudicationRaw = generate_object(model, &request).await?;

    if !raw.is_supported {
        return Ok(VerificationResult::unsupported(claim));
    }

    let source = match raw.source_id {
        Some(ref id) => {
            let found = evidence.iter().find(|item| &item.source_id == id).cloned();
            if found.is_none() {
                warn!(claim, source_id = %id, "adjudicator cited a source_id absent from its evidence");
            }
            found
        }
        None => None,
    };

    Ok(VerificationResult {
        claim: claim.to_string(),
        is_supported: true,
        document_name: raw.document_name,
        matching_text: raw.matching_text,
        source,
    })
}

// ============ Orchestrator ============

/// Verify every claim in `content` against the caller's knowledge base.
///
/// Zero extracted claims means "no factual content to check" and returns
/// an empty result without touching retrieval or adjudication. Otherwise
/// each claim is retrieved and adjudicated concurrently; the index tag on
/// each future re-imposes extraction order on the collected results.
pub async fn verify(
    ctx: &VerifyContext<'_>,
    owner_id: &str,
    content: &str,
) -> Result<Vec<VerificationResult>> {
    let claims = extract_claims(ctx.model, content).await?;
    if claims.is_empty() {
        return Ok(Vec::new());
    }

    let tasks = claims.iter().enumerate().map(|(index, claim)| async move {
        let evidence = retrieve::retrieve(
            ctx.pool,
            ctx.embedder,
            ctx.retrieval,
            owner_id,
            claim,
            Some(ctx.retrieval.verify_search_limit),
        )
        .await?;
        let result = adjudicate_claim(ctx.model, claim, &evidence).await?;
        Ok::<_, crate::error::AppError>((index, result))
    });

    let mut indexed = try_join_all(tasks).await?;
    indexed.sort_by_key(|(index, _)| *index);

    Ok(indexed.into_iter().map(|(_, result)| result).collect())
}

/// Claims that failed verification, in order.
pub fn failed_claims(results: &[VerificationResult]) -> Vec<&str> {
    results
        .iter()
        .filter(|result| !result.is_supported)
        .map(|result| result.claim.as_str())
        .collect()
}

/// Citation parts for supported, cited results — one per distinct source.
pub fn to_source_parts(results: &[VerificationResult]) -> Vec<MessagePart> {
    let mut seen = std::collections::HashSet::new();
    results
        .iter()
        .filter_map(|result| {
            let source = result.source.as_ref()?;
            if !seen.insert(source.source_id.clone()) {
                return None;
            }
            Some(MessagePart::Known(KnownPart::SourceDocument {
                source_id: source.source_id.clone(),
                title: source.filename.clone(),
                media_type: "application/pdf".to_string(),
                provider_metadata: SourceMetadata {
                    file_id: source.file_id.clone(),
                    chunk_id: source.chunk_id.clone(),
                    segment_id: source.segment_id.clone(),
                    page_number: source.page_number,
                    page_width: source.page_width,
                    page_height: source.page_height,
                    bbox: source.bbox,
                    snippet: result.matching_text.clone(),
                },
            }))
        })
        .collect()
}
