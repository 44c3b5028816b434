//! Knowledge-base file lifecycle: register → segment → embed → ready.
//!
//! Registration validates the upload and inserts a `processing` record,
//! then a background task drives the external segmenter (submit, bounded
//! poll), embeds the produced segments, and inserts the evidence chunks.
//! Any failure is captured per-file as a `failed` status with an error
//! message; a failed file can be retried with an explicit action.

use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::config::IngestConfig;
use crate::embedding::EmbeddingModel;
use crate::error::{AppError, Result};
use crate::kb;
use crate::models::{KbFileRecord, NewChunk};
use crate::segmenter::{Segment, Segmenter, TaskState};

/// Shared handles the ingestion pipeline needs.
#[derive(Clone)]
pub struct IngestContext {
    pub pool: SqlitePool,
    pub embedder: Arc<dyn EmbeddingModel>,
    pub segmenter: Arc<dyn Segmenter>,
    pub config: IngestConfig,
}

fn is_allowed_content_type(content_type: &str) -> bool {
    content_type == "application/pdf" || content_type.starts_with("image/")
}

/// Validate and register an uploaded file, then kick off processing in the
/// background. `storage_ref` must be a URL the segmenter can fetch.
pub async fn register_upload(
    ctx: &IngestContext,
    owner_id: &str,
    filename: &str,
    content_type: &str,
    size: u64,
    storage_ref: &str,
) -> Result<KbFileRecord> {
    if !is_allowed_content_type(content_type) {
        return Err(AppError::UnsupportedContentType);
    }
    if size > ctx.config.max_file_bytes {
        return Err(AppError::FileTooLarge);
    }

    let file = kb::insert_file(
        &ctx.pool,
        owner_id,
        filename,
        content_type,
        size as i64,
        storage_ref,
    )
    .await?;

    spawn_processing(ctx.clone(), file.id.clone());

    info!(file = %file.id, owner = %owner_id, "file registered");
    Ok(file)
}

/// Reset a failed (or stuck) file and reprocess it. Owner-checked.
pub async fn retry_process_file(ctx: &IngestContext, owner_id: &str, file_id: &str) -> Result<()> {
    kb::get_file_for_owner(&ctx.pool, owner_id, file_id).await?;

    kb::delete_chunks_for_file(&ctx.pool, file_id).await?;
    kb::mark_processing(&ctx.pool, file_id).await?;
    spawn_processing(ctx.clone(), file_id.to_string());

    info!(file = %file_id, "retry scheduled");
    Ok(())
}

fn spawn_processing(ctx: IngestContext, file_id: String) {
    tokio::spawn(async move {
        if let Err(e) = process_file(&ctx, &file_id).await {
            error!(file = %file_id, "processing failed: {e}");
            if let Err(db_err) = kb::mark_failed(&ctx.pool, &file_id, &e.to_string()).await {
                error!(file = %file_id, "failed to record failure: {db_err}");
            }
        }
    });
}

/// Drive one file through segmentation and embedding.
async fn process_file(ctx: &IngestContext, file_id: &str) -> Result<()> {
    let file = kb::get_file(&ctx.pool, file_id)
        .await?
        .ok_or(AppError::FileNotFound)?;

    let task_id = ctx.segmenter.submit(&file.storage_ref).await?;
    kb::set_task_id(&ctx.pool, file_id, &task_id).await?;

    let segments = poll_until_complete(ctx, &task_id).await?;

    if segments.is_empty() {
        kb::mark_ready(&ctx.pool, file_id, 0).await?;
        info!(file = %file_id, "processed with no embeddable segments");
        return Ok(());
    }

    let texts: Vec<String> = segments.iter().map(|s| s.embed_text.clone()).collect();
    let embeddings = ctx.embedder.embed_many(&texts).await?;
    if embeddings.len() != segments.len() {
        return Err(AppError::internal("missing embedding result"));
    }

    let chunks: Vec<NewChunk> = segments
        .into_iter()
        .zip(embeddings)
        .map(|(segment, embedding)| NewChunk {
            owner_id: file.owner_id.clone(),
            file_id: file.id.clone(),
            chunk_index: segment.chunk_index,
            chunk_id: segment.chunk_id,
            segment_id: segment.segment_id,
            page_number: segment.page_number,
            page_width: segment.page_width,
            page_height: segment.page_height,
            bbox: segment.bbox,
            content: segment.content,
            embed_text: segment.embed_text,
            embedding,
        })
        .collect();

    let count = chunks.len() as i64;
    kb::insert_chunks(&ctx.pool, &chunks).await?;
    kb::mark_ready(&ctx.pool, file_id, count).await?;

    info!(file = %file_id, chunks = count, "processing completed");
    Ok(())
}

/// Poll the segmentation task at a fixed interval, bounded by the
/// configured attempt count. Exhausting the budget fails the file rather
/// than waiting unbounded.
async fn poll_until_complete(ctx: &IngestContext, task_id: &str) -> Result<Vec<Segment>> {
    for attempt in 0..ctx.config.max_poll_attempts {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(ctx.config.poll_delay_ms)).await;
        }

        match ctx.segmenter.poll(task_id).await? {
            TaskState::Succeeded(segments) => return Ok(segments),
            TaskState::Failed(message) => {
                return Err(AppError::external("segmenter", message));
            }
            TaskState::Processing => {}
        }
    }

    Err(AppError::external(
        "segmenter",
        format!(
            "task {task_id} did not complete within {} attempts",
            ctx.config.max_poll_attempts
        ),
    ))
}
