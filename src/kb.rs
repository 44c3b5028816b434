//! Evidence store: knowledge-base files and embedded chunks.
//!
//! Every read and write is scoped by owner id. Vector search filters by
//! owner in SQL, and hydration re-checks ownership against the owning
//! file before any chunk content is disclosed — a chunk id leaking into a
//! later stage must still come back owner-verified or not at all.

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{AppError, Result};
use crate::models::{BoundingBox, EvidenceMatch, FileStatus, KbFileRecord, NewChunk};

// ============ Files ============

pub async fn insert_file(
    pool: &SqlitePool,
    owner_id: &str,
    filename: &str,
    content_type: &str,
    size: i64,
    storage_ref: &str,
) -> Result<KbFileRecord> {
    let now = chrono::Utc::now().timestamp_millis();
    let record = KbFileRecord {
        id: Uuid::new_v4().to_string(),
        owner_id: owner_id.to_string(),
        filename: filename.to_string(),
        content_type: content_type.to_string(),
        size,
        storage_ref: storage_ref.to_string(),
        status: FileStatus::Processing,
        error_message: None,
        chunk_count: None,
        task_id: None,
        created_at: now,
        updated_at: now,
    };

    sqlx::query(
        r#"
        INSERT INTO kb_files (id, owner_id, filename, content_type, size, storage_ref, status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.id)
    .bind(&record.owner_id)
    .bind(&record.filename)
    .bind(&record.content_type)
    .bind(record.size)
    .bind(&record.storage_ref)
    .bind(record.status.as_str())
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(pool)
    .await?;

    Ok(record)
}

/// Fetch a file without owner filtering. Internal use only (background
/// processing); anything caller-facing goes through [`get_file_for_owner`].
pub async fn get_file(pool: &SqlitePool, file_id: &str) -> Result<Option<KbFileRecord>> {
    let row = sqlx::query("SELECT * FROM kb_files WHERE id = ?")
        .bind(file_id)
        .fetch_optional(pool)
        .await?;

    row.map(|r| file_from_row(&r)).transpose()
}

/// Fetch a file the caller owns. A missing file is `FILE_NOT_FOUND`; a
/// file owned by someone else is a hard `FORBIDDEN`, never a filtered
/// empty result.
pub async fn get_file_for_owner(
    pool: &SqlitePool,
    owner_id: &str,
    file_id: &str,
) -> Result<KbFileRecord> {
    let file = get_file(pool, file_id).await?.ok_or(AppError::FileNotFound)?;
    if file.owner_id != owner_id {
        return Err(AppError::Forbidden);
    }
    Ok(file)
}

pub async fn list_files(pool: &SqlitePool, owner_id: &str) -> Result<Vec<KbFileRecord>> {
    let rows = sqlx::query("SELECT * FROM kb_files WHERE owner_id = ? ORDER BY created_at DESC")
        .bind(owner_id)
        .fetch_all(pool)
        .await?;

    rows.iter().map(file_from_row).collect()
}

pub async fn set_task_id(pool: &SqlitePool, file_id: &str, task_id: &str) -> Result<()> {
    sqlx::query("UPDATE kb_files SET task_id = ?, updated_at = ? WHERE id = ?")
        .bind(task_id)
        .bind(chrono::Utc::now().timestamp_millis())
        .bind(file_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_processing(pool: &SqlitePool, file_id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE kb_files SET status = 'processing', error_message = NULL, chunk_count = NULL, task_id = NULL, updated_at = ? WHERE id = ?",
    )
    .bind(chrono::Utc::now().timestamp_millis())
    .bind(file_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_ready(pool: &SqlitePool, file_id: &str, chunk_count: i64) -> Result<()> {
    sqlx::query(
        "UPDATE kb_files SET status = 'ready', error_message = NULL, chunk_count = ?, updated_at = ? WHERE id = ?",
    )
    .bind(chunk_count)
    .bind(chrono::Utc::now().timestamp_millis())
    .bind(file_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_failed(pool: &SqlitePool, file_id: &str, error_message: &str) -> Result<()> {
    sqlx::query("UPDATE kb_files SET status = 'failed', error_message = ?, updated_at = ? WHERE id = ?")
        .bind(error_message)
        .bind(chrono::Utc::now().timestamp_millis())
        .bind(file_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete a file and all of its chunks. Owner-checked.
pub async fn delete_file(pool: &SqlitePool, owner_id: &str, file_id: &str) -> Result<()> {
    let file = get_file_for_owner(pool, owner_id, file_id).await?;
    delete_chunks_for_file(pool, &file.id).await?;
    sqlx::query("DELETE FROM kb_files WHERE id = ?")
        .bind(&file.id)
        .execute(pool)
        .await?;
    Ok(())
}

// ============ Chunks ============

pub async fn insert_chunks(pool: &SqlitePool, chunks: &[NewChunk]) -> Result<()> {
    for chunk in chunks {
        let bbox_json = chunk
            .bbox
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            r#"
            INSERT INTO kb_chunks (id, owner_id, file_id, chunk_index, chunk_id, segment_id,
                                   page_number, page_width, page_height, bbox_json,
                                   content, embed_text, embedding)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&chunk.owner_id)
        .bind(&chunk.file_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.chunk_id)
        .bind(&chunk.segment_id)
        .bind(chunk.page_number)
        .bind(chunk.page_width)
        .bind(chunk.page_height)
        .bind(bbox_json)
        .bind(&chunk.content)
        .bind(&chunk.embed_text)
        .bind(vec_to_blob(&chunk.embedding))
        .execute(pool)
        .await?;
    }
    Ok(())
}

pub async fn delete_chunks_for_file(pool: &SqlitePool, file_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM kb_chunks WHERE file_id = ?")
        .bind(file_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Owner-filtered nearest-neighbor search. Returns chunk row ids ranked by
/// cosine similarity against the query vector.
pub async fn vector_search(
    pool: &SqlitePool,
    owner_id: &str,
    query_vec: &[f32],
    limit: i64,
) -> Result<Vec<String>> {
    let rows = sqlx::query("SELECT id, embedding FROM kb_chunks WHERE owner_id = ?")
        .bind(owner_id)
        .fetch_all(pool)
        .await?;

    let mut candidates: Vec<(String, f32)> = rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let vec = blob_to_vec(&blob);
            (row.get("id"), cosine_similarity(query_vec, &vec))
        })
        .collect();

    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    candidates.truncate(limit.max(0) as usize);

    Ok(candidates.into_iter().map(|(id, _)| id).collect())
}

/// Hydrate chunk row ids into attributable [`EvidenceMatch`] records,
/// re-fetching content and the owning file's display name.
///
/// Ownership is re-checked per row against the owning file; rows whose
/// file cannot be re-verified under `owner_id` are dropped, not errors.
/// Result order follows the input id order.
pub async fn hydrate_matches(
    pool: &SqlitePool,
    owner_id: &str,
    chunk_ids: &[String],
) -> Result<Vec<EvidenceMatch>> {
    let mut matches = Vec::with_capacity(chunk_ids.len());

    for chunk_row_id in chunk_ids {
        let row = sqlx::query(
            r#"
            SELECT c.file_id, c.chunk_index, c.chunk_id, c.segment_id,
                   c.page_number, c.page_width, c.page_height, c.bbox_json, c.content,
                   c.owner_id AS chunk_owner, f.owner_id AS file_owner, f.filename
            FROM kb_chunks c
            JOIN kb_files f ON f.id = c.file_id
            WHERE c.id = ?
            "#,
        )
        .bind(chunk_row_id)
        .fetch_optional(pool)
        .await?;

        let Some(row) = row else {
            continue;
        };

        let chunk_owner: String = row.get("chunk_owner");
        let file_owner: String = row.get("file_owner");
        if chunk_owner != owner_id || file_owner != owner_id {
            tracing::warn!(chunk = %chunk_row_id, "dropping evidence match failing ownership re-check");
            continue;
        }

        let file_id: String = row.get("file_id");
        let chunk_index: i64 = row.get("chunk_index");
        let chunk_id: Option<String> = row.get("chunk_id");
        let segment_id: Option<String> = row.get("segment_id");
        let bbox: Option<BoundingBox> = row
            .get::<Option<String>, _>("bbox_json")
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        matches.push(EvidenceMatch {
            source_id: derive_source_id(&file_id, segment_id.as_deref(), chunk_id.as_deref(), chunk_index),
            file_id,
            filename: row.get("filename"),
            content: row.get("content"),
            chunk_id,
            segment_id,
            page_number: row.get("page_number"),
            page_width: row.get("page_width"),
            page_height: row.get("page_height"),
            bbox,
        });
    }

    Ok(matches)
}

/// Stable citation id for a chunk position: the segment id when the
/// segmenter assigned one, else the chunk id, else the chunk ordinal.
/// Re-citing the same chunk across claims always yields the same id.
pub fn derive_source_id(
    file_id: &str,
    segment_id: Option<&str>,
    chunk_id: Option<&str>,
    ordinal: i64,
) -> String {
    match (segment_id, chunk_id) {
        (Some(segment), _) => format!("{file_id}:{segment}"),
        (None, Some(chunk)) => format!("{file_id}:{chunk}"),
        (None, None) => format!("{file_id}:{ordinal}"),
    }
}

fn file_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<KbFileRecord> {
    let status_raw: String = row.get("status");
    let status = FileStatus::parse(&status_raw)
        .ok_or_else(|| AppError::Database(format!("unknown file status: {status_raw}")))?;

    Ok(KbFileRecord {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        filename: row.get("filename"),
        content_type: row.get("content_type"),
        size: row.get("size"),
        storage_ref: row.get("storage_ref"),
        status,
        error_message: row.get("error_message"),
        chunk_count: row.get("chunk_count"),
        task_id: row.get("task_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
