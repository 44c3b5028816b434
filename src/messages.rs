//! Append-only chat message persistence.
//!
//! Messages are owner-scoped through their thread and never mutated after
//! insert. Raw file-attachment parts are stripped before storage; only the
//! chat-file-id references in metadata survive, so attachments are
//! re-resolved fresh at render time instead of being stored twice.

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{
    strip_file_parts, ChatFileRecord, MessageMetadata, MessagePart, MessageRecord, Role,
};
use crate::threads;

/// Append a message to a thread the caller owns.
///
/// `owner_id` is recorded on the row for user turns only, mirroring who
/// authored the turn; assistant turns belong to the thread.
pub async fn append_message(
    pool: &SqlitePool,
    owner_id: &str,
    thread_id: &str,
    role: Role,
    message_id: &str,
    parts: Vec<MessagePart>,
    metadata: Option<MessageMetadata>,
) -> Result<MessageRecord> {
    threads::require_thread(pool, owner_id, thread_id).await?;

    let parts = strip_file_parts(parts);
    let metadata = metadata.filter(|m| !m.is_empty());

    let record = MessageRecord {
        id: Uuid::new_v4().to_string(),
        thread_id: thread_id.to_string(),
        owner_id: (role == Role::User).then(|| owner_id.to_string()),
        role,
        message_id: message_id.to_string(),
        parts,
        metadata,
        created_at: chrono::Utc::now().timestamp_millis(),
    };

    let parts_json = serde_json::to_string(&record.parts)?;
    let metadata_json = record
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        r#"
        INSERT INTO chat_messages (id, thread_id, owner_id, role, message_id, parts_json, metadata_json, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.id)
    .bind(&record.thread_id)
    .bind(&record.owner_id)
    .bind(record.role.as_str())
    .bind(&record.message_id)
    .bind(&parts_json)
    .bind(&metadata_json)
    .bind(record.created_at)
    .execute(pool)
    .await?;

    threads::touch_thread(pool, thread_id).await?;

    Ok(record)
}

/// List a thread's messages in creation order.
pub async fn list_by_thread(
    pool: &SqlitePool,
    owner_id: &str,
    thread_id: &str,
) -> Result<Vec<MessageRecord>> {
    threads::require_thread(pool, owner_id, thread_id).await?;

    let rows =
        sqlx::query("SELECT * FROM chat_messages WHERE thread_id = ? ORDER BY created_at, id")
            .bind(thread_id)
            .fetch_all(pool)
            .await?;

    rows.iter().map(message_from_row).collect()
}

fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<MessageRecord> {
    let role_raw: String = row.get("role");
    let role = Role::parse(&role_raw)
        .ok_or_else(|| AppError::Database(format!("unknown message role: {role_raw}")))?;

    let parts_json: String = row.get("parts_json");
    let parts: Vec<MessagePart> = serde_json::from_str(&parts_json)?;

    let metadata: Option<MessageMetadata> = row
        .get::<Option<String>, _>("metadata_json")
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;

    Ok(MessageRecord {
        id: row.get("id"),
        thread_id: row.get("thread_id"),
        owner_id: row.get("owner_id"),
        role,
        message_id: row.get("message_id"),
        parts,
        metadata,
        created_at: row.get("created_at"),
    })
}

// ============ Chat attachment files ============

/// Register a chat attachment. `markdown` carries the extracted text
/// produced by the external OCR service; it becomes model context when the
/// file is referenced from a turn.
pub async fn insert_chat_file(
    pool: &SqlitePool,
    owner_id: &str,
    filename: &str,
    content_type: &str,
    size: i64,
    storage_ref: &str,
    markdown: Option<&str>,
) -> Result<ChatFileRecord> {
    let record = ChatFileRecord {
        id: Uuid::new_v4().to_string(),
        owner_id: owner_id.to_string(),
        filename: filename.to_string(),
        content_type: content_type.to_string(),
        size,
        storage_ref: storage_ref.to_string(),
        markdown: markdown.map(str::to_string),
        created_at: chrono::Utc::now().timestamp_millis(),
    };

    sqlx::query(
        r#"
        INSERT INTO chat_files (id, owner_id, filename, content_type, size, storage_ref, markdown, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.id)
    .bind(&record.owner_id)
    .bind(&record.filename)
    .bind(&record.content_type)
    .bind(record.size)
    .bind(&record.storage_ref)
    .bind(&record.markdown)
    .bind(record.created_at)
    .execute(pool)
    .await?;

    Ok(record)
}

/// Fetch the caller's chat files for the given ids. Foreign or missing
/// ids are skipped, not errors — a stale reference in old metadata must
/// not break rendering.
pub async fn get_files_for_chat(
    pool: &SqlitePool,
    owner_id: &str,
    chat_file_ids: &[String],
) -> Result<Vec<ChatFileRecord>> {
    let mut files = Vec::with_capacity(chat_file_ids.len());
    for id in chat_file_ids {
        let row = sqlx::query("SELECT * FROM chat_files WHERE id = ? AND owner_id = ?")
            .bind(id)
            .bind(owner_id)
            .fetch_optional(pool)
            .await?;
        if let Some(row) = row {
            files.push(ChatFileRecord {
                id: row.get("id"),
                owner_id: row.get("owner_id"),
                filename: row.get("filename"),
                content_type: row.get("content_type"),
                size: row.get("size"),
                storage_ref: row.get("storage_ref"),
                markdown: row.get("markdown"),
                created_at: row.get("created_at"),
            });
        }
    }
    Ok(files)
}
