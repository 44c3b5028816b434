use sqlx::SqlitePool;

use crate::error::Result;

/// Create all tables and indexes. Idempotent — safe to run on every start.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Conversation containers
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chat_threads (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            title TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Persisted turns; parts and metadata are stored as JSON text.
    // owner_id is set for user turns only.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chat_messages (
            id TEXT PRIMARY KEY,
            thread_id TEXT NOT NULL,
            owner_id TEXT,
            role TEXT NOT NULL,
            message_id TEXT NOT NULL,
            parts_json TEXT NOT NULL,
            metadata_json TEXT,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (thread_id) REFERENCES chat_threads(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-chat attachment files; markdown holds the extracted text used as
    // model context at render/generation time.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chat_files (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            filename TEXT NOT NULL,
            content_type TEXT NOT NULL,
            size INTEGER NOT NULL,
            storage_ref TEXT NOT NULL,
            markdown TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Knowledge-base files with processing lifecycle
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kb_files (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            filename TEXT NOT NULL,
            content_type TEXT NOT NULL,
            size INTEGER NOT NULL,
            storage_ref TEXT NOT NULL,
            status TEXT NOT NULL,
            error_message TEXT,
            chunk_count INTEGER,
            task_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Evidence chunks; embedding is a little-endian f32 BLOB
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kb_chunks (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            file_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            chunk_id TEXT,
            segment_id TEXT,
            page_number INTEGER,
            page_width REAL,
            page_height REAL,
            bbox_json TEXT,
            content TEXT NOT NULL,
            embed_text TEXT NOT NULL,
            embedding BLOB NOT NULL,
            FOREIGN KEY (file_id) REFERENCES kb_files(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_threads_owner ON chat_threads(owner_id, updated_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_thread ON chat_messages(thread_id, created_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chat_files_owner ON chat_files(owner_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_kb_files_owner ON kb_files(owner_id, created_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_kb_chunks_file ON kb_chunks(file_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_kb_chunks_owner ON kb_chunks(owner_id)")
        .execute(pool)
        .await?;

    Ok(())
}
