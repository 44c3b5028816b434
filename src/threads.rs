//! Owner-scoped chat thread persistence.
//!
//! Threads start with a placeholder title; a background job derives a real
//! title from the first message and writes it only while the title is
//! still the placeholder, so concurrent title jobs cannot clobber a name
//! the user already sees.

use sqlx::{Row, SqlitePool};
use tracing::warn;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::llm::{ChatMessage, ChatRequest, GenerationModel};
use crate::models::ThreadRecord;
use crate::prompts;

pub const DEFAULT_THREAD_TITLE: &str = "New chat";

pub async fn create_thread(pool: &SqlitePool, owner_id: &str) -> Result<ThreadRecord> {
    let now = chrono::Utc::now().timestamp_millis();
    let record = ThreadRecord {
        id: Uuid::new_v4().to_string(),
        owner_id: owner_id.to_string(),
        title: DEFAULT_THREAD_TITLE.to_string(),
        created_at: now,
        updated_at: now,
    };

    sqlx::query(
        "INSERT INTO chat_threads (id, owner_id, title, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&record.id)
    .bind(&record.owner_id)
    .bind(&record.title)
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(pool)
    .await?;

    Ok(record)
}

/// Fetch a thread the caller owns; `None` when missing or foreign.
pub async fn get_thread(
    pool: &SqlitePool,
    owner_id: &str,
    thread_id: &str,
) -> Result<Option<ThreadRecord>> {
    let row = sqlx::query("SELECT * FROM chat_threads WHERE id = ? AND owner_id = ?")
        .bind(thread_id)
        .bind(owner_id)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|r| thread_from_row(&r)))
}

pub async fn list_threads(
    pool: &SqlitePool,
    owner_id: &str,
    limit: i64,
) -> Result<Vec<ThreadRecord>> {
    let rows =
        sqlx::query("SELECT * FROM chat_threads WHERE owner_id = ? ORDER BY updated_at DESC LIMIT ?")
            .bind(owner_id)
            .bind(limit)
            .fetch_all(pool)
            .await?;

    Ok(rows.iter().map(thread_from_row).collect())
}

pub async fn touch_thread(pool: &SqlitePool, thread_id: &str) -> Result<()> {
    sqlx::query("UPDATE chat_threads SET updated_at = ? WHERE id = ?")
        .bind(chrono::Utc::now().timestamp_millis())
        .bind(thread_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Write a derived title, but only while the thread still carries the
/// placeholder. Returns whether the title was written.
pub async fn update_title_if_placeholder(
    pool: &SqlitePool,
    owner_id: &str,
    thread_id: &str,
    title: &str,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE chat_threads SET title = ?, updated_at = ? WHERE id = ? AND owner_id = ? AND title = ?",
    )
    .bind(title)
    .bind(chrono::Utc::now().timestamp_millis())
    .bind(thread_id)
    .bind(owner_id)
    .bind(DEFAULT_THREAD_TITLE)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Derive a 3-5 word title from the first user message and store it.
/// Intended to run as a spawned background job; failures are logged, never
/// surfaced to the user.
pub async fn generate_thread_title(
    pool: &SqlitePool,
    model: &dyn GenerationModel,
    owner_id: &str,
    thread_id: &str,
    message: &str,
) -> Result<()> {
    let request = ChatRequest::new(vec![
        ChatMessage::system(prompts::TITLE_PROMPT),
        ChatMessage::user(format!("The user's message is: {message}")),
    ]);

    let response = model.complete(&request).await?;
    let title = truncate_title(&response.content);
    let title = if title.is_empty() {
        DEFAULT_THREAD_TITLE
    } else {
        &title
    };

    if !update_title_if_placeholder(pool, owner_id, thread_id, title).await? {
        warn!(thread = %thread_id, "skipped title update; thread already titled");
    }
    Ok(())
}

/// Whitespace-split and keep at most five words.
fn truncate_title(raw: &str) -> String {
    raw.split_whitespace()
        .take(5)
        .collect::<Vec<_>>()
        .join(" ")
}

fn thread_from_row(row: &sqlx::sqlite::SqliteRow) -> ThreadRecord {
    ThreadRecord {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        title: row.get("title"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

/// Resolve a thread for the caller or fail with `THREAD_NOT_FOUND`.
pub async fn require_thread(
    pool: &SqlitePool,
    owner_id: &str,
    thread_id: &str,
) -> Result<ThreadRecord> {
    get_thread(pool, owner_id, thread_id)
        .await?
        .ok_or(AppError::ThreadNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        pool
    }

    #[test]
    fn test_truncate_title_limits_words() {
        assert_eq!(truncate_title("One Two Three Four Five Six"), "One Two Three Four Five");
        assert_eq!(truncate_title("  spaced   out  "), "spaced out");
        assert_eq!(truncate_title(""), "");
    }

    #[tokio::test]
    async fn test_create_and_get_thread() {
        let pool = test_pool().await;
        let thread = create_thread(&pool, "alice").await.unwrap();
        assert_eq!(thread.title, DEFAULT_THREAD_TITLE);

        let fetched = get_thread(&pool, "alice", &thread.id).await.unwrap();
        assert!(fetched.is_some());

        // Foreign owner sees nothing
        let foreign = get_thread(&pool, "bob", &thread.id).await.unwrap();
        assert!(foreign.is_none());
    }

    #[tokio::test]
    async fn test_title_only_replaces_placeholder() {
        let pool = test_pool().await;
        let thread = create_thread(&pool, "alice").await.unwrap();

        assert!(update_title_if_placeholder(&pool, "alice", &thread.id, "Rust Questions")
            .await
            .unwrap());

        // A second (racing) title job must not overwrite
        assert!(!update_title_if_placeholder(&pool, "alice", &thread.id, "Other Title")
            .await
            .unwrap());

        let fetched = get_thread(&pool, "alice", &thread.id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "Rust Questions");
    }

    #[tokio::test]
    async fn test_list_threads_newest_first() {
        let pool = test_pool().await;
        let first = create_thread(&pool, "alice").await.unwrap();
        let second = create_thread(&pool, "alice").await.unwrap();
        create_thread(&pool, "bob").await.unwrap();

        touch_thread(&pool, &second.id).await.unwrap();

        let listed = list_threads(&pool, "alice", 50).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
    }
}
