//! HTTP server exposing the chat and knowledge-base API.
//!
//! # Endpoints
//!
//! | Method   | Path | Description |
//! |----------|------|-------------|
//! | `POST`   | `/api/chat` | Run one chat turn; streamed SSE response |
//! | `POST`   | `/api/threads` | Create a thread (async title derivation) |
//! | `GET`    | `/api/threads` | List the caller's threads |
//! | `GET`    | `/api/threads/{id}/messages` | List a thread's messages |
//! | `POST`   | `/api/chat/files` | Register a chat attachment |
//! | `POST`   | `/api/kb/files` | Register a knowledge-base upload |
//! | `GET`    | `/api/kb/files` | List knowledge-base files |
//! | `POST`   | `/api/kb/files/{id}/retry` | Retry a failed file |
//! | `DELETE` | `/api/kb/files/{id}` | Delete a file and its chunks |
//! | `POST`   | `/api/kb/search` | Search the caller's knowledge base |
//! | `GET`    | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! Failures return `{ "error": { "code": "...", "message": "..." } }` with
//! the status mapped from the error code; see [`crate::error::AppError`].
//! Once a chat stream has started, generation failures surface as an
//! `error` frame inside the stream instead.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser
//! clients.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use crate::auth::{caller_identity, AuthKeys};
use crate::chat::{ChatService, TurnRequest};
use crate::config::Config;
use crate::db;
use crate::embedding::RemoteEmbedder;
use crate::error::{AppError, Result};
use crate::ingest::{self, IngestContext};
use crate::llm::OpenAiCompatibleModel;
use crate::migrate;
use crate::models::{KbFileRecord, MessageRecord, ThreadRecord};
use crate::retrieve;
use crate::segmenter::HttpSegmenter;
use crate::threads;
use crate::{kb, messages};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub chat: ChatService,
    pub ingest: IngestContext,
    pub auth: Arc<AuthKeys>,
}

/// Build clients from configuration and serve until terminated.
pub async fn run_server(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    let model = Arc::new(OpenAiCompatibleModel::new(config.llm.clone())?);
    let embedder = Arc::new(RemoteEmbedder::new(config.embedding.clone())?);
    let segmenter = Arc::new(HttpSegmenter::new(config.ingest.clone())?);

    let state = AppState {
        chat: ChatService {
            pool: pool.clone(),
            model,
            embedder: embedder.clone(),
            retrieval: config.retrieval.clone(),
            turn_timeout: std::time::Duration::from_secs(config.server.turn_timeout_secs),
        },
        ingest: IngestContext {
            pool,
            embedder,
            segmenter,
            config: config.ingest.clone(),
        },
        auth: Arc::new(AuthKeys::new(&config.auth.token_secret)),
    };

    serve(state, &config.server.bind).await
}

/// Serve a pre-built state. Split from [`run_server`] so tests and custom
/// binaries can inject their own model clients.
pub async fn serve(state: AppState, bind_addr: &str) -> Result<()> {
    let app = router(state);

    println!("factweave listening on http://{bind_addr}");

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|e| AppError::internal(format!("failed to bind {bind_addr}: {e}")))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| AppError::internal(format!("server error: {e}")))?;

    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/chat", post(handle_chat))
        .route("/api/threads", post(handle_create_thread))
        .route("/api/threads", get(handle_list_threads))
        .route("/api/threads/{id}/messages", get(handle_list_messages))
        .route("/api/chat/files", post(handle_register_chat_file))
        .route("/api/kb/files", post(handle_register_kb_file))
        .route("/api/kb/files", get(handle_list_kb_files))
        .route("/api/kb/files/{id}/retry", post(handle_retry_kb_file))
        .route("/api/kb/files/{id}", delete(handle_delete_kb_file))
        .route("/api/kb/search", post(handle_kb_search))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /api/chat ============

/// Run one chat turn. Validation failures return a JSON error with no
/// stream; a validated turn responds with an SSE stream of framed events.
async fn handle_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TurnRequest>,
) -> Result<impl IntoResponse> {
    let owner_id = caller_identity(&headers, &state.auth)?;

    let events = state.chat.run_turn(&owner_id, request).await?;

    let sse_stream = events.map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|e| {
            error!("failed to serialize chat event: {e}");
            "{\"type\":\"error\",\"message\":\"serialization failure\"}".to_string()
        });
        Ok::<_, Infallible>(Event::default().data(data))
    });

    Ok(Sse::new(sse_stream).keep_alive(KeepAlive::default()))
}

// ============ Threads ============

#[derive(Deserialize)]
struct CreateThreadRequest {
    /// Optional first message; triggers async title derivation.
    message: Option<String>,
}

async fn handle_create_thread(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateThreadRequest>,
) -> Result<(StatusCode, Json<ThreadRecord>)> {
    let owner_id = caller_identity(&headers, &state.auth)?;

    let thread = threads::create_thread(&state.chat.pool, &owner_id).await?;

    if let Some(message) = request.message.filter(|m| !m.trim().is_empty()) {
        let pool = state.chat.pool.clone();
        let model = state.chat.model.clone();
        let thread_id = thread.id.clone();
        let owner = owner_id.clone();
        tokio::spawn(async move {
            if let Err(e) =
                threads::generate_thread_title(&pool, model.as_ref(), &owner, &thread_id, &message)
                    .await
            {
                error!(thread = %thread_id, "title generation failed: {e}");
            }
        });
    }

    Ok((StatusCode::CREATED, Json(thread)))
}

#[derive(Deserialize)]
struct ListThreadsQuery {
    limit: Option<i64>,
}

async fn handle_list_threads(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListThreadsQuery>,
) -> Result<Json<Vec<ThreadRecord>>> {
    let owner_id = caller_identity(&headers, &state.auth)?;
    let listed =
        threads::list_threads(&state.chat.pool, &owner_id, query.limit.unwrap_or(50)).await?;
    Ok(Json(listed))
}

async fn handle_list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(thread_id): Path<String>,
) -> Result<Json<Vec<MessageRecord>>> {
    let owner_id = caller_identity(&headers, &state.auth)?;
    let listed = messages::list_by_thread(&state.chat.pool, &owner_id, &thread_id).await?;
    Ok(Json(listed))
}

// ============ Chat attachments ============

#[derive(Deserialize)]
struct RegisterChatFileRequest {
    filename: String,
    content_type: String,
    size: i64,
    storage_ref: String,
    /// Extracted text produced by the external OCR service.
    markdown: Option<String>,
}

async fn handle_register_chat_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RegisterChatFileRequest>,
) -> Result<(StatusCode, Json<crate::models::ChatFileRecord>)> {
    let owner_id = caller_identity(&headers, &state.auth)?;
    let file = messages::insert_chat_file(
        &state.chat.pool,
        &owner_id,
        &request.filename,
        &request.content_type,
        request.size,
        &request.storage_ref,
        request.markdown.as_deref(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(file)))
}

// ============ Knowledge base ============

#[derive(Deserialize)]
struct RegisterKbFileRequest {
    filename: String,
    content_type: String,
    size: u64,
    /// URL the segmenter can fetch the stored file from.
    storage_ref: String,
}

async fn handle_register_kb_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RegisterKbFileRequest>,
) -> Result<(StatusCode, Json<KbFileRecord>)> {
    let owner_id = caller_identity(&headers, &state.auth)?;
    let file = ingest::register_upload(
        &state.ingest,
        &owner_id,
        &request.filename,
        &request.content_type,
        request.size,
        &request.storage_ref,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(file)))
}

async fn handle_list_kb_files(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<KbFileRecord>>> {
    let owner_id = caller_identity(&headers, &state.auth)?;
    let files = kb::list_files(&state.chat.pool, &owner_id).await?;
    Ok(Json(files))
}

async fn handle_retry_kb_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(file_id): Path<String>,
) -> Result<StatusCode> {
    let owner_id = caller_identity(&headers, &state.auth)?;
    ingest::retry_process_file(&state.ingest, &owner_id, &file_id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn handle_delete_kb_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(file_id): Path<String>,
) -> Result<StatusCode> {
    let owner_id = caller_identity(&headers, &state.auth)?;
    kb::delete_file(&state.chat.pool, &owner_id, &file_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct KbSearchRequest {
    query: String,
    limit: Option<i64>,
}

async fn handle_kb_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<KbSearchRequest>,
) -> Result<Json<Vec<crate::models::EvidenceMatch>>> {
    let owner_id = caller_identity(&headers, &state.auth)?;
    if request.query.trim().is_empty() {
        return Err(AppError::InvalidRequest("query must not be empty".into()));
    }

    let matches = retrieve::retrieve(
        &state.chat.pool,
        state.chat.embedder.as_ref(),
        &state.chat.retrieval,
        &owner_id,
        &request.query,
        request.limit,
    )
    .await?;
    Ok(Json(matches))
}
