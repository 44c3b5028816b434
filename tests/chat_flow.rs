//! End-to-end turn scenarios driven through `ChatService` with scripted
//! model clients over an in-memory database.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_stream::StreamExt;

use factweave::chat::{ChatEvent, ChatService, IncomingMessage, TurnRequest};
use factweave::config::RetrievalConfig;
use factweave::embedding::EmbeddingModel;
use factweave::error::{AppError, Result};
use factweave::llm::{ChatRequest, ChatResponse, ChatStream, GenerationModel, StreamChunk};
use factweave::models::{MessagePart, NewChunk, Role};
use factweave::{kb, messages, migrate, prompts, threads};

// ============ Fakes ============

struct FakeEmbedder;

#[async_trait]
impl EmbeddingModel for FakeEmbedder {
    fn dims(&self) -> usize {
        2
    }
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![1.0, 0.0])
    }
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
    }
}

/// Content-addressed fake: answers each call site by its system prompt, so
/// concurrent calls stay deterministic. Records the system prompt and user
/// content of every streaming call for assertions.
struct FakeModel {
    route: &'static str,
    claims: Vec<String>,
    verdicts: HashMap<String, serde_json::Value>,
    draft: String,
    stream_text: String,
    stream_calls: Mutex<Vec<(String, String)>>,
}

impl FakeModel {
    fn general(stream_text: &str) -> Self {
        Self::new("general_chat", vec![], HashMap::new(), "", stream_text)
    }

    fn new(
        route: &'static str,
        claims: Vec<&str>,
        verdicts: HashMap<String, serde_json::Value>,
        draft: &str,
        stream_text: &str,
    ) -> Self {
        Self {
            route,
            claims: claims.into_iter().map(str::to_string).collect(),
            verdicts,
            draft: draft.to_string(),
            stream_text: stream_text.to_string(),
            stream_calls: Mutex::new(Vec::new()),
        }
    }

    fn stream_calls(&self) -> Vec<(String, String)> {
        self.stream_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationModel for FakeModel {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let system = &request.messages[0].content;
        if system.starts_with(prompts::DRAFT_PROMPT) {
            return Ok(ChatResponse {
                content: self.draft.clone(),
                finish_reason: Some("stop".into()),
            });
        }
        Err(AppError::internal(format!(
            "unexpected complete call: {}",
            &system[..system.len().min(40)]
        )))
    }

    async fn complete_stream(&self, request: &ChatRequest) -> Result<ChatStream> {
        let system = request.messages[0].content.clone();
        let user = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.stream_calls.lock().unwrap().push((system, user));

        let halfway = self.stream_text.len() / 2;
        let (first, second) = self.stream_text.split_at(halfway);
        let chunks = vec![
            Ok(StreamChunk {
                delta: first.to_string(),
                is_final: false,
                finish_reason: None,
            }),
            Ok(StreamChunk {
                delta: second.to_string(),
                is_final: true,
                finish_reason: Some("stop".into()),
            }),
        ];
        Ok(Box::pin(tokio_stream::iter(chunks)))
    }

    async fn complete_structured(&self, request: &ChatRequest) -> Result<serde_json::Value> {
        let system = &request.messages[0].content;
        if system == prompts::ROUTER_PROMPT {
            return Ok(serde_json::json!({ "route": self.route }));
        }
        if system == prompts::EXTRACT_CLAIMS_PROMPT {
            return Ok(serde_json::json!({ "claims": self.claims }));
        }
        if system == prompts::ADJUDICATE_PROMPT {
            let user = &request.messages[1].content;
            for (claim, verdict) in &self.verdicts {
                if user.contains(claim.as_str()) {
                    return Ok(verdict.clone());
                }
            }
            return Err(AppError::internal("no scripted verdict matched"));
        }
        Err(AppError::internal("unexpected structured call"))
    }
}

// ============ Harness ============

async fn service(model: FakeModel) -> (ChatService, Arc<FakeModel>) {
    let pool: SqlitePool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    migrate::run_migrations(&pool).await.unwrap();

    let model = Arc::new(model);
    let service = ChatService {
        pool,
        model: model.clone(),
        embedder: Arc::new(FakeEmbedder),
        retrieval: RetrievalConfig::default(),
        turn_timeout: Duration::from_secs(120),
    };
    (service, model)
}

fn turn(thread_id: &str, text: &str) -> TurnRequest {
    TurnRequest {
        messages: vec![IncomingMessage {
            id: "m-user".to_string(),
            role: Role::User,
            parts: vec![MessagePart::text(text)],
        }],
        thread_id: Some(thread_id.to_string()),
        chat_file_ids: vec![],
        trigger: None,
    }
}

async fn collect_events(service: &ChatService, owner: &str, request: TurnRequest) -> Vec<ChatEvent> {
    let mut stream = service.run_turn(owner, request).await.unwrap();
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }
    events
}

fn streamed_text(events: &[ChatEvent]) -> String {
    events
        .iter()
        .filter_map(|event| match event {
            ChatEvent::TextDelta { delta } => Some(delta.as_str()),
            _ => None,
        })
        .collect()
}

/// Wait for the background persistence task to write the assistant turn.
async fn wait_for_messages(
    service: &ChatService,
    owner: &str,
    thread_id: &str,
    count: usize,
) -> Vec<factweave::models::MessageRecord> {
    for _ in 0..100 {
        let listed = messages::list_by_thread(&service.pool, owner, thread_id)
            .await
            .unwrap();
        if listed.len() >= count {
            return listed;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("assistant turn was not persisted in time");
}

fn unsupported_verdict() -> serde_json::Value {
    serde_json::json!({
        "is_supported": false,
        "document_name": null,
        "matching_text": null,
        "source_id": null
    })
}

// ============ Scenario A: general chat ============

#[tokio::test]
async fn test_general_chat_turn_streams_and_persists() {
    let (service, model) = service(FakeModel::general("Hello! I'm doing well.")).await;
    let thread = threads::create_thread(&service.pool, "alice").await.unwrap();

    let events = collect_events(&service, "alice", turn(&thread.id, "Hello, how are you?")).await;

    assert!(events.iter().all(|e| !matches!(e, ChatEvent::Source { .. })));
    assert!(matches!(events.last(), Some(ChatEvent::Finish)));
    assert_eq!(streamed_text(&events), "Hello! I'm doing well.");

    let listed = wait_for_messages(&service, "alice", &thread.id, 2).await;
    assert_eq!(listed[0].role, Role::User);
    assert_eq!(listed[1].role, Role::Assistant);
    let assistant_text: String = listed[1]
        .parts
        .iter()
        .filter_map(MessagePart::as_text)
        .collect();
    assert!(!assistant_text.is_empty());
    assert!(listed[1].metadata.is_none());

    // No verification machinery ran
    assert_eq!(model.stream_calls().len(), 1);
}

// ============ Scenario B: fact-check with no evidence ============

#[tokio::test]
async fn test_fact_check_unsupported_claim_reported() {
    let claim = "The Eiffel Tower is located in Berlin";
    let mut verdicts = HashMap::new();
    verdicts.insert(claim.to_string(), unsupported_verdict());

    let (service, model) = service(FakeModel::new(
        "fact_check_input",
        vec![claim],
        verdicts,
        "",
        "That claim is not supported by your documents.",
    ))
    .await;
    let thread = threads::create_thread(&service.pool, "alice").await.unwrap();

    let events = collect_events(&service, "alice", turn(&thread.id, claim)).await;

    // No citations on a fully-unsupported check
    assert!(events.iter().all(|e| !matches!(e, ChatEvent::Source { .. })));
    assert!(streamed_text(&events).contains("not supported"));

    // The summarizer saw the verdict in stable order
    let calls = model.stream_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, prompts::SUMMARY_PROMPT);
    assert!(calls[0].1.contains("not supported by the documents"));
    assert!(calls[0].1.contains(claim));
}

// ============ Scenario C: generate with a failing claim ============

#[tokio::test]
async fn test_generate_with_failed_claim_takes_rewrite_path() {
    let claim = "The product cures all known diseases";
    let mut verdicts = HashMap::new();
    verdicts.insert(claim.to_string(), unsupported_verdict());

    let (service, model) = service(FakeModel::new(
        "generate_content",
        vec![claim],
        verdicts,
        "Our product cures all known diseases and ships worldwide.",
        "Our product ships worldwide.",
    ))
    .await;
    let thread = threads::create_thread(&service.pool, "alice").await.unwrap();

    let events = collect_events(&service, "alice", turn(&thread.id, "write product copy")).await;

    // Rewrite responses never carry citation parts
    assert!(events.iter().all(|e| !matches!(e, ChatEvent::Source { .. })));
    assert!(matches!(events.last(), Some(ChatEvent::Finish)));

    let calls = model.stream_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, prompts::REWRITE_PROMPT);
    assert!(calls[0].1.contains("Our product cures all known diseases"));
    assert!(calls[0].1.contains(claim));

    let listed = wait_for_messages(&service, "alice", &thread.id, 2).await;
    assert!(listed[1].parts.iter().all(|p| !p.is_source()));
}

// ============ Scenario D: generate with all claims supported ============

#[tokio::test]
async fn test_generate_with_supported_claims_cites_sources() {
    let claim = "The product is ISO 9001 certified";

    // Seed alice's knowledge base with the supporting chunk first, so the
    // scripted verdict can cite its real derived source id.
    let pool: SqlitePool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    let file = kb::insert_file(&pool, "alice", "certs.pdf", "application/pdf", 10, "ref")
        .await
        .unwrap();
    kb::insert_chunks(
        &pool,
        &[NewChunk {
            owner_id: "alice".into(),
            file_id: file.id.clone(),
            chunk_index: 0,
            chunk_id: None,
            segment_id: Some("seg-0".into()),
            page_number: Some(4),
            page_width: None,
            page_height: None,
            bbox: None,
            content: "The product is ISO 9001 certified since 2019.".into(),
            embed_text: "The product is ISO 9001 certified since 2019.".into(),
            embedding: vec![1.0, 0.0],
        }],
    )
    .await
    .unwrap();
    let source_id = format!("{}:seg-0", file.id);

    let mut verdicts = HashMap::new();
    verdicts.insert(
        claim.to_string(),
        serde_json::json!({
            "is_supported": true,
            "document_name": "certs.pdf",
            "matching_text": "ISO 9001 certified since 2019",
            "source_id": source_id
        }),
    );

    let model = Arc::new(FakeModel::new(
        "generate_content",
        vec![claim],
        verdicts,
        "Our product is ISO 9001 certified.",
        "Here is your verified copy: Our product is ISO 9001 certified.",
    ));
    let service = ChatService {
        pool,
        model: model.clone(),
        embedder: Arc::new(FakeEmbedder),
        retrieval: RetrievalConfig::default(),
        turn_timeout: Duration::from_secs(120),
    };
    let thread = threads::create_thread(&service.pool, "alice").await.unwrap();

    let events = collect_events(&service, "alice", turn(&thread.id, "write product copy")).await;

    // Citations precede all text deltas
    let first_text = events
        .iter()
        .position(|e| matches!(e, ChatEvent::TextDelta { .. }))
        .unwrap();
    let source_positions: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, ChatEvent::Source { .. }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(source_positions.len(), 1);
    assert!(source_positions[0] < first_text);

    match &events[source_positions[0]] {
        ChatEvent::Source {
            source_id: cited,
            title,
            provider_metadata,
            ..
        } => {
            assert_eq!(cited, &source_id);
            assert_eq!(title, "certs.pdf");
            assert_eq!(provider_metadata.page_number, Some(4));
            assert_eq!(
                provider_metadata.snippet.as_deref(),
                Some("ISO 9001 certified since 2019")
            );
        }
        _ => unreachable!(),
    }

    // Summary path ran, not rewrite, and carries the approved draft
    let calls = model.stream_calls();
    assert_eq!(calls[0].0, prompts::APPROVED_DRAFT_PROMPT);
    assert!(calls[0].1.contains("Our product is ISO 9001 certified."));

    // Persisted assistant turn includes the citation part
    let listed = wait_for_messages(&service, "alice", &thread.id, 2).await;
    assert!(listed[1].parts.iter().any(|p| p.is_source()));
}

// ============ Abort mid-stream ============

/// General-chat fake whose stream drips tokens slowly and never runs dry
/// on its own, so a client disconnect is always observed mid-stream.
struct DrippingModel;

#[async_trait]
impl GenerationModel for DrippingModel {
    async fn complete(&self, _request: &ChatRequest) -> Result<ChatResponse> {
        Err(AppError::internal("not used"))
    }

    async fn complete_stream(&self, _request: &ChatRequest) -> Result<ChatStream> {
        Ok(Box::pin(async_stream::stream! {
            for i in 0..1000 {
                tokio::time::sleep(Duration::from_millis(5)).await;
                yield Ok(StreamChunk {
                    delta: format!("token {i} "),
                    is_final: false,
                    finish_reason: None,
                });
            }
        }))
    }

    async fn complete_structured(&self, _request: &ChatRequest) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "route": "general_chat" }))
    }
}

#[tokio::test]
async fn test_client_abort_persists_partial_turn_as_aborted() {
    let pool: SqlitePool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    let service = ChatService {
        pool,
        model: Arc::new(DrippingModel),
        embedder: Arc::new(FakeEmbedder),
        retrieval: RetrievalConfig::default(),
        turn_timeout: Duration::from_secs(120),
    };
    let thread = threads::create_thread(&service.pool, "alice").await.unwrap();

    let mut stream = service
        .run_turn("alice", turn(&thread.id, "tell me something long"))
        .await
        .unwrap();

    // Consume one delta, then disconnect
    let first = stream.next().await;
    assert!(matches!(first, Some(ChatEvent::TextDelta { .. })));
    drop(stream);

    let listed = wait_for_messages(&service, "alice", &thread.id, 2).await;
    let assistant = &listed[1];
    assert_eq!(assistant.role, Role::Assistant);
    assert!(assistant.metadata.as_ref().is_some_and(|m| m.aborted));
    // Partial content was still captured
    let text: String = assistant
        .parts
        .iter()
        .filter_map(MessagePart::as_text)
        .collect();
    assert!(!text.is_empty());
}

// ============ Validation guards ============

#[tokio::test]
async fn test_missing_thread_is_rejected() {
    let (service, _model) = service(FakeModel::general("hi")).await;

    let err = service
        .run_turn("alice", turn("does-not-exist", "hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ThreadNotFound));
}

#[tokio::test]
async fn test_foreign_thread_is_not_found() {
    let (service, _model) = service(FakeModel::general("hi")).await;
    let thread = threads::create_thread(&service.pool, "alice").await.unwrap();

    let err = service
        .run_turn("mallory", turn(&thread.id, "hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ThreadNotFound));
}

#[tokio::test]
async fn test_empty_batch_is_rejected() {
    let (service, _model) = service(FakeModel::general("hi")).await;
    let thread = threads::create_thread(&service.pool, "alice").await.unwrap();

    let request = TurnRequest {
        messages: vec![],
        thread_id: Some(thread.id.clone()),
        chat_file_ids: vec![],
        trigger: None,
    };
    let err = service.run_turn("alice", request).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_empty_parts_are_rejected() {
    let (service, _model) = service(FakeModel::general("hi")).await;
    let thread = threads::create_thread(&service.pool, "alice").await.unwrap();

    let request = TurnRequest {
        messages: vec![IncomingMessage {
            id: "m1".to_string(),
            role: Role::User,
            parts: vec![],
        }],
        thread_id: Some(thread.id.clone()),
        chat_file_ids: vec![],
        trigger: None,
    };
    let err = service.run_turn("alice", request).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidMessages(_)));
}

#[tokio::test]
async fn test_regenerate_does_not_duplicate_user_turn() {
    let (service, _model) = service(FakeModel::general("again")).await;
    let thread = threads::create_thread(&service.pool, "alice").await.unwrap();

    let _ = collect_events(&service, "alice", turn(&thread.id, "hello")).await;
    let listed = wait_for_messages(&service, "alice", &thread.id, 2).await;
    assert_eq!(listed.len(), 2);

    let mut replay = turn(&thread.id, "hello");
    replay.trigger = Some("regenerate".to_string());
    let _ = collect_events(&service, "alice", replay).await;

    let listed = wait_for_messages(&service, "alice", &thread.id, 3).await;
    // One user turn, two assistant turns
    let user_turns = listed.iter().filter(|m| m.role == Role::User).count();
    assert_eq!(user_turns, 1);
}
