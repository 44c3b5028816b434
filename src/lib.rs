//! # Factweave
//!
//! A knowledge-grounded chat service with automatic claim verification.
//!
//! User messages are routed into one of three behaviors — general
//! conversation, fact-checking user-supplied text, or content generation
//! with automatic claim-checking — and grounded in a per-user knowledge
//! base of uploaded documents via retrieval-augmented search.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────────────────────┐   ┌───────────┐
//! │ Inbound  │──▶│ Router → Verify pipeline    │──▶│  SSE      │
//! │ turn     │   │ extract → retrieve → judge  │   │  stream   │
//! └──────────┘   └──────────────┬──────────────┘   └───────────┘
//!                               │
//!                ┌──────────────┴──────────────┐
//!                ▼                             ▼
//!          ┌──────────┐                  ┌──────────┐
//!          │  SQLite  │                  │  Models  │
//!          │ KB + chat│                  │ LLM/emb  │
//!          └──────────┘                  └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Domain errors and the wire error contract |
//! | [`auth`] | Bearer-token caller identity |
//! | [`llm`] | Generation-model abstraction |
//! | [`embedding`] | Embedding-model abstraction and vector utilities |
//! | [`segmenter`] | External document-segmentation client |
//! | [`ingest`] | Knowledge-base file lifecycle |
//! | [`kb`] | Evidence store (files, chunks, vector search) |
//! | [`retrieve`] | Per-claim evidence retrieval |
//! | [`verify`] | Claim extraction, adjudication, orchestration |
//! | [`route`] | Intent routing |
//! | [`chat`] | Response assembly and exactly-once persistence |
//! | [`threads`], [`messages`] | Owner-scoped conversation persistence |
//! | [`server`] | Axum HTTP server |

pub mod auth;
pub mod chat;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod kb;
pub mod llm;
pub mod messages;
pub mod migrate;
pub mod models;
pub mod prompts;
pub mod retrieve;
pub mod route;
pub mod segmenter;
pub mod server;
pub mod threads;
pub mod verify;
