//! Evidence retrieval for a single query or claim.
//!
//! Pipeline: embed the query text → owner-filtered nearest-neighbor search
//! in the evidence store → hydrate raw chunk ids into attributable
//! [`EvidenceMatch`] records (which re-checks ownership before content is
//! disclosed).

use sqlx::SqlitePool;

use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingModel;
use crate::error::Result;
use crate::kb;
use crate::models::EvidenceMatch;

/// Clamp a requested result count into `[1, max_search_limit]`.
/// Out-of-range requests are clamped, not rejected.
pub fn clamp_limit(config: &RetrievalConfig, requested: Option<i64>) -> i64 {
    requested
        .unwrap_or(config.default_search_limit)
        .clamp(1, config.max_search_limit)
}

/// Retrieve evidence for `query` from the caller's knowledge base.
pub async fn retrieve(
    pool: &SqlitePool,
    embedder: &dyn EmbeddingModel,
    config: &RetrievalConfig,
    owner_id: &str,
    query: &str,
    limit: Option<i64>,
) -> Result<Vec<EvidenceMatch>> {
    let limit = clamp_limit(config, limit);

    let query_vec = embedder.embed(query).await?;
    let chunk_ids = kb::vector_search(pool, owner_id, &query_vec, limit).await?;
    if chunk_ids.is_empty() {
        return Ok(Vec::new());
    }

    kb::hydrate_matches(pool, owner_id, &chunk_ids).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RetrievalConfig {
        RetrievalConfig {
            default_search_limit: 6,
            max_search_limit: 20,
            verify_search_limit: 12,
        }
    }

    #[test]
    fn test_clamp_uses_default_when_unspecified() {
        assert_eq!(clamp_limit(&config(), None), 6);
    }

    #[test]
    fn test_clamp_low_and_high() {
        assert_eq!(clamp_limit(&config(), Some(0)), 1);
        assert_eq!(clamp_limit(&config(), Some(-5)), 1);
        assert_eq!(clamp_limit(&config(), Some(500)), 20);
    }

    #[test]
    fn test_clamp_in_range_passthrough() {
        assert_eq!(clamp_limit(&config(), Some(12)), 12);
    }
}
