//! Intent routing for inbound turns.
//!
//! One structured model call classifies the latest user text into a
//! [`Route`]. There is no safe default route — mis-routing silently
//! changes user-visible behavior — so a non-conforming model output is a
//! fatal error for the turn rather than a fallback.

use serde::Deserialize;

use crate::error::Result;
use crate::llm::{generate_object, ChatMessage, ChatRequest, GenerationModel};
use crate::models::Route;
use crate::prompts;

#[derive(Debug, Deserialize)]
struct RouteDecision {
    route: Route,
}

/// Classify the latest user text. Decided once per inbound turn.
pub async fn classify(model: &dyn GenerationModel, latest_user_text: &str) -> Result<Route> {
    let request = ChatRequest::new(vec![
        ChatMessage::system(prompts::ROUTER_PROMPT),
        ChatMessage::user(latest_user_text.to_string()),
    ])
    .with_temperature(0.0);

    let decision: RouteDecision = generate_object(model, &request).await?;
    Ok(decision.route)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::llm::{ChatResponse, ChatStream};
    use async_trait::async_trait;

    /// Fake that always classifies to a fixed JSON payload.
    struct FixedModel {
        payload: serde_json::Value,
    }

    #[async_trait]
    impl GenerationModel for FixedModel {
        async fn complete(&self, _request: &ChatRequest) -> Result<ChatResponse> {
            Err(AppError::internal("not used"))
        }
        async fn complete_stream(&self, _request: &ChatRequest) -> Result<ChatStream> {
            Err(AppError::internal("not used"))
        }
        async fn complete_structured(&self, _request: &ChatRequest) -> Result<serde_json::Value> {
            Ok(self.payload.clone())
        }
    }

    #[tokio::test]
    async fn test_classify_parses_each_route() {
        for (name, expected) in [
            ("general_chat", Route::GeneralChat),
            ("fact_check_input", Route::FactCheckInput),
            ("generate_content", Route::GenerateContent),
        ] {
            let model = FixedModel {
                payload: serde_json::json!({ "route": name }),
            };
            assert_eq!(classify(&model, "hello").await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_classify_is_idempotent_for_fixed_model() {
        let model = FixedModel {
            payload: serde_json::json!({ "route": "fact_check_input" }),
        };
        let first = classify(&model, "is the sky blue?").await.unwrap();
        let second = classify(&model, "is the sky blue?").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_malformed_route_is_fatal() {
        let model = FixedModel {
            payload: serde_json::json!({ "route": "chitchat" }),
        };
        let err = classify(&model, "hello").await.unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
    }

    #[tokio::test]
    async fn test_missing_route_field_is_fatal() {
        let model = FixedModel {
            payload: serde_json::json!({ "intent": "general_chat" }),
        };
        assert!(classify(&model, "hello").await.is_err());
    }
}
