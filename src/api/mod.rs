//! Local HTTP API over services, model discovery and challenges.
//!
//! Endpoints:
//! - GET /health - Health check
//! - GET /api/services - List services with key status
//! - POST /api/services - Add or replace a service
//! - DELETE /api/services/{id} - Remove a service and its key
//! - PUT /api/services/{id}/key - Store or clear an API key
//! - GET /api/models - Enabled, disabled and failed services
//! - POST /api/models/refresh - Rediscover models
//! - POST /api/models/{id}/toggle - Enable or disable a model
//! - POST /api/challenge - Send one prompt to several models
//! - GET /api/challenge - Current challenge board
//! - POST /api/challenge/{id}/retry - Re-ask one model
//! - DELETE /api/challenge/{id} - Drop one model from the board

mod handlers;
mod types;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::challenge::ChallengeOrchestrator;
use crate::config::{DEFAULT_CHALLENGE_CONCURRENCY, DEFAULT_DISCOVERY_CONCURRENCY};
use crate::credentials::CredentialManager;
use crate::discovery::ModelCatalog;
use crate::drivers::DriverFactory;
use crate::http::DEFAULT_TIMEOUT;
use crate::service::ServiceRegistry;

pub use types::*;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<ServiceRegistry>,
    pub credentials: CredentialManager,
    pub catalog: Arc<ModelCatalog>,
    pub challenge: Arc<ChallengeOrchestrator>,
}

impl AppState {
    pub fn new(
        services: ServiceRegistry,
        catalog: ModelCatalog,
        challenge: ChallengeOrchestrator,
    ) -> Self {
        Self {
            credentials: services.credentials().clone(),
            services: Arc::new(services),
            catalog: Arc::new(catalog),
            challenge: Arc::new(challenge),
        }
    }

    /// State that keeps everything in memory, with default limits.
    pub fn in_memory(factory: Arc<dyn DriverFactory>, credentials: CredentialManager) -> Self {
        Self::new(
            ServiceRegistry::in_memory(credentials),
            ModelCatalog::new(factory.clone(), DEFAULT_DISCOVERY_CONCURRENCY),
            ChallengeOrchestrator::new(factory, DEFAULT_CHALLENGE_CONCURRENCY, DEFAULT_TIMEOUT),
        )
    }
}

/// Create the API router with the given state.
pub fn create_router_with_state(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/services", get(handlers::list_services))
        .route("/api/services", post(handlers::create_service))
        .route("/api/services/{id}", delete(handlers::delete_service))
        .route("/api/services/{id}/key", put(handlers::set_api_key))
        .route("/api/models", get(handlers::list_models))
        .route("/api/models/refresh", post(handlers::refresh_models))
        .route("/api/models/{id}/toggle", post(handlers::toggle_model))
        .route("/api/challenge", post(handlers::start_challenge))
        .route("/api/challenge", get(handlers::get_challenge))
        .route("/api/challenge/{id}/retry", post(handlers::retry_model))
        .route("/api/challenge/{id}", delete(handlers::deselect_model))
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::testing::{service, FakeDriver, FakeFactory};
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use serde_json::json;

    fn test_server() -> TestServer {
        let factory = FakeFactory::new().with(
            FakeDriver::new(service("openai"))
                .with_models(&["gpt-4o", "gpt-4o-mini", "tts-1"])
                .with_reply("gpt-4o-mini", Err(LlmError::RateLimitExceeded)),
        );
        let state = AppState::in_memory(Arc::new(factory), CredentialManager::in_memory());
        TestServer::new(create_router_with_state(state)).unwrap()
    }

    async fn refreshed_server() -> TestServer {
        let server = test_server();
        server.post("/api/models/refresh").await.assert_status_ok();
        server
    }

    #[tokio::test]
    async fn health_check_returns_ok() {
        let server = test_server();

        let response = server.get("/health").await;

        response.assert_status_ok();
        response.assert_json(&json!({
            "app": "battleground",
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        }));
    }

    #[tokio::test]
    async fn lists_builtin_services_without_keys() {
        let server = test_server();

        let response = server.get("/api/services").await;

        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        let services = body["services"].as_array().unwrap();
        assert_eq!(services[0]["id"], "openai");
        assert_eq!(services[1]["id"], "anthropic");
        assert!(services.iter().all(|s| s["has_api_key"] == false));
        assert!(services.iter().all(|s| s.get("api_key").is_none()));
    }

    #[tokio::test]
    async fn creates_service_with_key() {
        let server = test_server();

        let response = server
            .post("/api/services")
            .json(&json!({
                "id": "local-llama",
                "name": "Local Llama",
                "protocol": "openai-compatible",
                "endpoint_url": "http://localhost:8080/v1",
                "api_key": "sk-local"
            }))
            .await;

        response.assert_status(StatusCode::CREATED);
        let body: serde_json::Value = response.json();
        assert_eq!(body["id"], "local-llama");
        assert_eq!(body["protocol"], "openai");
        assert_eq!(body["has_api_key"], true);

        let list: serde_json::Value = server.get("/api/services").await.json();
        let ids: Vec<&str> = list["services"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["id"].as_str().unwrap())
            .collect();
        assert!(ids.contains(&"local-llama"));
    }

    #[tokio::test]
    async fn rejects_service_with_bad_endpoint() {
        let server = test_server();

        let response = server
            .post("/api/services")
            .json(&json!({
                "name": "Broken",
                "protocol": "openai",
                "endpoint_url": "not a url"
            }))
            .await;

        response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
        let body: serde_json::Value = response.json();
        assert_eq!(body["error"]["type"], "unprocessable");
    }

    #[tokio::test]
    async fn deletes_service() {
        let server = test_server();

        server
            .delete("/api/services/anthropic")
            .await
            .assert_status(StatusCode::NO_CONTENT);
        let missing = server.delete("/api/services/anthropic").await;

        missing.assert_status(StatusCode::NOT_FOUND);
        let body: serde_json::Value = missing.json();
        assert_eq!(body["error"]["type"], "not_found");
    }

    #[tokio::test]
    async fn stores_and_clears_api_key() {
        let server = test_server();

        let stored = server
            .put("/api/services/openai/key")
            .json(&json!({"api_key": "sk-test"}))
            .await;
        stored.assert_status_ok();
        stored.assert_json(&json!({"service_id": "openai", "has_api_key": true}));

        let cleared = server
            .put("/api/services/openai/key")
            .json(&json!({"api_key": null}))
            .await;
        cleared.assert_json(&json!({"service_id": "openai", "has_api_key": false}));

        let list: serde_json::Value = server.get("/api/services").await.json();
        assert_eq!(list["services"][0]["has_api_key"], false);
    }

    #[tokio::test]
    async fn key_for_unknown_service_is_not_found() {
        let server = test_server();

        let response = server
            .put("/api/services/nope-nope/key")
            .json(&json!({"api_key": "sk"}))
            .await;

        response.assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn models_are_empty_before_refresh() {
        let server = test_server();

        let response = server.get("/api/models").await;

        response.assert_json(&json!({
            "enabled": [],
            "disabled": [],
            "errors": [],
            "refreshing": false
        }));
    }

    #[tokio::test]
    async fn refresh_collects_models_and_service_errors() {
        let server = test_server();

        let outcome = server.post("/api/models/refresh").await;

        outcome.assert_json(&json!({"status": "completed", "models": 2, "failures": 3}));
        let body: serde_json::Value = server.get("/api/models").await.json();
        let enabled: Vec<&str> = body["enabled"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert_eq!(enabled, vec!["openai:gpt-4o", "openai:gpt-4o-mini"]);
        assert_eq!(body["errors"].as_array().unwrap().len(), 3);
        assert_eq!(body["errors"][0]["service_id"], "anthropic");
        assert_eq!(body["errors"][0]["error"]["type"], "network_error");
    }

    #[tokio::test]
    async fn toggling_moves_model_between_lists() {
        let server = refreshed_server().await;

        let toggled = server.post("/api/models/openai:gpt-4o/toggle").await;

        toggled.assert_json(&json!({"id": "openai:gpt-4o", "enabled": false}));
        let body: serde_json::Value = server.get("/api/models").await.json();
        assert_eq!(body["disabled"][0]["id"], "openai:gpt-4o");
        assert_eq!(body["enabled"].as_array().unwrap().len(), 1);

        let again = server.post("/api/models/openai:gpt-4o/toggle").await;
        again.assert_json(&json!({"id": "openai:gpt-4o", "enabled": true}));
    }

    #[tokio::test]
    async fn toggling_unknown_model_is_not_found() {
        let server = refreshed_server().await;

        let response = server.post("/api/models/openai:missing/toggle").await;

        response.assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn challenge_reports_each_model() {
        let server = refreshed_server().await;

        let response = server
            .post("/api/challenge")
            .json(&json!({
                "prompt": "Say hello!",
                "models": ["openai:gpt-4o", "openai:gpt-4o-mini"]
            }))
            .await;

        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        assert_eq!(body["prompt"], "Say hello!");
        assert_eq!(
            body["responses"]["openai:gpt-4o"]["message"]["content"],
            "reply from gpt-4o"
        );
        assert_eq!(
            body["errors"]["openai:gpt-4o-mini"]["type"],
            "rate_limit_exceeded"
        );
        assert_eq!(body["pending"], json!([]));

        let current: serde_json::Value = server.get("/api/challenge").await.json();
        assert_eq!(current, body);
    }

    #[tokio::test]
    async fn challenge_rejects_unknown_models() {
        let server = refreshed_server().await;

        let response = server
            .post("/api/challenge")
            .json(&json!({"prompt": "hi", "models": ["openai:gpt-4o", "ghost:model"]}))
            .await;

        response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
        let body: serde_json::Value = response.json();
        assert!(body["error"]["message"].as_str().unwrap().contains("ghost:model"));
    }

    #[tokio::test]
    async fn challenge_requires_prompt_and_models() {
        let server = refreshed_server().await;

        server
            .post("/api/challenge")
            .json(&json!({"prompt": "  ", "models": ["openai:gpt-4o"]}))
            .await
            .assert_status(StatusCode::BAD_REQUEST);
        server
            .post("/api/challenge")
            .json(&json!({"prompt": "hi", "models": []}))
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn retry_before_challenge_conflicts() {
        let server = test_server();

        let response = server.post("/api/challenge/openai:gpt-4o/retry").await;

        response.assert_status(StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn retry_replaces_only_that_model() {
        let server = refreshed_server().await;
        server
            .post("/api/challenge")
            .json(&json!({"prompt": "hi", "models": ["openai:gpt-4o", "openai:gpt-4o-mini"]}))
            .await
            .assert_status_ok();

        let retried = server.post("/api/challenge/openai:gpt-4o-mini/retry").await;

        retried.assert_status_ok();
        let body: serde_json::Value = retried.json();
        assert_eq!(body["message"]["content"], "reply from gpt-4o-mini");
        let report: serde_json::Value = server.get("/api/challenge").await.json();
        assert_eq!(report["errors"], json!({}));
        assert_eq!(report["responses"].as_object().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn deselect_drops_model_from_board() {
        let server = refreshed_server().await;
        server
            .post("/api/challenge")
            .json(&json!({"prompt": "hi", "models": ["openai:gpt-4o", "openai:gpt-4o-mini"]}))
            .await
            .assert_status_ok();

        server
            .delete("/api/challenge/openai:gpt-4o-mini")
            .await
            .assert_status(StatusCode::NO_CONTENT);

        let report: serde_json::Value = server.get("/api/challenge").await.json();
        assert_eq!(report["errors"], json!({}));
        server
            .delete("/api/challenge/openai:gpt-4o-mini")
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}
