//! HTTP handlers for the local API.

use super::types::*;
use super::AppState;
use crate::challenge::ChallengeReport;
use crate::discovery::RefreshOutcome;
use crate::message::LlmResponse;
use crate::models::LlmModel;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

// ============================================================================
// Health
// ============================================================================

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        app: "battleground",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================================
// Services and keys
// ============================================================================

pub async fn list_services(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ServicesResponse>, ApiError> {
    let mut services = Vec::new();
    for configuration in state.services.list().await {
        let has_api_key = state.credentials.has_api_key(&configuration.id).await?;
        services.push(ServiceView {
            configuration,
            has_api_key,
        });
    }
    Ok(Json(ServicesResponse { services }))
}

pub async fn create_service(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateServiceRequest>,
) -> Result<(StatusCode, Json<ServiceView>), ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::bad_request("Service name must not be empty"));
    }
    let api_key = request.api_key.clone().filter(|k| !k.is_empty());
    let configuration = request.into_configuration();
    reqwest::Url::parse(&configuration.endpoint_url)
        .map_err(|e| ApiError::unprocessable(format!("Invalid endpoint URL: {}", e)))?;

    state.services.add(configuration.clone()).await?;
    if let Some(key) = api_key.as_deref() {
        state.credentials.set_api_key(&configuration.id, Some(key)).await?;
    }
    let has_api_key = state.credentials.has_api_key(&configuration.id).await?;
    tracing::info!(service = %configuration.id, "Service saved");

    Ok((
        StatusCode::CREATED,
        Json(ServiceView {
            configuration,
            has_api_key,
        }),
    ))
}

pub async fn delete_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.services.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn set_api_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<SetKeyRequest>,
) -> Result<Json<KeyStatusResponse>, ApiError> {
    if state.services.get(&id).await.is_none() {
        return Err(ApiError::not_found(format!("No service with id '{}'", id)));
    }
    let key = request.api_key.as_deref().filter(|k| !k.is_empty());
    state.credentials.set_api_key(&id, key).await?;

    Ok(Json(KeyStatusResponse {
        has_api_key: key.is_some(),
        service_id: id,
    }))
}

// ============================================================================
// Models
// ============================================================================

pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        enabled: state.catalog.enabled_models().await,
        disabled: state.catalog.disabled_models().await,
        errors: state.catalog.service_errors().await,
        refreshing: state.catalog.is_refreshing(),
    })
}

pub async fn refresh_models(State(state): State<Arc<AppState>>) -> Json<RefreshOutcome> {
    let services = state.services.list().await;
    Json(state.catalog.refresh(services).await)
}

pub async fn toggle_model(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ToggleResponse>, ApiError> {
    if state.catalog.find(&id).await.is_none() {
        return Err(ApiError::not_found(format!("No model with id '{}'", id)));
    }
    let enabled = state.catalog.toggle_model(&id).await?;
    Ok(Json(ToggleResponse { id, enabled }))
}

// ============================================================================
// Challenge
// ============================================================================

/// Resolve requested ids against the current catalog.
async fn resolve_models(state: &AppState, ids: &[String]) -> Result<Vec<LlmModel>, ApiError> {
    let mut models = Vec::with_capacity(ids.len());
    let mut unknown = Vec::new();
    for id in ids {
        match state.catalog.find(id).await {
            Some(model) => models.push(model),
            None => unknown.push(id.as_str()),
        }
    }
    if !unknown.is_empty() {
        return Err(ApiError::unprocessable(format!(
            "Unknown models: {}",
            unknown.join(", ")
        )));
    }
    Ok(models)
}

pub async fn start_challenge(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChallengeRequest>,
) -> Result<Json<ChallengeReport>, ApiError> {
    if request.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("Prompt must not be empty"));
    }
    if request.models.is_empty() {
        return Err(ApiError::bad_request("Select at least one model"));
    }
    let models = resolve_models(&state, &request.models).await?;
    Ok(Json(state.challenge.run(&request.prompt, models).await))
}

pub async fn get_challenge(State(state): State<Arc<AppState>>) -> Json<ChallengeReport> {
    Json(state.challenge.report().await)
}

pub async fn retry_model(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<LlmResponse>, ApiError> {
    Ok(Json(state.challenge.retry(&id).await?))
}

pub async fn deselect_model(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.challenge.deselect(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("'{}' is not part of the current challenge", id)))
    }
}
