//! Request and response types for the local API.

use crate::discovery::ServiceFailure;
use crate::error::{CatalogError, ChallengeError, CredentialError, LlmError, ServiceError};
use crate::models::LlmModel;
use crate::service::{ProtocolKind, ServiceConfiguration};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub app: &'static str,
    pub version: &'static str,
}

/// A service as shown to clients. The key itself is never returned.
#[derive(Serialize)]
pub struct ServiceView {
    #[serde(flatten)]
    pub configuration: ServiceConfiguration,
    pub has_api_key: bool,
}

#[derive(Serialize)]
pub struct ServicesResponse {
    pub services: Vec<ServiceView>,
}

#[derive(Deserialize)]
pub struct CreateServiceRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub protocol: ProtocolKind,
    /// Defaults to the protocol's public endpoint.
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl CreateServiceRequest {
    pub fn into_configuration(self) -> ServiceConfiguration {
        let endpoint = self
            .endpoint_url
            .unwrap_or_else(|| self.protocol.default_base_url().to_string());
        let mut configuration = ServiceConfiguration::new(self.id, self.name, self.protocol, endpoint);
        configuration.comment = self.comment;
        configuration.thumbnail_url = self.thumbnail_url;
        configuration.username = self.username;
        configuration
    }
}

/// `null` clears the stored key.
#[derive(Deserialize)]
pub struct SetKeyRequest {
    pub api_key: Option<String>,
}

#[derive(Serialize)]
pub struct KeyStatusResponse {
    pub service_id: String,
    pub has_api_key: bool,
}

#[derive(Serialize)]
pub struct ModelsResponse {
    pub enabled: Vec<LlmModel>,
    pub disabled: Vec<LlmModel>,
    pub errors: Vec<ServiceFailure>,
    pub refreshing: bool,
}

#[derive(Serialize)]
pub struct ToggleResponse {
    pub id: String,
    pub enabled: bool,
}

#[derive(Deserialize)]
pub struct ChallengeRequest {
    pub prompt: String,
    pub models: Vec<String>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

/// Structured API error with status code, message and machine-readable type.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub kind: &'static str,
}

impl ApiError {
    /// Create a 404 Not Found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
            kind: "not_found",
        }
    }

    /// Create a 400 Bad Request error.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
            kind: "bad_request",
        }
    }

    /// Create a 409 Conflict error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
            kind: "conflict",
        }
    }

    /// Create a 422 Unprocessable Entity error.
    pub fn unprocessable(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: msg.into(),
            kind: "unprocessable",
        }
    }

    /// Create a 500 Internal Server Error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
            kind: "internal_error",
        }
    }
}

impl From<LlmError> for ApiError {
    fn from(err: LlmError) -> Self {
        Self {
            status: err.status_code(),
            message: err.to_string(),
            kind: err.error_type(),
        }
    }
}

impl From<CredentialError> for ApiError {
    fn from(err: CredentialError) -> Self {
        Self {
            kind: "credential_error",
            ..Self::internal(err.to_string())
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::NotFound(_) => Self::not_found(err.to_string()),
            ServiceError::Credential(inner) => inner.into(),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<ChallengeError> for ApiError {
    fn from(err: ChallengeError) -> Self {
        match err {
            ChallengeError::UnknownModel(_) => Self::not_found(err.to_string()),
            ChallengeError::NoChallenge => Self::conflict(err.to_string()),
            ChallengeError::Llm(inner) => inner.into(),
        }
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (
            self.status,
            axum::Json(ErrorResponse {
                error: ErrorDetail {
                    message: self.message,
                    kind: self.kind,
                },
            }),
        )
            .into_response()
    }
}
