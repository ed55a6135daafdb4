//! Error taxonomy for Battleground.
//!
//! Protocol errors (`LlmError`) are uniform across vendors. Credential and
//! service-list failures have their own types so callers can surface them
//! separately from model failures.

use axum::http::StatusCode;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::fmt;

/// Error returned by any protocol driver, regardless of vendor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    /// The configured endpoint cannot be turned into a request URL.
    InvalidEndpoint,
    /// Transport failure (DNS, TLS, connection reset, timeout).
    NetworkError(String),
    /// Body could not be decoded; carries the decoder's message.
    InvalidResponse(String),
    /// HTTP 401.
    AuthenticationError,
    /// HTTP 429.
    RateLimitExceeded,
    /// HTTP 400. Vendors return 400 for many reasons besides context
    /// overflow, so this is an approximation.
    ContextLengthExceeded,
    /// Any other non-200 status.
    ServerError(u16),
    /// The caller cancelled a streaming request.
    Cancelled,
}

impl LlmError {
    /// Map an HTTP status to an error. `None` means success (200 only).
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200 => None,
            401 => Some(Self::AuthenticationError),
            429 => Some(Self::RateLimitExceeded),
            400 => Some(Self::ContextLengthExceeded),
            other => Some(Self::ServerError(other)),
        }
    }

    /// Short machine-readable name.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidEndpoint => "invalid_endpoint",
            Self::NetworkError(_) => "network_error",
            Self::InvalidResponse(_) => "invalid_response",
            Self::AuthenticationError => "authentication_error",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::ContextLengthExceeded => "context_length_exceeded",
            Self::ServerError(_) => "server_error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Status code used when this error is relayed by the local API.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidEndpoint => StatusCode::UNPROCESSABLE_ENTITY,
            Self::AuthenticationError => StatusCode::UNAUTHORIZED,
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::ContextLengthExceeded => StatusCode::BAD_REQUEST,
            Self::Cancelled => StatusCode::CONFLICT,
            Self::NetworkError(_) | Self::InvalidResponse(_) | Self::ServerError(_) => {
                StatusCode::BAD_GATEWAY
            }
        }
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEndpoint => write!(f, "Invalid API endpoint"),
            Self::NetworkError(cause) => write!(f, "Network error: {}", cause),
            Self::InvalidResponse(detail) => {
                write!(f, "Invalid response from server: {}", detail)
            }
            Self::AuthenticationError => {
                write!(f, "Invalid API key or authentication failed")
            }
            Self::RateLimitExceeded => write!(f, "Rate limit exceeded"),
            Self::ContextLengthExceeded => write!(f, "Context length exceeded"),
            Self::ServerError(status) => write!(f, "Server error: status code {}", status),
            Self::Cancelled => write!(f, "Request cancelled"),
        }
    }
}

impl std::error::Error for LlmError {}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else if err.is_builder() {
            Self::InvalidEndpoint
        } else {
            Self::NetworkError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidResponse(err.to_string())
    }
}

impl Serialize for LlmError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("LlmError", 2)?;
        state.serialize_field("message", &self.to_string())?;
        state.serialize_field("type", self.error_type())?;
        state.end()
    }
}

// ============================================================================
// Credential errors
// ============================================================================

/// Failure talking to the secret store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    DuplicateItem,
    NotFound,
    AuthFailed,
    Decode(String),
    Encode(String),
    BadParams(String),
    StoreUnavailable(String),
    UserCancelled,
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateItem => write!(f, "A credential already exists for this service"),
            Self::NotFound => write!(f, "Credential not found"),
            Self::AuthFailed => write!(f, "Secret store authentication failed"),
            Self::Decode(msg) => write!(f, "Failed to decode credentials: {}", msg),
            Self::Encode(msg) => write!(f, "Failed to encode credentials: {}", msg),
            Self::BadParams(msg) => write!(f, "Invalid parameters provided: {}", msg),
            Self::StoreUnavailable(msg) => write!(f, "Secret store is not available: {}", msg),
            Self::UserCancelled => write!(f, "Operation cancelled by user"),
        }
    }
}

impl std::error::Error for CredentialError {}

// ============================================================================
// Service list errors
// ============================================================================

/// Failure reading or mutating the persisted service list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    NotFound(String),
    Decode(String),
    Encode(String),
    Io(String),
    Credential(CredentialError),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "No service with id '{}'", id),
            Self::Decode(msg) => write!(f, "Failed to decode services: {}", msg),
            Self::Encode(msg) => write!(f, "Failed to encode services: {}", msg),
            Self::Io(msg) => write!(f, "Failed to persist services: {}", msg),
            Self::Credential(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<CredentialError> for ServiceError {
    fn from(err: CredentialError) -> Self {
        Self::Credential(err)
    }
}

// ============================================================================
// Catalog errors
// ============================================================================

/// Failure persisting the set of disabled models.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    Decode(String),
    Encode(String),
    Io(String),
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(msg) => write!(f, "Failed to decode disabled models: {}", msg),
            Self::Encode(msg) => write!(f, "Failed to encode disabled models: {}", msg),
            Self::Io(msg) => write!(f, "Failed to persist disabled models: {}", msg),
        }
    }
}

impl std::error::Error for CatalogError {}

// ============================================================================
// Challenge errors
// ============================================================================

/// Failure addressing a model on the challenge board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeError {
    /// Retry was requested for a model that is not part of the last challenge.
    UnknownModel(String),
    /// Retry was requested before any challenge ran.
    NoChallenge,
    /// The model's request itself failed.
    Llm(LlmError),
}

impl fmt::Display for ChallengeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownModel(id) => write!(f, "'{}' is not part of the current challenge", id),
            Self::NoChallenge => write!(f, "No challenge has been run yet"),
            Self::Llm(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ChallengeError {}

impl From<LlmError> for ChallengeError {
    fn from(err: LlmError) -> Self {
        Self::Llm(err)
    }
}
