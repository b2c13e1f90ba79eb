//! Error types for the remote gateway.

use thiserror::Error;

/// Result type alias for gateway calls.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Errors returned by the REST backend or the transport underneath it.
#[derive(Debug, Error)]
pub enum ApiError {
    /// HTTP client error (connection refused, timeout, TLS, ...)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Non-success response from the backend
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Missing or rejected credentials
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Request could not be built from the given input
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The backend could not be reached at all
    #[error("Backend unreachable: {0}")]
    Unreachable(String),
}

impl ApiError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::Unreachable(message.into())
    }

    /// HTTP status if this is an API error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether a later attempt could plausibly succeed without any change
    /// to the request.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Api { status, .. } => matches!(*status, 408 | 429 | 500..=599),
            Self::Http(_) | Self::Unreachable(_) => true,
            Self::Json(_) | Self::Auth(_) | Self::InvalidRequest(_) => false,
        }
    }
}
