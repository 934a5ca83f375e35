use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use suggest_inference::{ServiceError, ServiceErrorKind};
use thiserror::Error;
use utoipa::ToSchema;

/// Response structure for API errors, `{"error": "..."}`
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// A human-readable error message describing what went wrong
    pub error: String,
}

/// Represents all possible errors returned by the suggestion service
#[derive(Debug, Error)]
pub enum SuggestServiceError {
    /// Error returned when the request body is malformed or the prompt is missing
    #[error("Invalid request body: {message}")]
    InvalidBody {
        /// Description of why the request body is invalid
        message: String,
        /// The endpoint that the error occurred on
        endpoint: String,
    },

    /// Error returned when the inference engine failed to load
    #[error("Engine unavailable: {message}")]
    EngineUnavailable {
        /// Description of the load failure
        message: String,
        /// The endpoint that the error occurred on
        endpoint: String,
    },

    /// Error returned when the engine fails while generating
    #[error("Generation failed: {message}")]
    GenerationFailure {
        /// Description of the generation failure
        message: String,
        /// The endpoint that the error occurred on
        endpoint: String,
    },
}

impl SuggestServiceError {
    /// Wraps a core [`ServiceError`] raised while serving `endpoint`
    pub fn from_service_error(error: ServiceError, endpoint: &str) -> Self {
        let endpoint = endpoint.to_string();
        let kind = error.kind();
        let message = error.to_string();
        match kind {
            ServiceErrorKind::InvalidRequest => Self::InvalidBody { message, endpoint },
            ServiceErrorKind::EngineUnavailable => Self::EngineUnavailable { message, endpoint },
            ServiceErrorKind::GenerationFailure => Self::GenerationFailure { message, endpoint },
        }
    }

    /// Maps each error variant to an HTTP status code:
    /// - `400 Bad Request` for invalid inputs
    /// - `500 Internal Server Error` for engine failures
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidBody { .. } => StatusCode::BAD_REQUEST,
            Self::EngineUnavailable { .. } | Self::GenerationFailure { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn endpoint(&self) -> &str {
        match self {
            Self::InvalidBody { endpoint, .. }
            | Self::EngineUnavailable { endpoint, .. }
            | Self::GenerationFailure { endpoint, .. } => endpoint,
        }
    }

    /// The message sent back to clients, the core error's own message
    fn client_message(&self) -> &str {
        match self {
            Self::InvalidBody { message, .. }
            | Self::EngineUnavailable { message, .. }
            | Self::GenerationFailure { message, .. } => message,
        }
    }
}

impl IntoResponse for SuggestServiceError {
    fn into_response(self) -> Response {
        tracing::error!(
            target = "suggest-service",
            event = "error_occurred",
            endpoint = self.endpoint(),
            status = self.status_code().as_u16(),
            error = %self,
        );
        let error_response = ErrorResponse {
            error: self.client_message().to_string(),
        };
        (self.status_code(), Json(error_response)).into_response()
    }
}
