use std::fmt;

use thiserror::Error;

/// Message returned to every caller once the engine failed to load.
pub const ENGINE_UNAVAILABLE_MESSAGE: &str = "Model not loaded on server: engine unavailable";

/// Message returned when a request carries no usable prompt.
pub const MISSING_PROMPT_MESSAGE: &str = "Missing 'prompt'.";

/// Errors surfaced by the suggestion pipeline, at the request boundary.
///
/// Every failure inside validation, engine loading or generation is
/// converted into one of these variants, so that a single request never
/// brings the process down.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// The caller sent a malformed or incomplete request
    #[error("{0}")]
    InvalidRequest(String),
    /// The engine failed to load, permanently for this process
    #[error("{0}")]
    EngineUnavailable(String),
    /// Encoding, generation or decoding failed for this request
    #[error("Generation failed: {0}")]
    GenerationFailure(String),
}

/// The class of a [`ServiceError`], used by adapters to pick a status code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceErrorKind {
    InvalidRequest,
    EngineUnavailable,
    GenerationFailure,
}

impl ServiceError {
    /// Returns the error's kind
    pub fn kind(&self) -> ServiceErrorKind {
        match self {
            Self::InvalidRequest(_) => ServiceErrorKind::InvalidRequest,
            Self::EngineUnavailable(_) => ServiceErrorKind::EngineUnavailable,
            Self::GenerationFailure(_) => ServiceErrorKind::GenerationFailure,
        }
    }

    /// The error for a request with a missing or blank prompt
    pub fn missing_prompt() -> Self {
        Self::InvalidRequest(MISSING_PROMPT_MESSAGE.to_string())
    }

    /// The error returned for every request after a failed engine load
    pub fn engine_unavailable() -> Self {
        Self::EngineUnavailable(ENGINE_UNAVAILABLE_MESSAGE.to_string())
    }
}

impl fmt::Display for ServiceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::InvalidRequest => "invalid_request",
            Self::EngineUnavailable => "engine_unavailable",
            Self::GenerationFailure => "generation_failure",
        };
        write!(f, "{kind}")
    }
}
