use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use utoipa::ToSchema;

use crate::models::ModelError;

/// Nucleus sampling cutoff used for every generation
pub const DEFAULT_TOP_P: f64 = 0.95;

/// Raw body of a `POST /suggest` request.
///
/// Fields are kept as untyped JSON values, coercion and clamping are
/// the validator's job (see [`crate::validation`]).
#[derive(Clone, Debug, Default, Deserialize, Serialize, ToSchema)]
pub struct SuggestRequest {
    /// The code (or text) to complete
    #[serde(default)]
    #[schema(value_type = Option<String>, example = "def add(a, b):\n    return")]
    pub prompt: Option<Value>,
    /// Upper bound on newly generated tokens, clamped to `[1, 48]`
    #[serde(default, rename = "maxNewTokens")]
    #[schema(value_type = Option<u32>, example = 24)]
    pub max_new_tokens: Option<Value>,
    /// Sampling temperature, clamped to `[0.1, 1.5]`
    #[serde(default)]
    #[schema(value_type = Option<f64>, example = 0.7)]
    pub temperature: Option<Value>,
}

/// `GenerationRequest` - a request that went through validation.
///
/// Only the validator builds values of this type, so its parameters
/// are always within their clamp bounds.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationRequest {
    /// The prompt, exactly as sent by the caller
    pub(crate) prompt: String,
    /// Number of new tokens to generate, in `[1, 48]`
    pub(crate) max_new_tokens: usize,
    /// Sampling temperature, in `[0.1, 1.5]`
    pub(crate) temperature: f64,
}

impl GenerationRequest {
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn max_new_tokens(&self) -> usize {
        self.max_new_tokens
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }
}

/// `GenerationParams` - sampling and stopping parameters handed to
/// [`crate::models::InferenceEngine::generate`]
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationParams {
    /// Maximum number of tokens appended to the prompt
    pub max_new_tokens: usize,
    /// Exponential scaling of the output probability distribution
    pub temperature: f64,
    /// Restricts sampling to the smallest set of tokens whose cumulative
    /// probability reaches `top_p`
    pub top_p: f64,
    /// Random seed for sampling
    pub random_seed: u64,
}

/// `GenerationResult` - response body of a successful `POST /suggest`
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize, ToSchema)]
pub struct GenerationResult {
    /// The prompt, echoed back unchanged
    pub prompt: String,
    /// Newly generated text only, at most 256 characters
    pub suggestion: String,
}

/// Cancellation signal threaded through a generation call.
///
/// A generation is aborted, between two tokens, once either the
/// associated [`CancelGuard`] is dropped or the deadline has passed.
#[derive(Clone, Debug, Default)]
pub struct CancelSignal {
    receiver: Option<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

impl CancelSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        Self::default()
    }

    /// Attaches a deadline to the signal
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Returns an error if the generation should stop now
    pub fn check(&self) -> Result<(), ModelError> {
        if let Some(receiver) = &self.receiver {
            if *receiver.borrow() {
                return Err(ModelError::Cancelled("request dropped by client".to_string()));
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(ModelError::Cancelled("deadline exceeded".to_string()));
            }
        }
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.check().is_err()
    }
}

/// Fires its [`CancelSignal`] when dropped.
///
/// The guard lives in the request handler future, dropping that future
/// (e.g. on client disconnect) cancels the in-flight generation.
#[derive(Debug)]
pub struct CancelGuard {
    sender: watch::Sender<bool>,
}

impl CancelGuard {
    pub fn new() -> (Self, CancelSignal) {
        let (sender, receiver) = watch::channel(false);
        (
            Self { sender },
            CancelSignal {
                receiver: Some(receiver),
                deadline: None,
            },
        )
    }

    /// Fires the signal without dropping the guard
    pub fn cancel(&self) {
        // NOTE: fails only if every receiver is gone, nothing to cancel then
        self.sender.send(true).ok();
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}
