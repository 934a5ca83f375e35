use std::time::Instant;

use metrics::histogram;
use tracing::{error, info, instrument};

use crate::{
    error::ServiceError,
    model_thread::{EngineHandle, ModelThreadError},
    types::{CancelSignal, GenerationParams, GenerationRequest, DEFAULT_TOP_P},
};

/// `CompletionEngine` - runs encode, generate and decode for a validated
/// request against a loaded engine.
///
/// Calls are serialized by the engine's model thread, the completion engine
/// itself holds no state besides sampling settings.
#[derive(Clone, Debug, Default)]
pub struct CompletionEngine {
    /// Fixed sampling seed, a random one is drawn per request if `None`
    random_seed: Option<u64>,
}

impl CompletionEngine {
    pub fn new(random_seed: Option<u64>) -> Self {
        Self { random_seed }
    }

    /// Sampling parameters for `request`
    pub fn params(&self, request: &GenerationRequest) -> GenerationParams {
        GenerationParams {
            max_new_tokens: request.max_new_tokens(),
            temperature: request.temperature(),
            top_p: DEFAULT_TOP_P,
            random_seed: self.random_seed.unwrap_or_else(rand::random),
        }
    }

    /// Generates a continuation of the request's prompt. Returns the full
    /// decoded text, prompt included.
    #[instrument(
        level = "info",
        skip_all,
        fields(
            max_new_tokens = request.max_new_tokens(),
            temperature = request.temperature()
        )
    )]
    pub async fn run(
        &self,
        engine: &EngineHandle,
        request: &GenerationRequest,
        cancel: CancelSignal,
    ) -> Result<String, ServiceError> {
        let params = self.params(request);
        let start = Instant::now();

        let output = engine
            .submit(request.prompt().to_string(), params, cancel)
            .await
            .map_err(|e| {
                error!(
                    target = "suggest-inference",
                    event = "generation_failed",
                    error = %e,
                    "Failed to generate completion"
                );
                match e {
                    ModelThreadError::ModelError(e) => {
                        ServiceError::GenerationFailure(e.to_string())
                    }
                    e => ServiceError::GenerationFailure(e.to_string()),
                }
            })?;

        let elapsed = start.elapsed();
        histogram!("suggest_generation_latency_secs").record(elapsed.as_secs_f64());
        info!(
            target = "suggest-inference",
            event = "generation_finished",
            elapsed_ms = elapsed.as_millis() as u64,
            output_chars = output.chars().count(),
            "Generated completion"
        );

        Ok(output)
    }
}
