use std::time::{Duration, Instant};

use metrics::counter;
use tracing::{info, instrument};

use crate::{
    completion::CompletionEngine,
    error::ServiceError,
    loader::{EngineLoader, EngineState},
    models::ModelLoader,
    response::build_result,
    types::{CancelGuard, GenerationResult, SuggestRequest},
    validation::{parse_body, validate},
};

/// `SuggestionService` - the inference request service core.
///
/// Owns the engine and its load state machine, and runs the
/// validate -> ensure ready -> generate -> build pipeline for each request.
/// It is built once at startup and shared by all request handlers.
pub struct SuggestionService<L: ModelLoader> {
    /// Lazy, at-most-once engine construction
    loader: EngineLoader<L>,
    /// Serialized encode, generate and decode
    completion: CompletionEngine,
    /// Upper bound on a single generation, if any
    generation_timeout: Option<Duration>,
}

impl<L: ModelLoader> SuggestionService<L> {
    /// Constructor, no engine is loaded until the first request (or
    /// [`Self::warm_up`])
    pub fn new(loader: L, random_seed: Option<u64>, generation_timeout: Option<Duration>) -> Self {
        Self {
            loader: EngineLoader::new(loader),
            completion: CompletionEngine::new(random_seed),
            generation_timeout,
        }
    }

    /// The current engine state
    pub fn engine_state(&self) -> EngineState {
        self.loader.state()
    }

    /// Triggers the engine load ahead of the first request
    pub async fn warm_up(&self) -> Result<(), ServiceError> {
        self.loader.ensure_ready().await.map(|_| ())
    }

    /// Handles a raw `POST /suggest` body
    #[instrument(level = "info", skip_all)]
    pub async fn suggest_body(&self, body: &[u8]) -> Result<GenerationResult, ServiceError> {
        let result = self.run_body_pipeline(body).await;
        record_outcome(&result);
        result
    }

    /// Handles a parsed `POST /suggest` request.
    ///
    /// Dropping the returned future cancels the generation, if it already
    /// started, before its next token.
    #[instrument(level = "info", skip_all)]
    pub async fn suggest(&self, request: SuggestRequest) -> Result<GenerationResult, ServiceError> {
        let result = self.run_pipeline(request).await;
        record_outcome(&result);
        result
    }

    async fn run_body_pipeline(&self, body: &[u8]) -> Result<GenerationResult, ServiceError> {
        self.fail_fast()?;
        let request = parse_body(body)?;
        self.run_pipeline(request).await
    }

    async fn run_pipeline(&self, request: SuggestRequest) -> Result<GenerationResult, ServiceError> {
        // A failed engine answers every request the same way, valid or not
        self.fail_fast()?;

        let request = validate(request)?;
        let engine = self.loader.ensure_ready().await?;

        let (_cancel_guard, cancel) = CancelGuard::new();
        let cancel = match self.generation_timeout {
            Some(timeout) => cancel.with_deadline(Instant::now() + timeout),
            None => cancel,
        };
        let decoded = self.completion.run(&engine, &request, cancel).await?;

        let result = build_result(request.prompt, &decoded);
        info!(
            target = "suggest-inference",
            event = "suggestion_built",
            suggestion_chars = result.suggestion.chars().count(),
            "Built suggestion"
        );
        Ok(result)
    }

    fn fail_fast(&self) -> Result<(), ServiceError> {
        if self.loader.state().is_failed() {
            return Err(ServiceError::engine_unavailable());
        }
        Ok(())
    }
}

/// Counts each handled request once, by outcome
fn record_outcome(result: &Result<GenerationResult, ServiceError>) {
    let outcome = match result {
        Ok(_) => "success".to_string(),
        Err(e) => e.kind().to_string(),
    };
    counter!("suggest_requests_total", "outcome" => outcome).increment(1);
}
