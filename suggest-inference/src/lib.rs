pub mod completion;
pub mod error;
pub mod loader;
pub mod model_thread;
pub mod models;
pub mod response;
pub mod service;
pub mod types;
pub mod validation;

#[cfg(test)]
mod tests;

pub use error::{ServiceError, ServiceErrorKind};
pub use loader::{EngineLoader, EngineState};
pub use model_thread::EngineHandle;
pub use models::{InferenceEngine, ModelError, ModelLoader};
pub use service::SuggestionService;
pub use types::{
    CancelGuard, CancelSignal, GenerationParams, GenerationRequest, GenerationResult, SuggestRequest,
};
