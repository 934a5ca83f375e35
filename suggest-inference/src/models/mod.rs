use ::candle::Error as CandleError;
use hf_hub::api::sync::ApiError;
use thiserror::Error;

use crate::types::{CancelSignal, GenerationParams};

pub mod candle;
pub mod config;

/// `InferenceEngine` - the opaque generative capability.
///
/// Implementations are not required to be `Sync`: the engine is owned by a
/// single model thread which runs one command at a time.
pub trait InferenceEngine {
    /// Encodes `text` into a sequence of token ids
    fn encode(&self, text: &str) -> Result<Vec<u32>, ModelError>;

    /// Appends at most `params.max_new_tokens` sampled tokens to `tokens`,
    /// stopping early on an end-of-sequence token. Returns the full
    /// sequence, prompt tokens included.
    ///
    /// Implementations must poll `cancel` between tokens.
    fn generate(
        &mut self,
        tokens: &[u32],
        params: &GenerationParams,
        cancel: &CancelSignal,
    ) -> Result<Vec<u32>, ModelError>;

    /// Decodes token ids back into text, skipping special tokens
    fn decode(&self, tokens: &[u32]) -> Result<String, ModelError>;
}

/// `ModelLoader` - builds an [`InferenceEngine`], from scratch.
///
/// `load` is blocking and potentially expensive (weights download and
/// memory mapping), it runs on the model thread.
pub trait ModelLoader: Send + Sync + 'static {
    type Model: InferenceEngine + Send + 'static;

    fn load(&self) -> Result<Self::Model, ModelError>;
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Candle error: `{0}`")]
    CandleError(#[from] CandleError),
    #[error("Hugging Face api error: `{0}`")]
    ApiError(#[from] ApiError),
    #[error("Io error: `{0}`")]
    IoError(#[from] std::io::Error),
    #[error("Deserialize error: `{0}`")]
    DeserializeError(#[from] serde_json::Error),
    #[error("Tokenizer error: `{0}`")]
    TokenizerError(Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid model configuration: `{0}`")]
    InvalidConfig(String),
    #[error("Generation cancelled: {0}")]
    Cancelled(String),
    #[error("Model panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    Msg(String),
}

impl From<tokenizers::Error> for ModelError {
    fn from(error: tokenizers::Error) -> Self {
        Self::TokenizerError(error)
    }
}

#[macro_export]
macro_rules! bail {
    ($msg:literal $(,)?) => {
        return Err($crate::models::ModelError::Msg(format!($msg)))
    };
    ($fmt:literal, $($arg:tt)*) => {
        return Err($crate::models::ModelError::Msg(format!($fmt, $($arg)*)))
    };
}
