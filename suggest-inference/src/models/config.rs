use std::path::{Path, PathBuf};

use config::{Config, ConfigError};
use serde::{Deserialize, Serialize};

const DEFAULT_MODEL_ID: &str = "TinyLlama/TinyLlama-1.1B-Chat-v1.0";
const DEFAULT_REVISION: &str = "main";
const DEFAULT_DTYPE: &str = "f32";
const DEFAULT_REPEAT_LAST_N: usize = 64;

/// `ModelConfig` - Model configuration values
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ModelConfig {
    /// The model's name, according to HuggingFace's model hub
    #[serde(default = "default_model_id")]
    pub model_id: String,
    /// The model's revision, used to fetch the model from HuggingFace's API
    #[serde(default = "default_revision")]
    pub revision: String,
    /// Hugging Face api key, optional
    #[serde(default)]
    pub api_key: Option<String>,
    /// Cache directory, where model data is stored. Falls back
    /// to the Hugging Face default cache, if not set
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// The data type, e.g. `f32`, `bf16` or `f16`
    #[serde(default = "default_dtype")]
    pub dtype: String,
    /// The device id, ignored when running on cpu
    #[serde(default)]
    pub device_id: usize,
    /// Use flash attention kernels, requires the `flash-attn` feature
    #[serde(default)]
    pub use_flash_attention: bool,
    /// Penalty applied to recently generated tokens, `1.0` disables it
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,
    /// Size of the window `repeat_penalty` applies to
    #[serde(default = "default_repeat_last_n")]
    pub repeat_last_n: usize,
    /// Fixed sampling seed. A fresh random seed is drawn for each
    /// request when not set
    #[serde(default)]
    pub random_seed: Option<u64>,
}

fn default_model_id() -> String {
    DEFAULT_MODEL_ID.to_string()
}

fn default_revision() -> String {
    DEFAULT_REVISION.to_string()
}

fn default_dtype() -> String {
    DEFAULT_DTYPE.to_string()
}

fn default_repeat_penalty() -> f32 {
    1.0
}

fn default_repeat_last_n() -> usize {
    DEFAULT_REPEAT_LAST_N
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: default_model_id(),
            revision: default_revision(),
            api_key: None,
            cache_dir: None,
            dtype: default_dtype(),
            device_id: 0,
            use_flash_attention: false,
            repeat_penalty: default_repeat_penalty(),
            repeat_last_n: default_repeat_last_n(),
            random_seed: None,
        }
    }
}

impl ModelConfig {
    /// Creates a new instance of `ModelConfig` from a file path, containing the
    /// contents of a configuration file, with the above parameters specified
    /// under a `model` section.
    ///
    /// Values can be overridden by environment variables prefixed by
    /// `MODEL__`, e.g. `MODEL__MODEL_ID`.
    pub fn from_file_path<P: AsRef<Path>>(config_file_path: P) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(config::File::from(config_file_path.as_ref()))
            .add_source(
                config::Environment::with_prefix("MODEL")
                    .keep_prefix(true)
                    .separator("__"),
            );
        let config = builder.build()?;
        config.get::<Self>("model")
    }
}
