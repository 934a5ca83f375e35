use std::{fmt::Display, path::PathBuf, time::Instant};

use candle::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::{
    generation::LogitsProcessor,
    models::llama::{self as model, Config, LlamaConfig},
};
use hf_hub::{api::sync::ApiBuilder, Repo, RepoType};
use metrics::counter;
use tokenizers::Tokenizer;
use tracing::{info, instrument, warn};

use crate::{
    bail,
    models::{config::ModelConfig, InferenceEngine, ModelError, ModelLoader},
    types::{CancelSignal, GenerationParams},
};

use super::{device, dtype, hub_load_safetensors};

const EOS_TOKEN: &str = "</s>";
const SINGLE_FILE_WEIGHTS: &str = "model.safetensors";
const SHARDED_WEIGHTS_INDEX: &str = "model.safetensors.index.json";

/// Data needed to instantiate a [`LlamaModel`], once fetched
#[derive(Debug)]
pub struct LlamaLoadData {
    pub device: Device,
    pub dtype: DType,
    pub config_file_path: PathBuf,
    pub tokenizer_file_path: PathBuf,
    pub weights_file_paths: Vec<PathBuf>,
    pub use_flash_attention: bool,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
}

/// `LlamaLoader` - fetches Llama family weights from the Hugging Face hub
/// and loads them with candle
#[derive(Clone, Debug)]
pub struct LlamaLoader {
    config: ModelConfig,
}

impl LlamaLoader {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }

    /// Downloads (or reads from cache) the model files
    #[instrument(skip_all, fields(model_id = %self.config.model_id))]
    pub fn fetch(&self) -> Result<LlamaLoadData, ModelError> {
        let device = device(self.config.device_id)?;
        let dtype = dtype(&self.config.dtype, &device)?;

        // Without an explicit key, keep whatever token `huggingface-cli login` cached
        let mut builder = ApiBuilder::new().with_progress(false);
        if let Some(token) = self.token_override() {
            builder = builder.with_token(Some(token));
        }
        if let Some(cache_dir) = &self.config.cache_dir {
            builder = builder.with_cache_dir(cache_dir.clone());
        }
        let api = builder.build()?;

        let repo = api.repo(Repo::with_revision(
            self.config.model_id.clone(),
            RepoType::Model,
            self.config.revision.clone(),
        ));
        let config_file_path = repo.get("config.json")?;
        let tokenizer_file_path = repo.get("tokenizer.json")?;

        // Small checkpoints ship a single weights file, larger ones are sharded
        let weights_file_paths = weights_or_shards(repo.get(SINGLE_FILE_WEIGHTS), || {
            hub_load_safetensors(&repo, SHARDED_WEIGHTS_INDEX)
        })?;

        Ok(LlamaLoadData {
            device,
            dtype,
            config_file_path,
            tokenizer_file_path,
            weights_file_paths,
            use_flash_attention: self.config.use_flash_attention,
            repeat_penalty: self.config.repeat_penalty,
            repeat_last_n: self.config.repeat_last_n,
        })
    }

    /// The configured api key, if any. Blank keys (e.g. an empty `HF_TOKEN`)
    /// count as unset.
    fn token_override(&self) -> Option<String> {
        self.config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
    }
}

/// Uses the single weights file when it could be fetched, the sharded
/// weights otherwise. If both fail, the error reports both causes.
fn weights_or_shards<E, F>(single: Result<PathBuf, E>, shards: F) -> Result<Vec<PathBuf>, ModelError>
where
    E: Display,
    F: FnOnce() -> Result<Vec<PathBuf>, ModelError>,
{
    match single {
        Ok(path) => Ok(vec![path]),
        Err(single_error) => {
            warn!(
                error = %single_error,
                "Failed to fetch `{SINGLE_FILE_WEIGHTS}`, trying sharded weights"
            );
            shards().map_err(|shards_error| {
                ModelError::Msg(format!(
                    "failed to fetch `{SINGLE_FILE_WEIGHTS}` ({single_error}) and `{SHARDED_WEIGHTS_INDEX}` ({shards_error})"
                ))
            })
        }
    }
}

/// Number of positions the checkpoint was trained with, as declared by
/// `max_position_embeddings` in its `config.json`
fn context_length(config: &serde_json::Value) -> usize {
    config
        .get("max_position_embeddings")
        .and_then(serde_json::Value::as_u64)
        .map(|length| length as usize)
        .unwrap_or(model::MAX_SEQ_LEN)
}

/// Fails if the prompt plus the token budget does not fit the context
fn check_context(
    prompt_tokens: usize,
    max_new_tokens: usize,
    context_length: usize,
) -> Result<(), ModelError> {
    if prompt_tokens + max_new_tokens > context_length {
        bail!(
            "prompt too long: {prompt_tokens} tokens plus {max_new_tokens} new tokens, the model context holds {context_length}"
        );
    }
    Ok(())
}

impl ModelLoader for LlamaLoader {
    type Model = LlamaModel;

    fn load(&self) -> Result<Self::Model, ModelError> {
        let load_data = self.fetch()?;
        LlamaModel::load(load_data)
    }
}

pub struct LlamaModel {
    device: Device,
    model: model::Llama,
    tokenizer: Tokenizer,
    config: Config,
    context_length: usize,
    dtype: DType,
    eos_token_id: Option<u32>,
    repeat_penalty: f32,
    repeat_last_n: usize,
}

impl LlamaModel {
    pub fn load(load_data: LlamaLoadData) -> Result<Self, ModelError> {
        info!("Loading Llama model ...");

        let start = Instant::now();

        let device = load_data.device;
        let dtype = load_data.dtype;
        let raw_config: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&load_data.config_file_path)?)?;
        let context_length = context_length(&raw_config);
        let config: LlamaConfig = serde_json::from_value(raw_config)?;
        let config = config.into_config(load_data.use_flash_attention);

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&load_data.weights_file_paths, dtype, &device)?
        };
        let model = model::Llama::load(vb, &config)?;
        let tokenizer = Tokenizer::from_file(&load_data.tokenizer_file_path)?;
        let eos_token_id = tokenizer.token_to_id(EOS_TOKEN);

        info!("Loaded Llama model in {:?}", start.elapsed());

        Ok(Self {
            device,
            model,
            tokenizer,
            config,
            context_length,
            dtype,
            eos_token_id,
            repeat_penalty: load_data.repeat_penalty,
            repeat_last_n: load_data.repeat_last_n,
        })
    }
}

impl InferenceEngine for LlamaModel {
    fn encode(&self, text: &str) -> Result<Vec<u32>, ModelError> {
        Ok(self.tokenizer.encode(text, true)?.get_ids().to_vec())
    }

    #[instrument(skip_all, fields(prompt_tokens = tokens.len(), max_new_tokens = params.max_new_tokens))]
    fn generate(
        &mut self,
        tokens: &[u32],
        params: &GenerationParams,
        cancel: &CancelSignal,
    ) -> Result<Vec<u32>, ModelError> {
        if tokens.is_empty() {
            bail!("cannot generate from an empty token sequence");
        }
        check_context(tokens.len(), params.max_new_tokens, self.context_length)?;

        let mut tokens = tokens.to_vec();
        let mut logits_processor = LogitsProcessor::new(
            params.random_seed,
            Some(params.temperature),
            Some(params.top_p),
        );
        let mut cache = model::Cache::new(true, self.dtype, &self.config, &self.device)?;
        let mut index_pos = 0;
        let mut generated_tokens = 0;

        let start_gen = Instant::now();
        for index in 0..params.max_new_tokens {
            cancel.check()?;

            let (context_size, context_index) = if cache.use_kv_cache && index > 0 {
                (1, index_pos)
            } else {
                (tokens.len(), 0)
            };
            let ctxt = &tokens[tokens.len().saturating_sub(context_size)..];
            let input_tensor = Tensor::new(ctxt, &self.device)?.unsqueeze(0)?;
            let logits = self
                .model
                .forward(&input_tensor, context_index, &mut cache)?;
            let logits = logits.squeeze(0)?;
            let logits = if self.repeat_penalty == 1. {
                logits
            } else {
                let start_at = tokens.len().saturating_sub(self.repeat_last_n);
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    self.repeat_penalty,
                    &tokens[start_at..],
                )?
            };
            index_pos += ctxt.len();

            let next_token = logits_processor.sample(&logits)?;
            tokens.push(next_token);
            generated_tokens += 1;

            if Some(next_token) == self.eos_token_id {
                break;
            }
        }

        let dt = start_gen.elapsed();
        counter!("suggest_generated_tokens_total").increment(generated_tokens as u64);
        info!(
            "{generated_tokens} tokens generated ({} token/s)",
            generated_tokens as f64 / dt.as_secs_f64(),
        );

        Ok(tokens)
    }

    fn decode(&self, tokens: &[u32]) -> Result<String, ModelError> {
        Ok(self.tokenizer.decode(tokens, true)?)
    }
}
