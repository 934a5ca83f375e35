use std::{path::Path, time::Duration};

use config::{Config, ConfigError, File};
use serde::Deserialize;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:5000";
const DEFAULT_BIND_HOST: &str = "0.0.0.0";

/// Configuration for the suggestion service.
///
/// Read from the `suggest_service` section of the configuration file.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SuggestServiceConfig {
    /// Bind address for the HTTP server.
    ///
    /// Defaults to `0.0.0.0:5000`.
    #[serde(default = "default_bind_address")]
    pub service_bind_address: String,

    /// Upper bound on a single generation, in milliseconds.
    ///
    /// Generations are not bounded when this is not set.
    #[serde(default)]
    pub generation_timeout_ms: Option<u64>,

    /// Load the model at startup instead of on the first request.
    #[serde(default)]
    pub preload_model: bool,
}

fn default_bind_address() -> String {
    DEFAULT_BIND_ADDRESS.to_string()
}

impl Default for SuggestServiceConfig {
    fn default() -> Self {
        Self {
            service_bind_address: default_bind_address(),
            generation_timeout_ms: None,
            preload_model: false,
        }
    }
}

impl SuggestServiceConfig {
    /// Creates a new `SuggestServiceConfig` instance from a configuration file.
    ///
    /// # Arguments
    ///
    /// * `config_file_path` - Path to the configuration file. The file should be in a format
    ///   supported by the `config` crate (e.g., YAML, JSON, TOML) and contain a
    ///   `suggest_service` section.
    ///
    /// Values can be overridden through environment variables prefixed by
    /// `SUGGEST_SERVICE__`, e.g. `SUGGEST_SERVICE__PRELOAD_MODEL=true`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read or parsed, or if the
    /// `suggest_service` section is missing or malformed.
    pub fn from_file_path<P: AsRef<Path>>(config_file_path: P) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::from(config_file_path.as_ref()))
            .add_source(
                config::Environment::with_prefix("SUGGEST_SERVICE")
                    .keep_prefix(true)
                    .separator("__"),
            );
        let config = builder.build()?;
        config.get::<Self>("suggest_service")
    }

    /// Binds to `0.0.0.0:{port}` instead of the configured address, when a
    /// port override (the `PORT` environment variable) is given.
    pub fn with_port_override(mut self, port: Option<&str>) -> Result<Self, ConfigError> {
        if let Some(port) = port {
            let port = port
                .trim()
                .parse::<u16>()
                .map_err(|e| ConfigError::Message(format!("Invalid port `{port}`: {e}")))?;
            self.service_bind_address = format!("{DEFAULT_BIND_HOST}:{port}");
        }
        Ok(self)
    }

    pub fn generation_timeout(&self) -> Option<Duration> {
        self.generation_timeout_ms.map(Duration::from_millis)
    }
}
