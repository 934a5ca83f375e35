use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use suggest_inference::{
    models::{candle::llama::LlamaLoader, config::ModelConfig},
    SuggestionService,
};
use suggest_service::{
    components::openapi::openapi_yaml,
    config::SuggestServiceConfig,
    server::{run_server, AppState},
};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_appender::{
    non_blocking,
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time::UtcTime},
    prelude::*,
    EnvFilter, Registry,
};

/// The name of the environment variable for the Hugging Face token
const HF_TOKEN: &str = "HF_TOKEN";
/// The name of the environment variable overriding the bind port
const PORT: &str = "PORT";
/// The directory where the logs are stored.
const LOGS: &str = "./logs";
/// The log file name.
const LOG_FILE: &str = "suggest-node.log";

/// Command line arguments for the suggestion node
#[derive(Parser)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config_path: String,

    /// Print the OpenAPI document as YAML and exit
    #[arg(long, default_value_t = false)]
    print_openapi: bool,
}

/// Configuration for the suggestion node, both sections read from the
/// same file.
#[derive(Debug)]
struct Config {
    /// Configuration for the HTTP service.
    service: SuggestServiceConfig,

    /// Configuration for the model backing the inference engine.
    model: ModelConfig,
}

impl Config {
    fn load(path: &str) -> Result<Self> {
        let service = SuggestServiceConfig::from_file_path(path)
            .context("Failed to load suggest_service configuration")?
            .with_port_override(std::env::var(PORT).ok().as_deref())
            .context("Invalid PORT environment variable")?;
        let mut model =
            ModelConfig::from_file_path(path).context("Failed to load model configuration")?;
        if model.api_key.is_none() {
            model.api_key = std::env::var(HF_TOKEN).ok();
        }
        Ok(Self { service, model })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.print_openapi {
        println!("{}", openapi_yaml().context("Failed to render OpenAPI document")?);
        return Ok(());
    }

    let _guard = setup_logging(LOGS).context("Failed to setup logging")?;
    dotenv().ok();

    let config = Config::load(&args.config_path)?;

    info!(
        target = "suggest-node",
        event = "config_loaded",
        model_id = config.model.model_id,
        revision = config.model.revision,
        generation_timeout_ms = config.service.generation_timeout_ms,
        preload_model = config.service.preload_model,
        "Starting suggestion node"
    );

    let random_seed = config.model.random_seed;
    let service = Arc::new(SuggestionService::new(
        LlamaLoader::new(config.model),
        random_seed,
        config.service.generation_timeout(),
    ));

    if config.service.preload_model {
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = service.warm_up().await {
                error!(
                    target = "suggest-node",
                    event = "preload_failed",
                    error = %e,
                    "Failed to preload the model, requests will be rejected"
                );
            }
        });
    }

    let tcp_listener = TcpListener::bind(&config.service.service_bind_address)
        .await
        .context("Failed to bind TCP listener")?;

    info!(
        target = "suggest-node",
        event = "suggest_service_spawn",
        bind_address = config.service.service_bind_address,
        "Starting suggestion service"
    );

    let app_state = AppState {
        backend: service,
    };
    run_server(app_state, tcp_listener)
        .await
        .context("Suggestion service failed")?;

    info!(
        target = "suggest-node",
        event = "suggest_node_shutdown",
        "Suggestion node shut down successfully"
    );
    Ok(())
}

/// Installs the global tracing subscriber: a pretty console layer and a
/// JSON layer written to a daily rolling file under `log_dir`.
///
/// The returned guard flushes the file writer on drop, it must be held for
/// the lifetime of the process.
fn setup_logging<P: AsRef<Path>>(log_dir: P) -> Result<WorkerGuard> {
    // Set up file appender with rotation
    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE);

    // Create a non-blocking writer
    let (non_blocking_appender, guard) = non_blocking(file_appender);

    // Create JSON formatter for file output
    let file_layer = fmt::layer()
        .json()
        .with_timer(UtcTime::rfc_3339())
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_appender);

    // Create console formatter for development
    let console_layer = fmt::layer()
        .pretty()
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_file(true)
        .with_span_events(FmtSpan::ENTER);

    // Create filter from environment variable or default to info
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,suggest_node=debug,suggest_service=debug,suggest_inference=debug")
    });

    Registry::default()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
