use std::{future::Future, pin::Pin, sync::Arc};

use axum::{
    body::Bytes,
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use suggest_inference::{
    EngineState, GenerationResult, ModelLoader, ServiceError, SuggestRequest, SuggestionService,
};
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;
use tracing::{info, instrument};
use utoipa::OpenApi;

use crate::{components::openapi::openapi_routes, error::SuggestServiceError};

pub const ROOT_PATH: &str = "/";
pub const HEALTH_PATH: &str = "/health";
pub const SUGGEST_PATH: &str = "/suggest";

const ROOT_MESSAGE: &str = "🚀 Code Suggestion API is running!";

/// A boxed, sendable future borrowing the backend
pub type BackendFuture<'a> =
    Pin<Box<dyn Future<Output = Result<GenerationResult, ServiceError>> + Send + 'a>>;

/// The suggestion pipeline, as seen by the HTTP handlers.
///
/// Implemented by [`SuggestionService`] for any model loader, so the router
/// does not depend on which engine backs it.
pub trait SuggestionBackend: Send + Sync + 'static {
    /// The current engine load state
    fn engine_state(&self) -> EngineState;

    /// Runs the full pipeline for a raw request body
    fn suggest_body(&self, body: Bytes) -> BackendFuture<'_>;
}

impl<L: ModelLoader> SuggestionBackend for SuggestionService<L> {
    fn engine_state(&self) -> EngineState {
        SuggestionService::engine_state(self)
    }

    fn suggest_body(&self, body: Bytes) -> BackendFuture<'_> {
        Box::pin(async move { SuggestionService::suggest_body(self, &body).await })
    }
}

/// Represents the shared state of the application.
#[derive(Clone)]
pub struct AppState {
    /// The suggestion pipeline, shared by every request handler
    pub backend: Arc<dyn SuggestionBackend>,
}

impl AppState {
    pub fn new<B: SuggestionBackend>(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }
}

/// OpenAPI documentation for the suggestion endpoint
#[derive(OpenApi)]
#[openapi(
    paths(suggest_handler),
    components(schemas(SuggestRequest, GenerationResult, crate::error::ErrorResponse))
)]
pub struct SuggestOpenApi;

/// Creates and configures the main router for the application.
///
/// Cross origin requests are allowed from anywhere, the OpenAPI docs are
/// served under `/swagger-ui`.
pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route(SUGGEST_PATH, post(suggest_handler))
        .route(HEALTH_PATH, get(health))
        .with_state(app_state)
        .route(ROOT_PATH, get(root))
        .merge(openapi_routes())
        .layer(CorsLayer::permissive())
}

/// Starts and runs the HTTP server until a Ctrl+C signal is received.
///
/// # Errors
///
/// Returns an error if the server fails while running, or if the shutdown
/// signal handler cannot be installed.
pub async fn run_server(app_state: AppState, tcp_listener: TcpListener) -> anyhow::Result<()> {
    let app = create_router(app_state);
    let shutdown_signal = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(
                target = "suggest-service",
                event = "shutdown_signal_error",
                error = %e,
                "Failed to listen for Ctrl+C, shutting down"
            );
        }
        info!(
            target = "suggest-service",
            event = "shutdown",
            "Shutting down server..."
        );
    };
    axum::serve(tcp_listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await?;
    Ok(())
}

/// Liveness probe
#[utoipa::path(
    get,
    path = "/",
    tag = "health",
    responses(
        (status = 200, description = "Service is running", body = Value)
    )
)]
pub async fn root() -> impl IntoResponse {
    Json(json!({ "message": ROOT_MESSAGE }))
}

/// Reports the engine load state, one of `uninitialized`, `loading`,
/// `ready` or `failed`
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Service is healthy", body = Value)
    )
)]
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let engine = state.backend.engine_state().to_string();
    Json(json!({ "status": "ok", "engine": engine }))
}

/// Generates a code suggestion for the given prompt.
///
/// The body is read as raw bytes rather than through the `Json` extractor,
/// so that malformed bodies get the same `{"error": ...}` shape as every
/// other failure. If the client goes away before the response is ready, the
/// handler future is dropped and the generation is cancelled before its
/// next token.
#[utoipa::path(
    post,
    path = "",
    tag = "suggest",
    request_body = SuggestRequest,
    responses(
        (status = 200, description = "Suggestion generated", body = GenerationResult),
        (status = 400, description = "Missing prompt or malformed body", body = crate::error::ErrorResponse),
        (status = 500, description = "Engine unavailable or generation failed", body = crate::error::ErrorResponse)
    )
)]
#[instrument(level = "info", skip_all, fields(body_len = body.len()))]
pub async fn suggest_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<GenerationResult>, SuggestServiceError> {
    info!(
        target = "suggest-service",
        event = "suggest_request_received",
        "Received suggestion request"
    );
    let result = state
        .backend
        .suggest_body(body)
        .await
        .map_err(|e| SuggestServiceError::from_service_error(e, SUGGEST_PATH))?;
    info!(
        target = "suggest-service",
        event = "suggest_request_completed",
        prompt_chars = result.prompt.chars().count(),
        suggestion_chars = result.suggestion.chars().count(),
        "Suggestion request completed"
    );
    Ok(Json(result))
}
