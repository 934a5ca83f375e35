use std::{fmt, sync::Arc, time::Instant};

use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::{
    error::ServiceError,
    model_thread::{spawn_model_thread, EngineHandle},
    models::ModelLoader,
};

/// Lifecycle of the inference engine, for the whole process.
///
/// The only transitions are `Uninitialized -> Loading` followed by
/// `Loading -> Ready` or `Loading -> Failed`. Both terminal states are
/// permanent.
#[derive(Clone, Debug, Default)]
pub enum EngineState {
    #[default]
    Uninitialized,
    Loading,
    Ready(EngineHandle),
    Failed(String),
}

impl EngineState {
    /// Whether the single load attempt already resolved
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready(_) | Self::Failed(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    fn outcome(&self) -> Option<Result<EngineHandle, ServiceError>> {
        match self {
            Self::Ready(handle) => Some(Ok(handle.clone())),
            Self::Failed(_) => Some(Err(ServiceError::engine_unavailable())),
            Self::Uninitialized | Self::Loading => None,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            Self::Uninitialized => "uninitialized",
            Self::Loading => "loading",
            Self::Ready(_) => "ready",
            Self::Failed(_) => "failed",
        };
        write!(f, "{state}")
    }
}

/// `EngineLoader` - owns the lazy, at-most-once construction of the
/// inference engine.
///
/// The state lives in a `watch` channel. Its internal lock is the
/// initialization guard: the `Uninitialized -> Loading` transition is a
/// compare-and-set under that lock, so exactly one caller gets to spawn the
/// model thread. Every caller, including the winner, then waits on the
/// channel for the terminal state. The load itself runs on the model
/// thread, so it completes even if all waiting callers are dropped.
pub struct EngineLoader<L: ModelLoader> {
    /// Consumed by the first `ensure_ready` call
    loader: std::sync::Mutex<Option<L>>,
    state: Arc<watch::Sender<EngineState>>,
}

impl<L: ModelLoader> EngineLoader<L> {
    pub fn new(loader: L) -> Self {
        let (state, _) = watch::channel(EngineState::Uninitialized);
        Self {
            loader: std::sync::Mutex::new(Some(loader)),
            state: Arc::new(state),
        }
    }

    /// A snapshot of the current state
    pub fn state(&self) -> EngineState {
        self.state.borrow().clone()
    }

    /// Returns a handle to the engine, loading it first if no load was ever
    /// attempted. Fails fast with `EngineUnavailable` once a load failed.
    #[instrument(level = "debug", skip_all)]
    pub async fn ensure_ready(&self) -> Result<EngineHandle, ServiceError> {
        if let Some(outcome) = self.state.borrow().outcome() {
            return outcome;
        }

        let mut receiver = self.state.subscribe();
        let won = self.state.send_if_modified(|state| {
            if matches!(state, EngineState::Uninitialized) {
                *state = EngineState::Loading;
                true
            } else {
                false
            }
        });
        if won {
            self.start_loading();
        }

        let state = receiver
            .wait_for(EngineState::is_terminal)
            .await
            .map_err(|_| ServiceError::engine_unavailable())?;
        state
            .outcome()
            .unwrap_or_else(|| Err(ServiceError::engine_unavailable()))
    }

    fn start_loading(&self) {
        let loader = self
            .loader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(loader) = loader else {
            // Unreachable: only the `Uninitialized -> Loading` winner gets here
            self.state
                .send_replace(EngineState::Failed("engine loader already consumed".to_string()));
            return;
        };

        info!(
            target = "suggest-inference",
            event = "engine_load_started",
            "Starting inference engine load"
        );
        let start = Instant::now();
        let state = self.state.clone();
        let spawned = spawn_model_thread(loader, move |outcome| {
            let next = match outcome {
                Ok(handle) => {
                    info!(
                        target = "suggest-inference",
                        event = "engine_ready",
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Inference engine ready"
                    );
                    EngineState::Ready(handle)
                }
                Err(reason) => {
                    error!(
                        target = "suggest-inference",
                        event = "engine_failed",
                        reason = %reason,
                        "Inference engine failed to load, it will not be retried"
                    );
                    EngineState::Failed(reason)
                }
            };
            state.send_replace(next);
        });
        if let Err(e) = spawned {
            self.state
                .send_replace(EngineState::Failed(format!("failed to spawn model thread: {e}")));
        }
    }
}
