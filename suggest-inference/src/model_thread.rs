use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::mpsc,
    time::Instant,
};

use thiserror::Error;
use tokio::sync::oneshot::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use crate::{
    models::{InferenceEngine, ModelError, ModelLoader},
    types::{CancelSignal, GenerationParams},
};

const MODEL_THREAD_NAME: &str = "suggest-model-thread";

/// A single completion job, executed on the model thread
pub(crate) struct ModelThreadCommand {
    prompt: String,
    params: GenerationParams,
    cancel: CancelSignal,
    sender: oneshot::Sender<Result<String, ModelError>>,
}

#[derive(Debug, Error)]
pub enum ModelThreadError {
    #[error("Model thread is not running")]
    Shutdown,
    #[error("Model thread dropped the response: `{0}`")]
    RecvError(#[from] RecvError),
    #[error("Model error: `{0}`")]
    ModelError(#[from] ModelError),
}

/// `EngineHandle` - handle to a loaded [`InferenceEngine`].
///
/// The engine itself lives on a dedicated OS thread, the handle only owns
/// the sending half of that thread's command queue. Commands are run one
/// at a time, in arrival order, so at most one generation is in flight
/// per engine no matter how many clones of the handle exist.
#[derive(Clone, Debug)]
pub struct EngineHandle {
    sender: mpsc::Sender<ModelThreadCommand>,
}

impl EngineHandle {
    /// Queues a full encode, generate and decode cycle and waits for its
    /// output, the decoded text of prompt and continuation
    pub(crate) async fn submit(
        &self,
        prompt: String,
        params: GenerationParams,
        cancel: CancelSignal,
    ) -> Result<String, ModelThreadError> {
        let (sender, receiver) = oneshot::channel();
        self.sender
            .send(ModelThreadCommand {
                prompt,
                params,
                cancel,
                sender,
            })
            .map_err(|_| ModelThreadError::Shutdown)?;
        Ok(receiver.await??)
    }
}

impl std::fmt::Debug for ModelThreadCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelThreadCommand")
            .field("prompt_len", &self.prompt.len())
            .field("params", &self.params)
            .finish()
    }
}

struct ModelThread<M: InferenceEngine> {
    model: M,
    receiver: mpsc::Receiver<ModelThreadCommand>,
}

impl<M: InferenceEngine> ModelThread<M> {
    fn run(mut self) {
        debug!("Start Model thread");

        while let Ok(command) = self.receiver.recv() {
            let ModelThreadCommand {
                prompt,
                params,
                cancel,
                sender,
            } = command;

            if sender.is_closed() {
                debug!("Caller went away while queued, skipping command");
                continue;
            }

            let output = cancel
                .check()
                .and_then(|_| self.complete(&prompt, &params, &cancel));
            sender.send(output).ok();
        }

        info!("Model thread shutting down, all engine handles dropped");
    }

    fn complete(
        &mut self,
        prompt: &str,
        params: &GenerationParams,
        cancel: &CancelSignal,
    ) -> Result<String, ModelError> {
        let model = &mut self.model;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let tokens = model.encode(prompt)?;
            let tokens = model.generate(&tokens, params, cancel)?;
            model.decode(&tokens)
        }));
        match result {
            Ok(output) => output,
            Err(payload) => {
                let message = panic_message(payload);
                error!("Model panicked while generating: {message}");
                Err(ModelError::Panicked(message))
            }
        }
    }
}

/// Spawns the model thread. The engine is loaded on the new thread, then
/// `on_loaded` is called exactly once with either a handle to the running
/// engine or the load failure reason.
pub(crate) fn spawn_model_thread<L, F>(loader: L, on_loaded: F) -> std::io::Result<()>
where
    L: ModelLoader,
    F: FnOnce(Result<EngineHandle, String>) + Send + 'static,
{
    std::thread::Builder::new()
        .name(MODEL_THREAD_NAME.to_string())
        .spawn(move || {
            let start = Instant::now();
            info!("Loading inference engine on model thread");

            let model = match panic::catch_unwind(AssertUnwindSafe(|| loader.load())) {
                Ok(Ok(model)) => model,
                Ok(Err(e)) => {
                    error!("Failed to load inference engine: {e}");
                    on_loaded(Err(e.to_string()));
                    return;
                }
                Err(payload) => {
                    let message = panic_message(payload);
                    error!("Inference engine panicked while loading: {message}");
                    on_loaded(Err(format!("engine panicked while loading: {message}")));
                    return;
                }
            };
            info!("Inference engine loaded in {:?}", start.elapsed());

            let (sender, receiver) = mpsc::channel();
            on_loaded(Ok(EngineHandle { sender }));

            ModelThread { model, receiver }.run();
        })
        .map(|_| ())
        .inspect_err(|e| warn!("Failed to spawn model thread: {e}"))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
