use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use metrics::{
    Counter, CounterFn, Gauge, Histogram, Key, KeyName, Metadata, SharedString, Unit,
};
use serde_json::json;

use crate::{
    error::{ServiceError, ServiceErrorKind},
    loader::EngineState,
    models::{InferenceEngine, ModelError, ModelLoader},
    response::MAX_SUGGESTION_CHARS,
    service::SuggestionService,
    types::{CancelSignal, GenerationParams, SuggestRequest},
};

const CONTINUATION: &str = " a + b";
const FAILING_PROMPT: &str = "explode";
const SLOW_PROMPT: &str = "take your time";
const END_OF_SEQUENCE: u32 = 0;

/// Shared record of everything the mock engine was asked to do
#[derive(Default)]
struct Recorder {
    loads: AtomicUsize,
    generations: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    cancelled: AtomicUsize,
    params: Mutex<Vec<GenerationParams>>,
}

/// Character level engine, one token per `char`. The continuation cycles
/// over `CONTINUATION`, which ends with an end of sequence token once
/// fully emitted.
struct MockEngine {
    recorder: Arc<Recorder>,
    generation_time: Duration,
}

impl InferenceEngine for MockEngine {
    fn encode(&self, text: &str) -> Result<Vec<u32>, ModelError> {
        Ok(text.chars().map(|c| c as u32).collect())
    }

    fn generate(
        &mut self,
        tokens: &[u32],
        params: &GenerationParams,
        cancel: &CancelSignal,
    ) -> Result<Vec<u32>, ModelError> {
        let in_flight = self.recorder.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.recorder
            .max_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);
        self.recorder.generations.fetch_add(1, Ordering::SeqCst);
        self.recorder.params.lock().unwrap().push(params.clone());

        let result = self.run(tokens, params, cancel);

        self.recorder.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn decode(&self, tokens: &[u32]) -> Result<String, ModelError> {
        Ok(tokens
            .iter()
            .filter(|token| **token != END_OF_SEQUENCE)
            .filter_map(|token| char::from_u32(*token))
            .collect())
    }
}

impl MockEngine {
    fn run(
        &self,
        tokens: &[u32],
        params: &GenerationParams,
        cancel: &CancelSignal,
    ) -> Result<Vec<u32>, ModelError> {
        let prompt = self.decode(tokens)?;
        if prompt == FAILING_PROMPT {
            return Err(ModelError::Msg("cuda out of memory".to_string()));
        }
        if prompt == SLOW_PROMPT {
            // Polls the cancellation signal for up to 5 seconds
            for _ in 0..500 {
                if let Err(e) = cancel.check() {
                    self.recorder.cancelled.fetch_add(1, Ordering::SeqCst);
                    return Err(e);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        std::thread::sleep(self.generation_time);
        let mut output = tokens.to_vec();
        let continuation = CONTINUATION
            .chars()
            .map(|c| c as u32)
            .chain(std::iter::once(END_OF_SEQUENCE));
        for token in continuation.take(params.max_new_tokens) {
            cancel.check()?;
            output.push(token);
        }
        Ok(output)
    }
}

struct MockLoader {
    recorder: Arc<Recorder>,
    fail: bool,
    generation_time: Duration,
}

impl ModelLoader for MockLoader {
    type Model = MockEngine;

    fn load(&self) -> Result<Self::Model, ModelError> {
        self.recorder.loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        if self.fail {
            return Err(ModelError::Msg("simulated load error".to_string()));
        }
        Ok(MockEngine {
            recorder: self.recorder.clone(),
            generation_time: self.generation_time,
        })
    }
}

fn service(
    fail: bool,
    timeout: Option<Duration>,
) -> (SuggestionService<MockLoader>, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let loader = MockLoader {
        recorder: recorder.clone(),
        fail,
        generation_time: Duration::from_millis(30),
    };
    (SuggestionService::new(loader, Some(42), timeout), recorder)
}

fn request(value: serde_json::Value) -> SuggestRequest {
    serde_json::from_value(value).unwrap()
}

#[tokio::test]
async fn test_ready_engine_returns_suggestion() {
    let (service, recorder) = service(false, None);
    let prompt = "def add(a, b):\n    return";

    let result = service
        .suggest(request(json!({ "prompt": prompt })))
        .await
        .unwrap();

    assert_eq!(result.prompt, prompt);
    assert_eq!(result.suggestion, CONTINUATION);
    assert!(!result.suggestion.is_empty());
    assert!(result.suggestion.chars().count() <= MAX_SUGGESTION_CHARS);
    assert!(matches!(service.engine_state(), EngineState::Ready(_)));
    assert_eq!(recorder.loads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_budget_bounds_continuation() {
    let (service, _) = service(false, None);
    let result = service
        .suggest(request(json!({ "prompt": "x", "maxNewTokens": 2 })))
        .await
        .unwrap();
    assert_eq!(result.suggestion, " a");
}

#[tokio::test]
async fn test_missing_prompt_skips_engine() {
    let (service, recorder) = service(false, None);

    let error = service.suggest(request(json!({}))).await.unwrap_err();
    assert_eq!(error, ServiceError::missing_prompt());

    let error = service
        .suggest(request(json!({ "prompt": "   " })))
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ServiceErrorKind::InvalidRequest);

    assert_eq!(recorder.loads.load(Ordering::SeqCst), 0);
    assert_eq!(recorder.generations.load(Ordering::SeqCst), 0);
    assert!(matches!(service.engine_state(), EngineState::Uninitialized));
}

#[tokio::test]
async fn test_failed_engine_rejects_every_request() {
    let (service, recorder) = service(true, None);

    let error = service
        .suggest(request(json!({ "prompt": "x=1" })))
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ServiceErrorKind::EngineUnavailable);
    assert!(error.to_string().contains("unavailable"));
    assert!(service.engine_state().is_failed());

    // Valid or not, every later request gets the same answer
    for body in [
        json!({ "prompt": "x=1" }),
        json!({}),
        json!({ "prompt": "y", "maxNewTokens": "lots" }),
    ] {
        let later = service.suggest(request(body)).await.unwrap_err();
        assert_eq!(later, error);
    }
    let later = service.suggest_body(b"{broken").await.unwrap_err();
    assert_eq!(later, error);

    assert_eq!(recorder.loads.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.generations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_parameters_are_clamped_before_generation() {
    let (service, recorder) = service(false, None);

    service
        .suggest(request(json!({ "prompt": "a", "maxNewTokens": 5000 })))
        .await
        .unwrap();
    service
        .suggest(request(json!({ "prompt": "a", "temperature": -10 })))
        .await
        .unwrap();

    let params = recorder.params.lock().unwrap().clone();
    assert_eq!(params.len(), 2);
    assert_eq!(params[0].max_new_tokens, 48);
    assert_eq!(params[0].temperature, 0.7);
    assert_eq!(params[1].max_new_tokens, 24);
    assert_eq!(params[1].temperature, 0.1);
    assert!(params.iter().all(|p| p.top_p == 0.95 && p.random_seed == 42));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_generations_never_overlap() {
    let (service, recorder) = service(false, None);
    let service = Arc::new(service);

    let handles = (0..8)
        .map(|i| {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .suggest(request(json!({ "prompt": format!("let x{i} =") })))
                    .await
            })
        })
        .collect::<Vec<_>>();

    for (i, handle) in handles.into_iter().enumerate() {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.prompt, format!("let x{i} ="));
        assert_eq!(result.suggestion, CONTINUATION);
    }

    assert_eq!(recorder.loads.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.generations.load(Ordering::SeqCst), 8);
    assert_eq!(recorder.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_generation_failure_is_contained() {
    let (service, _) = service(false, None);

    let error = service
        .suggest(request(json!({ "prompt": FAILING_PROMPT })))
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ServiceErrorKind::GenerationFailure);
    assert!(error.to_string().contains("cuda out of memory"));

    // The engine stays usable for later requests
    let result = service
        .suggest(request(json!({ "prompt": "x =" })))
        .await
        .unwrap();
    assert_eq!(result.suggestion, CONTINUATION);
}

#[tokio::test]
async fn test_generation_deadline() {
    let (service, recorder) = service(false, Some(Duration::from_millis(100)));

    let error = service
        .suggest(request(json!({ "prompt": SLOW_PROMPT })))
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ServiceErrorKind::GenerationFailure);
    assert!(error.to_string().contains("deadline exceeded"));
    assert_eq!(recorder.cancelled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dropped_request_cancels_generation() {
    let (service, recorder) = service(false, None);
    service.warm_up().await.unwrap();

    let dropped = tokio::time::timeout(
        Duration::from_millis(100),
        service.suggest(request(json!({ "prompt": SLOW_PROMPT }))),
    )
    .await;
    assert!(dropped.is_err());

    // The model thread notices the cancellation at its next poll
    for _ in 0..100 {
        if recorder.cancelled.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(recorder.cancelled.load(Ordering::SeqCst), 1);

    // And moves on to the next request
    let result = service
        .suggest(request(json!({ "prompt": "x =" })))
        .await
        .unwrap();
    assert_eq!(result.suggestion, CONTINUATION);
}

#[tokio::test]
async fn test_suggest_body() {
    let (service, _) = service(false, None);

    let result = service
        .suggest_body(br#"{"prompt": "fn main() {", "temperature": "1.2"}"#)
        .await
        .unwrap();
    assert_eq!(result.prompt, "fn main() {");

    let error = service.suggest_body(b"").await.unwrap_err();
    assert_eq!(error, ServiceError::missing_prompt());

    let error = service.suggest_body(b"{oops").await.unwrap_err();
    assert_eq!(error.kind(), ServiceErrorKind::InvalidRequest);
}

type OutcomeCounts = Arc<Mutex<HashMap<String, u64>>>;

/// Metrics recorder keeping only `suggest_requests_total`, by outcome label
#[derive(Default)]
struct OutcomeRecorder {
    counts: OutcomeCounts,
}

struct OutcomeCounter {
    outcome: String,
    counts: OutcomeCounts,
}

impl CounterFn for OutcomeCounter {
    fn increment(&self, value: u64) {
        *self
            .counts
            .lock()
            .unwrap()
            .entry(self.outcome.clone())
            .or_default() += value;
    }

    fn absolute(&self, value: u64) {
        self.counts
            .lock()
            .unwrap()
            .insert(self.outcome.clone(), value);
    }
}

impl metrics::Recorder for OutcomeRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        if key.name() != "suggest_requests_total" {
            return Counter::noop();
        }
        let outcome = key
            .labels()
            .find(|label| label.key() == "outcome")
            .map(|label| label.value().to_string())
            .unwrap_or_default();
        Counter::from_arc(Arc::new(OutcomeCounter {
            outcome,
            counts: self.counts.clone(),
        }))
    }

    fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> Gauge {
        Gauge::noop()
    }

    fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
        Histogram::noop()
    }
}

impl OutcomeRecorder {
    fn count(&self, outcome: &str) -> u64 {
        self.counts
            .lock()
            .unwrap()
            .get(outcome)
            .copied()
            .unwrap_or(0)
    }

    fn total(&self) -> u64 {
        self.counts.lock().unwrap().values().sum()
    }
}

/// Runs `f` on a current thread runtime with `recorder` installed, so every
/// counter the service touches lands in it
fn with_outcomes<F, Fut>(recorder: &OutcomeRecorder, f: F)
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    metrics::with_local_recorder(recorder, || runtime.block_on(f()));
}

#[test]
fn test_body_rejections_are_counted() {
    let recorder = OutcomeRecorder::default();
    with_outcomes(&recorder, || async {
        let (service, _) = service(false, None);

        let error = service.suggest_body(b"{oops").await.unwrap_err();
        assert_eq!(error.kind(), ServiceErrorKind::InvalidRequest);
        let error = service.suggest_body(b"[1, 2]").await.unwrap_err();
        assert_eq!(error.kind(), ServiceErrorKind::InvalidRequest);
        let error = service.suggest_body(b"{}").await.unwrap_err();
        assert_eq!(error, ServiceError::missing_prompt());
        service
            .suggest_body(br#"{"prompt": "x ="}"#)
            .await
            .unwrap();
    });

    assert_eq!(recorder.count("invalid_request"), 3);
    assert_eq!(recorder.count("success"), 1);
    assert_eq!(recorder.total(), 4);
}

#[test]
fn test_failed_engine_rejections_are_counted() {
    let recorder = OutcomeRecorder::default();
    with_outcomes(&recorder, || async {
        let (service, _) = service(true, None);

        service
            .suggest_body(br#"{"prompt": "x=1"}"#)
            .await
            .unwrap_err();
        // Rejected before the body is even parsed
        let bodies: [&[u8]; 3] = [b"{oops", b"{}", br#"{"prompt": "y"}"#];
        for body in bodies {
            let error = service.suggest_body(body).await.unwrap_err();
            assert_eq!(error.kind(), ServiceErrorKind::EngineUnavailable);
        }
    });

    assert_eq!(recorder.count("engine_unavailable"), 4);
    assert_eq!(recorder.total(), 4);
}
