//! Concurrent fan-out of train/classify requests over a [`Dataset`].
//!
//! Every request task carries the index of its example and the collector
//! writes the result into that index of a pre-sized slot buffer, so the
//! output order is the input order no matter which request finishes first.

use crate::client::ClassificationService;
use crate::config::DispatchConfig;
use crate::error::ServiceError;
use crate::idx::{Dataset, Example};
use crate::stats::Statistics;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub type SlotResult<T> = Result<T, ServiceError>;

/// Results of one batch, positionally aligned with the dispatched dataset.
#[derive(Debug)]
pub struct BatchOutcome<T> {
    pub results: Vec<SlotResult<T>>,
    /// Latencies of the successful requests, in completion order.
    pub latencies: Vec<Duration>,
    pub elapsed: Duration,
}

impl<T> BatchOutcome<T> {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn completed(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.len() - self.completed()
    }

    pub fn latency_stats(&self) -> Statistics {
        Statistics::from_durations(&self.latencies)
    }

    /// Successful requests per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.completed() as f64 / secs
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    request_timeout: Duration,
    max_retries: u32,
    backoff: Duration,
}

impl From<&DispatchConfig> for RetryPolicy {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            max_retries: config.max_retries,
            backoff: config.retry_backoff(),
        }
    }
}

/// Runs `call` under its own timeout, retrying transport failures with
/// exponential backoff.
async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut call: F) -> SlotResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SlotResult<T>>,
{
    let mut backoff = policy.backoff;
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(policy.request_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout),
        };

        match result {
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                debug!(attempt, error = %err, "retrying request");
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            other => return other,
        }
    }
}

fn progress_bar(len: usize, message: &'static str, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar().template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})") {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb.set_message(message);
    pb
}

type Finished<T> = (usize, SlotResult<T>, Duration);

struct Slots<T> {
    operation: &'static str,
    /// Example index of every spawned task, for tasks that die before
    /// reporting their own index.
    indices: HashMap<Id, usize>,
    results: Vec<Option<SlotResult<T>>>,
    latencies: Vec<Duration>,
    progress: ProgressBar,
}

impl<T> Slots<T> {
    fn new(operation: &'static str, len: usize, progress: ProgressBar) -> Self {
        Self {
            operation,
            indices: HashMap::with_capacity(len),
            results: (0..len).map(|_| None).collect(),
            latencies: Vec::with_capacity(len),
            progress,
        }
    }

    fn track(&mut self, id: Id, index: usize) {
        self.indices.insert(id, index);
    }

    fn record(&mut self, joined: Result<Finished<T>, JoinError>) {
        let (index, result, latency) = match joined {
            Ok(finished) => finished,
            Err(err) => {
                let Some(index) = self.indices.get(&err.id()).copied() else {
                    error!(operation = self.operation, error = %err, "untracked request task failed");
                    return;
                };
                error!(operation = self.operation, index, error = %err, "request task did not complete");
                let result = if err.is_cancelled() {
                    ServiceError::Cancelled
                } else {
                    ServiceError::Task(err.to_string())
                };
                self.results[index] = Some(Err(result));
                self.progress.inc(1);
                return;
            }
        };

        match &result {
            Ok(_) => self.latencies.push(latency),
            Err(ServiceError::Cancelled) => debug!(operation = self.operation, index, "request cancelled"),
            Err(err) => warn!(
                operation = self.operation,
                index,
                kind = err.kind(),
                error = %err,
                "request failed"
            ),
        }
        self.results[index] = Some(result);
        self.progress.inc(1);
    }

    fn finish(self, elapsed: Duration) -> BatchOutcome<T> {
        let unresolved = self.results.iter().filter(|r| r.is_none()).count();
        if unresolved > 0 {
            warn!(operation = self.operation, unresolved, "batch stopped before every request resolved");
        }
        self.progress.finish_with_message(format!("✓ {} complete", self.operation));

        BatchOutcome {
            results: self
                .results
                .into_iter()
                .map(|slot| slot.unwrap_or(Err(ServiceError::Cancelled)))
                .collect(),
            latencies: self.latencies,
            elapsed,
        }
    }
}

/// Schedules per-example requests against a [`ClassificationService`].
pub struct Dispatcher<S> {
    service: Arc<S>,
    config: DispatchConfig,
    cancel: CancellationToken,
    show_progress: bool,
}

impl<S: ClassificationService> Dispatcher<S> {
    pub fn new(service: Arc<S>, config: DispatchConfig) -> Self {
        Self {
            service,
            config,
            cancel: CancellationToken::new(),
            show_progress: false,
        }
    }

    /// Once `cancel` fires no new requests are issued and unresolved slots
    /// become [`ServiceError::Cancelled`].
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub async fn dispatch_train(&self, dataset: &Dataset) -> BatchOutcome<()> {
        self.dispatch("train", dataset, |service, example| async move {
            let label = example.label.to_string();
            service.train_one(&label, example.pixels).await
        })
        .await
    }

    pub async fn dispatch_classify(&self, dataset: &Dataset) -> BatchOutcome<String> {
        self.dispatch("classify", dataset, |service, example| async move {
            service.classify_one(example.pixels).await
        })
        .await
    }

    async fn dispatch<T, F, Fut>(&self, operation: &'static str, dataset: &Dataset, op: F) -> BatchOutcome<T>
    where
        T: Send + 'static,
        F: Fn(Arc<S>, Example) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = SlotResult<T>> + Send + 'static,
    {
        let started = Instant::now();
        let policy = RetryPolicy::from(&self.config);
        let gate = self
            .config
            .strategy
            .max_in_flight()
            .map(|limit| Arc::new(Semaphore::new(limit)));
        let progress = progress_bar(dataset.len(), operation, self.show_progress);
        let mut slots = Slots::new(operation, dataset.len(), progress);
        let mut tasks = JoinSet::new();

        for (index, example) in dataset.iter().enumerate() {
            let permit = match &gate {
                Some(gate) => {
                    let acquired = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => None,
                        permit = gate.clone().acquire_owned() => permit.ok(),
                    };
                    match acquired {
                        Some(permit) => Some(permit),
                        None => break,
                    }
                }
                None if self.cancel.is_cancelled() => break,
                None => None,
            };

            let service = self.service.clone();
            let cancel = self.cancel.clone();
            let op = op.clone();
            let handle = tasks.spawn(async move {
                let _permit = permit;
                let request_start = Instant::now();
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(ServiceError::Cancelled),
                    result = with_retry(policy, || op(service.clone(), example.clone())) => result,
                };
                (index, result, request_start.elapsed())
            });
            slots.track(handle.id(), index);

            while let Some(joined) = tasks.try_join_next() {
                slots.record(joined);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            slots.record(joined);
        }

        slots.finish(started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchStrategy;
    use crate::idx::decode;
    use crate::idx::tests::{images_bytes, labels_bytes};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type DelayFn = Box<dyn Fn(u8) -> u64 + Send + Sync>;
    type FailFn = Box<dyn Fn(u8, u32) -> Option<ServiceError> + Send + Sync>;

    /// Identifies each example by its first pixel and answers with that id.
    struct FakeService {
        delay_ms: DelayFn,
        failure: FailFn,
        attempts: Mutex<HashMap<u8, u32>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        trained: Mutex<Vec<(String, u8)>>,
    }

    impl FakeService {
        fn new(delay_ms: impl Fn(u8) -> u64 + Send + Sync + 'static) -> Self {
            Self {
                delay_ms: Box::new(delay_ms),
                failure: Box::new(|_, _| None),
                attempts: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                trained: Mutex::new(Vec::new()),
            }
        }

        fn failing(mut self, failure: impl Fn(u8, u32) -> Option<ServiceError> + Send + Sync + 'static) -> Self {
            self.failure = Box::new(failure);
            self
        }

        fn attempts(&self, id: u8) -> u32 {
            self.attempts.lock().unwrap().get(&id).copied().unwrap_or(0)
        }

        fn total_attempts(&self) -> u32 {
            self.attempts.lock().unwrap().values().sum()
        }

        async fn handle(&self, pixels: &Bytes) -> Result<u8, ServiceError> {
            let id = pixels[0];
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                let entry = attempts.entry(id).or_insert(0);
                *entry += 1;
                *entry
            };

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis((self.delay_ms)(id))).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match (self.failure)(id, attempt) {
                Some(err) => Err(err),
                None => Ok(id),
            }
        }
    }

    #[async_trait]
    impl ClassificationService for FakeService {
        async fn train_one(&self, label: &str, pixels: Bytes) -> Result<(), ServiceError> {
            let id = self.handle(&pixels).await?;
            self.trained.lock().unwrap().push((label.to_string(), id));
            Ok(())
        }

        async fn classify_one(&self, pixels: Bytes) -> Result<String, ServiceError> {
            self.handle(&pixels).await.map(|id| id.to_string())
        }
    }

    /// `count` 2x2 images whose first pixel is their index.
    fn indexed_dataset(count: u8) -> Dataset {
        let pixels: Vec<u8> = (0..count).flat_map(|i| [i, 0, 0, 0]).collect();
        let labels: Vec<u8> = (0..count).map(|i| i % 10).collect();
        decode(images_bytes(count as i32, 2, 2, &pixels), &labels_bytes(count as i32, &labels)).unwrap()
    }

    fn config(strategy: DispatchStrategy) -> DispatchConfig {
        DispatchConfig {
            strategy,
            ..DispatchConfig::default()
        }
    }

    fn expected_ids(count: u8) -> Vec<SlotResult<String>> {
        (0..count).map(|i| Ok(i.to_string())).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn results_follow_input_order_not_completion_order() {
        for strategy in [
            DispatchStrategy::Unbounded,
            DispatchStrategy::Concurrent { max_in_flight: 4 },
            DispatchStrategy::Sequential,
        ] {
            // later examples finish first
            let service = Arc::new(FakeService::new(|id| 10 * (30 - id as u64)));
            let dispatcher = Dispatcher::new(service, config(strategy));

            let outcome = dispatcher.dispatch_classify(&indexed_dataset(30)).await;
            assert_eq!(outcome.results, expected_ids(30), "strategy {strategy:?}");
            assert_eq!(outcome.completed(), 30);
            assert_eq!(outcome.latencies.len(), 30);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_requests_respect_the_limit() {
        let cases = [
            (DispatchStrategy::Sequential, 1),
            (DispatchStrategy::Concurrent { max_in_flight: 3 }, 3),
            (DispatchStrategy::Unbounded, 12),
        ];
        for (strategy, expected_peak) in cases {
            let service = Arc::new(FakeService::new(|_| 50));
            let dispatcher = Dispatcher::new(service.clone(), config(strategy));
            dispatcher.dispatch_classify(&indexed_dataset(12)).await;
            assert_eq!(service.peak.load(Ordering::SeqCst), expected_peak, "strategy {strategy:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn a_failed_request_only_affects_its_own_slot() {
        let service = Arc::new(
            FakeService::new(|id| 5 * id as u64)
                .failing(|id, _| (id == 2).then(|| ServiceError::Network("connection reset".into()))),
        );
        let dispatcher = Dispatcher::new(service, config(DispatchStrategy::Concurrent { max_in_flight: 2 }));

        let outcome = dispatcher.dispatch_classify(&indexed_dataset(6)).await;
        let mut expected = expected_ids(6);
        expected[2] = Err(ServiceError::Network("connection reset".into()));
        assert_eq!(outcome.results, expected);
        assert_eq!(outcome.failed(), 1);
        assert_eq!(outcome.latencies.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn a_panicking_request_is_a_task_failure_in_its_own_slot() {
        let service = Arc::new(FakeService::new(|id| 5 * id as u64).failing(|id, _| {
            if id == 1 {
                panic!("service handler blew up");
            }
            None
        }));
        let dispatcher = Dispatcher::new(service, config(DispatchStrategy::Unbounded));

        let outcome = dispatcher.dispatch_classify(&indexed_dataset(3)).await;
        assert_eq!(outcome.results[0], Ok("0".to_string()));
        assert!(
            matches!(&outcome.results[1], Err(ServiceError::Task(msg)) if msg.contains("panicked")),
            "{:?}",
            outcome.results[1]
        );
        assert_eq!(outcome.results[2], Ok("2".to_string()));
        assert_eq!(outcome.failed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_are_retried_with_backoff() {
        let service = Arc::new(
            FakeService::new(|_| 1).failing(|id, attempt| (id == 1 && attempt <= 2).then_some(ServiceError::Timeout)),
        );
        let dispatcher = Dispatcher::new(
            service.clone(),
            DispatchConfig {
                max_retries: 2,
                ..config(DispatchStrategy::Unbounded)
            },
        );

        let outcome = dispatcher.dispatch_classify(&indexed_dataset(3)).await;
        assert_eq!(outcome.results, expected_ids(3));
        assert_eq!(service.attempts(1), 3);
        assert_eq!(service.attempts(0), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn status_errors_are_not_retried() {
        let service = Arc::new(
            FakeService::new(|_| 1).failing(|id, _| (id == 0).then_some(ServiceError::Status { status: 500 })),
        );
        let dispatcher = Dispatcher::new(
            service.clone(),
            DispatchConfig {
                max_retries: 3,
                ..config(DispatchStrategy::Unbounded)
            },
        );

        let outcome = dispatcher.dispatch_classify(&indexed_dataset(2)).await;
        assert_eq!(outcome.results[0], Err(ServiceError::Status { status: 500 }));
        assert_eq!(service.attempts(0), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_hanging_request_times_out_alone() {
        let service = Arc::new(FakeService::new(|id| if id == 1 { 60_000 } else { 10 }));
        let dispatcher = Dispatcher::new(
            service,
            DispatchConfig {
                request_timeout_ms: 100,
                ..config(DispatchStrategy::Concurrent { max_in_flight: 2 })
            },
        );

        let outcome = dispatcher.dispatch_classify(&indexed_dataset(4)).await;
        let mut expected = expected_ids(4);
        expected[1] = Err(ServiceError::Timeout);
        assert_eq!(outcome.results, expected);
        assert!(outcome.elapsed < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_resolves_every_slot_as_cancelled() {
        let service = Arc::new(FakeService::new(|_| 1_000));
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(service.clone(), config(DispatchStrategy::Concurrent { max_in_flight: 2 }))
            .with_cancellation(cancel.clone());

        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let outcome = dispatcher.dispatch_classify(&indexed_dataset(8)).await;
        trigger.await.unwrap();

        assert_eq!(outcome.len(), 8);
        assert!(outcome.results.iter().all(|r| *r == Err(ServiceError::Cancelled)));
        // only the first window was ever issued
        assert_eq!(service.total_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pre_cancelled_dispatch_issues_nothing() {
        let service = Arc::new(FakeService::new(|_| 1));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let dispatcher = Dispatcher::new(service.clone(), config(DispatchStrategy::Unbounded)).with_cancellation(cancel);

        let outcome = dispatcher.dispatch_train(&indexed_dataset(5)).await;
        assert_eq!(outcome.completed(), 0);
        assert_eq!(outcome.len(), 5);
        assert_eq!(service.total_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn training_sends_stringified_labels() {
        let service = Arc::new(FakeService::new(|id| 20 - id as u64));
        let dispatcher = Dispatcher::new(service.clone(), config(DispatchStrategy::Unbounded));

        let outcome = dispatcher.dispatch_train(&indexed_dataset(12)).await;
        assert_eq!(outcome.completed(), 12);

        let mut trained = service.trained.lock().unwrap().clone();
        trained.sort_by_key(|(_, id)| *id);
        let expected: Vec<(String, u8)> = (0..12).map(|i| ((i % 10).to_string(), i)).collect();
        assert_eq!(trained, expected);
    }

    #[tokio::test]
    async fn empty_dataset_yields_empty_outcome() {
        let dispatcher = Dispatcher::new(Arc::new(FakeService::new(|_| 0)), DispatchConfig::default());
        let outcome = dispatcher.dispatch_classify(&indexed_dataset(0)).await;
        assert!(outcome.is_empty());
        assert_eq!(outcome.throughput(), 0.0);
    }
}
