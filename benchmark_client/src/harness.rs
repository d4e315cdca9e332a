use crate::report::{BatchSummary, HarnessReport, StageTiming};
use anyhow::{Context, Result};
use common::{aggregate, load_dataset, ClassificationService, Dataset, Dispatcher, HarnessConfig, ServiceClient};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Stages of one evaluation run. They never overlap; only the work inside
/// `Training` and `Classifying` is concurrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Configuring,
    TrainingDecode,
    Training,
    TestingDecode,
    Classifying,
    Reporting,
    Done,
}

/// Configure, train on one dataset, classify another, report accuracy.
pub struct Harness<S = ServiceClient> {
    config: HarnessConfig,
    client: ServiceClient,
    dispatcher: Dispatcher<S>,
    cancel: CancellationToken,
    stage: Stage,
    timings: Vec<StageTiming>,
}

impl Harness<ServiceClient> {
    pub fn new(config: HarnessConfig) -> Result<Self> {
        let client = ServiceClient::new(&config.server_url, config.dispatch.request_timeout())
            .context("Failed to create HTTP client")?;
        let service = Arc::new(client.clone());
        Ok(Self::with_service(config, client, service))
    }
}

impl<S: ClassificationService> Harness<S> {
    /// `client` carries the control operations (configure, info, model
    /// download); `service` receives the per-example train/classify calls.
    pub fn with_service(config: HarnessConfig, client: ServiceClient, service: Arc<S>) -> Self {
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(service, config.dispatch.clone())
            .with_cancellation(cancel.clone())
            .with_progress(config.show_progress);

        Self {
            config,
            client,
            dispatcher,
            cancel,
            stage: Stage::Idle,
            timings: Vec::new(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Cancelling stops new requests; unresolved ones count as misses.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn begin(&mut self, stage: Stage) -> Instant {
        info!(?stage, "entering stage");
        self.stage = stage;
        Instant::now()
    }

    fn end(&mut self, started: Instant) -> Duration {
        let elapsed = started.elapsed();
        self.timings.push(StageTiming::new(self.stage, elapsed));
        elapsed
    }

    fn decode(&mut self, stage: Stage, prefix: &str, title: &str) -> Result<Dataset> {
        let started = self.begin(stage);
        let dataset = load_dataset(&self.config.dataset_dir, prefix)
            .with_context(|| format!("Failed to load the {prefix} dataset from {}", self.config.dataset_dir.display()))?;
        let elapsed = self.end(started);

        println!("{title} data has {} images", dataset.len());
        println!("Parsing the {} dataset took: {} milliseconds", title.to_lowercase(), elapsed.as_millis());
        Ok(dataset)
    }

    pub async fn run(&mut self) -> Result<HarnessReport> {
        let deadline = self.config.deadline().map(|deadline| {
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                warn!(?deadline, "deadline reached, cancelling outstanding requests");
                cancel.cancel();
            })
        });

        let result = self.run_stages().await;
        if let Some(timer) = deadline {
            timer.abort();
        }
        result
    }

    async fn run_stages(&mut self) -> Result<HarnessReport> {
        let started = self.begin(Stage::Configuring);
        let ready_timeout = Duration::from_secs(self.config.wait_for_server_secs);
        self.client
            .wait_until_ready(ready_timeout, READY_POLL_INTERVAL)
            .await
            .with_context(|| format!("Service at {} did not become ready", self.client.base_url()))?;
        if let Some(service) = &self.config.service {
            self.client
                .configure(service)
                .await
                .context("Failed to configure the service")?;
        }
        let server_info = self
            .client
            .fetch_info()
            .await
            .context("Failed to get service info")?;
        self.end(started);

        println!("Number of hashtables: {}", server_info.hashtables);
        println!("Address size: {}", server_info.addresses);
        println!("Bleaching: {}", server_info.bleach);

        println!("\n-----------------\nTraining\n-----------------");
        let train_prefix = self.config.train_prefix.clone();
        let train = self.decode(Stage::TrainingDecode, &train_prefix, "Training")?;

        let started = self.begin(Stage::Training);
        let training = self.dispatcher.dispatch_train(&train).await;
        self.end(started);
        drop(train);
        println!("Training took: {} milliseconds", training.elapsed.as_millis());
        if training.failed() > 0 {
            println!("⚠ Warning: {}/{} training requests failed", training.failed(), training.len());
        }

        if let Some(path) = &self.config.save_model_path {
            match self.client.save_model().await {
                Ok(blob) => {
                    tokio::fs::write(path, &blob)
                        .await
                        .with_context(|| format!("Failed to write model to {}", path.display()))?;
                    info!(path = %path.display(), bytes = blob.len(), "model saved");
                }
                Err(err) => warn!(error = %err, "could not download trained model"),
            }
        }

        println!("-----------------\nTesting\n-----------------");
        let test_prefix = self.config.test_prefix.clone();
        let test = self.decode(Stage::TestingDecode, &test_prefix, "Testing")?;

        let started = self.begin(Stage::Classifying);
        let classification = self.dispatcher.dispatch_classify(&test).await;
        self.end(started);
        println!("Testing took: {} milliseconds", classification.elapsed.as_millis());

        let started = self.begin(Stage::Reporting);
        let accuracy = aggregate(&classification.results, test.labels())?;
        self.end(started);

        let report = HarnessReport {
            server_url: self.config.server_url.clone(),
            server_info,
            strategy: self.dispatcher.config().strategy,
            stages: self.timings.clone(),
            training: BatchSummary::from_outcome("train", &training),
            classification: BatchSummary::from_outcome("classify", &classification),
            hits: accuracy.hits(),
            total: accuracy.total(),
            errors: accuracy.errors(),
            accuracy: accuracy.accuracy(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        self.stage = Stage::Done;
        Ok(report)
    }
}
