use crate::http::ServiceConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How a batch of requests is scheduled against the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DispatchStrategy {
    /// One request in flight at a time.
    Sequential,
    /// At most `max_in_flight` requests in flight.
    Concurrent { max_in_flight: usize },
    /// One task per example, no cap.
    Unbounded,
}

impl DispatchStrategy {
    pub fn max_in_flight(&self) -> Option<usize> {
        match *self {
            DispatchStrategy::Sequential => Some(1),
            DispatchStrategy::Concurrent { max_in_flight } => Some(max_in_flight.max(1)),
            DispatchStrategy::Unbounded => None,
        }
    }
}

impl Default for DispatchStrategy {
    fn default() -> Self {
        DispatchStrategy::Concurrent { max_in_flight: 64 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub strategy: DispatchStrategy,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            strategy: DispatchStrategy::default(),
            request_timeout_ms: 30_000,
            max_retries: 0,
            retry_backoff_ms: 100,
        }
    }
}

impl DispatchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub server_url: String,
    pub dataset_dir: PathBuf,
    pub train_prefix: String,
    pub test_prefix: String,
    pub service: Option<ServiceConfig>,
    pub dispatch: DispatchConfig,
    pub deadline_ms: Option<u64>,
    pub wait_for_server_secs: u64,
    pub save_model_path: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub show_progress: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            dataset_dir: PathBuf::from("data/mnist/"),
            train_prefix: "train".to_string(),
            test_prefix: "t10k".to_string(),
            service: None,
            dispatch: DispatchConfig::default(),
            deadline_ms: None,
            wait_for_server_secs: 60,
            save_model_path: None,
            output_dir: None,
            show_progress: true,
        }
    }
}

impl HarnessConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: HarnessConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Applies `SERVER_URL` / `DATASET_DIR` style overrides on top of a loaded
    /// config.
    pub fn with_overrides(mut self, server_url: Option<String>, dataset_dir: Option<String>) -> Self {
        if let Some(url) = server_url {
            self.server_url = url;
        }
        if let Some(dir) = dataset_dir {
            self.dataset_dir = PathBuf::from(dir);
        }
        self
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}
