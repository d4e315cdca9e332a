use crate::harness::Stage;
use anyhow::Result;
use common::{BatchOutcome, DispatchStrategy, ServiceConfig, Statistics};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub elapsed_ms: f64,
}

impl StageTiming {
    pub fn new(stage: Stage, elapsed: Duration) -> Self {
        Self {
            stage,
            elapsed_ms: elapsed.as_secs_f64() * 1000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub operation: String,
    pub requests: usize,
    pub completed: usize,
    pub failed: usize,
    pub total_duration_sec: f64,
    pub throughput_qps: f64,
    pub latency_ms: Statistics,
}

impl BatchSummary {
    pub fn from_outcome<T>(operation: &str, outcome: &BatchOutcome<T>) -> Self {
        Self {
            operation: operation.to_string(),
            requests: outcome.len(),
            completed: outcome.completed(),
            failed: outcome.failed(),
            total_duration_sec: outcome.elapsed.as_secs_f64(),
            throughput_qps: outcome.throughput(),
            latency_ms: outcome.latency_stats(),
        }
    }

    fn print(&self) {
        println!("\n{}:", self.operation);
        println!("  Requests: {} ({} failed)", self.requests, self.failed);
        println!("  Total duration: {:.2}s", self.total_duration_sec);
        println!("  Throughput: {:.2} req/s", self.throughput_qps);
        println!("  Latency (mean): {:.2}ms", self.latency_ms.mean);
        println!("  Latency (p50): {:.2}ms", self.latency_ms.median);
        println!("  Latency (p95): {:.2}ms", self.latency_ms.p95);
        println!("  Latency (p99): {:.2}ms", self.latency_ms.p99);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessReport {
    pub server_url: String,
    pub server_info: ServiceConfig,
    pub strategy: DispatchStrategy,
    pub stages: Vec<StageTiming>,
    pub training: BatchSummary,
    pub classification: BatchSummary,
    pub hits: u64,
    pub total: u64,
    pub errors: u64,
    pub accuracy: f64,
    pub timestamp: String,
}

impl HarnessReport {
    pub fn print(&self) {
        println!("\n{}", "=".repeat(70));
        println!("Results");
        println!("{}", "=".repeat(70));
        println!("Dispatch strategy: {:?}", self.strategy);
        for timing in &self.stages {
            println!("  {:<16} {:>10.2}ms", format!("{:?}", timing.stage), timing.elapsed_ms);
        }
        self.training.print();
        self.classification.print();

        println!("\nHits: {}/{}", self.hits, self.total);
        println!("Failed requests (counted as misses): {}", self.errors);
        println!("Accuracy: {:.4}", self.accuracy);
    }

    /// Writes the report as pretty JSON to `<dir>/<timestamp>.json`.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let file_name = format!("{}.json", self.timestamp.replace(':', "-"));
        let path = dir.join(file_name);
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }
}
