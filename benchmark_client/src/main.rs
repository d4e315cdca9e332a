use anyhow::{Context, Result};
use benchmark_client::Harness;
use common::HarnessConfig;
use std::env;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("benchmark_client=info,common=warn")),
        )
        .init();

    println!("========================================================================");
    println!("WiSARD Evaluation Client - MNIST");
    println!("========================================================================");

    let config = match env::var("CONFIG_PATH") {
        Ok(path) => HarnessConfig::load(&path)
            .with_context(|| format!("Failed to load harness configuration from {path}"))?,
        Err(_) => HarnessConfig::default(),
    };
    let config = config.with_overrides(env::var("SERVER_URL").ok(), env::var("DATASET_DIR").ok());

    println!("Server URL: {}", config.server_url);
    println!("Dataset: {}", config.dataset_dir.display());
    println!("Dispatch: {:?}", config.dispatch.strategy);

    let output_dir = config.output_dir.clone();
    let mut harness = Harness::new(config)?;

    let cancel = harness.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling outstanding requests");
            cancel.cancel();
        }
    });

    let report = harness.run().await?;
    report.print();

    if let Some(dir) = output_dir {
        let path = report.save(&dir)?;
        println!("\nResults saved to: {}", path.display());
    }

    println!("\n========================================================================");
    println!("Evaluation complete!");
    println!("========================================================================");

    Ok(())
}
