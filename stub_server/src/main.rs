use anyhow::Result;
use std::sync::Arc;
use stub_server::{router, AppState};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter("stub_server=info,tower_http=info")
        .init();

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    info!("======================================================================");
    info!("Stub classification service - Starting");
    info!("======================================================================");

    let app = router(Arc::new(AppState::default()));
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Server ready on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
