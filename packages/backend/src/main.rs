// packages/backend/src/main.rs
use anyhow::Context;
use clap::Parser;
use comments_backend::{build_router, config::Config, init_tracing, setup_shared_state, shutdown_signal, ROUTES};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::parse());
    init_tracing(&config);
    info!("🚀 Starting Comments Service");

    let server_state = setup_shared_state(config.clone()).await?;
    let shutdown = server_state.shutdown.clone();
    let app = build_router(server_state);

    info!("Registered routes:");
    for (method, path) in ROUTES {
        info!("  - {} [{}]", path, method);
    }

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr()))?;
    info!("🚀 Comments service is running at http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("Server failed")?;

    info!("👋 Comments service stopped");
    Ok(())
}
