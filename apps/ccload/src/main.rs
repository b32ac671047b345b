use std::sync::Arc;

use anyhow::Context;
use ccload_common::GlobalConfigPatch;
use ccload_core::AppState;
use ccload_storage::InMemoryStorage;
use clap::Parser;

mod cli;

use cli::CliArgs;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = CliArgs::parse();
    let bind = args.bind.clone();
    let patch = args.into_patch();

    let mut merged = GlobalConfigPatch::default();
    merged.overlay(patch);
    let config = merged.into_config().context("missing required configuration (CCLOAD_PASS)")?;

    let storage: Arc<dyn ccload_storage::Storage> = Arc::new(InMemoryStorage::new());
    let state = Arc::new(AppState::bootstrap(config, storage).await.context("bootstrap app state")?);

    let router = ccload_core::build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind).await.with_context(|| format!("bind {bind}"))?;
    tracing::info!(event = "listening", addr = %bind);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!(event = "shutdown_signal_received");
}
