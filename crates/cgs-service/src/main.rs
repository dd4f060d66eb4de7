//! cgsd - clean room governance service daemon.

use anyhow::Context;
use cgs_governance::GovernanceState;
use cgs_service::{create_router, AppState};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Clean room governance service
#[derive(Parser)]
#[command(name = "cgsd")]
#[command(about = "Governance ledger for confidential clean rooms", long_about = None)]
#[command(version)]
struct Cli {
    /// Listen address
    #[arg(short, long, env = "CGS_LISTEN_ADDR", default_value = "127.0.0.1:8290")]
    listen: String,

    /// Log level
    #[arg(long, env = "CGS_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, env = "CGS_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());
    if cli.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let state = AppState::new(GovernanceState::new());
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen))?;
    tracing::info!(
        listen = %cli.listen,
        version = env!("CARGO_PKG_VERSION"),
        "governance service listening"
    );
    axum::serve(listener, router).await.context("server exited")
}
