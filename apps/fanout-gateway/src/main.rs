use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;

use fanout_gateway::cli::{self, Cli, Commands};
use fanout_gateway::config::GatewayConfig;
use fanout_gateway::state::GatewayState;
use fanout_gateway::telemetry::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = GatewayConfig::from_env();
    init_tracing(&cfg.log_filter);

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(cfg).await,
        Commands::Publish {
            channel,
            message,
            source,
        } => {
            if !cli::run_publish(&cfg, &channel, &message, source).await? {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

async fn serve(cfg: GatewayConfig) -> Result<()> {
    let state = GatewayState::from_config(&cfg).await?;
    info!(
        port = cfg.port,
        instance_id = %cfg.instance_id,
        redis = %cfg.redis_url.as_deref().unwrap_or("unset"),
        pubsub_enabled = cfg.pubsub_enabled,
        fanout = state.manager().supports_fanout(),
        send_timeout_ms = cfg.send_timeout.as_millis() as u64,
        "starting fanout-gateway"
    );

    let app = fanout_gateway::router(state.clone());
    let addr = format!("0.0.0.0:{}", cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("fanout-gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!("shutdown signal received; stopping channel subscriptions");
    state.manager().shutdown().await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
