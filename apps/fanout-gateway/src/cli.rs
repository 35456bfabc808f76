use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::GatewayConfig;
use crate::state::GatewayState;

#[derive(Parser, Debug)]
#[command(name = "fanout-gateway")]
#[command(about = "WebSocket gateway with cross-instance channel fan-out")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the gateway server (default)
    Serve,

    /// Publish one message to a channel through the configured bus
    Publish {
        /// Logical channel name, e.g. "guide" or "pillar:content"
        #[arg(short, long)]
        channel: String,

        /// Message body as JSON
        #[arg(short, long)]
        message: String,

        /// Connection id to stamp as the sender
        #[arg(long)]
        source: Option<String>,
    },
}

/// Publish once and print the outcome as JSON. Errors only on bad input or
/// backend setup; a failed publish is reported in the printed outcome.
pub async fn run_publish(
    cfg: &GatewayConfig,
    channel: &str,
    message: &str,
    source: Option<String>,
) -> Result<bool> {
    let message: serde_json::Value =
        serde_json::from_str(message).context("--message must be valid JSON")?;
    let state = GatewayState::from_config(cfg).await?;
    let outcome = state
        .manager()
        .publish_to_channel(channel, message, source)
        .await;
    println!("{}", serde_json::to_string(&outcome)?);
    Ok(outcome.is_success())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn parses_publish_command() {
        let cli = Cli::parse_from([
            "fanout-gateway",
            "publish",
            "--channel",
            "guide",
            "--message",
            r#"{"text":"hi"}"#,
        ]);
        match cli.command {
            Some(Commands::Publish {
                channel,
                message,
                source,
            }) => {
                assert_eq!(channel, "guide");
                assert_eq!(message, r#"{"text":"hi"}"#);
                assert!(source.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn serve_is_the_default() {
        let cli = Cli::parse_from(["fanout-gateway"]);
        assert!(cli.command.is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn publish_rejects_invalid_json() {
        let cfg = GatewayConfig::default();
        assert!(run_publish(&cfg, "guide", "{nope", None).await.is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn publish_in_process_succeeds_without_listeners() {
        let cfg = GatewayConfig::default();
        assert!(run_publish(&cfg, "guide", r#"{"text":"hi"}"#, None)
            .await
            .unwrap());
    }
}
