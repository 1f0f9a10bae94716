//! relaygate CLI
//!
//! Run the gateway, or tunnel stdin/stdout to a backend through one.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relaygate_client::{BufferPool, ReconnectConfig, Tunnel, TunnelOptions};
use relaygate_server::{GatewayConfig, GatewayServer, MetricsRegistry};
use std::path::PathBuf;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

/// relaygate - HTTP gateway with resumable TCP tunnels
#[derive(Parser, Debug)]
#[command(name = "relaygate")]
#[command(about = "relaygate - HTTP gateway with resumable TCP tunnels")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway
    Serve {
        /// Gateway configuration (YAML)
        #[arg(long, short, env = "RELAYGATE_CONFIG")]
        config: PathBuf,
    },

    /// Tunnel stdin/stdout to a backend through a gateway
    #[command(long_about = r#"
Open a tunnel through a gateway to host:port and pipe stdin/stdout through
it. The tunnel survives dropped connections: it reconnects and resumes
without losing or duplicating bytes.

EXAMPLES:
  # SSH through a gateway
  ssh -o ProxyCommand="relaygate connect --relay https://gw.example \
    --host %h --port %p --token $TOKEN" db.internal

ENVIRONMENT VARIABLES:
  RELAYGATE_RELAY   Gateway URL
  RELAYGATE_TOKEN   Bearer token for private mappings
    "#)]
    Connect {
        /// Gateway URL (e.g., https://gw.example)
        #[arg(long, env = "RELAYGATE_RELAY")]
        relay: Url,

        /// Backend host as seen from the gateway
        #[arg(long)]
        host: String,

        /// Backend port
        #[arg(long)]
        port: u16,

        /// Bearer token presented on every connection
        #[arg(long, env = "RELAYGATE_TOKEN")]
        token: Option<String>,

        /// Host header to route on, if it differs from the gateway URL
        #[arg(long)]
        host_header: Option<String>,

        /// Maximum consecutive reconnection attempts (0 = infinite)
        #[arg(long, default_value = "0")]
        max_reconnect_attempts: usize,
    },
}

/// Setup logging with the specified log level
///
/// Logs go to stderr so `connect` keeps stdout for tunnel data.
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

async fn serve(config: PathBuf) -> Result<()> {
    let config = GatewayConfig::from_file(&config)
        .with_context(|| format!("Failed to load {}", config.display()))?;
    let registry = MetricsRegistry::new().context("Failed to create metrics registry")?;
    let gateway = GatewayServer::new(config, None, registry)
        .context("Invalid gateway configuration")?
        .bind()
        .await
        .context("Failed to bind listeners")?;

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    gateway.shutdown().await;
    Ok(())
}

async fn connect(
    relay: Url,
    host: String,
    port: u16,
    options: TunnelOptions,
) -> Result<()> {
    let tunnel = Tunnel::open(BufferPool::new(8192, 512), &host, port, options)
        .context("Failed to create tunnel")?;
    info!("Tunnel to {}:{} via {}", host, port, relay);

    let mut states = tunnel.subscribe();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            debug!("Tunnel state: {}", *states.borrow_and_update());
        }
    });

    let supervisor = {
        let tunnel = tunnel.clone();
        tokio::spawn(async move { tunnel.keep_connected(&relay).await })
    };
    let sender = {
        let tunnel = tunnel.clone();
        tokio::spawn(async move { tunnel.send(tokio::io::stdin()).await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            tunnel.close();
        }
        result = tunnel.receive(tokio::io::stdout()) => {
            if let Err(e) = result {
                error!("Tunnel receive failed: {}", e);
            }
        }
    }

    match supervisor.await? {
        Ok(()) => {
            info!("Tunnel closed: {:?}", tunnel.stats());
            sender.abort();
            Ok(())
        }
        Err(e) => Err(e).context("Tunnel failed"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Serve { config } => serve(config).await,
        Commands::Connect {
            relay,
            host,
            port,
            token,
            host_header,
            max_reconnect_attempts,
        } => {
            let mut options = TunnelOptions::default().with_reconnect(ReconnectConfig {
                max_attempts: (max_reconnect_attempts > 0).then_some(max_reconnect_attempts),
                ..ReconnectConfig::default()
            });
            if let Some(token) = token {
                options = options.with_bearer_token(&token);
            }
            if let Some(host_header) = host_header {
                options = options.with_host_header(host_header);
            }

            connect(relay, host, port, options).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect() {
        let cli = Cli::parse_from([
            "relaygate",
            "connect",
            "--relay",
            "https://gw.example",
            "--host",
            "db.internal",
            "--port",
            "5432",
            "--token",
            "t",
        ]);
        match cli.command {
            Commands::Connect {
                relay, host, port, token, ..
            } => {
                assert_eq!(relay.as_str(), "https://gw.example/");
                assert_eq!(host, "db.internal");
                assert_eq!(port, 5432);
                assert_eq!(token.as_deref(), Some("t"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_serve() {
        let cli = Cli::parse_from(["relaygate", "-v", "serve", "--config", "gateway.yaml"]);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Serve { .. }));
    }
}
