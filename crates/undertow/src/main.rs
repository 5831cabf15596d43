use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use undertow::{Client, ClientConfig};

/// Undertow - expose local services through a tunnel server
#[derive(Parser, Debug)]
#[command(name = "undertow")]
#[command(about = "Expose local ports through an undertow server")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "client.toml")]
    config: String,

    /// Tunnel server address (host:port)
    server: Option<String>,

    /// Port pair to forward, LOCAL:REMOTE (e.g., 3000:9000)
    forward: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("undertow=info".parse()?)
                .add_directive("undertow_common=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let config = ClientConfig::load_and_resolve(&cli.config, cli.server, cli.forward.as_deref())
        .with_context(|| format!("Failed to load config from {}", cli.config))?;

    let client = Client::new(config);
    let shutdown = CancellationToken::new();

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, cancelling forwards...");
            shutdown.cancel();
        });
    }

    let failures = client.run(shutdown).await;
    if failures.is_empty() {
        tracing::info!("Client shutdown complete");
        return Ok(());
    }

    for (spec, e) in &failures {
        tracing::error!("{} stopped: {}", spec.label(), e);
    }
    anyhow::bail!("{} forward(s) failed", failures.len())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::debug!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::debug!("Received SIGTERM");
        }
    }
}
