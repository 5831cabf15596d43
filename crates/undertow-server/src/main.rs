use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use undertow_protocol::auth;
use undertow_server::{CaddyRoutes, ControlPlane, NoopRoutes, RouteRegistrar, ServerConfig};

/// Tunnel server - exposes ports for clients behind NAT
#[derive(Parser, Debug)]
#[command(name = "undertow-server")]
#[command(about = "Self-hosted reverse tunnel server")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "server.toml")]
    config: String,

    /// Port for client control connections (overrides config)
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("undertow_server=info".parse()?)
                .add_directive("undertow_common=info".parse()?),
        )
        .init();

    let args = Args::parse();
    tracing::info!("Starting tunnel server with config: {}", args.config);

    let config = ServerConfig::load_and_resolve(&args.config, args.port)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    let routes: Arc<dyn RouteRegistrar> = match &config.domain {
        Some(domain) => {
            tracing::info!(
                "Domain tunneling on *.{} via Caddy at {}",
                domain,
                config.caddy.admin_url
            );
            Arc::new(CaddyRoutes::new(
                &config.caddy.admin_url,
                &config.caddy.server_group,
            ))
        }
        None => Arc::new(NoopRoutes),
    };

    if config.token.is_empty() {
        tracing::warn!("No token configured, accepting every client");
    }

    let control_plane = ControlPlane::new(
        config.plane_settings(),
        auth::from_secret(&config.token),
        routes,
        config.domain.clone(),
    );

    let control_addr = SocketAddr::new(config.bind_addr, config.server_port);
    tracing::info!("Starting control plane on {}", control_addr);

    tokio::select! {
        result = control_plane.clone().run(control_addr) => {
            tracing::error!("Control plane stopped: {:?}", result);
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, cleaning up...");
        }
    }

    control_plane.shutdown().await;
    tracing::info!("Server shutdown complete");
    Ok(())
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
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
