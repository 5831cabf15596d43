//! Server configuration with environment variable priority
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Command line (port only)
//! 2. Environment variables (UNDERTOW_*)
//! 3. Config file (server.toml)
//! 4. Default values

use std::env;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::control_plane::PlaneSettings;

/// Environment variable prefix
const ENV_PREFIX: &str = "UNDERTOW";

const DEFAULT_SERVER_PORT: u16 = 8910;
const DEFAULT_CADDY_ADMIN: &str = "http://127.0.0.1:2019";
const DEFAULT_CADDY_GROUP: &str = "undertow";

/// Server configuration (parsed from TOML, can be overridden by env)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Port for client control connections
    pub server_port: Option<u16>,

    /// Address public listeners bind to
    pub bind_addr: Option<String>,

    /// Give every proxy a vanity domain under `domain`
    pub domain_tunnel: Option<bool>,

    /// Base domain for domain tunneling (e.g., "tunnel.example.com")
    pub domain: Option<String>,

    /// Shared secret; empty disables authentication
    pub token: Option<String>,

    /// Expect multiplexed (yamux) sessions from clients
    pub multiplex: Option<bool>,

    /// Caddy admin API used for domain routes
    pub caddy: Option<CaddyConfig>,

    /// Seconds an unclaimed public connection waits for the client
    pub pending_ttl: Option<u64>,

    /// Seconds between heartbeats on every control channel
    pub heartbeat_interval: Option<u64>,
}

/// Caddy admin API configuration
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct CaddyConfig {
    pub admin_url: Option<String>,

    /// Name of the Caddy HTTP server routes are added to
    pub server_group: Option<String>,
}

/// Resolved server configuration
#[derive(Debug, Clone)]
pub struct ResolvedServerConfig {
    pub server_port: u16,
    pub bind_addr: IpAddr,
    /// Base domain, set only when domain tunneling is on
    pub domain: Option<String>,
    pub token: String,
    pub multiplex: bool,
    pub caddy: ResolvedCaddyConfig,
    pub pending_ttl: Duration,
    pub heartbeat_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct ResolvedCaddyConfig {
    pub admin_url: String,
    pub server_group: String,
}

impl ResolvedServerConfig {
    pub fn plane_settings(&self) -> PlaneSettings {
        PlaneSettings {
            bind_addr: self.bind_addr,
            multiplex: self.multiplex,
            heartbeat_interval: self.heartbeat_interval,
            pending_ttl: self.pending_ttl,
            ..PlaneSettings::default()
        }
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

/// Get environment variable as u16
fn get_env_u16(name: &str) -> Option<u16> {
    get_env(name).and_then(|v| v.parse().ok())
}

fn get_env_u64(name: &str) -> Option<u64> {
    get_env(name).and_then(|v| v.parse().ok())
}

fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).and_then(|v| parse_bool(&v))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file (optional)
    pub fn load(path: &str) -> Self {
        if Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse {}: {}", path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read {}: {}", path, e);
                }
            }
        }
        Self::default()
    }

    /// Resolve configuration from the command line, environment and config file
    pub fn resolve(self, port_arg: Option<u16>) -> anyhow::Result<ResolvedServerConfig> {
        // Server port: CLI > ENV > config > default 8910
        let server_port = port_arg
            .or_else(|| get_env_u16("SERVER_PORT"))
            .or(self.server_port)
            .unwrap_or(DEFAULT_SERVER_PORT);

        // Bind address: ENV > config > 0.0.0.0
        let bind_addr = get_env("BIND_ADDR")
            .or(self.bind_addr)
            .map(|a| {
                a.parse::<IpAddr>()
                    .with_context(|| format!("Invalid bind address: {}", a))
            })
            .transpose()?
            .unwrap_or(IpAddr::from([0, 0, 0, 0]));

        // Domain tunneling: ENV > config > off
        let domain_tunnel = get_env_bool("DOMAIN_TUNNEL")
            .or(self.domain_tunnel)
            .unwrap_or(false);
        let domain = if domain_tunnel {
            let domain = get_env("DOMAIN").or(self.domain).ok_or_else(|| {
                anyhow::anyhow!(
                    "Domain required for domain tunneling. Set UNDERTOW_DOMAIN or domain in config"
                )
            })?;
            Some(domain.trim_matches('.').to_string())
        } else {
            None
        };

        let token = get_env("TOKEN").or(self.token).unwrap_or_default();
        let multiplex = get_env_bool("MULTIPLEX")
            .or(self.multiplex)
            .unwrap_or(false);

        let caddy_config = self.caddy.unwrap_or_default();
        let caddy = ResolvedCaddyConfig {
            admin_url: get_env("CADDY_ADMIN_URL")
                .or(caddy_config.admin_url)
                .unwrap_or_else(|| DEFAULT_CADDY_ADMIN.to_string()),
            server_group: get_env("CADDY_SERVER_GROUP")
                .or(caddy_config.server_group)
                .unwrap_or_else(|| DEFAULT_CADDY_GROUP.to_string()),
        };

        let pending_ttl = get_env_u64("PENDING_TTL")
            .or(self.pending_ttl)
            .unwrap_or(10);
        let heartbeat_interval = get_env_u64("HEARTBEAT_INTERVAL")
            .or(self.heartbeat_interval)
            .unwrap_or(1);
        if pending_ttl == 0 || heartbeat_interval == 0 {
            anyhow::bail!("pending_ttl and heartbeat_interval must be at least 1 second");
        }

        Ok(ResolvedServerConfig {
            server_port,
            bind_addr,
            domain,
            token,
            multiplex,
            caddy,
            pending_ttl: Duration::from_secs(pending_ttl),
            heartbeat_interval: Duration::from_secs(heartbeat_interval),
        })
    }

    /// Load config file and resolve with environment variable overrides
    pub fn load_and_resolve(
        path: &str,
        port_arg: Option<u16>,
    ) -> anyhow::Result<ResolvedServerConfig> {
        let config = Self::load(path);
        config.resolve(port_arg)
    }
}
