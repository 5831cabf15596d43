//! Client configuration with environment variable priority
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Command line (server address, one `LOCAL:REMOTE` forward)
//! 2. Environment variables (UNDERTOW_*)
//! 3. Config file (client.toml)
//! 4. Default values

use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

use undertow_common::parse_speed_limit;
use undertow_protocol::ProxyType;

use crate::forwarder::ForwardSpec;

/// Environment variable prefix
const ENV_PREFIX: &str = "UNDERTOW";

const DEFAULT_SERVER_ADDR: &str = "localhost:8910";
const DEFAULT_LOCAL_HOST: &str = "127.0.0.1";
const DEFAULT_HEARTBEAT_TIMEOUT: u64 = 15;

/// Client configuration (parsed from TOML, can be overridden by env)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ClientConfig {
    /// Server control address (e.g., "tunnel.example.com:8910")
    pub server_addr: Option<String>,

    /// Shared secret; must match the server
    pub token: Option<String>,

    /// Carry every logical connection over one yamux session
    pub multiplex: Option<bool>,

    /// Seconds without a server heartbeat before a forward gives up
    pub heartbeat_timeout: Option<u64>,

    #[serde(rename = "forward")]
    pub forwards: Vec<ForwardConfig>,
}

/// One `[[forward]]` table
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ForwardConfig {
    pub proxy_name: String,
    pub local_host: Option<String>,
    pub local_port: u16,
    pub remote_port: u16,
    /// Requested subdomain when the server does domain tunneling
    pub subdomain: String,
    pub proxy_type: Option<ProxyType>,
    /// e.g. "512kb", "2mb", "1048576"
    pub speed_limit: Option<String>,
}

/// Resolved client configuration
#[derive(Debug, Clone)]
pub struct ResolvedClientConfig {
    pub server_addr: String,
    pub token: String,
    pub multiplex: bool,
    pub heartbeat_timeout: Duration,
    pub forwards: Vec<ForwardSpec>,
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

fn get_env_u64(name: &str) -> Option<u64> {
    get_env(name).and_then(|v| v.parse().ok())
}

fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    })
}

/// Parse a `LOCAL:REMOTE` port pair
pub fn parse_forward_arg(arg: &str) -> anyhow::Result<(u16, u16)> {
    let (local, remote) = arg
        .split_once(':')
        .with_context(|| format!("Expected LOCAL:REMOTE, got '{}'", arg))?;
    let local = local
        .trim()
        .parse::<u16>()
        .with_context(|| format!("Invalid local port '{}'", local))?;
    let remote = remote
        .trim()
        .parse::<u16>()
        .with_context(|| format!("Invalid remote port '{}'", remote))?;
    if local == 0 || remote == 0 {
        bail!("Ports must be non-zero: '{}'", arg);
    }
    Ok((local, remote))
}

impl ForwardConfig {
    fn resolve(self) -> anyhow::Result<ForwardSpec> {
        if self.local_port == 0 || self.remote_port == 0 {
            bail!(
                "Forward '{}' needs both local_port and remote_port",
                self.proxy_name
            );
        }
        let speed_limit = match self.speed_limit.as_deref() {
            Some(limit) => parse_speed_limit(limit)
                .with_context(|| format!("Forward '{}': bad speed_limit", self.proxy_name))?,
            None => 0,
        };
        Ok(ForwardSpec {
            proxy_name: self.proxy_name,
            local_host: self
                .local_host
                .unwrap_or_else(|| DEFAULT_LOCAL_HOST.to_string()),
            local_port: self.local_port,
            remote_port: self.remote_port,
            subdomain: self.subdomain,
            proxy_type: self.proxy_type.unwrap_or(ProxyType::Tcp),
            speed_limit,
        })
    }
}

impl ClientConfig {
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

    /// Resolve configuration from the command line, environment and config file.
    ///
    /// A command line forward is added to the configured ones.
    pub fn resolve(
        self,
        server_arg: Option<String>,
        forward_arg: Option<&str>,
    ) -> anyhow::Result<ResolvedClientConfig> {
        // Server address: CLI > ENV > config > localhost:8910
        let server_addr = server_arg
            .or_else(|| get_env("SERVER_ADDR"))
            .or(self.server_addr)
            .unwrap_or_else(|| DEFAULT_SERVER_ADDR.to_string());

        let token = get_env("TOKEN").or(self.token).unwrap_or_default();
        let multiplex = get_env_bool("MULTIPLEX")
            .or(self.multiplex)
            .unwrap_or(false);

        let heartbeat_timeout = get_env_u64("HEARTBEAT_TIMEOUT")
            .or(self.heartbeat_timeout)
            .unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT);
        if heartbeat_timeout == 0 {
            bail!("heartbeat_timeout must be at least 1 second");
        }

        let mut forwards = self
            .forwards
            .into_iter()
            .map(ForwardConfig::resolve)
            .collect::<anyhow::Result<Vec<_>>>()?;

        if let Some(arg) = forward_arg {
            let (local_port, remote_port) = parse_forward_arg(arg)?;
            forwards.push(ForwardSpec {
                proxy_name: String::new(),
                local_host: DEFAULT_LOCAL_HOST.to_string(),
                local_port,
                remote_port,
                subdomain: String::new(),
                proxy_type: ProxyType::Tcp,
                speed_limit: 0,
            });
        }

        if forwards.is_empty() {
            bail!("Nothing to forward. Pass LOCAL:REMOTE or add a [[forward]] to the config");
        }

        let mut ports: Vec<u16> = forwards.iter().map(|f| f.remote_port).collect();
        ports.sort_unstable();
        if let Some(w) = ports.windows(2).find(|w| w[0] == w[1]) {
            bail!("Remote port {} is forwarded twice", w[0]);
        }

        Ok(ResolvedClientConfig {
            server_addr,
            token,
            multiplex,
            heartbeat_timeout: Duration::from_secs(heartbeat_timeout),
            forwards,
        })
    }

    /// Load config file and resolve with environment variable overrides
    pub fn load_and_resolve(
        path: &str,
        server_arg: Option<String>,
        forward_arg: Option<&str>,
    ) -> anyhow::Result<ResolvedClientConfig> {
        let config = Self::load(path);
        config.resolve(server_arg, forward_arg)
    }
}
