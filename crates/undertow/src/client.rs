use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use undertow_common::{Dialer, MuxDialer, PlainDialer};

use crate::config::ResolvedClientConfig;
use crate::forwarder::{ForwardError, ForwardSpec, ForwardUnit};

/// Runs every configured forward against one server
pub struct Client {
    config: ResolvedClientConfig,
    dialer: Arc<dyn Dialer>,
}

impl Client {
    pub fn new(config: ResolvedClientConfig) -> Self {
        let dialer: Arc<dyn Dialer> = if config.multiplex {
            Arc::new(MuxDialer::new(&config.server_addr, &config.token))
        } else {
            Arc::new(PlainDialer::new(&config.server_addr, &config.token))
        };
        Self { config, dialer }
    }

    /// Use a custom dialer (tests, alternative transports)
    pub fn with_dialer(config: ResolvedClientConfig, dialer: Arc<dyn Dialer>) -> Self {
        Self { config, dialer }
    }

    pub fn forwards(&self) -> &[ForwardSpec] {
        &self.config.forwards
    }

    /// Run all forwards until each has terminated. Cancelling `shutdown`
    /// terminates them, and each cancels its remote port on the way out.
    ///
    /// Returns the failures of forwards that stopped on their own.
    pub async fn run(&self, shutdown: CancellationToken) -> Vec<(ForwardSpec, ForwardError)> {
        tracing::info!(
            "Connecting to {} with {} forward(s) (multiplex: {})",
            self.config.server_addr,
            self.config.forwards.len(),
            self.config.multiplex
        );

        let mut units = JoinSet::new();
        for spec in &self.config.forwards {
            let mut unit = ForwardUnit::new(
                spec.clone(),
                self.dialer.clone(),
                self.config.heartbeat_timeout,
            );
            let spec = spec.clone();
            let shutdown = shutdown.child_token();
            units.spawn(async move {
                let result = unit.run(shutdown).await;
                (spec, result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = units.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((spec, Err(e))) => failures.push((spec, e)),
                Err(e) => tracing::error!("Forward task panicked: {}", e),
            }
        }
        failures
    }
}
