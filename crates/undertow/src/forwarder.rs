//! Per-forward state machine on the client.
//!
//! `Init -> AwaitResponse -> Running -> Terminated`. A rejected request
//! stops without a cancel (the port belongs to someone else); every other
//! way out of `Running` sends a best-effort ProxyCancel on a fresh
//! connection.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use undertow_common::{BoxedStream, Dialer, RateLimiter, TransportError};
use undertow_protocol::{
    read_message, write_message, CodecError, ControlMessage, MessageCodec, PacketType,
    ProxyCancel, ProxyRequest, ProxyType,
};

use crate::tunnel;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("Proxy on remote port {0} rejected by server")]
    Rejected(u16),

    #[error("Unexpected {0} from server")]
    Unexpected(PacketType),

    #[error("No heartbeat from server for {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("Control channel closed by server")]
    Closed,

    #[error("Local service {addr} unreachable: {source}")]
    LocalDial {
        addr: String,
        source: std::io::Error,
    },
}

/// One local service exposed on one remote port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub proxy_name: String,
    pub local_host: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub subdomain: String,
    pub proxy_type: ProxyType,
    /// Bytes per second on each leg, 0 = unlimited
    pub speed_limit: u64,
}

impl ForwardSpec {
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    /// Name used in logs
    pub fn label(&self) -> String {
        if self.proxy_name.is_empty() {
            format!(
                "{} [{}:{}]",
                self.proxy_type, self.local_port, self.remote_port
            )
        } else {
            format!("{} [{}]", self.proxy_type, self.proxy_name)
        }
    }

    /// A fresh limiter for one relay leg, if limited
    pub fn limiter(&self) -> Option<Arc<RateLimiter>> {
        (self.speed_limit > 0).then(|| Arc::new(RateLimiter::per_second(self.speed_limit)))
    }

    fn request(&self) -> ProxyRequest {
        ProxyRequest {
            remote_port: self.remote_port,
            proxy_name: self.proxy_name.clone(),
            subdomain: self.subdomain.clone(),
            proxy_type: self.proxy_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    Init,
    AwaitResponse,
    Running,
    Terminated,
}

pub struct ForwardUnit {
    spec: Arc<ForwardSpec>,
    dialer: Arc<dyn Dialer>,
    heartbeat_timeout: Duration,
    state: ForwardState,
    domain: Option<String>,
}

impl ForwardUnit {
    pub fn new(spec: ForwardSpec, dialer: Arc<dyn Dialer>, heartbeat_timeout: Duration) -> Self {
        Self {
            spec: Arc::new(spec),
            dialer,
            heartbeat_timeout,
            state: ForwardState::Init,
            domain: None,
        }
    }

    pub fn state(&self) -> ForwardState {
        self.state
    }

    /// Domain assigned by the server, once running with domain tunneling
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    fn transition(&mut self, next: ForwardState) {
        tracing::debug!("{}: {:?} -> {:?}", self.spec.label(), self.state, next);
        self.state = next;
    }

    /// Run until the server rejects the request, the control channel fails
    /// or `shutdown` fires. Shutdown is a clean exit.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), ForwardError> {
        let control = match self.establish(&shutdown).await {
            Ok(Some(control)) => control,
            Ok(None) => {
                self.transition(ForwardState::Terminated);
                return Ok(());
            }
            Err(e) => {
                self.transition(ForwardState::Terminated);
                return Err(e);
            }
        };

        self.transition(ForwardState::Running);
        match &self.domain {
            Some(domain) => tracing::info!(
                "{}: proxy created, {} -> {} (domain {})",
                self.spec.label(),
                self.spec.remote_port,
                self.spec.local_addr(),
                domain
            ),
            None => tracing::info!(
                "{}: proxy created, {} -> {}",
                self.spec.label(),
                self.spec.remote_port,
                self.spec.local_addr()
            ),
        }

        let result = self.serve(control, &shutdown).await;
        self.transition(ForwardState::Terminated);
        if let Err(e) = &result {
            tracing::error!("{}: {}", self.spec.label(), e);
        }
        self.send_cancel().await;
        result
    }

    /// Init + AwaitResponse. `None` when shut down before the response.
    async fn establish(
        &mut self,
        shutdown: &CancellationToken,
    ) -> Result<Option<BoxedStream>, ForwardError> {
        let mut control = self.dialer.open().await?;
        write_message(&mut control, &self.spec.request().into()).await?;
        self.transition(ForwardState::AwaitResponse);

        let msg = tokio::select! {
            _ = shutdown.cancelled() => return Ok(None),
            msg = read_message(&mut control) => msg?,
        };

        match msg {
            ControlMessage::ProxyResponse(resp) if resp.is_success() => {
                self.domain = (!resp.domain.is_empty()).then_some(resp.domain);
                Ok(Some(control))
            }
            ControlMessage::ProxyResponse(resp) => {
                tracing::error!(
                    "{}: proxy create failed, status: {}, remote port: {}",
                    self.spec.label(),
                    resp.status,
                    self.spec.remote_port
                );
                Err(ForwardError::Rejected(self.spec.remote_port))
            }
            other => Err(ForwardError::Unexpected(other.packet_type())),
        }
    }

    /// Running: heartbeats and exchanges until something ends the unit
    async fn serve(
        &self,
        control: BoxedStream,
        shutdown: &CancellationToken,
    ) -> Result<(), ForwardError> {
        let mut frames = FramedRead::new(control, MessageCodec::new());
        let deadline = tokio::time::sleep(self.heartbeat_timeout);
        tokio::pin!(deadline);

        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = &mut deadline => {
                    return Err(ForwardError::HeartbeatTimeout(self.heartbeat_timeout));
                }
                frame = frames.next() => match frame {
                    Some(frame) => frame?,
                    None => return Err(ForwardError::Closed),
                },
            };

            deadline
                .as_mut()
                .reset(tokio::time::Instant::now() + self.heartbeat_timeout);

            match msg {
                ControlMessage::Heartbeat(_) => {
                    tracing::trace!("{}: heartbeat", self.spec.label());
                }
                ControlMessage::Exchange(exchange) => {
                    tracing::debug!(
                        "{}: new {} connection {}",
                        self.spec.label(),
                        exchange.proxy_type,
                        exchange.conn_id
                    );
                    let dialer = self.dialer.clone();
                    let spec = self.spec.clone();
                    tokio::spawn(async move {
                        let conn_id = exchange.conn_id.clone();
                        match tunnel::serve_exchange(dialer, spec.clone(), exchange).await {
                            Ok(traffic) => tracing::debug!(
                                "{}: connection {} done, {} bytes in, {} bytes out",
                                spec.label(),
                                conn_id,
                                traffic.a_to_b,
                                traffic.b_to_a
                            ),
                            Err(e) => tracing::warn!(
                                "{}: connection {} abandoned: {}",
                                spec.label(),
                                conn_id,
                                e
                            ),
                        }
                    });
                }
                other => return Err(ForwardError::Unexpected(other.packet_type())),
            }
        }
    }

    /// Terminated: tell the server to drop the proxy, once, best effort
    async fn send_cancel(&self) {
        let cancel = ProxyCancel {
            proxy_name: self.spec.proxy_name.clone(),
            remote_port: self.spec.remote_port,
        };

        let result = async {
            let mut stream = self.dialer.open().await?;
            write_message(&mut stream, &cancel.into()).await?;
            Ok::<_, ForwardError>(())
        }
        .await;

        match result {
            Ok(()) => tracing::info!(
                "{}: cancelled remote port {}",
                self.spec.label(),
                self.spec.remote_port
            ),
            Err(e) => tracing::warn!(
                "{}: failed to cancel remote port {}: {}",
                self.spec.label(),
                self.spec.remote_port,
                e
            ),
        }
    }
}
