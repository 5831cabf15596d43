//! Per-proxy state machine on the server.
//!
//! ```text
//! Requested --(port, listener, domain ok)--> Listening --(cancel / channel failure)--> Closed
//!     \------------------(any failure)-----------------------------------------------/
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use undertow_protocol::{
    write_message, ControlMessage, Exchange, Heartbeat, MessageCodec, ProxyRequest, ProxyResponse,
    ProxyType,
};

use crate::accept::accept_with_backoff;
use crate::pending::{new_rendezvous_id, PendingConnections};
use crate::registry::{DomainBinding, ProxyEntry, ProxyRegistry, ProxyStats};

/// A public connection waiting for its data connection
pub enum PublicConn {
    Tcp {
        stream: TcpStream,
        stats: Arc<ProxyStats>,
    },
    Udp {
        socket: Arc<UdpSocket>,
        /// The proxy's shutdown token; the UDP relay lives as long as the proxy
        shutdown: CancellationToken,
        stats: Arc<ProxyStats>,
    },
}

impl PublicConn {
    pub fn proxy_type(&self) -> ProxyType {
        match self {
            Self::Tcp { .. } => ProxyType::Tcp,
            Self::Udp { .. } => ProxyType::Udp,
        }
    }
}

/// Everything a proxy unit needs from the server
pub struct ProxyContext {
    pub registry: Arc<ProxyRegistry>,
    pub pending: Arc<PendingConnections<PublicConn>>,
    pub bind_addr: IpAddr,
    pub heartbeat_interval: Duration,
    pub shutdown: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Requested,
    Listening,
    Closed,
}

/// Why a proxy unit reached `Closed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Never got past `Requested`
    Rejected(String),
    /// ProxyCancel, admin close or server shutdown
    Cancelled,
    /// Control channel closed or unreadable
    ControlClosed,
    /// Writing a response, Exchange or Heartbeat failed
    WriteFailed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(reason) => write!(f, "rejected: {}", reason),
            Self::Cancelled => f.write_str("cancelled"),
            Self::ControlClosed => f.write_str("control channel closed"),
            Self::WriteFailed => f.write_str("control channel write failed"),
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    Udp(Arc<UdpSocket>),
}

/// One ProxyRequest, from reservation to teardown
pub struct ProxyUnit {
    ctx: Arc<ProxyContext>,
    request: ProxyRequest,
    peer: SocketAddr,
    state: ProxyState,
}

impl ProxyUnit {
    pub fn new(ctx: Arc<ProxyContext>, request: ProxyRequest, peer: SocketAddr) -> Self {
        Self {
            ctx,
            request,
            peer,
            state: ProxyState::Requested,
        }
    }

    pub fn state(&self) -> ProxyState {
        self.state
    }

    fn transition(&mut self, next: ProxyState) {
        tracing::debug!(
            "Proxy on port {}: {:?} -> {:?}",
            self.request.remote_port,
            self.state,
            next
        );
        self.state = next;
    }

    /// Drive the unit over its control stream until it closes
    pub async fn run<S>(&mut self, mut stream: S) -> CloseReason
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let port = self.request.remote_port;
        tracing::info!(
            "Proxy request from {}: name={:?}, port={}, type={}, subdomain={:?}",
            self.peer,
            self.request.proxy_name,
            port,
            self.request.proxy_type,
            self.request.subdomain
        );

        let (listener, domain) = match self.open().await {
            Ok(opened) => opened,
            Err(reason) => {
                tracing::warn!("Proxy request for port {} failed: {}", port, reason);
                if let Err(e) =
                    write_message(&mut stream, &ProxyResponse::failed().into()).await
                {
                    tracing::debug!("Failed to send failure response: {}", e);
                }
                self.transition(ProxyState::Closed);
                return CloseReason::Rejected(reason);
            }
        };

        let shutdown = self.ctx.shutdown.child_token();
        let stats = ProxyStats::new();
        let domain_name = domain.as_ref().map(|b| b.domain.clone());
        let proxy_id = self.ctx.registry.add(ProxyEntry {
            port,
            proxy_type: self.request.proxy_type,
            proxy_name: self.request.proxy_name.clone(),
            peer: self.peer,
            domain,
            shutdown: shutdown.clone(),
            stats: stats.clone(),
            created_at: SystemTime::now(),
        });

        let response = ProxyResponse::success(domain_name.clone());
        if let Err(e) = write_message(&mut stream, &response.into()).await {
            tracing::warn!("Failed to send proxy response on port {}: {}", port, e);
            self.ctx.registry.remove_owned(port, proxy_id).await;
            drop(listener);
            self.ctx.registry.release(port);
            self.transition(ProxyState::Closed);
            return CloseReason::WriteFailed;
        }

        self.transition(ProxyState::Listening);
        tracing::info!(
            "Proxy established: {} port {} for {}{}",
            self.request.proxy_type,
            port,
            self.peer,
            domain_name
                .map(|d| format!(" (domain {})", d))
                .unwrap_or_default()
        );

        // The listener is gone once listen returns
        let reason = self.listen(stream, listener, shutdown, stats).await;

        self.ctx.registry.remove_owned(port, proxy_id).await;
        self.ctx.registry.release(port);
        self.transition(ProxyState::Closed);
        tracing::info!("Proxy on port {} closed: {}", port, reason);
        reason
    }

    /// Requested: reserve the port, bind it, bind the domain
    async fn open(&self) -> Result<(Listener, Option<DomainBinding>), String> {
        let port = self.request.remote_port;
        if !self.ctx.registry.reserve(port) {
            return Err(format!("port {} is unavailable", port));
        }

        let addr = SocketAddr::new(self.ctx.bind_addr, port);
        let listener = match self.request.proxy_type {
            ProxyType::Tcp => TcpListener::bind(addr).await.map(Listener::Tcp),
            ProxyType::Udp => UdpSocket::bind(addr)
                .await
                .map(|s| Listener::Udp(Arc::new(s))),
        };
        let listener = match listener {
            Ok(l) => l,
            Err(e) => {
                self.ctx.registry.release(port);
                return Err(format!("bind {} failed: {}", addr, e));
            }
        };

        match self
            .ctx
            .registry
            .bind_domain(&self.request.subdomain, port)
            .await
        {
            Ok(domain) => Ok((listener, domain)),
            Err(e) => {
                self.ctx.registry.release(port);
                Err(e.to_string())
            }
        }
    }

    /// Listening: serve the listener and the control channel
    async fn listen<S>(
        &self,
        stream: S,
        listener: Listener,
        shutdown: CancellationToken,
        stats: Arc<ProxyStats>,
    ) -> CloseReason
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let port = self.request.remote_port;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut control = FramedRead::new(read_half, MessageCodec::new());

        let (tx, rx) = mpsc::channel::<ControlMessage>(64);
        let mut writer = tokio::spawn(write_loop(write_half, rx));

        let tcp = match listener {
            Listener::Tcp(listener) => Some(listener),
            Listener::Udp(socket) => {
                let id = new_rendezvous_id();
                stats.connection_opened();
                self.ctx.pending.put(
                    id.clone(),
                    PublicConn::Udp {
                        socket,
                        shutdown: shutdown.clone(),
                        stats: stats.clone(),
                    },
                );
                let exchange = Exchange {
                    conn_id: id,
                    proxy_type: ProxyType::Udp,
                };
                if tx.send(exchange.into()).await.is_err() {
                    writer.abort();
                    return CloseReason::WriteFailed;
                }
                None
            }
        };

        let mut heartbeat = tokio::time::interval(self.ctx.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break CloseReason::Cancelled,
                _ = &mut writer => break CloseReason::WriteFailed,
                _ = heartbeat.tick() => {
                    if tx.send(Heartbeat {}.into()).await.is_err() {
                        break CloseReason::WriteFailed;
                    }
                }
                (conn, from) = accept(tcp.as_ref(), port) => {
                    let id = new_rendezvous_id();
                    tracing::debug!("Public connection {} from {} on port {}", id, from, port);
                    let _ = conn.set_nodelay(true);
                    stats.connection_opened();
                    self.ctx.pending.put(
                        id.clone(),
                        PublicConn::Tcp { stream: conn, stats: stats.clone() },
                    );
                    let exchange = Exchange { conn_id: id, proxy_type: ProxyType::Tcp };
                    if tx.send(exchange.into()).await.is_err() {
                        break CloseReason::WriteFailed;
                    }
                }
                frame = control.next() => match frame {
                    Some(Ok(ControlMessage::ProxyCancel(cancel))) => {
                        if cancel.remote_port == port {
                            tracing::info!("Proxy on port {} cancelled by client", port);
                            break CloseReason::Cancelled;
                        }
                        tracing::warn!(
                            "Ignoring cancel for port {} on the control channel of port {}",
                            cancel.remote_port,
                            port
                        );
                    }
                    Some(Ok(other)) => {
                        tracing::warn!(
                            "Unexpected {} on control channel of port {}",
                            other.packet_type(),
                            port
                        );
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Control channel error on port {}: {}", port, e);
                        break CloseReason::ControlClosed;
                    }
                    None => break CloseReason::ControlClosed,
                },
            }
        };

        drop(tx);
        writer.abort();
        reason
    }
}

/// Accept on the TCP listener; never resolves for UDP proxies
async fn accept(listener: Option<&TcpListener>, port: u16) -> (TcpStream, SocketAddr) {
    match listener {
        Some(listener) => accept_with_backoff(listener, format!("port {}", port)).await,
        None => std::future::pending().await,
    }
}

async fn write_loop<S>(mut write_half: WriteHalf<S>, mut rx: mpsc::Receiver<ControlMessage>)
where
    S: AsyncWrite,
{
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write_message(&mut write_half, &msg).await {
            tracing::debug!("Failed to write {}: {}", msg.packet_type(), e);
            break;
        }
    }
}
