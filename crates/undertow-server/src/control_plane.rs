use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use undertow_common::{relay_metered, relay_udp_server_side};
use undertow_protocol::{
    read_message, Authenticator, CodecError, ControlMessage, Exchange, PROTOCOL_VERSION,
};

use crate::accept::accept_with_backoff;
use crate::pending::PendingConnections;
use crate::proxy::{ProxyContext, ProxyUnit, PublicConn};
use crate::registry::{ProxyRegistry, ProxySnapshot};
use crate::routes::RouteRegistrar;

/// Tunables of the control plane
#[derive(Debug, Clone)]
pub struct PlaneSettings {
    /// Address public listeners bind to
    pub bind_addr: IpAddr,
    /// Expect a yamux session after Login instead of a single control message
    pub multiplex: bool,
    pub heartbeat_interval: Duration,
    pub pending_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for PlaneSettings {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            multiplex: false,
            heartbeat_interval: Duration::from_secs(1),
            pending_ttl: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Control plane server that accepts tunnel client connections
pub struct ControlPlane {
    ctx: Arc<ProxyContext>,
    authenticator: Box<dyn Authenticator>,
    settings: PlaneSettings,
}

impl ControlPlane {
    pub fn new(
        settings: PlaneSettings,
        authenticator: Box<dyn Authenticator>,
        routes: Arc<dyn RouteRegistrar>,
        base_domain: Option<String>,
    ) -> Arc<Self> {
        let ctx = Arc::new(ProxyContext {
            registry: ProxyRegistry::new(routes, base_domain),
            pending: PendingConnections::new(settings.pending_ttl),
            bind_addr: settings.bind_addr,
            heartbeat_interval: settings.heartbeat_interval,
            shutdown: CancellationToken::new(),
        });

        Arc::new(Self {
            ctx,
            authenticator,
            settings,
        })
    }

    /// Start listening for tunnel client connections
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve an already bound listener until [`ControlPlane::shutdown`]
    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!(
            "Control plane listening on {} (multiplex: {})",
            listener.local_addr()?,
            self.settings.multiplex
        );

        let sweeper = self
            .ctx
            .pending
            .spawn_sweeper(self.settings.sweep_interval, self.ctx.shutdown.clone());

        let result = loop {
            let (stream, peer_addr) = tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break Ok(()),
                accepted = accept_with_backoff(&listener, "control port") => accepted,
            };

            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream, peer_addr).await {
                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                }
            });
        };

        sweeper.abort();
        result
    }

    /// Authenticate a physical connection, then serve it
    async fn handle_connection(
        self: Arc<Self>,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<()> {
        tracing::debug!("New connection from {}", peer_addr);
        stream.set_nodelay(true)?;

        let login = match read_message(&mut stream).await? {
            ControlMessage::Login(login) => login,
            other => bail!("expected login, got {}", other.packet_type()),
        };

        if !self.authenticator.verify_login(&login) {
            bail!("invalid token");
        }
        if login.version != PROTOCOL_VERSION {
            tracing::warn!(
                "Client {} runs version {} (server {})",
                peer_addr,
                login.version,
                PROTOCOL_VERSION
            );
        }
        tracing::debug!("Authenticated {}", peer_addr);

        if self.settings.multiplex {
            self.serve_session(stream, peer_addr).await;
        } else {
            self.handle_stream(stream, peer_addr).await;
        }
        Ok(())
    }

    /// Accept yamux streams until the session or the server ends
    async fn serve_session(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let mut session = tokio_yamux::Session::new_server(stream, tokio_yamux::Config::default());

        loop {
            let next = tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                next = session.next() => next,
            };

            match next {
                Some(Ok(stream)) => {
                    let this = self.clone();
                    tokio::spawn(this.handle_stream(stream, peer_addr));
                }
                Some(Err(e)) => {
                    tracing::debug!("Session with {} failed: {}", peer_addr, e);
                    break;
                }
                None => break,
            }
        }

        tracing::debug!("Session with {} closed", peer_addr);
    }

    /// One logical connection: exactly one control message decides its role
    async fn handle_stream<S>(self: Arc<Self>, mut stream: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let msg = match read_message(&mut stream).await {
            Ok(msg) => msg,
            Err(CodecError::Closed) => return,
            Err(e) => {
                tracing::warn!("Bad first frame from {}: {}", peer_addr, e);
                return;
            }
        };

        match msg {
            ControlMessage::ProxyRequest(request) => {
                let mut unit = ProxyUnit::new(self.ctx.clone(), request, peer_addr);
                unit.run(stream).await;
            }
            ControlMessage::Exchange(exchange) => {
                self.handle_exchange(stream, exchange).await;
            }
            ControlMessage::ProxyCancel(cancel) => {
                tracing::info!(
                    "Cancel request from {} for port {}",
                    peer_addr,
                    cancel.remote_port
                );
                self.close_proxy(cancel.remote_port).await;
            }
            other => {
                tracing::warn!(
                    "Unexpected {} as first message from {}",
                    other.packet_type(),
                    peer_addr
                );
            }
        }
    }

    /// Resolve a rendezvous and splice the data connection with its public side
    async fn handle_exchange<S>(&self, stream: S, exchange: Exchange)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Some(public) = self.ctx.pending.take(&exchange.conn_id) else {
            tracing::debug!("No pending connection {} (expired?)", exchange.conn_id);
            return;
        };

        if public.proxy_type() != exchange.proxy_type {
            tracing::warn!(
                "Exchange {} claims {} but the connection is {}",
                exchange.conn_id,
                exchange.proxy_type,
                public.proxy_type()
            );
            return;
        }

        match public {
            PublicConn::Tcp {
                stream: public,
                stats,
            } => {
                tracing::debug!("Relaying TCP connection {}", exchange.conn_id);
                let traffic =
                    relay_metered(public, stream, None, None, Some(stats.traffic.clone())).await;
                tracing::debug!(
                    "Connection {} finished: {} bytes in, {} bytes out",
                    exchange.conn_id,
                    traffic.a_to_b,
                    traffic.b_to_a
                );
            }
            PublicConn::Udp {
                socket,
                shutdown,
                stats,
            } => {
                tracing::debug!("Relaying UDP datagrams for {}", exchange.conn_id);
                let traffic = relay_udp_server_side(socket, stream, shutdown).await;
                stats.traffic.add(traffic);
                tracing::debug!(
                    "UDP relay {} finished: {} bytes in, {} bytes out",
                    exchange.conn_id,
                    traffic.a_to_b,
                    traffic.b_to_a
                );
            }
        }
    }

    /// Active proxies with their traffic counters
    pub fn snapshot(&self) -> Vec<ProxySnapshot> {
        self.ctx.registry.snapshot()
    }

    /// Close the proxy on `port`, whoever owns it
    pub async fn close_proxy(&self, port: u16) -> bool {
        let closed = self.ctx.registry.remove(port).await;
        if closed {
            tracing::info!("Proxy on port {} closed", port);
        }
        closed
    }

    /// Stop accepting, close every proxy and deregister its route
    pub async fn shutdown(&self) {
        self.ctx.shutdown.cancel();
        let removed = self.ctx.registry.clear().await;
        tracing::info!("Control plane shut down, {} proxies removed", removed);
    }

    pub fn pending_connections(&self) -> usize {
        self.ctx.pending.len()
    }

    pub fn is_port_reserved(&self, port: u16) -> bool {
        self.ctx.registry.is_reserved(port)
    }
}
