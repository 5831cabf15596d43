//! Test server harness for E2E tests
//!
//! Starts a complete control plane on loopback with a mocked route registrar.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};

use undertow::{ForwardSpec, ResolvedClientConfig};
use undertow_protocol::{auth, ProxyType};
use undertow_server::{ControlPlane, PlaneSettings, ProxySnapshot};

use crate::mock_routes::MockRouteRegistrar;

/// Initialize tracing for tests
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("undertow=debug,undertow_server=debug,undertow_common=debug,undertow_e2e=debug")
        .with_test_writer()
        .try_init();
}

/// A TCP port that was free a moment ago
pub async fn free_tcp_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind port finder");
    listener.local_addr().unwrap().port()
}

/// A UDP port that was free a moment ago
pub async fn free_udp_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind port finder");
    socket.local_addr().unwrap().port()
}

pub struct TestServerBuilder {
    settings: PlaneSettings,
    token: String,
    domain: Option<String>,
}

impl TestServerBuilder {
    pub fn token(mut self, token: &str) -> Self {
        self.token = token.to_string();
        self
    }

    pub fn multiplex(mut self, multiplex: bool) -> Self {
        self.settings.multiplex = multiplex;
        self
    }

    /// Turn on domain tunneling under `domain`
    pub fn domain(mut self, domain: &str) -> Self {
        self.domain = Some(domain.to_string());
        self
    }

    pub fn pending_ttl(mut self, ttl: Duration) -> Self {
        self.settings.pending_ttl = ttl;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.settings.heartbeat_interval = interval;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.settings.sweep_interval = interval;
        self
    }

    pub async fn start(self) -> TestServer {
        let routes = MockRouteRegistrar::new();
        let control_plane = ControlPlane::new(
            self.settings.clone(),
            auth::from_secret(&self.token),
            routes.clone(),
            self.domain.clone(),
        );

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind control plane");
        let control_addr = listener.local_addr().unwrap();

        let plane = control_plane.clone();
        tokio::spawn(async move {
            if let Err(e) = plane.run_with_listener(listener).await {
                tracing::error!("Control plane error: {}", e);
            }
        });

        TestServer {
            control_addr,
            token: self.token,
            multiplex: self.settings.multiplex,
            base_domain: self.domain,
            routes,
            control_plane,
        }
    }
}

/// A running test server instance
pub struct TestServer {
    /// Where clients connect
    pub control_addr: SocketAddr,
    pub token: String,
    pub multiplex: bool,
    pub base_domain: Option<String>,
    /// Mock registrar for route assertions
    pub routes: Arc<MockRouteRegistrar>,
    pub control_plane: Arc<ControlPlane>,
}

impl TestServer {
    pub fn builder() -> TestServerBuilder {
        TestServerBuilder {
            settings: PlaneSettings {
                bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                ..PlaneSettings::default()
            },
            token: "e2e-secret".to_string(),
            domain: None,
        }
    }

    /// Plain mode, default timings
    pub async fn start() -> Self {
        Self::builder().start().await
    }

    /// Client config pointed at this server
    pub fn client_config(&self, forwards: Vec<ForwardSpec>) -> ResolvedClientConfig {
        ResolvedClientConfig {
            server_addr: self.control_addr.to_string(),
            token: self.token.clone(),
            multiplex: self.multiplex,
            heartbeat_timeout: Duration::from_secs(15),
            forwards,
        }
    }

    /// A TCP forward from `remote_port` on this server to `local_port`
    pub fn tcp_forward(&self, local_port: u16, remote_port: u16) -> ForwardSpec {
        ForwardSpec {
            proxy_name: format!("tcp-{}", remote_port),
            local_host: "127.0.0.1".to_string(),
            local_port,
            remote_port,
            subdomain: String::new(),
            proxy_type: ProxyType::Tcp,
            speed_limit: 0,
        }
    }

    pub fn udp_forward(&self, local_port: u16, remote_port: u16) -> ForwardSpec {
        ForwardSpec {
            proxy_type: ProxyType::Udp,
            proxy_name: format!("udp-{}", remote_port),
            ..self.tcp_forward(local_port, remote_port)
        }
    }

    /// Public address of a proxied port
    pub fn public_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    pub fn proxy(&self, port: u16) -> Option<ProxySnapshot> {
        self.control_plane
            .snapshot()
            .into_iter()
            .find(|p| p.port == port)
    }

    /// Wait until a proxy is listening on `port`
    pub async fn wait_for_proxy(&self, port: u16) -> ProxySnapshot {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(proxy) = self.proxy(port) {
                return proxy;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "No proxy on port {} after 5s",
                port
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until nothing holds `port` any more
    pub async fn wait_for_release(&self, port: u16) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.control_plane.is_port_reserved(port) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "Port {} still held after 5s",
                port
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn shutdown(&self) {
        self.control_plane.shutdown().await;
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let plane = self.control_plane.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { plane.shutdown().await });
        }
    }
}
