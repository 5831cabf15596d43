//! Clients for E2E tests
//!
//! [`TestClient`] runs the real client in the background; [`TestControlClient`]
//! speaks the wire protocol by hand for tests that need to misbehave.

use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use undertow::{Client, ForwardError, ForwardSpec};
use undertow_common::{BoxedStream, Dialer, MuxDialer, PlainDialer};
use undertow_protocol::{
    auth, read_message, write_message, ControlMessage, Exchange, ProxyCancel, ProxyRequest,
    ProxyResponse, ProxyType,
};

use crate::harness::TestServer;

type Failures = Vec<(ForwardSpec, ForwardError)>;

/// The real client, running until shut down
pub struct TestClient {
    shutdown: CancellationToken,
    handle: Option<JoinHandle<Failures>>,
}

impl TestClient {
    /// Start forwarding `forwards` through `server`
    pub fn start(server: &TestServer, forwards: Vec<ForwardSpec>) -> Self {
        let client = Client::new(server.client_config(forwards));
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { client.run(token).await });

        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// True once every forward has stopped on its own
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Wait for the forwards to stop without cancelling them
    pub async fn join(&mut self) -> Failures {
        match self.handle.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Cancel every forward and wait until their cancels have been sent
    pub async fn shutdown(&mut self) -> Failures {
        self.shutdown.cancel();
        self.join().await
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Hand-driven client side of the protocol
pub struct TestControlClient {
    dialer: Arc<dyn Dialer>,
}

impl TestControlClient {
    pub fn new(server: &TestServer) -> Self {
        Self::with_token(server, &server.token)
    }

    pub fn with_token(server: &TestServer, token: &str) -> Self {
        let addr = server.control_addr.to_string();
        let dialer: Arc<dyn Dialer> = if server.multiplex {
            Arc::new(MuxDialer::new(addr, token))
        } else {
            Arc::new(PlainDialer::new(addr, token))
        };
        Self { dialer }
    }

    /// A fresh, logged-in logical connection
    pub async fn open(&self) -> Result<BoxedStream> {
        Ok(self.dialer.open().await?)
    }

    /// Send a ProxyRequest and return the control stream with the response
    pub async fn request(
        &self,
        remote_port: u16,
        proxy_type: ProxyType,
        subdomain: &str,
    ) -> Result<(BoxedStream, ProxyResponse)> {
        let mut control = self.open().await?;
        let request = ProxyRequest {
            remote_port,
            proxy_name: format!("raw-{}", remote_port),
            subdomain: subdomain.to_string(),
            proxy_type,
        };
        write_message(&mut control, &request.into()).await?;

        match read_message(&mut control).await? {
            ControlMessage::ProxyResponse(resp) => Ok((control, resp)),
            other => bail!("expected ProxyResponse, got {}", other.packet_type()),
        }
    }

    /// Read control frames until an Exchange, skipping heartbeats
    pub async fn next_exchange(control: &mut BoxedStream) -> Result<Exchange> {
        loop {
            match read_message(control).await? {
                ControlMessage::Heartbeat(_) => continue,
                ControlMessage::Exchange(exchange) => return Ok(exchange),
                other => bail!("expected Exchange, got {}", other.packet_type()),
            }
        }
    }

    /// Answer an Exchange with a data connection
    pub async fn answer(&self, exchange: Exchange) -> Result<BoxedStream> {
        let mut data = self.open().await?;
        write_message(&mut data, &exchange.into()).await?;
        Ok(data)
    }

    /// Standalone cancel on its own logical connection
    pub async fn cancel(&self, remote_port: u16) -> Result<()> {
        let mut stream = self.open().await?;
        let cancel = ProxyCancel {
            proxy_name: String::new(),
            remote_port,
        };
        write_message(&mut stream, &cancel.into()).await?;
        Ok(())
    }
}

/// Raw TCP connection to the control port with a hand-made Login
pub async fn connect_with_login(server: &TestServer, token: &str) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(server.control_addr).await?;
    write_message(&mut stream, &auth::issue_now(token).into()).await?;
    Ok(stream)
}
