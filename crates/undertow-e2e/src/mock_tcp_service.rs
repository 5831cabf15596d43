//! Mock local TCP service for E2E tests
//!
//! Stands in for the service a client exposes: echoes, answers with a fixed
//! payload, or swallows everything, and records what each connection sent.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Behavior mode for the mock TCP service
#[derive(Clone, Debug)]
pub enum TcpServiceMode {
    /// Echo back all received data
    Echo,
    /// Send a fixed response after the first read, then close
    FixedResponse(Vec<u8>),
    /// Read until EOF without answering
    Accumulate,
}

/// A finished connection
#[derive(Clone, Debug)]
pub struct RecordedTcpConnection {
    pub received_data: Vec<u8>,
    pub peer_addr: SocketAddr,
}

pub struct MockTcpService {
    addr: SocketAddr,
    connections: Arc<RwLock<Vec<RecordedTcpConnection>>>,
    shutdown: CancellationToken,
}

impl MockTcpService {
    /// Echo service on an ephemeral port
    pub async fn start() -> Self {
        Self::start_with_mode(TcpServiceMode::Echo).await
    }

    pub async fn start_with_mode(mode: TcpServiceMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock TCP service");
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(RwLock::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let recorded = connections.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::error!("Mock TCP accept error: {}", e);
                            break;
                        }
                    },
                };

                let recorded = recorded.clone();
                let mode = mode.clone();
                tokio::spawn(async move {
                    let received_data = serve(stream, mode).await;
                    recorded.write().push(RecordedTcpConnection {
                        received_data,
                        peer_addr,
                    });
                });
            }
        });

        Self {
            addr,
            connections,
            shutdown,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connections that have finished, in completion order
    pub fn get_connections(&self) -> Vec<RecordedTcpConnection> {
        self.connections.read().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn total_bytes_received(&self) -> usize {
        self.connections
            .read()
            .iter()
            .map(|c| c.received_data.len())
            .sum()
    }
}

impl Drop for MockTcpService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve(mut stream: TcpStream, mode: TcpServiceMode) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("Mock TCP read error: {}", e);
                break;
            }
        };
        received.extend_from_slice(&buf[..n]);

        let reply = match &mode {
            TcpServiceMode::Echo => &buf[..n],
            TcpServiceMode::FixedResponse(response) => {
                let _ = stream.write_all(response).await;
                break;
            }
            TcpServiceMode::Accumulate => continue,
        };
        if let Err(e) = stream.write_all(reply).await {
            tracing::debug!("Mock TCP write error: {}", e);
            break;
        }
    }

    received
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_tcp_echo() {
        let service = MockTcpService::start().await;

        let mut stream = TcpStream::connect(service.addr()).await.unwrap();
        stream.write_all(b"Hello, TCP!").await.unwrap();

        let mut buf = [0u8; 11];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"Hello, TCP!");

        drop(stream);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(service.connection_count(), 1);
        assert_eq!(service.total_bytes_received(), 11);
    }

    #[tokio::test]
    async fn test_tcp_fixed_response() {
        let service =
            MockTcpService::start_with_mode(TcpServiceMode::FixedResponse(b"PONG".to_vec())).await;

        let mut stream = TcpStream::connect(service.addr()).await.unwrap();
        stream.write_all(b"PING").await.unwrap();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"PONG");
    }
}
