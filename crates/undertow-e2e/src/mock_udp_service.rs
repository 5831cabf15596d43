//! Mock local UDP service: answers every datagram with its uppercase form

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

pub struct MockUdpService {
    addr: SocketAddr,
    received: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl MockUdpService {
    pub async fn start() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock UDP service");
        let addr = socket.local_addr().unwrap();
        let received = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let count = received.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                let (n, from) = tokio::select! {
                    _ = token.cancelled() => break,
                    res = socket.recv_from(&mut buf) => match res {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::debug!("Mock UDP recv error: {}", e);
                            continue;
                        }
                    },
                };
                count.fetch_add(1, Ordering::SeqCst);
                buf[..n].make_ascii_uppercase();
                let _ = socket.send_to(&buf[..n], from).await;
            }
        });

        Self {
            addr,
            received,
            shutdown,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Datagrams received so far
    pub fn datagram_count(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }
}

impl Drop for MockUdpService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_uppercase_echo() {
        let service = MockUdpService::start().await;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(b"ping", service.addr()).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"PING");
        assert_eq!(service.datagram_count(), 1);
    }
}
