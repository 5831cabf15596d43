//! One data connection: answer an Exchange and splice it with the local service.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::{lookup_host, TcpStream, UdpSocket};

use undertow_common::{relay, relay_udp_client_side, Dialer, Traffic};
use undertow_protocol::{write_message, Exchange, ProxyType};

use crate::forwarder::{ForwardError, ForwardSpec};

/// Open a data connection, echo `exchange` on it, then relay to the local
/// service. A local dial failure drops this attempt only; the public side
/// sees its connection close.
pub async fn serve_exchange(
    dialer: Arc<dyn Dialer>,
    spec: Arc<ForwardSpec>,
    exchange: Exchange,
) -> Result<Traffic, ForwardError> {
    let mut data = dialer.open().await?;
    let proxy_type = exchange.proxy_type;
    write_message(&mut data, &exchange.into()).await?;

    let local_addr = spec.local_addr();
    let traffic = match proxy_type {
        ProxyType::Tcp => {
            let local = TcpStream::connect(&local_addr)
                .await
                .map_err(|source| ForwardError::LocalDial {
                    addr: local_addr.clone(),
                    source,
                })?;
            let _ = local.set_nodelay(true);
            // Tunnel -> local and local -> tunnel each get their own bucket
            relay(data, local, spec.limiter(), spec.limiter()).await
        }
        ProxyType::Udp => {
            let socket = connect_udp(&local_addr)
                .await
                .map_err(|source| ForwardError::LocalDial {
                    addr: local_addr.clone(),
                    source,
                })?;
            relay_udp_client_side(socket, data, spec.limiter()).await
        }
    };

    Ok(traffic)
}

async fn connect_udp(addr: &str) -> std::io::Result<UdpSocket> {
    let target = lookup_host(addr).await?.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no address for {}", addr),
        )
    })?;

    let bind: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(target).await?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use undertow_common::{BoxedStream, TransportError};
    use undertow_protocol::{read_message, ControlMessage, UdpDatagram};

    struct DuplexDialer {
        tx: mpsc::UnboundedSender<DuplexStream>,
    }

    #[async_trait]
    impl Dialer for DuplexDialer {
        async fn open(&self) -> Result<BoxedStream, TransportError> {
            let (client, server) = tokio::io::duplex(64 * 1024);
            let _ = self.tx.send(server);
            Ok(Box::new(client))
        }
    }

    fn spec(local_port: u16, proxy_type: ProxyType) -> Arc<ForwardSpec> {
        Arc::new(ForwardSpec {
            proxy_name: String::new(),
            local_host: "127.0.0.1".to_string(),
            local_port,
            remote_port: 9000,
            subdomain: String::new(),
            proxy_type,
            speed_limit: 0,
        })
    }

    fn exchange(proxy_type: ProxyType) -> Exchange {
        Exchange {
            conn_id: "abc123def456".to_string(),
            proxy_type,
        }
    }

    #[tokio::test]
    async fn test_tcp_exchange_echoes_then_relays() {
        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = local.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut conn, _) = local.accept().await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(b"pong").await.unwrap();
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let dialer: Arc<dyn Dialer> = Arc::new(DuplexDialer { tx });
        let task = tokio::spawn(serve_exchange(
            dialer,
            spec(port, ProxyType::Tcp),
            exchange(ProxyType::Tcp),
        ));

        let mut server = rx.recv().await.unwrap();
        match read_message(&mut server).await.unwrap() {
            ControlMessage::Exchange(ex) => assert_eq!(ex, exchange(ProxyType::Tcp)),
            other => panic!("expected exchange, got {:?}", other),
        }

        server.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        server.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");
        drop(server);

        let traffic = task.await.unwrap().unwrap();
        assert_eq!(traffic.a_to_b, 4);
        assert_eq!(traffic.b_to_a, 4);
    }

    #[tokio::test]
    async fn test_local_dial_failure_drops_attempt() {
        // Grab a free port, then close it
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let dialer: Arc<dyn Dialer> = Arc::new(DuplexDialer { tx });
        let result = serve_exchange(
            dialer,
            spec(port, ProxyType::Tcp),
            exchange(ProxyType::Tcp),
        )
        .await;
        assert!(matches!(result, Err(ForwardError::LocalDial { .. })));

        // The data connection carried the echo and was then closed
        let mut server = rx.recv().await.unwrap();
        assert!(matches!(
            read_message(&mut server).await.unwrap(),
            ControlMessage::Exchange(_)
        ));
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_udp_exchange_reaches_local_service() {
        let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = local.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = local.recv_from(&mut buf).await.unwrap();
            local.send_to(&buf[..n], from).await.unwrap();
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let dialer: Arc<dyn Dialer> = Arc::new(DuplexDialer { tx });
        tokio::spawn(serve_exchange(
            dialer,
            spec(port, ProxyType::Udp),
            exchange(ProxyType::Udp),
        ));

        let mut server = rx.recv().await.unwrap();
        assert!(matches!(
            read_message(&mut server).await.unwrap(),
            ControlMessage::Exchange(_)
        ));

        let peer: SocketAddr = "203.0.113.7:5353".parse().unwrap();
        write_message(
            &mut server,
            &UdpDatagram {
                payload: b"hello".to_vec(),
                addr: Some(peer),
            }
            .into(),
        )
        .await
        .unwrap();

        match read_message(&mut server).await.unwrap() {
            ControlMessage::UdpDatagram(dgram) => {
                assert_eq!(dgram.payload, b"hello");
                assert_eq!(dgram.addr, Some(peer));
            }
            other => panic!("expected datagram, got {:?}", other),
        }
    }
}
