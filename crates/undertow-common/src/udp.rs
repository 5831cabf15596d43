//! UDP encapsulation over a reliable tunnel stream.
//!
//! Each datagram travels as one [`UdpDatagram`] frame, so packet boundaries
//! survive the trip. Loss and reordering of a real UDP path are not
//! reproduced.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use undertow_protocol::{ControlMessage, MessageCodec, UdpDatagram, MAX_PAYLOAD_SIZE};

use crate::limit::RateLimiter;
use crate::relay::Traffic;

/// Largest datagram carried through a tunnel; longer ones are dropped.
/// Its base64 plus the JSON envelope and the longest peer address fits in
/// one frame.
pub const MAX_DATAGRAM_SIZE: usize = (MAX_PAYLOAD_SIZE - 256) / 4 * 3;

/// Holds any UDP payload, so oversized datagrams are seen whole
const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Errors from a connected socket left by ICMP for an earlier send
fn is_transient_recv_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

/// Client half: `socket` is connected to the local service.
///
/// Datagrams from the tunnel go to the local service and remember their
/// public peer; replies are tagged with the last peer seen. `a_to_b` counts
/// local → tunnel bytes.
pub async fn relay_udp_client_side<S>(
    socket: UdpSocket,
    tunnel: S,
    limiter: Option<Arc<RateLimiter>>,
) -> Traffic
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut frames) = Framed::new(tunnel, MessageCodec::new()).split();
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    let mut last_peer: Option<SocketAddr> = None;
    let mut traffic = Traffic::default();

    loop {
        tokio::select! {
            res = socket.recv(&mut buf) => {
                let n = match res {
                    Ok(n) => n,
                    // The local service may come back
                    Err(e) if is_transient_recv_error(&e) => {
                        tracing::debug!("Local UDP recv error: {}", e);
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!("Local UDP recv failed: {}", e);
                        break;
                    }
                };
                if n > MAX_DATAGRAM_SIZE {
                    tracing::warn!(
                        "Dropping {} byte datagram from local service (max {})",
                        n,
                        MAX_DATAGRAM_SIZE
                    );
                    continue;
                }
                if let Some(limiter) = &limiter {
                    limiter.acquire(n).await;
                }
                let msg = UdpDatagram {
                    payload: buf[..n].to_vec(),
                    addr: last_peer,
                };
                if let Err(e) = sink.send(ControlMessage::from(msg)).await {
                    tracing::debug!("UDP tunnel write error: {}", e);
                    break;
                }
                traffic.a_to_b += n as u64;
            }
            frame = frames.next() => {
                let datagram = match frame {
                    Some(Ok(ControlMessage::UdpDatagram(d))) => d,
                    Some(Ok(other)) => {
                        tracing::warn!("Unexpected {} on UDP tunnel", other.packet_type());
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::debug!("UDP tunnel read error: {}", e);
                        break;
                    }
                    None => break,
                };
                if let Some(limiter) = &limiter {
                    limiter.acquire(datagram.payload.len()).await;
                }
                if datagram.addr.is_some() {
                    last_peer = datagram.addr;
                }
                if let Err(e) = socket.send(&datagram.payload).await {
                    tracing::debug!("Local UDP send error: {}", e);
                    continue;
                }
                traffic.b_to_a += datagram.payload.len() as u64;
            }
        }
    }

    traffic
}

/// Server half: `socket` is the public UDP socket of a proxy.
///
/// Public datagrams are tagged with their sender; datagrams coming back are
/// sent to their `addr`, or to the last sender when it is absent. `a_to_b`
/// counts public → tunnel bytes.
pub async fn relay_udp_server_side<S>(
    socket: Arc<UdpSocket>,
    tunnel: S,
    shutdown: CancellationToken,
) -> Traffic
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut frames) = Framed::new(tunnel, MessageCodec::new()).split();
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    let mut last_peer: Option<SocketAddr> = None;
    let mut traffic = Traffic::default();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            res = socket.recv_from(&mut buf) => {
                let (n, peer) = match res {
                    Ok(r) => r,
                    Err(e) => {
                        // ICMP unreachable from an earlier send surfaces here
                        tracing::debug!("Public UDP recv error: {}", e);
                        continue;
                    }
                };
                if n > MAX_DATAGRAM_SIZE {
                    tracing::warn!(
                        "Dropping {} byte datagram from {} (max {})",
                        n,
                        peer,
                        MAX_DATAGRAM_SIZE
                    );
                    continue;
                }
                last_peer = Some(peer);
                let msg = UdpDatagram {
                    payload: buf[..n].to_vec(),
                    addr: Some(peer),
                };
                if let Err(e) = sink.send(ControlMessage::from(msg)).await {
                    tracing::debug!("UDP tunnel write error: {}", e);
                    break;
                }
                traffic.a_to_b += n as u64;
            }
            frame = frames.next() => {
                let datagram = match frame {
                    Some(Ok(ControlMessage::UdpDatagram(d))) => d,
                    Some(Ok(other)) => {
                        tracing::warn!("Unexpected {} on UDP tunnel", other.packet_type());
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::debug!("UDP tunnel read error: {}", e);
                        break;
                    }
                    None => break,
                };
                let Some(peer) = datagram.addr.or(last_peer) else {
                    tracing::debug!("Dropping UDP reply with no known peer");
                    continue;
                };
                if let Err(e) = socket.send_to(&datagram.payload, peer).await {
                    tracing::debug!("Public UDP send to {} failed: {}", peer, e);
                    continue;
                }
                traffic.b_to_a += datagram.payload.len() as u64;
            }
        }
    }

    traffic
}
