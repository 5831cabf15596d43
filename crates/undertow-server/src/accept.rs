//! Accepting that survives a failing `accept(2)`
//!
//! A public or control listener must keep serving after the process runs out
//! of file descriptors or a peer resets before it is accepted.

use std::fmt::Display;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

/// Pause after an error that will not clear by retrying at once
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept the next connection, logging and retrying every error
///
/// Cancel-safe: dropping the future mid-backoff loses no connection.
pub async fn accept_with_backoff(
    listener: &TcpListener,
    label: impl Display,
) -> (TcpStream, SocketAddr) {
    loop {
        match listener.accept().await {
            Ok(accepted) => return accepted,
            Err(e) => match retry_delay(&e) {
                Some(delay) => {
                    tracing::warn!("Accept error on {}: {} (retrying in {:?})", label, e, delay);
                    tokio::time::sleep(delay).await;
                }
                None => tracing::debug!("Accept error on {}: {}", label, e),
            },
        }
    }
}

/// `None` for errors tied to the one connection being accepted
fn retry_delay(e: &io::Error) -> Option<Duration> {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted => None,
        // EMFILE, ENFILE, ENOBUFS and anything unknown
        _ => Some(ACCEPT_BACKOFF),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_connection_errors_retry_at_once() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Interrupted,
        ] {
            assert_eq!(retry_delay(&io::Error::from(kind)), None);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_descriptor_exhaustion_backs_off() {
        // EMFILE and ENFILE
        for errno in [24, 23] {
            let e = io::Error::from_raw_os_error(errno);
            assert_eq!(retry_delay(&e), Some(ACCEPT_BACKOFF));
        }
    }

    #[tokio::test]
    async fn test_accepts_after_backoff_future_is_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // A select losing to another branch must not swallow a connection
        tokio::select! {
            _ = accept_with_backoff(&listener, "test") => panic!("nothing connected yet"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }

        let _client = TcpStream::connect(addr).await.unwrap();
        let (_, from) = tokio::time::timeout(
            Duration::from_secs(5),
            accept_with_backoff(&listener, "test"),
        )
        .await
        .unwrap();
        assert!(from.ip().is_loopback());
    }
}
