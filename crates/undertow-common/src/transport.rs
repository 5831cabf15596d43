use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use undertow_protocol::{auth, write_message, ControlMessage};

use crate::error::TransportError;

/// A bidirectional async byte stream.
///
/// Trait objects can only have one non-auto principal trait, so
/// `AsyncRead + AsyncWrite` is folded into a single one.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Opens authenticated logical connections to the server
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn open(&self) -> Result<BoxedStream, TransportError>;
}

async fn connect_and_login(addr: &str, secret: &str) -> Result<TcpStream, TransportError> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let login = ControlMessage::from(auth::issue_now(secret));
    write_message(&mut stream, &login).await?;
    Ok(stream)
}

/// One TCP connection and one Login per logical connection
#[derive(Debug, Clone)]
pub struct PlainDialer {
    addr: String,
    secret: String,
}

impl PlainDialer {
    pub fn new(addr: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            secret: secret.into(),
        }
    }
}

#[async_trait]
impl Dialer for PlainDialer {
    async fn open(&self) -> Result<BoxedStream, TransportError> {
        let stream = connect_and_login(&self.addr, &self.secret).await?;
        Ok(Box::new(stream))
    }
}

struct MuxSession {
    control: tokio_yamux::Control,
    driver: JoinHandle<()>,
}

impl MuxSession {
    async fn establish(addr: &str, secret: &str) -> Result<Self, TransportError> {
        let stream = connect_and_login(addr, secret).await?;
        let mut session = tokio_yamux::Session::new_client(stream, tokio_yamux::Config::default());
        let control = session.control();

        // The session only makes progress while polled. The server never
        // opens streams, so anything inbound is dropped.
        let driver = tokio::spawn(async move {
            while let Some(next) = session.next().await {
                if let Err(e) = next {
                    tracing::debug!("Multiplexed session ended: {}", e);
                    break;
                }
            }
        });

        tracing::debug!("Multiplexed session established with {}", addr);
        Ok(Self { control, driver })
    }

    fn is_alive(&self) -> bool {
        !self.driver.is_finished()
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// One TCP connection and one Login for a whole yamux session; every
/// logical connection is a new stream. The session is built on first use
/// and rebuilt once it has died.
pub struct MuxDialer {
    addr: String,
    secret: String,
    session: tokio::sync::Mutex<Option<MuxSession>>,
}

impl MuxDialer {
    pub fn new(addr: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            secret: secret.into(),
            session: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl Dialer for MuxDialer {
    async fn open(&self) -> Result<BoxedStream, TransportError> {
        let mut guard = self.session.lock().await;

        if let Some(session) = guard.as_mut() {
            if session.is_alive() {
                match session.control.open_stream().await {
                    Ok(stream) => return Ok(Box::new(stream)),
                    Err(e) => tracing::debug!("Stale multiplexed session, rebuilding: {}", e),
                }
            }
        }

        *guard = None;
        let mut session = MuxSession::establish(&self.addr, &self.secret).await?;
        let stream = session
            .control
            .open_stream()
            .await
            .map_err(|e| TransportError::Session(e.to_string()))?;
        *guard = Some(session);
        Ok(Box::new(stream))
    }
}
