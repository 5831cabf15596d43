use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::limit::RateLimiter;
use crate::pool::BufferPool;

/// Bytes moved by one relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Traffic {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

impl Traffic {
    pub fn total(&self) -> u64 {
        self.a_to_b + self.b_to_a
    }
}

/// Live byte counters, shareable across relays (e.g. per proxy)
#[derive(Debug, Default)]
pub struct TrafficStats {
    a_to_b: AtomicU64,
    b_to_a: AtomicU64,
}

impl TrafficStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> Traffic {
        Traffic {
            a_to_b: self.a_to_b.load(Ordering::Relaxed),
            b_to_a: self.b_to_a.load(Ordering::Relaxed),
        }
    }

    pub fn add(&self, traffic: Traffic) {
        self.a_to_b.fetch_add(traffic.a_to_b, Ordering::Relaxed);
        self.b_to_a.fetch_add(traffic.b_to_a, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy)]
enum Direction {
    AToB,
    BToA,
}

impl Direction {
    fn counter(self, stats: &TrafficStats) -> &AtomicU64 {
        match self {
            Self::AToB => &stats.a_to_b,
            Self::BToA => &stats.b_to_a,
        }
    }
}

/// Splice two streams together until either direction ends.
///
/// `limit_a` throttles bytes read from `a`, `limit_b` bytes read from `b`.
pub async fn relay<A, B>(
    a: A,
    b: B,
    limit_a: Option<Arc<RateLimiter>>,
    limit_b: Option<Arc<RateLimiter>>,
) -> Traffic
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    relay_metered(a, b, limit_a, limit_b, None).await
}

/// Like [`relay`], also adding every byte to `shared` as it moves
pub async fn relay_metered<A, B>(
    a: A,
    b: B,
    limit_a: Option<Arc<RateLimiter>>,
    limit_b: Option<Arc<RateLimiter>>,
    shared: Option<Arc<TrafficStats>>,
) -> Traffic
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    let local = TrafficStats::new();

    let mut forward = tokio::spawn(pipe(
        a_read,
        b_write,
        limit_a,
        Direction::AToB,
        local.clone(),
        shared.clone(),
    ));
    let backward = pipe(b_read, a_write, limit_b, Direction::BToA, local.clone(), shared);

    // Whichever side finishes first tears down the other
    tokio::select! {
        _ = &mut forward => {}
        _ = backward => {
            forward.abort();
            // Let the aborted half settle before reading its counters
            let _ = forward.await;
        }
    }

    local.snapshot()
}

async fn pipe<R, W>(
    mut reader: R,
    mut writer: W,
    limiter: Option<Arc<RateLimiter>>,
    direction: Direction,
    local: Arc<TrafficStats>,
    shared: Option<Arc<TrafficStats>>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BufferPool::global().get();
    let chunk = match &limiter {
        Some(l) => (l.burst() as usize).min(buf.len()),
        None => buf.len(),
    };

    loop {
        let n = match reader.read(&mut buf[..chunk]).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("Relay read error: {}", e);
                break;
            }
        };

        if let Some(limiter) = &limiter {
            limiter.acquire(n).await;
        }

        if let Err(e) = writer.write_all(&buf[..n]).await {
            tracing::debug!("Relay write error: {}", e);
            break;
        }

        direction.counter(&local).fetch_add(n as u64, Ordering::Relaxed);
        if let Some(shared) = &shared {
            direction.counter(shared).fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_relay_both_directions() {
        let (mut left, a) = tokio::io::duplex(1024);
        let (b, mut right) = tokio::io::duplex(1024);

        let handle = tokio::spawn(relay(a, b, None, None));

        left.write_all(b"hello from a").await.unwrap();
        let mut buf = [0u8; 12];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello from a");

        right.write_all(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        left.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");

        drop(left);
        let traffic = handle.await.unwrap();
        assert_eq!(traffic.a_to_b, 12);
        assert_eq!(traffic.b_to_a, 5);
    }

    #[tokio::test]
    async fn test_closing_one_side_tears_down_the_other() {
        let (left, a) = tokio::io::duplex(1024);
        let (b, mut right) = tokio::io::duplex(1024);

        let handle = tokio::spawn(relay(a, b, None, None));
        drop(left);

        // The far side sees EOF even though it never closed anything
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), right.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_both_streams_released_on_return() {
        let (mut left, a) = tokio::io::duplex(1024);
        let (b, mut right) = tokio::io::duplex(1024);

        let handle = tokio::spawn(relay(a, b, None, None));
        left.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        right.read_exact(&mut buf).await.unwrap();

        // The far side leaves while the near side is still open
        drop(right);
        let traffic = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(traffic.a_to_b, 5);
        assert!(left.write_all(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_shared_stats_accumulate() {
        let shared = TrafficStats::new();

        for _ in 0..2 {
            let (mut left, a) = tokio::io::duplex(1024);
            let (b, mut right) = tokio::io::duplex(1024);
            let handle = tokio::spawn(relay_metered(a, b, None, None, Some(shared.clone())));

            left.write_all(b"abcd").await.unwrap();
            let mut buf = [0u8; 4];
            right.read_exact(&mut buf).await.unwrap();
            drop(left);
            handle.await.unwrap();
        }

        assert_eq!(shared.snapshot().a_to_b, 8);
        assert_eq!(shared.snapshot().b_to_a, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limited_leg_is_throttled() {
        let (mut left, a) = tokio::io::duplex(64 * 1024);
        let (b, mut right) = tokio::io::duplex(64 * 1024);
        let limiter = Arc::new(RateLimiter::per_second(1024));

        tokio::spawn(relay(a, b, Some(limiter), None));

        let start = tokio::time::Instant::now();
        left.write_all(&[7u8; 4096]).await.unwrap();
        let mut buf = vec![0u8; 4096];
        right.read_exact(&mut buf).await.unwrap();

        // 1 KiB burst, then 3 KiB at 1 KiB/s
        assert!(start.elapsed() >= Duration::from_millis(2900));
    }
}
