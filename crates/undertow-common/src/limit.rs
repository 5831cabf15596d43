use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::SpeedLimitError;

/// Token bucket shared by one relay leg.
///
/// `acquire` reserves tokens up front and lets the balance go negative, so
/// concurrent callers queue behind each other instead of racing for refills.
/// Over any window of length T at most `rate * T + burst` bytes get through.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    burst: u64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

impl RateLimiter {
    /// `rate` bytes per second with a bucket of `burst` bytes (at least 1)
    pub fn new(rate: u64, burst: u64) -> Self {
        let burst = burst.max(1);
        Self {
            rate: rate as f64,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                last: Instant::now(),
            }),
        }
    }

    /// One second worth of burst, the usual setting for a speed limit
    pub fn per_second(rate: u64) -> Self {
        Self::new(rate, rate)
    }

    pub fn rate(&self) -> u64 {
        self.rate as u64
    }

    pub fn burst(&self) -> u64 {
        self.burst
    }

    /// Wait until `n` bytes may pass
    pub async fn acquire(&self, n: usize) {
        let mut remaining = n as u64;
        while remaining > 0 {
            let take = remaining.min(self.burst);
            let wait = self.reserve(take);
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            remaining -= take;
        }
    }

    fn reserve(&self, n: u64) -> Duration {
        if self.rate <= 0.0 {
            return Duration::ZERO;
        }

        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst as f64);
        bucket.last = now;
        bucket.tokens -= n as f64;

        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.rate)
        }
    }
}

/// Parse a speed limit like `"512"`, `"512b"`, `"64kb"`, `"10mb"` or `"1gb"`
/// into bytes per second. Units are powers of 1024. Zero means unlimited.
pub fn parse_speed_limit(input: &str) -> Result<u64, SpeedLimitError> {
    let s = input.trim().to_ascii_lowercase();
    if s.is_empty() {
        return Ok(0);
    }

    let (digits, multiplier) = if let Some(n) = s.strip_suffix("kb") {
        (n, 1024u64)
    } else if let Some(n) = s.strip_suffix("mb") {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("gb") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('b') {
        (n, 1)
    } else {
        (s.as_str(), 1)
    };

    let base: u64 = digits
        .trim()
        .parse()
        .map_err(|_| SpeedLimitError::Invalid(input.to_string()))?;

    base.checked_mul(multiplier)
        .ok_or_else(|| SpeedLimitError::Overflow(input.to_string()))
}
