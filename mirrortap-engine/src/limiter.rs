//! Per-direction token-bucket throttle
//!
//! One limiter instance per direction (uplink, downlink). The bucket holds
//! kbps × 1000 / 8 bytes and refills continuously from elapsed time. The
//! limiter itself never blocks: `admit` debits the bucket and tells the
//! caller how long to wait before acting on the admitted bytes, so the pump
//! loops sleep asynchronously instead of stalling a thread.
//!
//! Rate semantics follow the launcher contract: negative (or unset) means
//! unlimited; a literal zero means paused, admitting nothing until the rate
//! is changed.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Outcome of an admission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Bytes admitted; act immediately
    Granted,
    /// Bytes admitted against future tokens; act after the delay
    Delayed(Duration),
    /// Rate is zero; nothing is admitted
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Rate {
    Unlimited,
    Paused,
    BytesPerSec(f64),
}

#[derive(Debug)]
struct Bucket {
    rate: Rate,
    capacity: f64,
    available: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter for one direction
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter from a kbps setting (negative = unlimited,
    /// zero = paused).
    pub fn from_kbps(kbps: i64) -> Self {
        let limiter = Self {
            bucket: Mutex::new(Bucket {
                rate: Rate::Unlimited,
                capacity: 0.0,
                available: 0.0,
                last_refill: Instant::now(),
            }),
        };
        limiter.set_rate_kbps(kbps);
        limiter
    }

    pub fn unlimited() -> Self {
        Self::from_kbps(-1)
    }

    /// Swap the rate at runtime; the bucket restarts full at the new size.
    pub fn set_rate_kbps(&self, kbps: i64) {
        let mut bucket = self.bucket.lock();
        if kbps < 0 {
            bucket.rate = Rate::Unlimited;
            bucket.capacity = 0.0;
        } else if kbps == 0 {
            bucket.rate = Rate::Paused;
            bucket.capacity = 0.0;
        } else {
            let bytes_per_sec = kbps as f64 * 1000.0 / 8.0;
            bucket.rate = Rate::BytesPerSec(bytes_per_sec);
            bucket.capacity = bytes_per_sec;
            bucket.available = bytes_per_sec;
        }
        bucket.last_refill = Instant::now();
        debug!("rate limit set to {} kbps", kbps);
    }

    /// Request admission for `len` bytes.
    pub fn admit(&self, len: usize) -> Admission {
        self.admit_at(len, Instant::now())
    }

    /// Admission with an explicit clock; the production path always passes
    /// `Instant::now()`.
    pub fn admit_at(&self, len: usize, now: Instant) -> Admission {
        let mut bucket = self.bucket.lock();

        let rate = match bucket.rate {
            Rate::Unlimited => return Admission::Granted,
            Rate::Paused => return Admission::Paused,
            Rate::BytesPerSec(rate) => rate,
        };

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.available = (bucket.available + elapsed.as_secs_f64() * rate).min(bucket.capacity);
        bucket.last_refill = now;

        // Tokens are debited up front; a deficit becomes the caller's delay
        bucket.available -= len as f64;
        if bucket.available >= 0.0 {
            Admission::Granted
        } else {
            let wait = -bucket.available / rate;
            Admission::Delayed(Duration::from_secs_f64(wait))
        }
    }
}
