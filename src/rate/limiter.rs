use std::sync::Mutex;

use tokio::time::{sleep, Instant};

use crate::descriptor::{Direction, RateLimit};
use crate::rate::bucket::TokenBucket;

/// A read bucket and a write bucket behind one lock. Used both for the two
///  process-level groups and for the per-peer buckets; a transfer claims the
///  group first and its own bucket second, so the effective rate is the
///  minimum of the two.
pub(crate) struct RateLimiter {
    buckets: Mutex<DirectionalBuckets>,
}

struct DirectionalBuckets {
    read: TokenBucket,
    write: TokenBucket,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> RateLimiter {
        let now = Instant::now();
        RateLimiter {
            buckets: Mutex::new(DirectionalBuckets {
                read: TokenBucket::new(limit.max_read_rate, limit.max_burst_read, now),
                write: TokenBucket::new(limit.max_write_rate, limit.max_burst_write, now),
            }),
        }
    }

    /// Swaps in a new config. This is the group-rate lock of the concurrency
    ///  model; it is never held across an await.
    pub fn set(&self, limit: RateLimit) {
        let mut buckets = self.buckets.lock().expect("rate lock poisoned");
        buckets.read.configure(limit.max_read_rate, limit.max_burst_read);
        buckets.write.configure(limit.max_write_rate, limit.max_burst_write);
    }

    pub async fn claim_read(&self, n: u64) {
        let wait = {
            let mut buckets = self.buckets.lock().expect("rate lock poisoned");
            buckets.read.claim(n, Instant::now())
        };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    pub async fn claim_write(&self, n: u64) {
        let wait = {
            let mut buckets = self.buckets.lock().expect("rate lock poisoned");
            buckets.write.claim(n, Instant::now())
        };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

/// The two process-level aggregates: every inbound peer shares one, every
///  outbound peer the other.
pub(crate) struct RateGroups {
    pub incoming: std::sync::Arc<RateLimiter>,
    pub outgoing: std::sync::Arc<RateLimiter>,
}

impl RateGroups {
    pub fn new() -> RateGroups {
        RateGroups {
            incoming: std::sync::Arc::new(RateLimiter::new(RateLimit::UNLIMITED)),
            outgoing: std::sync::Arc::new(RateLimiter::new(RateLimit::UNLIMITED)),
        }
    }

    pub fn for_direction(&self, direction: Direction) -> &std::sync::Arc<RateLimiter> {
        match direction {
            Direction::Inbound => &self.incoming,
            Direction::Outbound => &self.outgoing,
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_claim_sleeps_off_debt() {
        let limiter = RateLimiter::new(RateLimit {
            max_read_rate: 1000,
            max_burst_read: 1000,
            max_write_rate: RateLimit::UNLIMITED_RATE,
            max_burst_write: RateLimit::UNLIMITED_RATE,
        });

        let before = Instant::now();
        limiter.claim_read(1000).await;
        assert_eq!(Instant::now(), before);

        limiter.claim_read(1000).await;
        let waited = Instant::now() - before;
        assert!(waited >= Duration::from_millis(1000), "{:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_takes_effect() {
        let limiter = RateLimiter::new(RateLimit {
            max_read_rate: 1,
            max_burst_read: 1,
            max_write_rate: 1,
            max_burst_write: 1,
        });
        limiter.set(RateLimit::UNLIMITED);

        let before = Instant::now();
        limiter.claim_write(1 << 30).await;
        assert_eq!(Instant::now(), before);
    }
}
