use std::time::Duration;

use tokio::time::Instant;

use crate::descriptor::RateLimit;

/// A token bucket that never rejects: a claim always succeeds, going into
///  debt if it must, and reports how long the claimant has to sleep before
///  the debt is paid off. This keeps large transfers from starving behind
///  a burst ceiling smaller than their size.
pub(crate) struct TokenBucket {
    rate: u64,
    burst: i64,
    balance: i64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate: u64, burst: u64, now: Instant) -> TokenBucket {
        let (rate, burst) = clamp_cfg(rate, burst);
        TokenBucket {
            rate,
            burst,
            balance: burst,
            last_refill: now,
        }
    }

    pub fn configure(&mut self, rate: u64, burst: u64) {
        let (rate, burst) = clamp_cfg(rate, burst);
        self.rate = rate;
        self.burst = burst;
        self.balance = self.balance.min(burst);
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate == RateLimit::UNLIMITED_RATE
    }

    /// Claims `n` tokens and returns how long to wait before transferring
    ///  again. Zero when the bucket still has balance.
    pub fn claim(&mut self, n: u64, now: Instant) -> Duration {
        if self.is_unlimited() {
            return Duration::ZERO;
        }

        self.refill(now);
        self.balance = self.balance.saturating_sub(n.min(i64::MAX as u64) as i64);

        if self.balance >= 0 {
            Duration::ZERO
        } else {
            let debt = (-self.balance) as u128;
            Duration::from_millis((debt * 1000 / self.rate as u128 + 1) as u64)
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(self.last_refill).as_millis();
        let add = (elapsed_ms * self.rate as u128 / 1000).min(i64::MAX as u128) as i64;
        if add > 0 {
            self.balance = self.balance.saturating_add(add).min(self.burst);
            self.last_refill = now;
        }
    }
}

fn clamp_cfg(rate: u64, burst: u64) -> (u64, i64) {
    let rate = if rate == 0 { 1 } else { rate };
    (rate, burst.min(i64::MAX as u64) as i64)
}
