//! Token-bucket rate limiting for incremental flooding.
//!
//! Uses the token bucket algorithm, which allows controlled bursts while
//! maintaining an average rate. The bucket has a capacity
//! (`flood_msg_burst_size`) and a refill rate (`flood_msg_per_sec`); one
//! token is consumed per flooded publication. When the bucket is empty the
//! caller buffers the publication and drains the buffer once a token is
//! available again.

use std::time::{Duration, Instant};

use trellis_types::config::FloodRate;

/// Token bucket gating outbound flood publications.
#[derive(Debug)]
pub struct FloodLimiter {
    /// Available tokens, scaled by 1000 for sub-token precision.
    tokens_millis: u64,
    /// Maximum tokens the bucket can hold, scaled by 1000.
    capacity_millis: u64,
    /// Tokens added per second.
    refill_rate: f64,
    /// Last time tokens were refilled.
    last_refill: Instant,
}

impl FloodLimiter {
    /// Creates a limiter from the configured flood rate, starting at full
    /// capacity.
    pub fn new(rate: FloodRate) -> Self {
        let capacity_millis = u64::from(rate.flood_msg_burst_size) * 1000;
        Self {
            tokens_millis: capacity_millis,
            capacity_millis,
            refill_rate: f64::from(rate.flood_msg_per_sec),
            last_refill: Instant::now(),
        }
    }

    /// Refills based on elapsed time, then tries to consume one token.
    ///
    /// Returns true when a token was consumed and the publication may be
    /// flooded immediately.
    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens_millis >= 1000 {
            self.tokens_millis -= 1000;
            true
        } else {
            false
        }
    }

    /// Estimated wait until one token becomes available.
    pub fn retry_after(&self) -> Duration {
        if self.tokens_millis >= 1000 {
            return Duration::ZERO;
        }
        let deficit_millis = 1000 - self.tokens_millis;
        let secs = deficit_millis as f64 / (self.refill_rate * 1000.0);
        Duration::from_secs_f64(secs)
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let added = (elapsed.as_secs_f64() * self.refill_rate * 1000.0) as u64;
        if added > 0 {
            self.tokens_millis = (self.tokens_millis + added).min(self.capacity_millis);
            self.last_refill = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(per_sec: u32, burst: u32) -> FloodLimiter {
        FloodLimiter::new(FloodRate { flood_msg_per_sec: per_sec, flood_msg_burst_size: burst })
    }

    #[test]
    fn test_burst_then_exhaustion() {
        let mut limiter = limiter(10, 3);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_retry_after_bounded_by_rate() {
        let mut limiter = limiter(100, 1);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        // At 100 msg/s a token regenerates within 10ms.
        assert!(limiter.retry_after() <= Duration::from_millis(11));
    }

    #[test]
    fn test_tokens_refill_over_time() {
        let mut limiter = limiter(1000, 1);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        std::thread::sleep(Duration::from_millis(5));
        assert!(limiter.try_acquire());
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let mut limiter = limiter(1000, 2);
        std::thread::sleep(Duration::from_millis(10));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }
}
