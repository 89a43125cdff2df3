//! Peer retry scheduling.
//!
//! Stateful wrapper around `backon`'s exponential policy for the peer
//! FSM's poll-and-reset pattern: every reported failure pulls the next
//! delay from the policy and schedules a retry deadline, a reported
//! success rebuilds the policy so the next failure starts from the
//! minimum delay again.

use std::time::{Duration, Instant};

use backon::{BackoffBuilder, ExponentialBuilder};

/// Tracks retry timing with exponentially growing delays between
/// failures, capped at a maximum.
pub struct ExponentialBackoff {
    builder: ExponentialBuilder,
    delays: backon::ExponentialBackoff,
    max_delay: Duration,
    retry_at: Option<Instant>,
}

impl ExponentialBackoff {
    /// Creates a backoff with delays ranging from `initial` to `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        let builder = ExponentialBuilder::new()
            .with_min_delay(initial)
            .with_max_delay(max)
            .with_factor(2.0)
            .without_max_times();
        let delays = builder.clone().build();
        Self { builder, delays, max_delay: max, retry_at: None }
    }

    /// Records a failure and schedules the next retry.
    pub fn report_error(&mut self) {
        // The policy is unbounded; the cap is only a safety net.
        let delay = self.delays.next().unwrap_or(self.max_delay);
        self.retry_at = Some(Instant::now() + delay);
    }

    /// Records a success, resetting the delay sequence.
    pub fn report_success(&mut self) {
        self.delays = self.builder.clone().build();
        self.retry_at = None;
    }

    /// Returns true if a retry is allowed now.
    pub fn can_try_now(&self) -> bool {
        self.time_remaining().is_zero()
    }

    /// Time remaining until the next retry is allowed.
    pub fn time_remaining(&self) -> Duration {
        match self.retry_at {
            Some(at) => at.saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    /// The instant at which the next retry is allowed, if one is pending.
    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }
}

impl std::fmt::Debug for ExponentialBackoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExponentialBackoff")
            .field("max_delay", &self.max_delay)
            .field("retry_at", &self.retry_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_backoff_allows_retry() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(8));
        assert!(backoff.can_try_now());
        assert_eq!(backoff.time_remaining(), Duration::ZERO);
        assert!(backoff.retry_at().is_none());
    }

    #[test]
    fn test_first_error_waits_the_minimum_delay() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(8));
        backoff.report_error();
        assert!(!backoff.can_try_now());
        assert!(backoff.time_remaining() <= Duration::from_millis(100));
    }

    #[test]
    fn test_delays_grow_exponentially() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(8));
        backoff.report_error();
        backoff.report_error();
        // Second delay is 200ms.
        assert!(backoff.time_remaining() > Duration::from_millis(150));
        assert!(backoff.time_remaining() <= Duration::from_millis(200));

        backoff.report_error();
        // Third delay is 400ms.
        assert!(backoff.time_remaining() > Duration::from_millis(300));
        assert!(backoff.time_remaining() <= Duration::from_millis(400));
    }

    #[test]
    fn test_delays_cap_at_max() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(300));
        for _ in 0..10 {
            backoff.report_error();
        }
        assert!(backoff.time_remaining() <= Duration::from_millis(300));
        assert!(backoff.time_remaining() > Duration::from_millis(250));
    }

    #[test]
    fn test_success_resets_the_sequence() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(8));
        backoff.report_error();
        backoff.report_error();
        backoff.report_success();
        assert!(backoff.can_try_now());

        // The next failure starts over at the minimum delay.
        backoff.report_error();
        assert!(backoff.time_remaining() <= Duration::from_millis(100));
    }
}
