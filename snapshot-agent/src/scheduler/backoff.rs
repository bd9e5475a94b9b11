//! Retry delays for failed backup attempts.

use rand::Rng;
use std::time::Duration;

/// Upper bound on the random jitter added to any single delay.
pub const MAX_JITTER: Duration = Duration::from_secs(30);

/// Exponential backoff: `base * 2^(attempt-1)` capped at `max`, plus up to
/// 10% random jitter (never more than [`MAX_JITTER`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before retrying after the `attempt`-th failure, without jitter.
    /// `attempt` starts at 1.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Jitter bound for a given delay.
    pub fn jitter_bound(delay: Duration) -> Duration {
        (delay / 10).min(MAX_JITTER)
    }

    /// Delay including random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        let bound = Self::jitter_bound(delay);
        if bound.is_zero() {
            return delay;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=bound.as_millis() as u64);
        delay + Duration::from_millis(jitter_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_capped() {
        let backoff = Backoff::new(Duration::from_secs(60), Duration::from_secs(900));
        assert_eq!(backoff.base_delay(1), Duration::from_secs(60));
        assert_eq!(backoff.base_delay(2), Duration::from_secs(120));
        assert_eq!(backoff.base_delay(3), Duration::from_secs(240));
        assert_eq!(backoff.base_delay(5), Duration::from_secs(900));
        assert_eq!(backoff.base_delay(64), Duration::from_secs(900));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let backoff = Backoff::new(Duration::from_secs(60), Duration::from_secs(900));
        for attempt in 1..=6 {
            let base = backoff.base_delay(attempt);
            let delay = backoff.delay(attempt);
            assert!(delay >= base);
            assert!(delay <= base + Backoff::jitter_bound(base));
        }
        assert_eq!(Backoff::jitter_bound(Duration::from_secs(900)), MAX_JITTER);
        assert_eq!(Backoff::jitter_bound(Duration::from_secs(60)), Duration::from_secs(6));
    }

    #[test]
    fn test_zero_base_means_no_delay() {
        let backoff = Backoff::new(Duration::ZERO, Duration::from_secs(10));
        assert_eq!(backoff.delay(3), Duration::ZERO);
    }
}
