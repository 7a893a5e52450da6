//! Reconnect policy: bounded retries with capped exponential backoff.

use std::time::Duration;

/// Default retry ceiling since the last successful connect.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;
/// Delay before the first reconnect.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(3);
/// Upper bound for any reconnect delay.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub cap_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            base_delay: DEFAULT_BACKOFF_BASE,
            cap_delay: DEFAULT_BACKOFF_CAP,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based):
    /// `min(base * 2^(attempt-1), cap)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.cap_delay)
            .min(self.cap_delay)
    }

    /// Whether another reconnect may be scheduled given the attempts already made.
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule() {
        let p = ReconnectPolicy::default();
        assert_eq!(p.delay_for(1), Duration::from_secs(3));
        assert_eq!(p.delay_for(2), Duration::from_secs(6));
        assert_eq!(p.delay_for(3), Duration::from_secs(12));
        assert_eq!(p.delay_for(4), Duration::from_secs(24));
        assert_eq!(p.delay_for(5), Duration::from_secs(30));
        assert_eq!(p.delay_for(50), Duration::from_secs(30));
    }

    #[test]
    fn delays_are_non_decreasing() {
        let p = ReconnectPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(250),
            cap_delay: Duration::from_secs(5),
        };
        let delays: Vec<Duration> = (1..=40).map(|k| p.delay_for(k)).collect();
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert!(delays.iter().all(|d| *d <= p.cap_delay));
    }

    #[test]
    fn attempt_zero_uses_base() {
        let p = ReconnectPolicy::default();
        assert_eq!(p.delay_for(0), p.base_delay);
    }

    #[test]
    fn retry_ceiling() {
        let p = ReconnectPolicy::default();
        assert!(p.allows_retry(0));
        assert!(p.allows_retry(2));
        assert!(!p.allows_retry(3));
        assert!(!p.allows_retry(4));
    }
}
