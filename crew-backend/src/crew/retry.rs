use crate::error::BackendError;
use rand::Rng;
use std::time::Duration;

/// Upper bound for any single backoff delay
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Bounded retry with exponential backoff for backend calls
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Add up to 10% random jitter to each delay
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: MAX_DELAY,
            jitter: true,
        }
    }

    /// Retry without sleeping between attempts
    pub fn no_delay(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Whether a failed attempt (1-based) should be followed by another
    pub fn should_retry(&self, attempt: u32, error: &BackendError) -> bool {
        error.is_transient() && attempt < self.max_attempts
    }

    /// Delay after the given failed attempt (1-based).
    ///
    /// Doubles from `base_delay` per attempt and is capped at `max_delay`.
    /// A provider `Retry-After` hint wins when it is longer, but is still capped.
    pub fn delay_for(&self, attempt: u32, error: &BackendError) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let mut delay = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        if let Some(secs) = error.retry_after_secs() {
            delay = delay.max(Duration::from_secs(secs)).min(self.max_delay);
        }

        if self.jitter && !delay.is_zero() {
            let extra = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 10);
            delay += Duration::from_millis(extra);
        }
        delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            jitter: false,
            ..RetryPolicy::new(5, Duration::from_millis(500))
        }
    }

    #[test]
    fn test_exponential_delays_are_capped() {
        let policy = policy();
        let err = BackendError::Timeout(120);
        assert_eq!(policy.delay_for(1, &err), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2, &err), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3, &err), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(10, &err), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_after_hint_is_honored() {
        let policy = policy();
        let err = BackendError::RateLimited { retry_after_secs: Some(4) };
        assert_eq!(policy.delay_for(1, &err), Duration::from_secs(4));

        let err = BackendError::RateLimited { retry_after_secs: Some(600) };
        assert_eq!(policy.delay_for(1, &err), Duration::from_secs(30));
    }

    #[test]
    fn test_should_retry_respects_budget_and_transience() {
        let policy = RetryPolicy::no_delay(3);
        let transient = BackendError::Network("reset".into());
        assert!(policy.should_retry(1, &transient));
        assert!(policy.should_retry(2, &transient));
        assert!(!policy.should_retry(3, &transient));

        let permanent = BackendError::Api { status: 401, message: "bad key".into() };
        assert!(!policy.should_retry(1, &permanent));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1000));
        let err = BackendError::Timeout(1);
        for _ in 0..20 {
            let delay = policy.delay_for(1, &err);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(1100));
        }
    }
}
