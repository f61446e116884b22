//! Retry with exponential backoff for response generator calls

use std::time::{Duration, SystemTime};

/// Retry policy for the response generator
///
/// Controls how many times a failed request is retried and how
/// long to wait between attempts using exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first call
    pub max_retries: u32,
    /// Base delay between retries (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Default backoff with `max_retries` retries
    #[must_use]
    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }
}

/// Whether an HTTP status from the generator is worth retrying
///
/// Rate limits (429) and server errors (5xx) are transient.
#[must_use]
pub fn is_recoverable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Compute the delay before the next retry attempt.
///
/// Exponential backoff: `min(base_delay * 2^attempt + jitter, max_delay)`.
/// Jitter is 0-25% of the computed delay, derived from `SystemTime`.
#[must_use]
pub fn delay_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt));
    let base = base.min(policy.max_delay);

    let jitter_nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();

    let jitter_fraction = f64::from(jitter_nanos % 250) / 1000.0;
    let jitter = base.mul_f64(jitter_fraction);

    (base + jitter).min(policy.max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_statuses() {
        assert!(is_recoverable_status(429));
        assert!(is_recoverable_status(503));
        assert!(!is_recoverable_status(400));
        assert!(!is_recoverable_status(401));
    }

    #[test]
    fn delay_grows_and_is_capped() {
        let policy = RetryPolicy::default();

        let first = delay_for_attempt(&policy, 0);
        assert!(first >= Duration::from_millis(200));
        assert!(first <= Duration::from_millis(250));

        let third = delay_for_attempt(&policy, 2);
        assert!(third >= Duration::from_millis(800));

        let huge = delay_for_attempt(&policy, 30);
        assert_eq!(huge, policy.max_delay);
    }
}
