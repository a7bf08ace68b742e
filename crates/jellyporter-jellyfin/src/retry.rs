use std::time::Duration;

/// Exponential-backoff retry policy for requests against a Jellyfin server.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry `attempt` (1-based), doubling per attempt and
    /// capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exp = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt - 1));
        exp.min(self.max_backoff)
    }

    /// Transient upstream conditions worth another attempt.
    pub fn should_retry_status(&self, status: u16) -> bool {
        status == 429 || (500..=599).contains(&status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::ZERO);
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_secs(1));
        assert_eq!(policy.backoff(3), Duration::from_secs(2));
        assert_eq!(policy.backoff(10), Duration::from_secs(15));
    }

    #[test]
    fn retries_on_throttling_and_server_errors_only() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry_status(429));
        assert!(policy.should_retry_status(500));
        assert!(policy.should_retry_status(503));
        assert!(!policy.should_retry_status(200));
        assert!(!policy.should_retry_status(404));
        assert!(!policy.should_retry_status(401));
    }
}
