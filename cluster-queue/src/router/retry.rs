//! Backoff schedule for router sends that are retried after a failure.

use std::time::Duration;

/// Exponential backoff with an optional cap and a fixed retry budget.
///
/// Attempts are counted from 1: `retry_interval(1)` is the wait before the
/// first retry, after the initial send failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff_coefficient: u32,
    pub initial_interval: Duration,
    pub maximum_interval: Option<Duration>,
    /// Zero disables retrying.
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn build(backoff_coefficient: u32, initial_interval: Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    pub fn retry_interval(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_coefficient
            .saturating_pow(attempt.saturating_sub(1));
        let interval = self.initial_interval.saturating_mul(factor);
        self.maximum_interval
            .map_or(interval, |cap| interval.min(cap))
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    /// Every wait the policy allows, in order.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_retries).map(|attempt| self.retry_interval(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: Duration::from_secs(1),
            maximum_interval: None,
            max_retries: 3,
        }
    }
}

pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: Duration) -> Self {
        Self {
            policy: RetryPolicy {
                backoff_coefficient,
                initial_interval,
                ..RetryPolicy::default()
            },
        }
    }

    pub fn maximum_interval(mut self, interval: Duration) -> Self {
        self.policy.maximum_interval = Some(interval);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.policy.max_retries = retries;
        self
    }

    pub fn provide(&self) -> RetryPolicy {
        self.policy.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coefficient_of_one_keeps_interval_constant() {
        let policy = RetryPolicy::build(1, Duration::from_millis(200))
            .max_retries(3)
            .provide();
        assert!(policy.schedule().all(|d| d == Duration::from_millis(200)));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::build(2, Duration::from_millis(100))
            .maximum_interval(Duration::from_millis(300))
            .max_retries(4)
            .provide();
        assert_eq!(
            policy.schedule().collect::<Vec<_>>(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
                Duration::from_millis(300),
            ]
        );
    }

    #[test]
    fn test_budget_counts_retries_after_first_send() {
        let policy = RetryPolicy::build(2, Duration::from_millis(10))
            .max_retries(2)
            .provide();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));

        let disabled = RetryPolicy::build(2, Duration::from_millis(10))
            .max_retries(0)
            .provide();
        assert!(!disabled.should_retry(1));
        assert_eq!(disabled.schedule().count(), 0);
    }
}
