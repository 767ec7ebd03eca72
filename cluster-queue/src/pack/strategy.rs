use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use uuid::Uuid;

use super::context::PackResult;
use crate::discovery::{ProcessingStrategyConfig, ProcessingStrategyType};
use crate::msg::QueueMsg;

pub enum ProcessingDecision<T> {
    /// Stop processing the pack and commit its offsets.
    Commit,
    /// Run the given messages again after `pause`, within the same poll cycle.
    Reprocess {
        messages: Vec<(Uuid, Arc<QueueMsg<T>>)>,
        pause: Duration,
    },
}

impl<T> ProcessingDecision<T> {
    pub fn is_commit(&self) -> bool {
        matches!(self, ProcessingDecision::Commit)
    }
}

/// Decides, after each attempt of a pack, whether to commit or retry.
///
/// One instance lives for the duration of a single pack since it counts
/// attempts.
pub struct ProcessingStrategy {
    queue: String,
    strategy_type: ProcessingStrategyType,
    retry_succeeded: bool,
    retry_failed: bool,
    retry_timed_out: bool,
    max_retries: u32,
    max_failure_share: f64,
    pause: Duration,
    max_pause: Duration,
    retry_count: u32,
    initial_total: usize,
}

impl ProcessingStrategy {
    pub fn new(queue: impl Into<String>, config: &ProcessingStrategyConfig) -> Self {
        let (retry_succeeded, retry_failed, retry_timed_out) = match config.strategy_type {
            ProcessingStrategyType::SkipAllFailures
            | ProcessingStrategyType::SkipAllFailuresAndTimedOut => (false, false, false),
            ProcessingStrategyType::RetryAll => (true, true, true),
            ProcessingStrategyType::RetryFailed => (false, true, false),
            ProcessingStrategyType::RetryTimedOut => (false, false, true),
            ProcessingStrategyType::RetryFailedAndTimedOut => (false, true, true),
        };
        Self {
            queue: queue.into(),
            strategy_type: config.strategy_type,
            retry_succeeded,
            retry_failed,
            retry_timed_out,
            max_retries: config.retries,
            max_failure_share: config.failure_percentage / 100.0,
            pause: config.pause_between_retries,
            max_pause: config.max_pause_between_retries,
            retry_count: 0,
            initial_total: 0,
        }
    }

    pub fn strategy_type(&self) -> ProcessingStrategyType {
        self.strategy_type
    }

    /// Whether handlers of timed-out messages are abandoned when the pack
    /// deadline passes. Strategies that resubmit timed-out messages always
    /// abandon the previous attempt; `SkipAllFailures` and `RetryFailed` let
    /// it finish in the background.
    pub fn skip_timed_out(&self) -> bool {
        self.strategy_type == ProcessingStrategyType::SkipAllFailuresAndTimedOut
            || self.retry_timed_out
    }

    fn is_skip(&self) -> bool {
        !(self.retry_failed || self.retry_timed_out)
    }

    /// Exponential pause, doubling from `pause` per retry up to `max_pause`.
    fn next_pause(&self) -> Duration {
        if self.pause.is_zero() {
            return Duration::ZERO;
        }
        let ceiling = self.max_pause.max(self.pause);
        let factor = 2u32.saturating_pow(self.retry_count.saturating_sub(1));
        self.pause.saturating_mul(factor).min(ceiling)
    }

    pub fn analyze<T>(&mut self, result: &PackResult<T>) -> ProcessingDecision<T> {
        if result.is_success() {
            return ProcessingDecision::Commit;
        }
        if self.is_skip() {
            debug!(
                queue = %self.queue,
                failed = result.failed.len(),
                timed_out = result.timed_out.len(),
                "Skipping failed and timed out messages"
            );
            return ProcessingDecision::Commit;
        }

        if self.retry_count == 0 {
            self.initial_total = result.total();
        }
        self.retry_count += 1;

        let failed = (result.failed.len() + result.timed_out.len()) as f64;
        if self.max_retries > 0 && self.retry_count > self.max_retries {
            info!(queue = %self.queue, retries = self.max_retries, "Skip reprocess of the pack: max allowed retries reached");
            return ProcessingDecision::Commit;
        }
        if self.max_failure_share > 0.0
            && self.initial_total > 0
            && failed / self.initial_total as f64 > self.max_failure_share
        {
            info!(
                queue = %self.queue,
                failure_share = failed / self.initial_total as f64,
                "Skip reprocess of the pack: max allowed failure percentage reached"
            );
            return ProcessingDecision::Commit;
        }

        let mut messages = Vec::new();
        if self.retry_failed {
            messages.extend(result.failed.iter().map(|(id, m)| (*id, Arc::clone(m))));
        }
        if self.retry_timed_out {
            messages.extend(result.timed_out.iter().map(|(id, m)| (*id, Arc::clone(m))));
        }
        if self.retry_succeeded {
            messages.extend(result.succeeded.iter().map(|(id, m)| (*id, Arc::clone(m))));
        }
        if messages.is_empty() {
            return ProcessingDecision::Commit;
        }

        info!(queue = %self.queue, count = messages.len(), attempt = self.retry_count, "Going to reprocess messages");
        ProcessingDecision::Reprocess {
            messages,
            pause: self.next_pause(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use test_case::test_case;

    fn msg() -> (Uuid, Arc<QueueMsg<u32>>) {
        (Uuid::new_v4(), Arc::new(QueueMsg::new(Uuid::new_v4(), 0)))
    }

    /// One succeeded, one failed, one timed out.
    fn mixed() -> PackResult<u32> {
        let to_map = |m: (Uuid, Arc<QueueMsg<u32>>)| HashMap::from([m]);
        PackResult {
            completed: false,
            succeeded: to_map(msg()),
            failed: to_map(msg()),
            timed_out: to_map(msg()),
            exceptions: HashMap::new(),
        }
    }

    fn config(strategy_type: ProcessingStrategyType) -> ProcessingStrategyConfig {
        ProcessingStrategyConfig {
            strategy_type,
            retries: 3,
            failure_percentage: 0.0,
            pause_between_retries: Duration::ZERO,
            max_pause_between_retries: Duration::ZERO,
        }
    }

    #[test_case(ProcessingStrategyType::SkipAllFailures, 0 ; "skip all failures")]
    #[test_case(ProcessingStrategyType::SkipAllFailuresAndTimedOut, 0 ; "skip failures and timeouts")]
    #[test_case(ProcessingStrategyType::RetryAll, 3 ; "retry all")]
    #[test_case(ProcessingStrategyType::RetryFailed, 1 ; "retry failed")]
    #[test_case(ProcessingStrategyType::RetryTimedOut, 1 ; "retry timed out")]
    #[test_case(ProcessingStrategyType::RetryFailedAndTimedOut, 2 ; "retry failed and timed out")]
    fn test_reprocess_selection(strategy_type: ProcessingStrategyType, expected: usize) {
        let mut strategy = ProcessingStrategy::new("q", &config(strategy_type));
        let result = mixed();
        match strategy.analyze(&result) {
            ProcessingDecision::Commit => assert_eq!(expected, 0),
            ProcessingDecision::Reprocess { messages, .. } => {
                assert_eq!(messages.len(), expected);
                if strategy_type == ProcessingStrategyType::RetryFailed {
                    assert!(result.failed.contains_key(&messages[0].0));
                }
            }
        }
    }

    #[test_case(ProcessingStrategyType::SkipAllFailures, false ; "skip all failures keeps timed out running")]
    #[test_case(ProcessingStrategyType::SkipAllFailuresAndTimedOut, true ; "skip failures and timeouts abandons them")]
    #[test_case(ProcessingStrategyType::RetryAll, true ; "retry all")]
    #[test_case(ProcessingStrategyType::RetryFailed, false ; "retry failed")]
    #[test_case(ProcessingStrategyType::RetryTimedOut, true ; "retry timed out")]
    #[test_case(ProcessingStrategyType::RetryFailedAndTimedOut, true ; "retry failed and timed out")]
    fn test_timed_out_handling(strategy_type: ProcessingStrategyType, skip_timed_out: bool) {
        let strategy = ProcessingStrategy::new("q", &config(strategy_type));
        assert_eq!(strategy.skip_timed_out(), skip_timed_out);
    }

    #[test]
    fn test_success_always_commits() {
        let mut strategy = ProcessingStrategy::new("q", &config(ProcessingStrategyType::RetryAll));
        let result: PackResult<u32> = PackResult {
            completed: true,
            succeeded: HashMap::from([msg()]),
            failed: HashMap::new(),
            timed_out: HashMap::new(),
            exceptions: HashMap::new(),
        };
        assert!(strategy.analyze(&result).is_commit());
    }

    #[test]
    fn test_retry_budget_exhausted_commits() {
        let mut strategy = ProcessingStrategy::new("q", &config(ProcessingStrategyType::RetryFailed));
        let result = mixed();
        for _ in 0..3 {
            assert!(!strategy.analyze(&result).is_commit());
        }
        assert!(strategy.analyze(&result).is_commit());
    }

    #[test]
    fn test_failure_share_above_threshold_commits() {
        let mut cfg = config(ProcessingStrategyType::RetryFailedAndTimedOut);
        cfg.failure_percentage = 50.0;
        let mut strategy = ProcessingStrategy::new("q", &cfg);
        // 2 of 3 failed or timed out
        assert!(strategy.analyze(&mixed()).is_commit());

        cfg.failure_percentage = 80.0;
        let mut strategy = ProcessingStrategy::new("q", &cfg);
        assert!(!strategy.analyze(&mixed()).is_commit());
    }

    #[test]
    fn test_pause_doubles_up_to_max() {
        let mut cfg = config(ProcessingStrategyType::RetryFailed);
        cfg.retries = 0;
        cfg.pause_between_retries = Duration::from_secs(1);
        cfg.max_pause_between_retries = Duration::from_secs(5);
        let mut strategy = ProcessingStrategy::new("q", &cfg);

        let pauses: Vec<Duration> = (0..5)
            .map(|_| match strategy.analyze(&mixed()) {
                ProcessingDecision::Reprocess { pause, .. } => pause,
                ProcessingDecision::Commit => panic!("unlimited retries never commit"),
            })
            .collect();
        assert_eq!(
            pauses,
            vec![1, 2, 4, 5, 5]
                .into_iter()
                .map(Duration::from_secs)
                .collect::<Vec<_>>()
        );
    }
}
