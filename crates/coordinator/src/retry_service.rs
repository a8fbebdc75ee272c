use std::time::Duration;

use orchestrator_core::{config::RetryConfig, errors::FailureKind, models::Task};
use tracing::debug;

/// Retry decisions for failed tasks.
#[derive(Debug, Clone, Default)]
pub struct RetryService {
    config: RetryConfig,
}

impl RetryService {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Retry budget of the task: its own `retry_limit`, else the default.
    pub fn limit(&self, task: &Task) -> u32 {
        task.spec.retry_limit.unwrap_or(self.config.default_limit)
    }

    pub fn is_retryable(&self, kind: Option<FailureKind>) -> bool {
        match kind {
            Some(FailureKind::Unsupported) | Some(FailureKind::Cancelled) => false,
            Some(FailureKind::Timeout) => self.config.retry_on_timeout,
            Some(FailureKind::Execution) | Some(FailureKind::Infrastructure) | None => true,
        }
    }

    /// Whether a task that just failed with `kind` gets another attempt.
    pub fn should_retry(&self, task: &Task, kind: Option<FailureKind>) -> bool {
        let limit = self.limit(task);
        let retry = self.is_retryable(kind) && task.retry_count < limit;
        debug!(
            task_id = %task.id,
            retry_count = task.retry_count,
            limit,
            ?kind,
            retry,
            "retry decision"
        );
        retry
    }

    /// Delay before the attempt following `retry_count` earlier retries.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let backoff = &self.config.backoff;
        let base = backoff.initial_interval_ms as f64;
        let max = backoff.max_interval_ms as f64;

        let exponential = base * backoff.multiplier.powi(retry_count.min(63) as i32);
        let capped = exponential.min(max);
        let jitter = capped * backoff.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let millis = (capped + jitter).clamp(0.0, max);

        Duration::from_millis(millis as u64)
    }
}

#[cfg(test)]
mod tests {
    use orchestrator_core::{config::BackoffConfig, models::TaskSpec};

    use super::*;

    fn failed_task(retry_limit: Option<u32>, retry_count: u32) -> Task {
        let mut spec = TaskSpec::new("t");
        spec.retry_limit = retry_limit;
        let mut task = Task::new("job", 0, spec);
        task.retry_count = retry_count;
        task
    }

    #[test]
    fn test_budget_prefers_task_limit() {
        let service = RetryService::new(RetryConfig {
            default_limit: 1,
            ..Default::default()
        });
        assert_eq!(service.limit(&failed_task(Some(3), 0)), 3);
        assert_eq!(service.limit(&failed_task(None, 0)), 1);

        let kind = Some(FailureKind::Execution);
        assert!(service.should_retry(&failed_task(Some(2), 1), kind));
        assert!(!service.should_retry(&failed_task(Some(2), 2), kind));
    }

    #[test]
    fn test_failure_kinds() {
        let service = RetryService::new(RetryConfig {
            default_limit: 5,
            retry_on_timeout: false,
            backoff: BackoffConfig::immediate(),
        });
        let task = failed_task(None, 0);
        assert!(!service.should_retry(&task, Some(FailureKind::Unsupported)));
        assert!(!service.should_retry(&task, Some(FailureKind::Cancelled)));
        assert!(!service.should_retry(&task, Some(FailureKind::Timeout)));
        assert!(service.should_retry(&task, Some(FailureKind::Infrastructure)));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let service = RetryService::new(RetryConfig {
            backoff: BackoffConfig {
                initial_interval_ms: 100,
                max_interval_ms: 1_000,
                multiplier: 2.0,
                jitter_factor: 0.0,
            },
            ..Default::default()
        });
        assert_eq!(service.backoff(0), Duration::from_millis(100));
        assert_eq!(service.backoff(2), Duration::from_millis(400));
        assert_eq!(service.backoff(10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let service = RetryService::new(RetryConfig::default());
        for _ in 0..100 {
            let delay = service.backoff(0).as_millis();
            assert!((900..=1_100).contains(&delay), "{delay}");
        }
        assert_eq!(
            RetryService::new(RetryConfig {
                backoff: BackoffConfig::immediate(),
                ..Default::default()
            })
            .backoff(3),
            Duration::ZERO
        );
    }
}
