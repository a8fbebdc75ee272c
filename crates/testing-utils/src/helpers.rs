//! Test helper utilities and common testing patterns

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;

/// Test environment setup utilities
pub struct TestEnv;

impl TestEnv {
    /// Polls `condition` every 20ms until it holds or `timeout` elapses.
    pub async fn wait_for<F, Fut>(condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        Self::wait_for_with_interval(condition, timeout, Duration::from_millis(20)).await
    }

    pub async fn wait_for_with_interval<F, Fut>(
        mut condition: F,
        timeout: Duration,
        poll_interval: Duration,
    ) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(poll_interval).await;
        }
        condition().await
    }

    /// Generate unique test names based on timestamp
    pub fn unique_name(prefix: &str) -> String {
        let timestamp = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        format!("{prefix}_{timestamp}")
    }

    /// Set up logging for tests; safe to call from every test.
    pub fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("debug")
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_wait_for_returns_when_condition_holds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let ok = TestEnv::wait_for(
            move || {
                let counter = counter.clone();
                async move { counter.fetch_add(1, Ordering::SeqCst) >= 2 }
            },
            Duration::from_secs(1),
        )
        .await;
        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        assert!(!TestEnv::wait_for(|| async { false }, Duration::from_millis(50)).await);
    }

    #[test]
    fn test_unique_name_has_prefix() {
        assert!(TestEnv::unique_name("job").starts_with("job_"));
    }
}
