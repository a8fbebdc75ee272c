use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Keyed async locks serializing all events of one job.
#[derive(Debug, Default)]
pub struct JobLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl JobLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, job_id: &str) -> JobGuard {
        let mutex = self
            .locks
            .entry(job_id.to_string())
            .or_default()
            .value()
            .clone();
        let guard = mutex.lock_owned().await;
        JobGuard {
            locks: self.locks.clone(),
            job_id: job_id.to_string(),
            _guard: guard,
        }
    }

    /// Number of jobs with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Held for the duration of one job event. The map entry is dropped with
/// the last holder.
pub struct JobGuard {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    job_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        // One reference in the map, one in `_guard`; anything more is a waiter.
        self.locks
            .remove_if(&self.job_id, |_, mutex| Arc::strong_count(mutex) <= 2);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_same_job_is_serialized() {
        let locks = Arc::new(JobLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                tokio::spawn(async move {
                    let _guard = locks.lock("job-1").await;
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_jobs_do_not_block() {
        let locks = JobLocks::new();
        let _a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("b")).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }
}
