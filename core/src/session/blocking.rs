//! Bounded pool for blocking socket calls

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::protocol::constants::BLOCKING_POOL_SIZE;
use crate::{Error, Result};

/// Runs blocking closures on tokio's blocking threads, at most `size` at a time.
///
/// Meant for calls that return on their own, such as Bluetooth connect and
/// accept. A job holds its permit until it finishes, so loops that run for a
/// socket's lifetime belong on their own blocking thread instead.
#[derive(Debug, Clone)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl Default for BlockingPool {
    fn default() -> Self {
        Self::new(BLOCKING_POOL_SIZE)
    }
}

impl BlockingPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers not currently running a job
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `job` once a worker is free and wait for its result
    pub async fn run<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Transport("blocking pool closed".to_string()))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|e| Error::Transport(format!("blocking task failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_returns_value() {
        let pool = BlockingPool::new(2);
        assert_eq!(pool.run(|| 40 + 2).await.unwrap(), 42);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = BlockingPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let jobs = (0..6).map(|_| {
            let pool = pool.clone();
            let running = running.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                pool.run(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            })
        });
        for job in jobs.collect::<Vec<_>>() {
            job.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
