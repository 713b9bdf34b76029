//! Bounded background pools.
//!
//! A [`WorkerPool`] is a tokio runtime handle plus a semaphore. Tasks wait for a
//! permit inside the spawned future, so submission never blocks the caller and
//! at most `size` bodies run at once. Panics in a task are contained by tokio
//! and never take the pool down.

use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::Result;

#[derive(Clone)]
pub struct WorkerPool {
    name: Arc<str>,
    handle: Handle,
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool on the current tokio runtime.
    pub fn new(name: &str, size: usize) -> Result<Self> {
        Ok(Self::with_handle(name, size, Handle::try_current()?))
    }

    pub fn with_handle(name: &str, size: usize, handle: Handle) -> Self {
        let size = size.max(1);
        Self {
            name: Arc::from(name),
            handle,
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Tasks currently holding a permit.
    pub fn active(&self) -> usize {
        self.size - self.permits.available_permits()
    }

    pub fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let name = Arc::clone(&self.name);
        self.handle.spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::warn!(pool = %name, "Pool closed, dropping task");
                    return;
                }
            };
            task.await;
        })
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_bounds_concurrency() {
        let pool = WorkerPool::new("test", 2).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(pool.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_poison_pool() {
        let pool = WorkerPool::new("test", 1).unwrap();
        let result = pool.spawn(async { panic!("boom") }).await;
        assert!(result.is_err());

        let (tx, rx) = tokio::sync::oneshot::channel();
        pool.spawn(async move {
            let _ = tx.send(7);
        });
        assert_eq!(rx.await.unwrap(), 7);
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        assert!(WorkerPool::new("test", 1).is_err());
    }
}
