//! Where background work runs.
//!
//! Moderation and concurrent tool calls are handed to a [`TaskExecutor`]
//! injected at service build time. The default is a [`WorkerPool`] owned
//! by the service and bounded by a semaphore.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{Semaphore, oneshot};

/// Runs detached futures.
pub trait TaskExecutor: Send + Sync + fmt::Debug {
    /// Schedule `task`. It must eventually be polled to completion.
    fn execute(&self, task: BoxFuture<'static, ()>);
}

/// A shared, thread-safe [`TaskExecutor`] trait object.
pub type SharedTaskExecutor = Arc<dyn TaskExecutor>;

/// Tokio-backed pool running at most `size` tasks at a time.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool with `size` slots (at least one).
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Number of slots.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }
}

impl TaskExecutor for WorkerPool {
    fn execute(&self, task: BoxFuture<'static, ()>) {
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            // The semaphore is never closed.
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            task.await;
        });
    }
}

/// Handle to the output of a submitted task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Wait for the output. `None` if the task was dropped before finishing.
    pub async fn join(self) -> Option<T> {
        self.rx.await.ok()
    }
}

/// Run `fut` on `executor` and get a handle to its output.
pub fn submit<F>(executor: &dyn TaskExecutor, fut: F) -> TaskHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    executor.execute(Box::pin(async move {
        let _ = tx.send(fut.await);
    }));
    TaskHandle { rx }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn submit_returns_output() {
        let pool = WorkerPool::new(2);
        let handle = submit(&pool, async { 40 + 2 });
        assert_eq!(handle.join().await, Some(42));
    }

    #[tokio::test]
    async fn zero_size_is_clamped() {
        assert_eq!(WorkerPool::new(0).size(), 1);
    }

    #[tokio::test]
    async fn bounds_concurrency() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                submit(&pool, async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
