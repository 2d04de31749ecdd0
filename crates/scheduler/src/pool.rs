use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::tier::PriorityTier;

type JobFuture = Pin<Box<dyn Future<Output = bool> + Send>>;

/// Queued unit of work. Resolves to `true` when the task succeeded.
type Job = Box<dyn FnOnce() -> JobFuture + Send>;

#[derive(Default)]
struct PoolStats {
    queued: AtomicUsize,
    running: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub tier: PriorityTier,
    pub workers: usize,
    pub queue_depth: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub shut_down: bool,
}

/// A fixed set of workers draining one bounded job queue.
///
/// At most `workers` jobs run at once; at most `queue_depth` wait. Pools
/// never share workers, so a saturated pool cannot delay another pool's
/// queue.
pub struct WorkerPool {
    tier: PriorityTier,
    workers: usize,
    queue_depth: usize,
    sender: RwLock<Option<mpsc::Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<PoolStats>,
}

impl WorkerPool {
    /// Spawn the pool's workers on the current Tokio runtime.
    pub fn new(tier: PriorityTier, workers: usize, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue_depth);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let stats = Arc::new(PoolStats::default());

        let handles = (0..workers)
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let stats = Arc::clone(&stats);
                tokio::spawn(worker_loop(tier, worker, rx, stats))
            })
            .collect();

        info!(tier = %tier, workers, queue_depth, "worker pool started");

        Self {
            tier,
            workers,
            queue_depth,
            sender: RwLock::new(Some(tx)),
            handles: Mutex::new(handles),
            stats,
        }
    }

    pub fn tier(&self) -> PriorityTier {
        self.tier
    }

    /// Run an async task on this pool and wait for its result.
    pub async fn submit<F, Fut, T>(&self, task: F) -> SchedulerResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || -> JobFuture {
            Box::pin(async move {
                let result = task().await;
                let ok = result.is_ok();
                let _ = tx.send(result);
                ok
            })
        });

        self.enqueue(job)?;

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(SchedulerError::Task(e)),
            // The job was dropped without reporting: it panicked.
            Err(_) => Err(SchedulerError::TaskPanicked(self.tier)),
        }
    }

    /// Run a blocking closure on this pool. The closure executes on Tokio's
    /// blocking threads while occupying one of this pool's workers.
    pub async fn submit_blocking<F, T>(&self, task: F) -> SchedulerResult<T>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(move || async move {
            match tokio::task::spawn_blocking(task).await {
                Ok(result) => result,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => Err(anyhow::anyhow!("blocking task cancelled: {}", e)),
            }
        })
        .await
    }

    fn enqueue(&self, job: Job) -> SchedulerResult<()> {
        let sender = match self.sender.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let Some(sender) = sender else {
            return Err(SchedulerError::PoolShutDown(self.tier));
        };

        self.stats.queued.fetch_add(1, Ordering::SeqCst);
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.queued.fetch_sub(1, Ordering::SeqCst);
                warn!(tier = %self.tier, queue_depth = self.queue_depth, "worker pool exhausted");
                Err(SchedulerError::PoolExhausted(self.tier))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.queued.fetch_sub(1, Ordering::SeqCst);
                Err(SchedulerError::PoolShutDown(self.tier))
            }
        }
    }

    pub fn status(&self) -> PoolStatus {
        let shut_down = match self.sender.read() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        };
        PoolStatus {
            tier: self.tier,
            workers: self.workers,
            queue_depth: self.queue_depth,
            queued: self.stats.queued.load(Ordering::SeqCst),
            running: self.stats.running.load(Ordering::SeqCst),
            completed: self.stats.completed.load(Ordering::SeqCst),
            failed: self.stats.failed.load(Ordering::SeqCst),
            shut_down,
        }
    }

    /// Stop accepting work, let queued jobs finish, and join the workers.
    pub async fn shutdown(&self) {
        let sender = match self.sender.write() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);

        let handles = match self.handles.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(tier = %self.tier, error = %e, "worker exited abnormally");
            }
        }

        info!(tier = %self.tier, "worker pool shut down");
    }
}

async fn worker_loop(
    tier: PriorityTier,
    worker: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    stats: Arc<PoolStats>,
) {
    debug!(tier = %tier, worker, "worker started");

    loop {
        let job = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            break;
        };

        stats.queued.fetch_sub(1, Ordering::SeqCst);
        stats.running.fetch_add(1, Ordering::SeqCst);

        // Spawned so a panicking task cannot take the worker down with it.
        let outcome = tokio::spawn(job()).await;

        stats.running.fetch_sub(1, Ordering::SeqCst);
        match outcome {
            Ok(true) => {
                stats.completed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(false) => {
                stats.failed.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::SeqCst);
                warn!(tier = %tier, worker, error = %e, "task panicked");
            }
        }
    }

    debug!(tier = %tier, worker, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn runs_task_and_returns_value() {
        let pool = WorkerPool::new(PriorityTier::Normal, 2, 8);
        let value = pool.submit(|| async { Ok(7 * 6) }).await.unwrap();
        assert_eq!(value, 42);

        let status = pool.status();
        assert_eq!(status.completed, 1);
        assert_eq!(status.queued, 0);
        assert_eq!(status.running, 0);
    }

    #[tokio::test]
    async fn task_errors_propagate() {
        let pool = WorkerPool::new(PriorityTier::Low, 1, 8);
        let err = pool
            .submit(|| async { Err::<(), _>(anyhow::anyhow!("download failed")) })
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Task(_)));
        assert!(err.to_string().contains("download failed"));
        assert_eq!(pool.status().failed, 1);
    }

    #[tokio::test]
    async fn panics_are_reported_and_pool_survives() {
        let pool = WorkerPool::new(PriorityTier::High, 1, 8);
        let err = pool
            .submit(|| async {
                if true {
                    panic!("boom");
                }
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::TaskPanicked(PriorityTier::High)));

        // The single worker is still alive.
        assert_eq!(pool.submit(|| async { Ok(1) }).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn blocking_tasks_run() {
        let pool = WorkerPool::new(PriorityTier::Normal, 1, 4);
        let value = pool
            .submit_blocking(|| {
                std::thread::sleep(Duration::from_millis(5));
                Ok("done")
            })
            .await
            .unwrap();
        assert_eq!(value, "done");

        let err = pool
            .submit_blocking(|| -> anyhow::Result<()> { panic!("blocking boom") })
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::TaskPanicked(_)));
    }

    #[tokio::test]
    async fn full_queue_is_reported() {
        let pool = Arc::new(WorkerPool::new(PriorityTier::Low, 1, 1));
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);

        // One job occupies the worker, a second fills the queue.
        let mut pending = Vec::new();
        for _ in 0..2 {
            let pool = Arc::clone(&pool);
            let mut release_rx = release_rx.clone();
            pending.push(tokio::spawn(async move {
                pool.submit(move || async move {
                    let _ = release_rx.wait_for(|released| *released).await;
                    Ok(())
                })
                .await
            }));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let err = pool.submit(|| async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, SchedulerError::PoolExhausted(PriorityTier::Low)));
        assert!(err.is_pool_error());

        release_tx.send(true).unwrap();
        for handle in pending {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn shutdown_drains_then_rejects() {
        let pool = Arc::new(WorkerPool::new(PriorityTier::Vip, 1, 8));

        let queued = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.submit(|| async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok("drained")
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        pool.shutdown().await;
        assert_eq!(queued.await.unwrap().unwrap(), "drained");

        let err = pool.submit(|| async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, SchedulerError::PoolShutDown(PriorityTier::Vip)));
        assert!(pool.status().shut_down);
    }
}
