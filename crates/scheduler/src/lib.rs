//! Tier-isolated execution of admitted work.
//!
//! Every identity is classified into a [`PriorityTier`]; each tier owns a
//! separate [`WorkerPool`] sized from configuration. A flood of LOW work
//! fills the LOW pool only, so VIP and HIGH submissions keep their own
//! workers and queues.

pub mod error;
pub mod pool;
pub mod tier;

pub use error::{SchedulerError, SchedulerResult};
pub use pool::{PoolStatus, WorkerPool};
pub use tier::{ModuloClassifier, PriorityTier, TierClassifier};

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};
use turnstile_common::{Identity, SchedulerConfig, TurnstileResult};

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub total_workers: usize,
    pub pools: BTreeMap<PriorityTier, PoolStatus>,
}

pub struct PriorityScheduler {
    classifier: Arc<dyn TierClassifier>,
    pools: BTreeMap<PriorityTier, WorkerPool>,
}

impl PriorityScheduler {
    /// Build one pool per tier. Must be called inside a Tokio runtime.
    pub fn new(config: &SchedulerConfig, classifier: Arc<dyn TierClassifier>) -> TurnstileResult<Self> {
        config.validate()?;

        let pools = PriorityTier::ALL
            .into_iter()
            .map(|tier| {
                let workers = match tier {
                    PriorityTier::Vip => config.tiers.vip,
                    PriorityTier::High => config.tiers.high,
                    PriorityTier::Normal => config.tiers.normal,
                    PriorityTier::Low => config.tiers.low,
                };
                (tier, WorkerPool::new(tier, workers, config.queue_depth))
            })
            .collect();

        info!(total_workers = config.tiers.total(), "priority scheduler started");

        Ok(Self { classifier, pools })
    }

    /// Scheduler using [`ModuloClassifier`] with the given admins as VIP.
    pub fn with_admins(config: &SchedulerConfig, admins: &[Identity]) -> TurnstileResult<Self> {
        Self::new(config, Arc::new(ModuloClassifier::from_config(admins, config)))
    }

    pub fn classify(&self, identity: Identity) -> PriorityTier {
        self.classifier.classify(identity)
    }

    pub fn pool(&self, tier: PriorityTier) -> Option<&WorkerPool> {
        self.pools.get(&tier)
    }

    fn pool_for(&self, identity: Identity) -> SchedulerResult<&WorkerPool> {
        let tier = self.classify(identity);
        self.pools
            .get(&tier)
            .ok_or(SchedulerError::PoolShutDown(tier))
    }

    /// Run `task` on the pool of `identity`'s tier and wait for its result.
    pub async fn submit<F, Fut, T>(&self, identity: Identity, task: F) -> SchedulerResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool_for(identity)?;
        debug!(identity, tier = %pool.tier(), "submitting task");
        pool.submit(task).await
    }

    pub async fn submit_blocking<F, T>(&self, identity: Identity, task: F) -> SchedulerResult<T>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool_for(identity)?;
        debug!(identity, tier = %pool.tier(), "submitting blocking task");
        pool.submit_blocking(task).await
    }

    pub fn status(&self) -> SchedulerStatus {
        let pools: BTreeMap<_, _> = self
            .pools
            .iter()
            .map(|(tier, pool)| (*tier, pool.status()))
            .collect();
        SchedulerStatus {
            total_workers: pools.values().map(|p| p.workers).sum(),
            pools,
        }
    }

    /// Shut every pool down, letting queued work finish.
    pub async fn shutdown(&self) {
        for pool in self.pools.values() {
            pool.shutdown().await;
        }
        info!("priority scheduler shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use turnstile_common::TierCapacities;

    fn small_config() -> SchedulerConfig {
        SchedulerConfig {
            tiers: TierCapacities {
                vip: 1,
                high: 1,
                normal: 2,
                low: 2,
            },
            queue_depth: 4,
            high_every: 100,
            normal_every: 10,
        }
    }

    #[tokio::test]
    async fn routes_by_tier() {
        let scheduler = PriorityScheduler::with_admins(&small_config(), &[1]).unwrap();

        assert_eq!(scheduler.classify(1), PriorityTier::Vip);
        assert_eq!(scheduler.classify(200), PriorityTier::High);
        assert_eq!(scheduler.classify(20), PriorityTier::Normal);
        assert_eq!(scheduler.classify(21), PriorityTier::Low);

        scheduler.submit(1, || async { Ok(()) }).await.unwrap();
        scheduler.submit(21, || async { Ok(()) }).await.unwrap();
        scheduler.submit(21, || async { Ok(()) }).await.unwrap();

        let status = scheduler.status();
        assert_eq!(status.total_workers, 6);
        assert_eq!(status.pools[&PriorityTier::Vip].completed, 1);
        assert_eq!(status.pools[&PriorityTier::Low].completed, 2);
        assert_eq!(status.pools[&PriorityTier::Normal].completed, 0);
    }

    /// Poll until `pool` reports exactly `running` busy workers and `queued`
    /// waiting jobs.
    async fn wait_for_load(pool: &WorkerPool, running: usize, queued: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let status = pool.status();
                if status.running == running && status.queued == queued {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("pool never reached the expected load");
    }

    #[tokio::test]
    async fn saturated_low_tier_does_not_block_vip() {
        let scheduler = Arc::new(PriorityScheduler::with_admins(&small_config(), &[1]).unwrap());
        let (hold_tx, hold_rx) = tokio::sync::watch::channel(false);
        let started = Arc::new(AtomicUsize::new(0));

        // Fill both LOW workers, then the whole LOW queue, one job at a time.
        let mut blocked = Vec::new();
        for i in 0..6 {
            let scheduler_ref = Arc::clone(&scheduler);
            let mut hold_rx = hold_rx.clone();
            let started = Arc::clone(&started);
            blocked.push(tokio::spawn(async move {
                scheduler_ref
                    .submit(21, move || async move {
                        started.fetch_add(1, Ordering::SeqCst);
                        let _ = hold_rx.wait_for(|go| *go).await;
                        Ok(())
                    })
                    .await
            }));

            let low = scheduler.pool(PriorityTier::Low).unwrap();
            wait_for_load(low, (i + 1).min(2), (i + 1).saturating_sub(2)).await;
        }
        assert_eq!(started.load(Ordering::SeqCst), 2);

        let overflow = tokio::time::timeout(
            Duration::from_secs(1),
            scheduler.submit(21, || async { Ok(()) }),
        )
        .await
        .expect("a full pool must reject immediately");
        assert!(matches!(
            overflow,
            Err(SchedulerError::PoolExhausted(PriorityTier::Low))
        ));

        let vip = tokio::time::timeout(
            Duration::from_secs(1),
            scheduler.submit(1, || async { Ok("vip done") }),
        )
        .await
        .expect("VIP work must not wait on LOW workers")
        .unwrap();
        assert_eq!(vip, "vip done");

        hold_tx.send(true).unwrap();
        for handle in blocked {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(scheduler.status().pools[&PriorityTier::Low].completed, 6);
    }

    #[tokio::test]
    async fn blocking_submission_uses_identity_tier() {
        let scheduler = PriorityScheduler::with_admins(&small_config(), &[]).unwrap();
        let sum = scheduler
            .submit_blocking(30, || Ok((1..=10).sum::<u32>()))
            .await
            .unwrap();
        assert_eq!(sum, 55);
        assert_eq!(scheduler.status().pools[&PriorityTier::Normal].completed, 1);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let scheduler = PriorityScheduler::with_admins(&small_config(), &[]).unwrap();
        scheduler.shutdown().await;

        let err = scheduler.submit(5, || async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, SchedulerError::PoolShutDown(PriorityTier::Low)));
        assert!(scheduler.status().pools.values().all(|p| p.shut_down));
    }

    #[tokio::test]
    async fn zero_workers_is_rejected() {
        let mut config = small_config();
        config.tiers.high = 0;
        assert!(PriorityScheduler::with_admins(&config, &[]).is_err());
    }
}
