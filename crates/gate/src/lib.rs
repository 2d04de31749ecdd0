//! The admission pipeline: every piece of work passes the rate limiter,
//! then (for commands) the spam limiter, then waits for an execution slot
//! and finally runs on its identity's tier pool.

pub mod metrics;

pub use metrics::GateMetrics;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use turnstile_admission::{AdmissionController, AdmissionError, AdmissionStatus};
use turnstile_common::{AppConfig, Identity, TurnstileResult};
use turnstile_rate_limit::{
    build_limiters, CommandSpamLimiter, CommandUsage, Decision, RateLimiter, RateUsage,
};
use turnstile_scheduler::{PriorityScheduler, PriorityTier, SchedulerError, SchedulerStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    /// Counted by the rate limiter only.
    Request,
    /// Counted by the rate limiter and the command spam limiter.
    Command,
}

#[derive(Debug, Clone)]
pub struct WorkRequest {
    pub identity: Identity,
    pub task_key: String,
    pub kind: WorkKind,
}

impl WorkRequest {
    pub fn request(identity: Identity, task_key: impl Into<String>) -> Self {
        Self {
            identity,
            task_key: task_key.into(),
            kind: WorkKind::Request,
        }
    }

    pub fn command(identity: Identity, task_key: impl Into<String>) -> Self {
        Self {
            identity,
            task_key: task_key.into(),
            kind: WorkKind::Command,
        }
    }
}

/// Which limiter turned a request away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectedBy {
    RateLimit,
    CommandLimit,
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("{message}")]
    Rejected {
        by: RejectedBy,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl GateError {
    fn rejected(by: RejectedBy, decision: Decision) -> Self {
        let retry_after = decision.retry_after();
        let (_, message) = decision.into_parts();
        GateError::Rejected {
            by,
            message,
            retry_after,
        }
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self, GateError::Rejected { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GateStatus {
    pub admission: AdmissionStatus,
    pub scheduler: SchedulerStatus,
    pub tracked_identities: usize,
    pub tracked_command_identities: usize,
}

/// Everything the gate knows about one identity.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityReport {
    pub identity: Identity,
    pub is_admin: bool,
    pub tier: PriorityTier,
    pub active_slots: usize,
    pub rate: RateUsage,
    pub commands: CommandUsage,
}

pub struct Gate {
    admins: HashSet<Identity>,
    rate_limiter: RateLimiter,
    command_limiter: CommandSpamLimiter,
    admission: AdmissionController,
    scheduler: PriorityScheduler,
    metrics: Arc<GateMetrics>,
}

impl Gate {
    pub fn new(
        admins: impl IntoIterator<Item = Identity>,
        rate_limiter: RateLimiter,
        command_limiter: CommandSpamLimiter,
        admission: AdmissionController,
        scheduler: PriorityScheduler,
    ) -> Self {
        Self {
            admins: admins.into_iter().collect(),
            rate_limiter,
            command_limiter,
            admission,
            scheduler,
            metrics: Arc::new(GateMetrics::new()),
        }
    }

    /// Build every component from configuration. Must be called inside a
    /// Tokio runtime since the scheduler spawns its workers immediately.
    pub fn from_config(config: &AppConfig) -> TurnstileResult<Self> {
        let (rate_limiter, command_limiter) = build_limiters(
            config.rate_limit.clone(),
            config.command_limit.clone(),
            &config.persistence,
        )?;
        let admission = AdmissionController::new(&config.concurrency)?;
        let scheduler = PriorityScheduler::with_admins(&config.scheduler, &config.admins)?;

        info!(
            admins = config.admins.len(),
            persistence = config.persistence.enabled,
            "gate initialized"
        );

        Ok(Self::new(
            config.admins.iter().copied(),
            rate_limiter,
            command_limiter,
            admission,
            scheduler,
        ))
    }

    pub fn is_admin(&self, identity: Identity) -> bool {
        self.admins.contains(&identity)
    }

    /// Run only the limiter stage for `identity`. Counts against the
    /// identity's windows exactly like a full submission would.
    pub fn check_only(&self, identity: Identity, kind: WorkKind) -> Result<(), GateError> {
        let is_admin = self.is_admin(identity);

        let decision = self.rate_limiter.check(identity, is_admin);
        if !decision.is_allowed() {
            self.metrics.rate_limited_total.inc();
            debug!(identity, "rejected by rate limiter");
            return Err(GateError::rejected(RejectedBy::RateLimit, decision));
        }

        if kind == WorkKind::Command {
            let decision = self.command_limiter.check(identity, is_admin);
            if !decision.is_allowed() {
                self.metrics.commands_rejected_total.inc();
                debug!(identity, "rejected by command limiter");
                return Err(GateError::rejected(RejectedBy::CommandLimit, decision));
            }
        }

        Ok(())
    }

    /// Pass `request` through the full pipeline and run `task` once admitted.
    ///
    /// The execution slot is held until the task has finished on its tier
    /// pool and is released on every exit path, including task failure. If
    /// the returned future is dropped after admission, the task still runs
    /// to completion and keeps its slot until then.
    pub async fn process<F, Fut, T>(&self, request: WorkRequest, task: F) -> Result<T, GateError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let WorkRequest {
            identity,
            task_key,
            kind,
        } = request;
        self.metrics.requests_total.inc();

        self.check_only(identity, kind)?;

        let waited = Instant::now();
        let slot = self.admission.acquire(identity, task_key).await?;
        self.metrics.slot_wait.observe(waited.elapsed().as_secs_f64());
        self.metrics.admitted_total.inc();
        self.sync_active_slots();

        let tier = self.scheduler.classify(identity);
        debug!(identity, tier = %tier, task_key = slot.task_key(), "slot acquired");

        // The slot travels with the job: it is released when the task ends
        // on its pool, or when the job is dropped unrun, never when the
        // caller stops waiting.
        let started = Instant::now();
        let result = self
            .scheduler
            .submit(identity, move || async move {
                let _slot = slot;
                task().await
            })
            .await;
        self.metrics
            .task_duration
            .with_label_values(&[tier.as_str()])
            .observe(started.elapsed().as_secs_f64());

        self.sync_active_slots();

        let outcome = match &result {
            Ok(_) => "completed",
            Err(e) if e.is_pool_error() => "rejected",
            Err(_) => "failed",
        };
        self.metrics
            .tasks_total
            .with_label_values(&[tier.as_str(), outcome])
            .inc();
        if let Err(e) = &result {
            warn!(identity, tier = %tier, error = %e, "task did not complete");
        }

        result.map_err(GateError::from)
    }

    fn sync_active_slots(&self) {
        self.metrics
            .active_slots
            .set(self.admission.status().active_count as i64);
    }

    pub fn status(&self) -> GateStatus {
        GateStatus {
            admission: self.admission.status(),
            scheduler: self.scheduler.status(),
            tracked_identities: self.rate_limiter.tracked(),
            tracked_command_identities: self.command_limiter.tracked(),
        }
    }

    pub fn identity_report(&self, identity: Identity) -> IdentityReport {
        IdentityReport {
            identity,
            is_admin: self.is_admin(identity),
            tier: self.scheduler.classify(identity),
            active_slots: self.admission.active_count(identity),
            rate: self.rate_limiter.usage(identity),
            commands: self.command_limiter.usage(identity),
        }
    }

    /// Spawn the limiter housekeeping thread.
    pub fn start_maintenance(&self, every: Duration) -> std::io::Result<()> {
        turnstile_rate_limit::start_maintenance_task(
            &self.rate_limiter,
            &self.command_limiter,
            every,
        )
    }

    /// Refuse new slots, drain the tier pools and write out limiter state.
    pub async fn shutdown(&self) {
        self.admission.close();
        self.scheduler.shutdown().await;
        self.rate_limiter.flush();
        self.command_limiter.flush();
        info!("gate shut down");
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn command_limiter(&self) -> &CommandSpamLimiter {
        &self.command_limiter
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn scheduler(&self) -> &PriorityScheduler {
        &self.scheduler
    }

    pub fn metrics(&self) -> &Arc<GateMetrics> {
        &self.metrics
    }
}
