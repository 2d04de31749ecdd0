use thiserror::Error;

use crate::tier::PriorityTier;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("{0} pool is exhausted")]
    PoolExhausted(PriorityTier),

    #[error("{0} pool is shut down")]
    PoolShutDown(PriorityTier),

    #[error("task failed: {0}")]
    Task(#[source] anyhow::Error),

    #[error("task panicked in {0} pool")]
    TaskPanicked(PriorityTier),
}

impl SchedulerError {
    /// Pool-level failures, as opposed to failures of the task itself.
    pub fn is_pool_error(&self) -> bool {
        matches!(
            self,
            SchedulerError::PoolExhausted(_) | SchedulerError::PoolShutDown(_)
        )
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
