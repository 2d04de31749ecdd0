//! Bounded concurrency admission for the turnstile pipeline.
//!
//! Callers that passed the limiters wait here for an execution slot instead
//! of being rejected. A slot is one permit from the global pool plus one
//! from the caller's own pool. Permits are always taken global-first and
//! returned identity-first, which keeps two identities contending for both
//! scopes from deadlocking.
//!
//! Slots are only handed out as a [`SlotGuard`]; dropping the guard returns
//! them on every exit path, including panics and cancelled futures.
//!
//! Waiters are queued by `tokio::sync::Semaphore` in arrival order per pool,
//! but a caller blocked on its identity pool already holds a global permit,
//! so ordering across identities is best-effort only.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};
use turnstile_common::{ConcurrencyConfig, Identity, TurnstileResult};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("admission controller is closed")]
    Closed,
}

/// Point-in-time view of slot usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionStatus {
    /// Slots currently held by running work.
    pub active_count: usize,
    pub global_capacity: usize,
    pub per_identity_capacity: usize,
    /// Global permits not held by anyone, running or waiting.
    pub available_slots: usize,
    pub active_identities: Vec<Identity>,
    pub active_tasks: BTreeMap<Identity, Vec<String>>,
}

/// Global plus per-identity execution slots. Cheap to clone; clones share
/// the same pools.
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

struct Inner {
    global: Arc<Semaphore>,
    global_capacity: usize,
    per_identity_capacity: usize,
    identities: DashMap<Identity, Arc<Semaphore>>,
    // Observability only; guarded separately from the permits.
    active: Mutex<BTreeMap<Identity, Vec<String>>>,
}

impl AdmissionController {
    pub fn new(config: &ConcurrencyConfig) -> TurnstileResult<Self> {
        config.validate()?;

        info!(
            global = config.global,
            per_identity = config.per_identity,
            "creating admission controller"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                global: Arc::new(Semaphore::new(config.global)),
                global_capacity: config.global,
                per_identity_capacity: config.per_identity,
                identities: DashMap::new(),
                active: Mutex::new(BTreeMap::new()),
            }),
        })
    }

    /// Wait for a slot. Blocks until both a global and a per-identity permit
    /// are free; fails only once the controller has been closed.
    ///
    /// Cancel-safe: dropping the future before it resolves holds nothing.
    pub async fn acquire(
        &self,
        identity: Identity,
        task_key: impl Into<String>,
    ) -> Result<SlotGuard, AdmissionError> {
        let task_key = task_key.into();

        let global = Arc::clone(&self.inner.global)
            .acquire_owned()
            .await
            .map_err(|_| AdmissionError::Closed)?;
        let local = self
            .identity_pool(identity)
            .acquire_owned()
            .await
            .map_err(|_| AdmissionError::Closed)?;

        Ok(self.admit(identity, task_key, global, local))
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self, identity: Identity, task_key: impl Into<String>) -> Option<SlotGuard> {
        let global = Arc::clone(&self.inner.global).try_acquire_owned().ok()?;
        let local = self.identity_pool(identity).try_acquire_owned().ok()?;
        Some(self.admit(identity, task_key.into(), global, local))
    }

    /// Run `work` while holding a slot for `identity`.
    pub async fn run<F, T>(
        &self,
        identity: Identity,
        task_key: impl Into<String>,
        work: F,
    ) -> Result<T, AdmissionError>
    where
        F: Future<Output = T>,
    {
        let _slot = self.acquire(identity, task_key).await?;
        Ok(work.await)
    }

    /// Return a slot explicitly. Equivalent to dropping the guard.
    pub fn release(&self, slot: SlotGuard) {
        drop(slot);
    }

    /// Wake every waiter with [`AdmissionError::Closed`] and refuse new
    /// acquisitions. Held slots stay valid until dropped.
    pub fn close(&self) {
        self.inner.global.close();
        for pool in self.inner.identities.iter() {
            pool.close();
        }
        info!("admission controller closed");
    }

    pub fn status(&self) -> AdmissionStatus {
        let active = lock_active(&self.inner.active);
        let active_count = active.values().map(Vec::len).sum();
        AdmissionStatus {
            active_count,
            global_capacity: self.inner.global_capacity,
            per_identity_capacity: self.inner.per_identity_capacity,
            available_slots: self.inner.global.available_permits(),
            active_identities: active.keys().copied().collect(),
            active_tasks: active.clone(),
        }
    }

    /// Slots currently held by `identity`.
    pub fn active_count(&self, identity: Identity) -> usize {
        lock_active(&self.inner.active)
            .get(&identity)
            .map_or(0, Vec::len)
    }

    fn identity_pool(&self, identity: Identity) -> Arc<Semaphore> {
        let per_identity = self.inner.per_identity_capacity;
        let pool = self
            .inner
            .identities
            .entry(identity)
            .or_insert_with(|| Arc::new(Semaphore::new(per_identity)));
        if self.inner.global.is_closed() {
            pool.close();
        }
        Arc::clone(pool.value())
    }

    fn admit(
        &self,
        identity: Identity,
        task_key: String,
        global: OwnedSemaphorePermit,
        local: OwnedSemaphorePermit,
    ) -> SlotGuard {
        let active_for_identity = {
            let mut active = lock_active(&self.inner.active);
            let tasks = active.entry(identity).or_default();
            tasks.push(task_key.clone());
            tasks.len()
        };

        debug!(
            identity,
            task_key = %task_key,
            active_for_identity,
            available = self.inner.global.available_permits(),
            "admission slot acquired"
        );

        SlotGuard {
            identity,
            task_key,
            local: Some(local),
            global: Some(global),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("global_capacity", &self.inner.global_capacity)
            .field("per_identity_capacity", &self.inner.per_identity_capacity)
            .field("available", &self.inner.global.available_permits())
            .finish()
    }
}

fn lock_active(
    active: &Mutex<BTreeMap<Identity, Vec<String>>>,
) -> std::sync::MutexGuard<'_, BTreeMap<Identity, Vec<String>>> {
    match active.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A held execution slot. Dropping it removes the task from the active set,
/// then returns the per-identity permit, then the global permit.
#[must_use = "the slot is released as soon as the guard is dropped"]
pub struct SlotGuard {
    identity: Identity,
    task_key: String,
    local: Option<OwnedSemaphorePermit>,
    global: Option<OwnedSemaphorePermit>,
    inner: Arc<Inner>,
}

impl SlotGuard {
    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn task_key(&self) -> &str {
        &self.task_key
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        {
            let mut active = lock_active(&self.inner.active);
            if let Some(tasks) = active.get_mut(&self.identity) {
                if let Some(pos) = tasks.iter().position(|k| *k == self.task_key) {
                    tasks.remove(pos);
                }
                if tasks.is_empty() {
                    active.remove(&self.identity);
                }
            }
        }

        drop(self.local.take());
        drop(self.global.take());

        debug!(
            identity = self.identity,
            task_key = %self.task_key,
            "admission slot released"
        );
    }
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard")
            .field("identity", &self.identity)
            .field("task_key", &self.task_key)
            .finish()
    }
}
