#![allow(clippy::result_large_err)]

use super::backend::{backend_from_config, SandboxBackend};
use super::{SandboxCommand, SandboxLimits, SandboxOutcome};
use crate::core::config::SandboxConfig;
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Extra time given to a backend beyond the command's own wall limit.
const EXECUTE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BoxState {
    Free,
    Busy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SandboxBox {
    pub id: usize,
    pub state: BoxState,
    pub scratch_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub available: usize,
    pub checkouts: u64,
    pub releases: u64,
}

struct PoolInner {
    backend: Arc<dyn SandboxBackend>,
    limits: SandboxLimits,
    permits: Arc<Semaphore>,
    free: Mutex<VecDeque<usize>>,
    boxes: Mutex<Vec<SandboxBox>>,
    checkouts: AtomicU64,
    releases: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PoolInner {
    fn release(&self, id: usize) {
        if let Some(entry) = lock(&self.boxes).get_mut(id) {
            entry.state = BoxState::Free;
        }
        lock(&self.free).push_back(id);
        self.releases.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(box_id = id, "sandbox box released");
    }
}

/// Fixed-size set of sandbox boxes shared by every run in the process.
///
/// Exhaustion is backpressure: [`SandboxPool::obtain`] waits until a lease is
/// dropped. Leases return their box on drop, so a box is handed back exactly
/// once whether the holder finished, failed, timed out or was cancelled.
#[derive(Clone)]
pub struct SandboxPool {
    inner: Arc<PoolInner>,
}

impl SandboxPool {
    pub fn new(backend: Arc<dyn SandboxBackend>, size: usize, limits: SandboxLimits) -> Result<Self, AppError> {
        if size == 0 {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                "sandbox pool size must be at least 1",
            )
            .with_code("SBX-000"));
        }
        let boxes = (0..size)
            .map(|id| SandboxBox {
                id,
                state: BoxState::Free,
                scratch_dir: backend.scratch_dir(id),
            })
            .collect();
        Ok(SandboxPool {
            inner: Arc::new(PoolInner {
                backend,
                limits,
                permits: Arc::new(Semaphore::new(size)),
                free: Mutex::new((0..size).collect()),
                boxes: Mutex::new(boxes),
                checkouts: AtomicU64::new(0),
                releases: AtomicU64::new(0),
            }),
        })
    }

    pub fn from_config(config: &SandboxConfig, workspace: &Path) -> Result<Self, AppError> {
        let backend = backend_from_config(config, workspace);
        tracing::info!(
            backend = backend.name(),
            size = config.pool_size,
            "initialising sandbox pool"
        );
        Self::new(backend, config.pool_size, SandboxLimits::from_config(config))
    }

    pub fn size(&self) -> usize {
        lock(&self.inner.boxes).len()
    }

    pub fn available(&self) -> usize {
        lock(&self.inner.free).len()
    }

    /// Default limits for commands run through this pool.
    pub fn limits(&self) -> &SandboxLimits {
        &self.inner.limits
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.size(),
            available: self.available(),
            checkouts: self.inner.checkouts.load(Ordering::SeqCst),
            releases: self.inner.releases.load(Ordering::SeqCst),
        }
    }

    pub fn snapshot(&self) -> Vec<SandboxBox> {
        lock(&self.inner.boxes).clone()
    }

    /// Take a box out of the free set, waiting while all boxes are busy.
    /// The box is not wiped; use [`SandboxPool::checkout`] for a clean one.
    pub async fn obtain(&self) -> Result<SandboxLease, AppError> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| {
                AppError::new(ErrorCategory::SandboxError, "sandbox pool is closed")
                    .with_code("SBX-006")
            })?;
        let id = lock(&self.inner.free).pop_front().ok_or_else(|| {
            AppError::new(
                ErrorCategory::InternalError,
                "sandbox permit granted without a free box",
            )
            .with_code("SBX-007")
        })?;
        let scratch_dir = {
            let mut boxes = lock(&self.inner.boxes);
            let entry = &mut boxes[id];
            entry.state = BoxState::Busy;
            entry.scratch_dir.clone()
        };
        self.inner.checkouts.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(box_id = id, "sandbox box obtained");
        Ok(SandboxLease {
            pool: Arc::clone(&self.inner),
            id,
            scratch_dir,
            _permit: permit,
        })
    }

    /// Wipe the box and initialise it again.
    pub async fn clean_and_init(&self, lease: &mut SandboxLease) -> Result<(), AppError> {
        self.inner.backend.cleanup(lease.id).await?;
        let scratch_dir = self.inner.backend.init(lease.id).await?;
        if let Some(entry) = lock(&self.inner.boxes).get_mut(lease.id) {
            entry.scratch_dir = scratch_dir.clone();
        }
        lease.scratch_dir = scratch_dir;
        Ok(())
    }

    /// Obtain a box and reset it. Init failure releases the box and fails only this caller.
    pub async fn checkout(&self) -> Result<SandboxLease, AppError> {
        let mut lease = self.obtain().await?;
        if let Err(mut err) = self.clean_and_init(&mut lease).await {
            err.add_context("box_id", &lease.id.to_string());
            tracing::error!(box_id = lease.id, error = %err, "sandbox init failed");
            return Err(err);
        }
        Ok(lease)
    }

    /// Run a command in a leased box with a wall-clock timeout.
    pub async fn execute(
        &self,
        lease: &SandboxLease,
        command: &SandboxCommand,
    ) -> Result<SandboxOutcome, AppError> {
        let budget = command.limits.wall_time + EXECUTE_GRACE;
        let run = self.inner.backend.run(lease.id, command);
        match tokio::time::timeout(budget, run).await {
            Ok(outcome) => {
                let outcome = outcome?;
                tracing::debug!(
                    box_id = lease.id,
                    status = ?outcome.status,
                    duration_ms = outcome.duration_ms,
                    "sandbox command finished"
                );
                Ok(outcome)
            }
            Err(_) => {
                tracing::warn!(box_id = lease.id, "sandbox backend exceeded its time budget");
                Ok(SandboxOutcome::timed_out(command.limits.wall_time))
            }
        }
    }
}

/// Exclusive use of one box. Dropping the lease releases the box.
pub struct SandboxLease {
    pool: Arc<PoolInner>,
    id: usize,
    scratch_dir: PathBuf,
    // Dropped after `Drop::drop` has returned the id to the free list.
    _permit: OwnedSemaphorePermit,
}

impl SandboxLease {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn release(self) {}
}

impl std::fmt::Debug for SandboxLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxLease")
            .field("id", &self.id)
            .field("scratch_dir", &self.scratch_dir)
            .finish()
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}
