//! Criticality-aware task scheduler.
//!
//! A [`Scheduler`] owns the descriptor pool, the accelerator registry, the
//! critical barrier and the kernel table. It is created once by
//! [`Scheduler::initialize`] and cloned cheaply into every place that needs
//! it, including the completion tokens handed to kernels.

pub mod barrier;
pub mod dispatch;
pub mod pool;
pub mod stats;
pub mod task;

pub use self::barrier::CriticalBarrier;
pub use self::dispatch::{Completion, Kernel, Kernels, Launch};
pub use self::stats::{format_summary, StatusTimes, TaskStats, TaskUsage, UsageReport};
pub use self::task::{
    CompletionAction, Criticality, Finalizer, FinishedTask, JobKind, Payload, TaskId,
    TaskSnapshot, TaskStatus, MAX_PAYLOAD_BYTES,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use self::pool::DescriptorPool;
use crate::accel::{AcceleratorRegistry, InstanceSpec, SelectionPolicy};

/// Largest descriptor pool a scheduler may be configured with.
pub const MAX_POOL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum SchedError {
    #[error("descriptor pool exhausted ({capacity} descriptors in use)")]
    PoolExhausted { capacity: usize },

    #[error("no accelerator available for {kind} job")]
    AcceleratorUnavailable { kind: JobKind },

    #[error("invalid {op} on task {task} in state {status}")]
    InvalidTransition {
        task: TaskId,
        op: &'static str,
        status: TaskStatus,
    },

    #[error("unknown task handle {task} (pool capacity {capacity})")]
    UnknownHandle { task: TaskId, capacity: usize },

    #[error("payload of {size} bytes exceeds the {max} byte descriptor limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("no kernel registered for {kind} jobs")]
    NoKernel { kind: JobKind },

    #[error("kernel failed on task {task}: {message}")]
    Kernel { task: TaskId, message: String },

    #[error("invalid scheduler configuration: {0}")]
    Config(String),

    #[error("scheduler is shut down")]
    ShutDown,
}

impl SchedError {
    /// Handle/state integrity violations: the pool can no longer be trusted.
    pub fn is_integrity_fault(&self) -> bool {
        matches!(
            self,
            SchedError::InvalidTransition { .. } | SchedError::UnknownHandle { .. }
        )
    }
}

struct SchedulerInner {
    policy: SelectionPolicy,
    pool: DescriptorPool,
    registry: AcceleratorRegistry,
    barrier: CriticalBarrier,
    kernels: Kernels,
    closed: AtomicBool,
}

/// Process-wide scheduler context.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Build the pool and registry. The policy is fixed for the lifetime of
    /// the scheduler.
    pub fn initialize(
        policy: SelectionPolicy,
        pool_capacity: usize,
        inventory: &[InstanceSpec],
        kernels: Kernels,
    ) -> Result<Self, SchedError> {
        if pool_capacity == 0 || pool_capacity > MAX_POOL_CAPACITY {
            return Err(SchedError::Config(format!(
                "pool capacity must be between 1 and {}, got {}",
                MAX_POOL_CAPACITY, pool_capacity
            )));
        }
        if inventory.is_empty() {
            return Err(SchedError::Config(
                "accelerator inventory is empty".to_string(),
            ));
        }

        info!(
            %policy,
            pool_capacity,
            accelerators = inventory.len(),
            kernels = kernels.len(),
            "Scheduler initialized"
        );

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                policy,
                pool: DescriptorPool::new(pool_capacity),
                registry: AcceleratorRegistry::new(inventory),
                barrier: CriticalBarrier::new(),
                kernels,
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.inner.policy
    }

    pub fn capacity(&self) -> usize {
        self.inner.pool.capacity()
    }

    pub fn registry(&self) -> &AcceleratorRegistry {
        &self.inner.registry
    }

    pub(crate) fn pool(&self) -> &DescriptorPool {
        &self.inner.pool
    }

    pub(crate) fn barrier(&self) -> &CriticalBarrier {
        &self.inner.barrier
    }

    pub(crate) fn kernels(&self) -> &Kernels {
        &self.inner.kernels
    }

    /// `ShutDown` once `shutdown` has begun.
    pub(crate) fn ensure_open(&self) -> Result<(), SchedError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SchedError::ShutDown);
        }
        Ok(())
    }

    /// Claim a free descriptor for a job. Fails fast with `PoolExhausted`.
    pub fn acquire(&self, kind: JobKind, criticality: Criticality) -> Result<TaskId, SchedError> {
        self.ensure_open()?;
        self.inner.pool.acquire(kind, criticality)
    }

    /// Return a descriptor to the pool.
    ///
    /// Releasing a dispatched descriptor abandons its job: the accelerator
    /// stays bound until the kernel signals completion, and the late result
    /// is discarded.
    pub fn release(&self, task: TaskId) -> Result<(), SchedError> {
        let released = self.inner.pool.release(task)?;
        if released.previous == TaskStatus::Dispatched {
            warn!(
                task = %task,
                kind = ?released.kind,
                accel = ?released.accelerator,
                "released a dispatched task; its result will be discarded"
            );
        }
        Ok(())
    }

    /// Wait until every critical job dispatched before this call completed.
    pub async fn wait_all_critical(&self) {
        self.inner.barrier.wait().await
    }

    /// Wait until the pool has nothing pending and no accelerator is still
    /// bound, including to jobs released while running.
    pub async fn drain(&self) {
        loop {
            let settled = self.inner.pool.settled().notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            let pending = self.inner.pool.pending();
            let busy = self.inner.registry.busy_count();
            if pending == 0 && busy == 0 {
                return;
            }
            debug!(pending, busy, "draining dispatched tasks");
            settled.await;
        }
    }

    pub fn status(&self, task: TaskId) -> Result<TaskStatus, SchedError> {
        Ok(self.inner.pool.snapshot(task)?.status)
    }

    pub fn snapshot(&self, task: TaskId) -> Result<TaskSnapshot, SchedError> {
        self.inner.pool.snapshot(task)
    }

    pub fn snapshots(&self) -> Vec<TaskSnapshot> {
        self.inner.pool.snapshots()
    }

    /// Descriptors currently owned by a job.
    pub fn in_use(&self) -> usize {
        self.inner.pool.in_use()
    }

    pub fn outstanding_critical(&self) -> usize {
        self.inner.barrier.outstanding()
    }

    pub fn usage_report(&self) -> UsageReport {
        UsageReport {
            policy: self.inner.policy,
            capacity: self.capacity(),
            tasks: self.inner.pool.usage(),
            accelerators: self.inner.registry.usage(),
        }
    }

    /// Refuse new work, wait for dispatched jobs to finish and report usage.
    pub async fn shutdown(&self) -> UsageReport {
        self.inner.closed.store(true, Ordering::Release);
        self.drain().await;

        for snap in self.snapshots() {
            if snap.status != TaskStatus::Free {
                warn!(task = %snap.id, status = %snap.status, "descriptor still held at shutdown");
            }
        }

        let report = self.usage_report();
        info!(summary = %format_summary(&report), "Scheduler shut down");
        report
    }
}
