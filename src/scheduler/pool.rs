//! Fixed-capacity pool of reusable task descriptors.
//!
//! Every descriptor state transition happens under the pool mutex; per-slot
//! [`Notify`] handles wake `finish` callers when their job completes.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use super::stats::{TaskStats, TaskUsage};
use super::task::{CompletionAction, Criticality, JobKind, Payload, TaskId, TaskSnapshot, TaskStatus};
use super::SchedError;
use crate::accel::AcceleratorBinding;

/// Scheduling state of one descriptor slot.
#[derive(Debug)]
pub(crate) struct Descriptor {
    pub id: TaskId,
    pub status: TaskStatus,
    /// Bumped on every acquire; completions carry it so a late signal for a
    /// released job never lands on the slot's next owner.
    pub generation: u64,
    pub kind: Option<JobKind>,
    pub criticality: Option<Criticality>,
    pub accelerator: Option<AcceleratorBinding>,
    pub action: CompletionAction,
    pub input_len: usize,
    pub output: Option<Result<Payload, String>>,
    /// Completed, finalizer running, auto-release pending.
    pub finalizing: bool,
    pub stats: TaskStats,
    status_since: Instant,
}

impl Descriptor {
    fn new(id: TaskId) -> Self {
        Self {
            id,
            status: TaskStatus::Free,
            generation: 0,
            kind: None,
            criticality: None,
            accelerator: None,
            action: CompletionAction::None,
            input_len: 0,
            output: None,
            finalizing: false,
            stats: TaskStats::default(),
            status_since: Instant::now(),
        }
    }

    /// Move to `to`, refusing anything outside the descriptor lifecycle.
    pub fn transition(&mut self, to: TaskStatus, op: &'static str) -> Result<(), SchedError> {
        if !self.status.can_become(to) {
            return Err(SchedError::InvalidTransition {
                task: self.id,
                op,
                status: self.status,
            });
        }
        let now = Instant::now();
        self.stats
            .time_in_status
            .add(self.status, now.duration_since(self.status_since));
        trace!(task = %self.id, from = %self.status, to = %to, "descriptor transition");
        self.status = to;
        self.status_since = now;
        Ok(())
    }

    fn reset(&mut self) {
        self.kind = None;
        self.criticality = None;
        self.accelerator = None;
        self.action = CompletionAction::None;
        self.input_len = 0;
        self.output = None;
        self.finalizing = false;
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            kind: self.kind,
            criticality: self.criticality,
            accelerator: self.accelerator,
            status: self.status,
            finalizer: !self.action.is_none(),
        }
    }
}

/// What `release` found in the slot before resetting it.
#[derive(Debug)]
pub(crate) struct Released {
    pub previous: TaskStatus,
    pub kind: Option<JobKind>,
    pub accelerator: Option<AcceleratorBinding>,
}

pub(crate) struct DescriptorPool {
    slots: Mutex<Vec<Descriptor>>,
    completed: Vec<Notify>,
    /// Notified whenever a dispatched descriptor completes.
    settled: Notify,
}

impl DescriptorPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new((0..capacity as u32).map(|i| Descriptor::new(TaskId(i))).collect()),
            completed: (0..capacity).map(|_| Notify::new()).collect(),
            settled: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Descriptor>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.completed.len()
    }

    fn check(&self, task: TaskId) -> Result<(), SchedError> {
        if task.index() >= self.capacity() {
            return Err(SchedError::UnknownHandle {
                task,
                capacity: self.capacity(),
            });
        }
        Ok(())
    }

    /// Claim the first free descriptor. Never waits.
    pub fn acquire(&self, kind: JobKind, criticality: Criticality) -> Result<TaskId, SchedError> {
        let mut slots = self.lock();
        let Some(slot) = slots.iter_mut().find(|d| d.status == TaskStatus::Free) else {
            warn!(%kind, %criticality, capacity = self.capacity(), "descriptor pool exhausted");
            return Err(SchedError::PoolExhausted {
                capacity: self.capacity(),
            });
        };

        slot.transition(TaskStatus::Acquired, "acquire")?;
        slot.reset();
        slot.generation += 1;
        slot.kind = Some(kind);
        slot.criticality = Some(criticality);
        slot.stats.record_acquire(kind);
        debug!(task = %slot.id, %kind, %criticality, "descriptor acquired");
        Ok(slot.id)
    }

    /// Return a descriptor to the pool, whatever job state it is in.
    pub fn release(&self, task: TaskId) -> Result<Released, SchedError> {
        self.release_inner(task, None)
    }

    /// Release only if the slot still belongs to `generation`.
    pub fn release_generation(&self, task: TaskId, generation: u64) -> Result<Released, SchedError> {
        self.release_inner(task, Some(generation))
    }

    fn release_inner(&self, task: TaskId, generation: Option<u64>) -> Result<Released, SchedError> {
        self.check(task)?;
        let mut slots = self.lock();
        let slot = &mut slots[task.index()];
        if generation.is_some_and(|g| g != slot.generation) {
            return Err(SchedError::InvalidTransition {
                task,
                op: "release",
                status: slot.status,
            });
        }

        let previous = slot.status;
        slot.transition(TaskStatus::Free, "release")?;
        let released = Released {
            previous,
            kind: slot.kind,
            accelerator: slot.accelerator,
        };
        if let Some(kind) = slot.kind {
            slot.stats.record_release(kind);
        }
        slot.reset();
        debug!(task = %task, from = %previous, "descriptor released");
        Ok(released)
    }

    /// Run `f` against one descriptor while holding the pool lock.
    pub fn with_slot<R>(
        &self,
        task: TaskId,
        f: impl FnOnce(&mut Descriptor) -> Result<R, SchedError>,
    ) -> Result<R, SchedError> {
        self.check(task)?;
        let mut slots = self.lock();
        f(&mut slots[task.index()])
    }

    /// Wake-up handle for `finish` callers of `task`; `task` must be in range.
    pub fn completed(&self, task: TaskId) -> &Notify {
        &self.completed[task.index()]
    }

    pub fn settled(&self) -> &Notify {
        &self.settled
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.lock().iter().filter(|d| d.status == status).count()
    }

    /// Jobs still running or still inside their finalizer.
    pub fn pending(&self) -> usize {
        self.lock()
            .iter()
            .filter(|d| d.status == TaskStatus::Dispatched || d.finalizing)
            .count()
    }

    pub fn in_use(&self) -> usize {
        self.capacity() - self.count(TaskStatus::Free)
    }

    pub fn snapshot(&self, task: TaskId) -> Result<TaskSnapshot, SchedError> {
        self.with_slot(task, |d| Ok(d.snapshot()))
    }

    pub fn snapshots(&self) -> Vec<TaskSnapshot> {
        self.lock().iter().map(Descriptor::snapshot).collect()
    }

    pub fn usage(&self) -> Vec<TaskUsage> {
        self.lock()
            .iter()
            .map(|d| TaskUsage {
                id: d.id,
                stats: d.stats.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_until_exhausted() {
        let pool = DescriptorPool::new(3);
        let ids: Vec<TaskId> = (0..3)
            .map(|_| pool.acquire(JobKind::Spectral, Criticality::Base).unwrap())
            .collect();
        assert_eq!(ids, vec![TaskId(0), TaskId(1), TaskId(2)]);
        assert_eq!(pool.in_use(), 3);

        let err = pool
            .acquire(JobKind::Decoding, Criticality::Critical)
            .unwrap_err();
        assert!(matches!(err, SchedError::PoolExhausted { capacity: 3 }));
    }

    #[test]
    fn test_release_free_is_invalid() {
        let pool = DescriptorPool::new(2);
        let id = pool.acquire(JobKind::Spectral, Criticality::Base).unwrap();
        pool.release(id).unwrap();

        let err = pool.release(id).unwrap_err();
        assert!(matches!(
            err,
            SchedError::InvalidTransition {
                op: "release",
                status: TaskStatus::Free,
                ..
            }
        ));
        assert!(err.is_integrity_fault());
    }

    #[test]
    fn test_unknown_handle() {
        let pool = DescriptorPool::new(2);
        assert!(matches!(
            pool.release(TaskId(2)),
            Err(SchedError::UnknownHandle { capacity: 2, .. })
        ));
        assert!(pool.snapshot(TaskId(99)).is_err());
    }

    #[test]
    fn test_reuse_resets_descriptor() {
        let pool = DescriptorPool::new(1);
        let id = pool.acquire(JobKind::Decoding, Criticality::Critical).unwrap();
        pool.with_slot(id, |d| {
            d.action = CompletionAction::Finalize(Box::new(|_| {}));
            d.output = Some(Ok(Payload::Bytes(vec![1, 2, 3])));
            d.input_len = 3;
            Ok(())
        })
        .unwrap();
        pool.release(id).unwrap();

        let again = pool.acquire(JobKind::Spectral, Criticality::Base).unwrap();
        assert_eq!(again, id);
        pool.with_slot(again, |d| {
            assert_eq!(d.kind, Some(JobKind::Spectral));
            assert_eq!(d.criticality, Some(Criticality::Base));
            assert!(d.action.is_none());
            assert!(d.output.is_none());
            assert_eq!(d.input_len, 0);
            assert_eq!(d.generation, 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_stale_generation_release_refused() {
        let pool = DescriptorPool::new(1);
        let id = pool.acquire(JobKind::Spectral, Criticality::Base).unwrap();
        pool.release(id).unwrap();
        pool.acquire(JobKind::Spectral, Criticality::Base).unwrap();

        assert!(pool.release_generation(id, 1).is_err());
        assert_eq!(pool.in_use(), 1);
        pool.release_generation(id, 2).unwrap();
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_stats_follow_kinds() {
        let pool = DescriptorPool::new(1);
        for kind in [JobKind::Spectral, JobKind::Spectral, JobKind::Classification] {
            let id = pool.acquire(kind, Criticality::Base).unwrap();
            pool.release(id).unwrap();
        }
        let usage = pool.usage();
        assert_eq!(usage[0].stats.acquired_by_kind[&JobKind::Spectral], 2);
        assert_eq!(usage[0].stats.released_by_kind[&JobKind::Classification], 1);
    }
}
