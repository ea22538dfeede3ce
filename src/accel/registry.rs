use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::{AcceleratorBinding, AcceleratorType};
use crate::scheduler::TaskId;

/// Static description of one instance, produced from the configured inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceSpec {
    pub binding: AcceleratorBinding,
    /// Relative speed rank; 1 is the fastest.
    pub rank: u32,
}

/// Point-in-time view of an instance.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InstanceInfo {
    pub binding: AcceleratorBinding,
    pub rank: u32,
    pub bound_to: Option<TaskId>,
}

/// Per-instance utilization counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AcceleratorUsage {
    pub binding: AcceleratorBinding,
    pub rank: u32,
    pub jobs: u64,
    pub busy_us: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("accelerator busy with task {0}")]
    Busy(TaskId),

    #[error("no such accelerator instance")]
    NoSuchInstance,
}

struct InstanceState {
    id: u32,
    rank: u32,
    bound_to: Option<TaskId>,
    bound_at: Option<Instant>,
    jobs: u64,
    busy: Duration,
}

/// Busy/free bookkeeping for every accelerator instance of the process.
///
/// Holds no job data. Binding and unbinding happen under one mutex, so an
/// instance is never bound to two tasks; every unbind wakes dispatchers that
/// are waiting for a free instance.
pub struct AcceleratorRegistry {
    inner: Mutex<BTreeMap<AcceleratorType, Vec<InstanceState>>>,
    freed: Notify,
}

impl AcceleratorRegistry {
    pub fn new(inventory: &[InstanceSpec]) -> Self {
        let mut map: BTreeMap<AcceleratorType, Vec<InstanceState>> = BTreeMap::new();
        for spec in inventory {
            map.entry(spec.binding.accel_type)
                .or_default()
                .push(InstanceState {
                    id: spec.binding.instance,
                    rank: spec.rank,
                    bound_to: None,
                    bound_at: None,
                    jobs: 0,
                    busy: Duration::ZERO,
                });
        }
        for instances in map.values_mut() {
            instances.sort_by_key(|i| i.id);
        }

        info!(
            "AcceleratorRegistry initialized. CPU: {}, spectral: {}, decoder: {}, classifier: {}",
            map.get(&AcceleratorType::Cpu).map_or(0, Vec::len),
            map.get(&AcceleratorType::SpectralUnit).map_or(0, Vec::len),
            map.get(&AcceleratorType::DecoderUnit).map_or(0, Vec::len),
            map.get(&AcceleratorType::ClassifierUnit).map_or(0, Vec::len),
        );

        Self {
            inner: Mutex::new(map),
            freed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<AcceleratorType, Vec<InstanceState>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of configured instances of `accel_type`, busy or not.
    pub fn instance_count(&self, accel_type: AcceleratorType) -> usize {
        self.lock().get(&accel_type).map_or(0, Vec::len)
    }

    /// Free instances of `accel_type` as `(instance, rank)`, fastest first.
    pub fn available(&self, accel_type: AcceleratorType) -> Vec<(u32, u32)> {
        let inner = self.lock();
        let mut free: Vec<(u32, u32)> = inner
            .get(&accel_type)
            .map(|instances| {
                instances
                    .iter()
                    .filter(|i| i.bound_to.is_none())
                    .map(|i| (i.id, i.rank))
                    .collect()
            })
            .unwrap_or_default();
        free.sort_by_key(|&(id, rank)| (rank, id));
        free
    }

    /// Bind `instance` of `accel_type` to `task` if it is free.
    pub fn try_bind(
        &self,
        accel_type: AcceleratorType,
        instance: u32,
        task: TaskId,
    ) -> Result<(), BindError> {
        let mut inner = self.lock();
        let slot = inner
            .get_mut(&accel_type)
            .and_then(|v| v.iter_mut().find(|i| i.id == instance))
            .ok_or(BindError::NoSuchInstance)?;

        if let Some(owner) = slot.bound_to {
            return Err(BindError::Busy(owner));
        }
        slot.bound_to = Some(task);
        slot.bound_at = Some(Instant::now());
        debug!(accel = %accel_type, instance, task = %task, "accelerator bound");
        Ok(())
    }

    /// Mark an instance free again and wake any dispatcher waiting for one.
    ///
    /// Returns the task the instance was bound to, if any.
    pub fn unbind(&self, accel_type: AcceleratorType, instance: u32) -> Option<TaskId> {
        let previous = {
            let mut inner = self.lock();
            let Some(slot) = inner
                .get_mut(&accel_type)
                .and_then(|v| v.iter_mut().find(|i| i.id == instance))
            else {
                warn!(accel = %accel_type, instance, "unbind of unknown accelerator instance");
                return None;
            };
            let previous = slot.bound_to.take();
            if let Some(since) = slot.bound_at.take() {
                slot.busy += since.elapsed();
                slot.jobs += 1;
            }
            previous
        };

        if previous.is_some() {
            debug!(accel = %accel_type, instance, "accelerator released");
            self.freed.notify_waiters();
        }
        previous
    }

    /// Notified every time an instance becomes free.
    pub(crate) fn freed(&self) -> &Notify {
        &self.freed
    }

    /// All instances, including busy ones.
    pub fn instances(&self) -> Vec<InstanceInfo> {
        self.lock()
            .iter()
            .flat_map(|(ty, instances)| {
                instances.iter().map(move |i| InstanceInfo {
                    binding: AcceleratorBinding::new(*ty, i.id),
                    rank: i.rank,
                    bound_to: i.bound_to,
                })
            })
            .collect()
    }

    pub fn busy_count(&self) -> usize {
        self.lock()
            .values()
            .flat_map(|v| v.iter())
            .filter(|i| i.bound_to.is_some())
            .count()
    }

    pub fn usage(&self) -> Vec<AcceleratorUsage> {
        self.lock()
            .iter()
            .flat_map(|(ty, instances)| {
                instances.iter().map(move |i| AcceleratorUsage {
                    binding: AcceleratorBinding::new(*ty, i.id),
                    rank: i.rank,
                    jobs: i.jobs,
                    busy_us: i.busy.as_micros() as u64,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(ty: AcceleratorType, instance: u32, rank: u32) -> InstanceSpec {
        InstanceSpec {
            binding: AcceleratorBinding::new(ty, instance),
            rank,
        }
    }

    #[test]
    fn test_available_is_ordered_by_rank() {
        let registry = AcceleratorRegistry::new(&[
            spec(AcceleratorType::Cpu, 0, 3),
            spec(AcceleratorType::Cpu, 1, 1),
            spec(AcceleratorType::Cpu, 2, 2),
        ]);
        assert_eq!(
            registry.available(AcceleratorType::Cpu),
            vec![(1, 1), (2, 2), (0, 3)]
        );
        assert!(registry.available(AcceleratorType::DecoderUnit).is_empty());
    }

    #[test]
    fn test_instance_binds_to_one_task_at_a_time() {
        let registry = AcceleratorRegistry::new(&[spec(AcceleratorType::SpectralUnit, 0, 1)]);
        registry
            .try_bind(AcceleratorType::SpectralUnit, 0, TaskId(3))
            .unwrap();
        assert_eq!(
            registry.try_bind(AcceleratorType::SpectralUnit, 0, TaskId(4)),
            Err(BindError::Busy(TaskId(3)))
        );
        assert!(registry.available(AcceleratorType::SpectralUnit).is_empty());
        assert_eq!(registry.busy_count(), 1);

        assert_eq!(
            registry.unbind(AcceleratorType::SpectralUnit, 0),
            Some(TaskId(3))
        );
        registry
            .try_bind(AcceleratorType::SpectralUnit, 0, TaskId(4))
            .unwrap();
    }

    #[test]
    fn test_unknown_instance() {
        let registry = AcceleratorRegistry::new(&[spec(AcceleratorType::Cpu, 0, 1)]);
        assert_eq!(
            registry.try_bind(AcceleratorType::Cpu, 7, TaskId(0)),
            Err(BindError::NoSuchInstance)
        );
        assert_eq!(registry.unbind(AcceleratorType::ClassifierUnit, 0), None);
    }

    #[test]
    fn test_usage_counts_completed_bindings() {
        let registry = AcceleratorRegistry::new(&[spec(AcceleratorType::Cpu, 0, 1)]);
        for task in 0..3 {
            registry.try_bind(AcceleratorType::Cpu, 0, TaskId(task)).unwrap();
            registry.unbind(AcceleratorType::Cpu, 0);
        }
        let usage = registry.usage();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].jobs, 3);
    }
}
