//! Accelerator selection policies.

use std::fmt;
use std::str::FromStr;

use tracing::{debug, trace};

use super::{capable_types, AcceleratorBinding, AcceleratorRegistry, AcceleratorType};
use crate::scheduler::{JobKind, SchedError, TaskId};

/// Process-wide accelerator selection strategy, fixed at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Pin the job to its nominal accelerator type and wait for a free instance.
    SelectAndWait,
    /// Take the fastest free instance among all capable types, never wait.
    FastestFirst,
}

impl SelectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionPolicy::SelectAndWait => "select_and_wait",
            SelectionPolicy::FastestFirst => "fastest_first",
        }
    }

    /// Bind an accelerator instance for `task`, or report why none was bound.
    pub async fn select(
        &self,
        registry: &AcceleratorRegistry,
        kind: JobKind,
        task: TaskId,
    ) -> Result<AcceleratorBinding, SchedError> {
        match self {
            SelectionPolicy::SelectAndWait => select_and_wait(registry, kind, task).await,
            SelectionPolicy::FastestFirst => fastest_first(registry, kind, task),
        }
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "0" | "select_and_wait" | "wait" => Ok(SelectionPolicy::SelectAndWait),
            "1" | "fastest_first" | "fastest" => Ok(SelectionPolicy::FastestFirst),
            other => Err(format!(
                "unknown selection policy '{}' (expected select_and_wait or fastest_first)",
                other
            )),
        }
    }
}

/// The accelerator type a job kind is pinned to: the first preferred type
/// that exists in the inventory at all.
pub fn nominal_type(registry: &AcceleratorRegistry, kind: JobKind) -> Option<AcceleratorType> {
    capable_types(kind)
        .iter()
        .copied()
        .find(|ty| registry.instance_count(*ty) > 0)
}

async fn select_and_wait(
    registry: &AcceleratorRegistry,
    kind: JobKind,
    task: TaskId,
) -> Result<AcceleratorBinding, SchedError> {
    let accel_type =
        nominal_type(registry, kind).ok_or(SchedError::AcceleratorUnavailable { kind })?;

    loop {
        // Register for the wake-up before looking, so an unbind between the
        // scan and the await is not lost.
        let freed = registry.freed().notified();
        tokio::pin!(freed);
        freed.as_mut().enable();

        for (instance, _rank) in registry.available(accel_type) {
            if registry.try_bind(accel_type, instance, task).is_ok() {
                return Ok(AcceleratorBinding::new(accel_type, instance));
            }
        }

        debug!(task = %task, %kind, accel = %accel_type, "all instances busy, waiting");
        freed.await;
        trace!(task = %task, "accelerator freed, rescanning");
    }
}

fn fastest_first(
    registry: &AcceleratorRegistry,
    kind: JobKind,
    task: TaskId,
) -> Result<AcceleratorBinding, SchedError> {
    // (rank, preference of the type, type, instance)
    let mut candidates: Vec<(u32, usize, AcceleratorType, u32)> = capable_types(kind)
        .iter()
        .enumerate()
        .flat_map(|(pref, ty)| {
            registry
                .available(*ty)
                .into_iter()
                .map(move |(instance, rank)| (rank, pref, *ty, instance))
        })
        .collect();
    candidates.sort();

    for (_rank, _pref, accel_type, instance) in candidates {
        if registry.try_bind(accel_type, instance, task).is_ok() {
            return Ok(AcceleratorBinding::new(accel_type, instance));
        }
    }

    Err(SchedError::AcceleratorUnavailable { kind })
}
