//! Per-descriptor and per-accelerator usage accounting.

use std::collections::BTreeMap;
use std::time::Duration;

use super::{JobKind, TaskId, TaskStatus};
use crate::accel::{AcceleratorUsage, SelectionPolicy};

/// Accumulated residence time per descriptor status, in microseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatusTimes {
    pub free_us: u64,
    pub acquired_us: u64,
    pub dispatched_us: u64,
    pub completed_us: u64,
}

impl StatusTimes {
    pub fn add(&mut self, status: TaskStatus, elapsed: Duration) {
        let us = elapsed.as_micros() as u64;
        let field = match status {
            TaskStatus::Free => &mut self.free_us,
            TaskStatus::Acquired => &mut self.acquired_us,
            TaskStatus::Dispatched => &mut self.dispatched_us,
            TaskStatus::Completed => &mut self.completed_us,
        };
        *field = field.saturating_add(us);
    }
}

/// Lifetime counters for one descriptor slot.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TaskStats {
    pub acquired_by_kind: BTreeMap<JobKind, u64>,
    pub released_by_kind: BTreeMap<JobKind, u64>,
    pub time_in_status: StatusTimes,
}

impl TaskStats {
    pub fn record_acquire(&mut self, kind: JobKind) {
        *self.acquired_by_kind.entry(kind).or_default() += 1;
    }

    pub fn record_release(&mut self, kind: JobKind) {
        *self.released_by_kind.entry(kind).or_default() += 1;
    }

    pub fn acquisitions(&self) -> u64 {
        self.acquired_by_kind.values().sum()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskUsage {
    pub id: TaskId,
    pub stats: TaskStats,
}

/// Usage of the whole scheduler, logged at shutdown.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UsageReport {
    pub policy: SelectionPolicy,
    pub capacity: usize,
    pub tasks: Vec<TaskUsage>,
    pub accelerators: Vec<AcceleratorUsage>,
}

impl UsageReport {
    /// Acquisitions per job kind over all descriptors.
    pub fn acquired_by_kind(&self) -> BTreeMap<JobKind, u64> {
        let mut totals = BTreeMap::new();
        for task in &self.tasks {
            for (kind, n) in &task.stats.acquired_by_kind {
                *totals.entry(*kind).or_default() += n;
            }
        }
        totals
    }

    /// Descriptors that were ever acquired.
    pub fn slots_used(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.stats.acquisitions() > 0)
            .count()
    }
}

/// Format a usage report as a short human-readable summary.
pub fn format_summary(report: &UsageReport) -> String {
    let totals = report.acquired_by_kind();
    let jobs: u64 = totals.values().sum();
    let mut summary = format!(
        "policy {}: {} job{} on {}/{} descriptors",
        report.policy,
        jobs,
        if jobs == 1 { "" } else { "s" },
        report.slots_used(),
        report.capacity,
    );
    for (kind, n) in &totals {
        summary.push_str(&format!(", {} {}", n, kind));
    }
    let busiest = report.accelerators.iter().max_by_key(|a| a.jobs);
    if let Some(a) = busiest.filter(|a| a.jobs > 0) {
        summary.push_str(&format!(
            "; busiest {} ({} jobs, {:.1} ms busy)",
            a.binding,
            a.jobs,
            a.busy_us as f64 / 1000.0
        ));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::{AcceleratorBinding, AcceleratorType};

    #[test]
    fn test_status_times_accumulate() {
        let mut times = StatusTimes::default();
        times.add(TaskStatus::Dispatched, Duration::from_micros(250));
        times.add(TaskStatus::Dispatched, Duration::from_micros(750));
        times.add(TaskStatus::Free, Duration::from_millis(2));
        assert_eq!(times.dispatched_us, 1000);
        assert_eq!(times.free_us, 2000);
        assert_eq!(times.acquired_us, 0);
    }

    #[test]
    fn test_format_summary() {
        let mut stats = TaskStats::default();
        stats.record_acquire(JobKind::Spectral);
        stats.record_acquire(JobKind::Spectral);
        stats.record_acquire(JobKind::Decoding);

        let report = UsageReport {
            policy: SelectionPolicy::FastestFirst,
            capacity: 4,
            tasks: vec![
                TaskUsage {
                    id: TaskId(0),
                    stats,
                },
                TaskUsage {
                    id: TaskId(1),
                    stats: TaskStats::default(),
                },
            ],
            accelerators: vec![AcceleratorUsage {
                binding: AcceleratorBinding::new(AcceleratorType::SpectralUnit, 0),
                rank: 1,
                jobs: 2,
                busy_us: 1500,
            }],
        };

        let summary = format_summary(&report);
        assert!(summary.contains("3 jobs on 1/4 descriptors"));
        assert!(summary.contains("2 spectral"));
        assert!(summary.contains("busiest spectral_unit#0 (2 jobs, 1.5 ms busy)"));
    }
}
