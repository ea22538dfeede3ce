//! Perception/control loop driving the scheduler.
//!
//! Every cycle dispatches one critical job of each kind, optionally floods the
//! accelerators with non-critical extras that release themselves, waits on the
//! critical barrier and checks the critical results against ground truth.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::accel::SelectionPolicy;
use crate::config::WorkloadConfig;
use crate::scheduler::{Criticality, JobKind, Payload, SchedError, Scheduler, TaskId};
use crate::sim::{CycleInputs, InputFeed};

/// Outcome counters for the critical jobs of one kind.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct KindTally {
    pub launched: u64,
    pub correct: u64,
    pub incorrect: u64,
    /// Kernel reported an error.
    pub failed: u64,
    /// No accelerator could be bound for the cycle.
    pub skipped: u64,
}

/// Non-critical job counters. Completion is counted by the finalizers.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ExtraTally {
    pub launched: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// Wall-clock time spent in each phase, summed over all cycles.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PhaseTimings {
    pub total_us: u64,
    pub dispatch_us: u64,
    pub wait_critical_us: u64,
    pub finish_us: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub policy: SelectionPolicy,
    pub cycles: u32,
    pub critical: BTreeMap<JobKind, KindTally>,
    pub extras: ExtraTally,
    pub timing: PhaseTimings,
}

impl RunReport {
    /// Critical results that matched the ground truth, across all kinds.
    pub fn correct(&self) -> u64 {
        self.critical.values().map(|t| t.correct).sum()
    }

    pub fn checked(&self) -> u64 {
        self.critical
            .values()
            .map(|t| t.correct + t.incorrect)
            .sum()
    }
}

#[derive(Default)]
struct ExtraCounters {
    completed: AtomicU64,
    failed: AtomicU64,
}

fn micros(d: Duration) -> u64 {
    d.as_micros() as u64
}

struct ControlLoop<'a> {
    scheduler: &'a Scheduler,
    critical: BTreeMap<JobKind, KindTally>,
    extras: ExtraTally,
    counters: Arc<ExtraCounters>,
}

impl<'a> ControlLoop<'a> {
    fn new(scheduler: &'a Scheduler) -> Self {
        Self {
            scheduler,
            critical: JobKind::ALL
                .iter()
                .map(|&k| (k, KindTally::default()))
                .collect(),
            extras: ExtraTally::default(),
            counters: Arc::new(ExtraCounters::default()),
        }
    }

    fn tally(&mut self, kind: JobKind) -> &mut KindTally {
        self.critical.entry(kind).or_default()
    }

    /// Dispatch a critical job. Running out of descriptors aborts the run;
    /// an unavailable accelerator skips the job for this cycle.
    async fn start_critical(&mut self, kind: JobKind, input: Payload) -> Result<Option<TaskId>> {
        let task = self
            .scheduler
            .acquire(kind, Criticality::Critical)
            .with_context(|| format!("out of descriptors for critical {} job", kind))?;

        match self.scheduler.start(task, input).await {
            Ok(_) => {
                self.tally(kind).launched += 1;
                Ok(Some(task))
            }
            Err(e @ SchedError::AcceleratorUnavailable { .. }) => {
                warn!(task = %task, %kind, error = %e, "skipping critical job this cycle");
                self.scheduler.release(task)?;
                self.tally(kind).skipped += 1;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Dispatch a non-critical job that releases itself when it finishes.
    /// Pool or accelerator shortage skips the job.
    async fn start_extra(&mut self, kind: JobKind, input: Payload) -> Result<()> {
        let task = match self.scheduler.acquire(kind, Criticality::Base) {
            Ok(task) => task,
            Err(e @ SchedError::PoolExhausted { .. }) => {
                warn!(%kind, error = %e, "skipping non-critical job");
                self.extras.skipped += 1;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let counters = Arc::clone(&self.counters);
        self.scheduler.attach_finalizer(task, move |finished| {
            match &finished.output {
                Ok(_) => counters.completed.fetch_add(1, Ordering::Relaxed),
                Err(_) => counters.failed.fetch_add(1, Ordering::Relaxed),
            };
        })?;

        match self.scheduler.start(task, input).await {
            Ok(_) => {
                self.extras.launched += 1;
                Ok(())
            }
            Err(e @ SchedError::AcceleratorUnavailable { .. }) => {
                warn!(task = %task, %kind, error = %e, "skipping non-critical job");
                self.scheduler.release(task)?;
                self.extras.skipped += 1;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Take a critical job's output, score it and return the descriptor.
    async fn collect(&mut self, kind: JobKind, task: TaskId, inputs: &CycleInputs) -> Result<()> {
        let outcome = self.scheduler.finish(task).await;
        self.scheduler.release(task)?;

        let output = match outcome {
            Ok(output) => output,
            Err(e @ SchedError::Kernel { .. }) => {
                warn!(cycle = inputs.cycle, %kind, error = %e, "critical job failed");
                self.tally(kind).failed += 1;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let correct = match kind {
            JobKind::Spectral => output
                .as_samples()
                .and_then(|s| s.first())
                .is_some_and(|d| *d == inputs.expected_distance),
            JobKind::Decoding => output.as_bytes() == Some(&inputs.expected_message[..]),
            JobKind::Classification => output
                .as_bytes()
                .and_then(|b| b.first())
                .is_some_and(|l| *l == inputs.expected_label),
        };
        if correct {
            self.tally(kind).correct += 1;
        } else {
            debug!(cycle = inputs.cycle, %kind, "critical result does not match ground truth");
            self.tally(kind).incorrect += 1;
        }
        Ok(())
    }
}

/// Drive the scheduler until the feed runs dry.
///
/// Waits for outstanding non-critical jobs before returning so the report
/// counts every finalizer.
pub async fn run_control_loop(
    scheduler: &Scheduler,
    feed: &mut dyn InputFeed,
    workload: &WorkloadConfig,
) -> Result<RunReport> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let run_start = Instant::now();
    let mut timing = PhaseTimings::default();
    let mut lp = ControlLoop::new(scheduler);
    let mut cycles = 0u32;

    info!(
        %run_id,
        policy = %scheduler.policy(),
        cycles = workload.cycles,
        extra_spectral = workload.extra_spectral,
        extra_decoding = workload.extra_decoding,
        "Starting control loop"
    );

    while let Some(inputs) = feed.next_cycle() {
        let dispatch_start = Instant::now();
        let mut critical = Vec::with_capacity(JobKind::ALL.len());

        if let Some(task) = lp
            .start_critical(JobKind::Classification, Payload::Bytes(inputs.scores.clone()))
            .await?
        {
            critical.push((JobKind::Classification, task));
        }

        if let Some(task) = lp
            .start_critical(JobKind::Spectral, Payload::Samples(inputs.samples.clone()))
            .await?
        {
            critical.push((JobKind::Spectral, task));
        }
        for _ in 0..workload.extra_spectral {
            lp.start_extra(JobKind::Spectral, Payload::Samples(inputs.samples.clone()))
                .await?;
        }

        if let Some(task) = lp
            .start_critical(JobKind::Decoding, Payload::Bytes(inputs.encoded.clone()))
            .await?
        {
            critical.push((JobKind::Decoding, task));
        }
        for _ in 0..workload.extra_decoding {
            let message = if workload.size_variability == 0 {
                inputs.encoded.clone()
            } else {
                feed.random_message().0
            };
            lp.start_extra(JobKind::Decoding, Payload::Bytes(message)).await?;
        }
        timing.dispatch_us += micros(dispatch_start.elapsed());

        let wait_start = Instant::now();
        scheduler.wait_all_critical().await;
        timing.wait_critical_us += micros(wait_start.elapsed());

        let finish_start = Instant::now();
        for (kind, task) in critical {
            lp.collect(kind, task, &inputs).await?;
        }
        timing.finish_us += micros(finish_start.elapsed());

        debug!(
            cycle = inputs.cycle,
            in_use = scheduler.in_use(),
            busy = scheduler.registry().busy_count(),
            "cycle complete"
        );
        cycles += 1;
    }

    scheduler.drain().await;
    timing.total_us = micros(run_start.elapsed());

    let mut extras = lp.extras;
    extras.completed = lp.counters.completed.load(Ordering::Relaxed);
    extras.failed = lp.counters.failed.load(Ordering::Relaxed);

    let report = RunReport {
        run_id,
        started_at,
        policy: scheduler.policy(),
        cycles,
        critical: lp.critical,
        extras,
        timing,
    };
    info!(
        %run_id,
        cycles,
        correct = report.correct(),
        checked = report.checked(),
        extras = report.extras.completed,
        total_us = report.timing.total_us,
        "Control loop finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::{AcceleratorBinding, AcceleratorType, InstanceSpec};
    use crate::kernels;
    use crate::sim::SyntheticFeed;
    use std::collections::HashMap;

    fn inventory() -> Vec<InstanceSpec> {
        vec![
            InstanceSpec {
                binding: AcceleratorBinding::new(AcceleratorType::Cpu, 0),
                rank: 3,
            },
            InstanceSpec {
                binding: AcceleratorBinding::new(AcceleratorType::Cpu, 1),
                rank: 3,
            },
            InstanceSpec {
                binding: AcceleratorBinding::new(AcceleratorType::SpectralUnit, 0),
                rank: 1,
            },
        ]
    }

    fn scheduler(policy: SelectionPolicy, capacity: usize) -> Scheduler {
        Scheduler::initialize(
            policy,
            capacity,
            &inventory(),
            kernels::simulated(HashMap::new()),
        )
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_all_critical_results_correct() {
        let sched = scheduler(SelectionPolicy::SelectAndWait, 16);
        let workload = WorkloadConfig {
            cycles: 4,
            extra_spectral: 2,
            extra_decoding: 2,
            ..WorkloadConfig::default()
        };
        let mut feed = SyntheticFeed::new(&workload);

        let report = run_control_loop(&sched, &mut feed, &workload).await.unwrap();
        assert_eq!(report.cycles, 4);
        assert_eq!(report.checked(), 12);
        assert_eq!(report.correct(), 12);
        assert_eq!(report.extras.launched, 16);
        assert_eq!(report.extras.completed, 16);
        assert_eq!(sched.in_use(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_random_extra_messages() {
        let sched = scheduler(SelectionPolicy::FastestFirst, 32);
        let workload = WorkloadConfig {
            cycles: 2,
            extra_decoding: 1,
            size_variability: 1,
            ..WorkloadConfig::default()
        };
        let mut feed = SyntheticFeed::new(&workload);

        let report = run_control_loop(&sched, &mut feed, &workload).await.unwrap();
        let launched: u64 = report.critical.values().map(|t| t.launched).sum();
        let skipped: u64 = report.critical.values().map(|t| t.skipped).sum();
        assert_eq!(launched + skipped, 6);
        assert_eq!(report.correct(), launched);
        assert_eq!(report.extras.completed + report.extras.skipped, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_critical_exhaustion_aborts() {
        let sched = scheduler(SelectionPolicy::SelectAndWait, 2);
        let workload = WorkloadConfig {
            cycles: 1,
            ..WorkloadConfig::default()
        };
        let mut feed = SyntheticFeed::new(&workload);

        let err = run_control_loop(&sched, &mut feed, &workload)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SchedError>(),
            Some(SchedError::PoolExhausted { capacity: 2 })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_extra_exhaustion_is_skipped() {
        let sched = scheduler(SelectionPolicy::SelectAndWait, 3);
        let workload = WorkloadConfig {
            cycles: 1,
            extra_decoding: 1,
            ..WorkloadConfig::default()
        };
        let mut feed = SyntheticFeed::new(&workload);

        let report = run_control_loop(&sched, &mut feed, &workload).await.unwrap();
        assert_eq!(report.extras.skipped, 1);
        assert_eq!(report.correct(), 3);
    }
}
