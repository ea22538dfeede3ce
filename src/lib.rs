//! accelsched -- criticality-aware task scheduling onto heterogeneous
//! accelerators.
//!
//! This crate provides the descriptor pool, accelerator registry, selection
//! policies, dispatch/completion protocol and critical barrier, plus simulated
//! kernels and a control loop to drive them.

pub mod accel;
pub mod config;
pub mod kernels;
pub mod runner;
pub mod scheduler;
pub mod sim;

use anyhow::Result;

use crate::runner::RunReport;
use crate::scheduler::{Scheduler, UsageReport};

/// Build a scheduler from `config`, run the simulated control loop and shut
/// the scheduler down.
pub async fn run(config: &config::Config) -> Result<(RunReport, UsageReport)> {
    config.validate()?;

    // 1. Initialize Scheduler
    let kernels = kernels::simulated(config.latencies());
    let scheduler = Scheduler::initialize(
        config.scheduler.policy,
        config.scheduler.pool_capacity,
        &config.inventory(),
        kernels,
    )?;

    // 2. Drive it
    let mut feed = sim::SyntheticFeed::new(&config.workload);
    let outcome = runner::run_control_loop(&scheduler, &mut feed, &config.workload).await;

    // 3. Drain and report, even when the loop failed
    let usage = scheduler.shutdown().await;
    Ok((outcome?, usage))
}
