//! Simulated job kernels.
//!
//! [`SimKernel`] stands in for real accelerator back ends: it holds the job
//! for the bound instance's configured latency, then runs a small reference
//! computation on a blocking thread. [`FnKernel`] adapts a closure.

pub mod classifier;
pub mod decoder;
pub mod spectral;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::trace;

use crate::accel::AcceleratorBinding;
use crate::scheduler::{Completion, JobKind, Kernel, Kernels, Launch, Payload};

/// Run `work` off the caller's thread: on the tokio blocking pool when a
/// runtime is available, on a plain thread otherwise.
fn spawn_job<W>(work: W)
where
    W: FnOnce() + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(work);
        }
        Err(_) => {
            std::thread::spawn(work);
        }
    }
}

/// Kernel backed by a plain function of the launched job.
pub struct FnKernel<F> {
    f: Arc<F>,
}

impl<F> FnKernel<F>
where
    F: Fn(&Launch) -> Result<Payload, String> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f: Arc::new(f) }
    }
}

impl<F> Kernel for FnKernel<F>
where
    F: Fn(&Launch) -> Result<Payload, String> + Send + Sync + 'static,
{
    fn launch(&self, job: Launch, done: Completion) {
        let f = Arc::clone(&self.f);
        spawn_job(move || {
            let output = f(&job);
            done.complete(output);
        });
    }
}

/// Reference computation for one job kind.
pub fn compute(kind: JobKind, input: &Payload) -> Result<Payload, String> {
    match kind {
        JobKind::Spectral => {
            let samples = input
                .as_samples()
                .ok_or("spectral job expects sample input")?;
            let distance = spectral::estimate_distance(samples).map_err(|e| e.to_string())?;
            Ok(Payload::Samples(vec![distance]))
        }
        JobKind::Decoding => {
            let frame = input.as_bytes().ok_or("decoding job expects byte input")?;
            decoder::decode(frame)
                .map(Payload::Bytes)
                .map_err(|e| e.to_string())
        }
        JobKind::Classification => {
            let scores = input
                .as_bytes()
                .ok_or("classification job expects byte input")?;
            let label = classifier::classify(scores).map_err(|e| e.to_string())?;
            Ok(Payload::Bytes(vec![label]))
        }
    }
}

/// Simulated accelerator kernel for one job kind.
pub struct SimKernel {
    kind: JobKind,
    latencies: Arc<HashMap<AcceleratorBinding, Duration>>,
}

impl SimKernel {
    pub fn new(kind: JobKind, latencies: Arc<HashMap<AcceleratorBinding, Duration>>) -> Self {
        Self { kind, latencies }
    }

    fn latency(&self, binding: &AcceleratorBinding) -> Duration {
        self.latencies.get(binding).copied().unwrap_or_default()
    }
}

impl Kernel for SimKernel {
    fn launch(&self, job: Launch, done: Completion) {
        debug_assert_eq!(job.kind, self.kind);
        let kind = self.kind;
        let latency = self.latency(&job.accelerator);
        trace!(task = %job.task, accel = %job.accelerator, latency_us = latency.as_micros() as u64, "sim kernel launch");

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(latency).await;
                    let output = tokio::task::spawn_blocking(move || compute(kind, &job.input))
                        .await
                        .unwrap_or_else(|e| Err(format!("kernel thread failed: {}", e)));
                    done.complete(output);
                });
            }
            Err(_) => {
                std::thread::spawn(move || {
                    std::thread::sleep(latency);
                    done.complete(compute(kind, &job.input));
                });
            }
        }
    }
}

/// Kernel table with a [`SimKernel`] for every job kind.
pub fn simulated(latencies: HashMap<AcceleratorBinding, Duration>) -> Kernels {
    let latencies = Arc::new(latencies);
    JobKind::ALL
        .iter()
        .map(|&kind| {
            let kernel: Arc<dyn Kernel> = Arc::new(SimKernel::new(kind, Arc::clone(&latencies)));
            (kind, kernel)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_checks_payload_shape() {
        assert!(compute(JobKind::Spectral, &Payload::Bytes(vec![1, 2])).is_err());
        assert!(compute(JobKind::Decoding, &Payload::Samples(vec![1.0])).is_err());

        let label = compute(JobKind::Classification, &Payload::Bytes(vec![0, 0, 7, 1, 0])).unwrap();
        assert_eq!(label.as_bytes(), Some(&[2u8][..]));

        let decoded = compute(JobKind::Decoding, &Payload::Bytes(decoder::encode(b"hi"))).unwrap();
        assert_eq!(decoded.as_bytes(), Some(&b"hi"[..]));
    }

    #[test]
    fn test_simulated_covers_every_kind() {
        let kernels = simulated(HashMap::new());
        for kind in JobKind::ALL {
            assert!(kernels.contains_key(&kind));
        }
    }
}
