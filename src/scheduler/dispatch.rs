//! Dispatch and completion protocol.
//!
//! `start` binds an accelerator through the selection policy and hands the job
//! to its kernel together with a [`Completion`] token. The kernel runs the job
//! on whatever unit of concurrency it likes and consumes the token exactly
//! once; the completion handler then either leaves the descriptor for `finish`
//! or runs its finalizer and releases it.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use super::task::{
    CompletionAction, Criticality, Finalizer, FinishedTask, JobKind, Payload, TaskId, TaskStatus,
    MAX_PAYLOAD_BYTES,
};
use super::{SchedError, Scheduler};
use crate::accel::AcceleratorBinding;

/// A job as handed to a kernel.
#[derive(Debug)]
pub struct Launch {
    pub task: TaskId,
    pub kind: JobKind,
    pub criticality: Criticality,
    pub accelerator: AcceleratorBinding,
    pub input: Payload,
}

/// Executes one job kind. `launch` must not block; the job signals its end
/// through the completion token.
pub trait Kernel: Send + Sync {
    fn launch(&self, job: Launch, done: Completion);
}

/// Kernel table, one entry per job kind.
pub type Kernels = HashMap<JobKind, Arc<dyn Kernel>>;

/// One-shot completion signal for a launched job.
///
/// Consuming it with [`Completion::complete`] delivers the output. Dropping it
/// unconsumed completes the job with a failure, so waiters are never stranded.
pub struct Completion {
    scheduler: Option<Scheduler>,
    task: TaskId,
    kind: JobKind,
    criticality: Criticality,
    generation: u64,
    accelerator: AcceleratorBinding,
    epoch: Option<u64>,
}

impl Completion {
    pub fn task(&self) -> TaskId {
        self.task
    }

    pub fn complete(mut self, output: Result<Payload, String>) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.on_complete(&self, output);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            warn!(task = %self.task, "completion dropped without a result");
            scheduler.on_complete(
                self,
                Err("kernel dropped the job without completing it".to_string()),
            );
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("task", &self.task)
            .field("accelerator", &self.accelerator)
            .field("pending", &self.scheduler.is_some())
            .finish()
    }
}

enum Handled {
    Wait,
    Finalize(Finalizer, FinishedTask),
    Stale,
}

impl Scheduler {
    /// Attach a finalizer to an acquired descriptor. The descriptor is then
    /// released automatically once the finalizer has run.
    pub fn attach_finalizer<F>(&self, task: TaskId, finalizer: F) -> Result<(), SchedError>
    where
        F: FnOnce(FinishedTask) + Send + 'static,
    {
        self.ensure_open()?;
        self.pool().with_slot(task, |d| {
            if d.status != TaskStatus::Acquired {
                return Err(SchedError::InvalidTransition {
                    task,
                    op: "attach_finalizer",
                    status: d.status,
                });
            }
            d.action = CompletionAction::Finalize(Box::new(finalizer));
            Ok(())
        })
    }

    /// Bind an accelerator and launch the job held by an acquired descriptor.
    ///
    /// On a policy failure the descriptor stays acquired; the caller decides
    /// whether to retry or release it.
    pub async fn start(&self, task: TaskId, input: Payload) -> Result<AcceleratorBinding, SchedError> {
        self.ensure_open()?;
        let (kind, criticality, generation) = self.pool().with_slot(task, |d| {
            match (d.status, d.kind, d.criticality) {
                (TaskStatus::Acquired, Some(kind), Some(crit)) => Ok((kind, crit, d.generation)),
                _ => Err(SchedError::InvalidTransition {
                    task,
                    op: "start",
                    status: d.status,
                }),
            }
        })?;

        let size = input.len_bytes();
        if size > MAX_PAYLOAD_BYTES {
            return Err(SchedError::PayloadTooLarge {
                size,
                max: MAX_PAYLOAD_BYTES,
            });
        }
        let kernel = self
            .kernels()
            .get(&kind)
            .cloned()
            .ok_or(SchedError::NoKernel { kind })?;

        let binding = match self.policy().select(self.registry(), kind, task).await {
            Ok(binding) => binding,
            Err(e) => {
                warn!(task = %task, %kind, %criticality, error = %e, "accelerator selection failed");
                return Err(e);
            }
        };

        let committed = self.pool().with_slot(task, |d| {
            // Checked under the pool lock so a concurrent drain either sees
            // this dispatch or the dispatch sees the shutdown.
            self.ensure_open()?;
            if d.generation != generation {
                return Err(SchedError::InvalidTransition {
                    task,
                    op: "start",
                    status: d.status,
                });
            }
            d.transition(TaskStatus::Dispatched, "start")?;
            d.accelerator = Some(binding);
            d.input_len = size;
            // Registered under the pool lock: the completion cannot race ahead.
            Ok(criticality.is_critical().then(|| self.barrier().register()))
        });
        let epoch = match committed {
            Ok(epoch) => epoch,
            Err(e) => {
                self.registry().unbind(binding.accel_type, binding.instance);
                self.pool().settled().notify_waiters();
                return Err(e);
            }
        };

        debug!(task = %task, %kind, %criticality, accel = %binding, bytes = size, "task dispatched");

        let done = Completion {
            scheduler: Some(self.clone()),
            task,
            kind,
            criticality,
            generation,
            accelerator: binding,
            epoch,
        };
        kernel.launch(
            Launch {
                task,
                kind,
                criticality,
                accelerator: binding,
                input,
            },
            done,
        );
        Ok(binding)
    }

    /// Wait for a job without a finalizer to complete and take its output.
    ///
    /// The descriptor stays `Completed` until the caller releases it.
    pub async fn finish(&self, task: TaskId) -> Result<Payload, SchedError> {
        let generation = self.pool().with_slot(task, |d| match d.status {
            TaskStatus::Dispatched | TaskStatus::Completed if d.action.is_none() => Ok(d.generation),
            status => Err(SchedError::InvalidTransition {
                task,
                op: "finish",
                status,
            }),
        })?;

        loop {
            let completed = self.pool().completed(task).notified();
            tokio::pin!(completed);
            completed.as_mut().enable();

            let output = self.pool().with_slot(task, |d| {
                if d.generation != generation {
                    return Err(SchedError::InvalidTransition {
                        task,
                        op: "finish",
                        status: d.status,
                    });
                }
                match d.status {
                    TaskStatus::Dispatched => Ok(None),
                    // A second finish finds the output already taken.
                    TaskStatus::Completed => d.output.take().map(Some).ok_or(
                        SchedError::InvalidTransition {
                            task,
                            op: "finish",
                            status: d.status,
                        },
                    ),
                    status => Err(SchedError::InvalidTransition {
                        task,
                        op: "finish",
                        status,
                    }),
                }
            })?;

            if let Some(output) = output {
                return output.map_err(|message| SchedError::Kernel { task, message });
            }
            trace!(task = %task, "waiting for task completion");
            completed.await;
        }
    }

    /// Completion handler, run on whichever thread the kernel completes on.
    pub(crate) fn on_complete(&self, done: &Completion, output: Result<Payload, String>) {
        let task = done.task;
        let accelerator = done.accelerator;

        let handled = self.pool().with_slot(task, |d| {
            if d.generation != done.generation || d.status != TaskStatus::Dispatched {
                return Ok(Handled::Stale);
            }
            d.transition(TaskStatus::Completed, "complete")?;
            match std::mem::take(&mut d.action) {
                CompletionAction::None => {
                    d.output = Some(output);
                    Ok(Handled::Wait)
                }
                CompletionAction::Finalize(finalizer) => {
                    d.finalizing = true;
                    let finished = FinishedTask {
                        id: task,
                        kind: done.kind,
                        criticality: done.criticality,
                        accelerator,
                        output,
                    };
                    Ok(Handled::Finalize(finalizer, finished))
                }
            }
        });

        self.registry()
            .unbind(accelerator.accel_type, accelerator.instance);
        if let Some(epoch) = done.epoch {
            self.barrier().complete(epoch);
        }

        match handled {
            Ok(Handled::Wait) => {
                debug!(task = %task, accel = %accelerator, "task completed");
            }
            Ok(Handled::Finalize(finalizer, finished)) => {
                debug!(task = %task, accel = %accelerator, "task completed, running finalizer");
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| finalizer(finished))) {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    error!(task = %task, panic = %message, "finalizer panicked");
                }
                if let Err(e) = self.pool().release_generation(task, done.generation) {
                    error!(task = %task, error = %e, "auto-release after finalizer failed");
                }
            }
            Ok(Handled::Stale) => {
                debug!(task = %task, accel = %accelerator, "discarding result of released task");
            }
            Err(e) => {
                error!(task = %task, error = %e, "completion on a corrupted descriptor");
            }
        }

        self.pool().completed(task).notify_waiters();
        self.pool().settled().notify_waiters();
    }
}
