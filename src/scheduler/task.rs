//! Task descriptor vocabulary: identity, job kind, criticality, status,
//! payloads and completion actions.

use std::fmt;

use crate::accel::AcceleratorBinding;

/// Largest input a descriptor can carry (the biggest supported message).
pub const MAX_PAYLOAD_BYTES: usize = 128 * 1024;

/// Handle of a descriptor: its slot index in the pool.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct TaskId(pub u32);

impl TaskId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Which external kernel a job belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Spectral transform (radar FFT / distance estimation)
    Spectral,
    /// Convolutional decoding (Viterbi message decode)
    Decoding,
    /// Object classification (CNN)
    Classification,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Spectral, JobKind::Decoding, JobKind::Classification];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Spectral => "spectral",
            JobKind::Decoding => "decoding",
            JobKind::Classification => "classification",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Criticality levels (ascending). Only `Critical` jobs gate the cycle;
/// `Elevated` is a finer BASE-class level visible to policies and reports.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    Base = 1,
    Elevated = 2,
    Critical = 3,
}

impl Criticality {
    pub fn is_critical(&self) -> bool {
        matches!(self, Criticality::Critical)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Criticality::Base => "base",
            Criticality::Elevated => "elevated",
            Criticality::Critical => "critical",
        }
    }
}

impl fmt::Display for Criticality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptor lifecycle: Free -> Acquired -> Dispatched -> Completed -> Free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Free,
    Acquired,
    Dispatched,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Free => "free",
            TaskStatus::Acquired => "acquired",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Completed => "completed",
        }
    }

    /// Whether `self -> to` is a legal descriptor transition.
    pub fn can_become(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (*self, to),
            (Free, Acquired)
                | (Acquired, Dispatched)
                | (Dispatched, Completed)
                | (Acquired, Free)
                | (Dispatched, Free)
                | (Completed, Free)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job input or output data. The scheduler only measures it; kernels
/// interpret it.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Payload {
    /// f32 sample stream (interleaved re/im for complex data)
    Samples(Vec<f32>),
    /// Raw bytes
    Bytes(Vec<u8>),
}

impl Payload {
    pub fn len_bytes(&self) -> usize {
        match self {
            Payload::Samples(s) => s.len() * std::mem::size_of::<f32>(),
            Payload::Bytes(b) => b.len(),
        }
    }

    pub fn as_samples(&self) -> Option<&[f32]> {
        match self {
            Payload::Samples(s) => Some(s),
            Payload::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(b) => Some(b),
            Payload::Samples(_) => None,
        }
    }
}

/// Everything a finalizer gets to see about the job that just finished.
#[derive(Debug)]
pub struct FinishedTask {
    pub id: TaskId,
    pub kind: JobKind,
    pub criticality: Criticality,
    pub accelerator: AcceleratorBinding,
    /// Kernel output, or the kernel's failure message.
    pub output: Result<Payload, String>,
}

pub type Finalizer = Box<dyn FnOnce(FinishedTask) + Send + 'static>;

/// What happens when a job completes.
#[derive(Default)]
pub enum CompletionAction {
    /// Owner waits with `finish` and releases explicitly.
    #[default]
    None,
    /// Run the finalizer, then return the descriptor to the pool.
    Finalize(Finalizer),
}

impl CompletionAction {
    pub fn is_none(&self) -> bool {
        matches!(self, CompletionAction::None)
    }
}

impl fmt::Debug for CompletionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionAction::None => f.write_str("None"),
            CompletionAction::Finalize(_) => f.write_str("Finalize(..)"),
        }
    }
}

/// Diagnostic view of one descriptor.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub kind: Option<JobKind>,
    pub criticality: Option<Criticality>,
    pub accelerator: Option<AcceleratorBinding>,
    pub status: TaskStatus,
    pub finalizer: bool,
}

impl fmt::Display for TaskSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {:>3} [{}]", self.id, self.status)?;
        if let Some(kind) = self.kind {
            write!(f, " {}", kind)?;
        }
        if let Some(crit) = self.criticality {
            write!(f, " {}", crit)?;
        }
        if let Some(accel) = self.accelerator {
            write!(f, " on {}", accel)?;
        }
        if self.finalizer {
            f.write_str(" (auto-release)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::AcceleratorType;

    #[test]
    fn test_status_transitions() {
        use TaskStatus::*;
        assert!(Free.can_become(Acquired));
        assert!(Acquired.can_become(Dispatched));
        assert!(Dispatched.can_become(Completed));
        assert!(Completed.can_become(Free));
        assert!(Acquired.can_become(Free));

        assert!(!Free.can_become(Free));
        assert!(!Free.can_become(Dispatched));
        assert!(!Acquired.can_become(Completed));
        assert!(!Completed.can_become(Dispatched));
    }

    #[test]
    fn test_criticality_order() {
        assert!(Criticality::Critical > Criticality::Elevated);
        assert!(Criticality::Elevated > Criticality::Base);
        assert!(!Criticality::Elevated.is_critical());
    }

    #[test]
    fn test_payload_size() {
        assert_eq!(Payload::Samples(vec![0.0; 8]).len_bytes(), 32);
        assert_eq!(Payload::Bytes(vec![1, 2, 3]).len_bytes(), 3);
    }

    #[test]
    fn test_snapshot_display() {
        let snap = TaskSnapshot {
            id: TaskId(4),
            kind: Some(JobKind::Decoding),
            criticality: Some(Criticality::Base),
            accelerator: Some(AcceleratorBinding::new(AcceleratorType::Cpu, 2)),
            status: TaskStatus::Dispatched,
            finalizer: true,
        };
        assert_eq!(
            snap.to_string(),
            "task   4 [dispatched] decoding base on cpu#2 (auto-release)"
        );
    }
}
