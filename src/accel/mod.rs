//! Accelerator inventory -- dedicated spectral/decoder/classifier units with a
//! general-purpose CPU fallback.
//!
//! Every job kind has a dedicated unit type and may fall back to the CPU. The
//! [`registry`] tracks which instance is busy; the [`policy`] decides which
//! instance a job lands on.

pub mod policy;
pub mod registry;

pub use policy::SelectionPolicy;
pub use registry::{AcceleratorRegistry, AcceleratorUsage, BindError, InstanceInfo, InstanceSpec};

use std::fmt;

use crate::scheduler::JobKind;

/// Hardware (or software) execution unit families.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AcceleratorType {
    /// General-purpose host cores (can run every job kind)
    Cpu,
    /// Dedicated spectral-transform (FFT) unit
    SpectralUnit,
    /// Dedicated convolutional-decoder (Viterbi) unit
    DecoderUnit,
    /// Dedicated classification (CNN) unit
    ClassifierUnit,
}

impl AcceleratorType {
    pub const ALL: [AcceleratorType; 4] = [
        AcceleratorType::Cpu,
        AcceleratorType::SpectralUnit,
        AcceleratorType::DecoderUnit,
        AcceleratorType::ClassifierUnit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AcceleratorType::Cpu => "cpu",
            AcceleratorType::SpectralUnit => "spectral_unit",
            AcceleratorType::DecoderUnit => "decoder_unit",
            AcceleratorType::ClassifierUnit => "classifier_unit",
        }
    }
}

impl fmt::Display for AcceleratorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accelerator types able to execute `kind`, dedicated unit first.
pub fn capable_types(kind: JobKind) -> &'static [AcceleratorType] {
    match kind {
        JobKind::Spectral => &[AcceleratorType::SpectralUnit, AcceleratorType::Cpu],
        JobKind::Decoding => &[AcceleratorType::DecoderUnit, AcceleratorType::Cpu],
        JobKind::Classification => &[AcceleratorType::ClassifierUnit, AcceleratorType::Cpu],
    }
}

/// A concrete accelerator instance a job has been bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct AcceleratorBinding {
    pub accel_type: AcceleratorType,
    pub instance: u32,
}

impl AcceleratorBinding {
    pub fn new(accel_type: AcceleratorType, instance: u32) -> Self {
        Self {
            accel_type,
            instance,
        }
    }
}

impl fmt::Display for AcceleratorBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.accel_type, self.instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_can_fall_back_to_cpu() {
        for kind in JobKind::ALL {
            let types = capable_types(kind);
            assert_eq!(types.last(), Some(&AcceleratorType::Cpu));
            assert_ne!(types[0], AcceleratorType::Cpu);
        }
    }

    #[test]
    fn test_binding_display() {
        let b = AcceleratorBinding::new(AcceleratorType::DecoderUnit, 1);
        assert_eq!(b.to_string(), "decoder_unit#1");
    }
}
