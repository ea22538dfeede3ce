//! Synthetic sensor input.
//!
//! Each cycle yields one radar sample block, one encoded V2V message and one
//! camera classifier frame, together with the values a correct kernel should
//! report for them.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::WorkloadConfig;
use crate::kernels::{classifier, decoder, spectral};

/// Inputs for one control-loop cycle plus their ground truth.
#[derive(Debug, Clone)]
pub struct CycleInputs {
    pub cycle: u32,
    /// Interleaved complex beat-signal samples.
    pub samples: Vec<f32>,
    pub expected_distance: f32,
    /// Repetition-coded message as received.
    pub encoded: Vec<u8>,
    pub expected_message: Vec<u8>,
    /// Per-class scores.
    pub scores: Vec<u8>,
    pub expected_label: u8,
}

/// Source of per-cycle inputs. Returns `None` when the trace is exhausted.
pub trait InputFeed: Send {
    fn next_cycle(&mut self) -> Option<CycleInputs>;

    /// An independent encoded message and its plaintext, for extra decoding
    /// jobs that should not reuse the cycle's message.
    fn random_message(&mut self) -> (Vec<u8>, Vec<u8>);
}

/// Seeded random feed sized by the workload configuration.
pub struct SyntheticFeed {
    rng: StdRng,
    cycles: u32,
    cycle: u32,
    fft_samples: usize,
    message_bytes: usize,
}

impl SyntheticFeed {
    pub fn new(workload: &WorkloadConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(workload.seed),
            cycles: workload.cycles,
            cycle: 0,
            fft_samples: workload.fft_samples(),
            message_bytes: workload.message_bytes(),
        }
    }

    fn radar_block(&mut self) -> (Vec<f32>, f32) {
        let n = self.fft_samples;
        let bin = self.rng.gen_range(1..n / 2);
        let noise = 0.05f32;
        let samples = (0..n)
            .flat_map(|i| {
                let phase = 2.0 * std::f32::consts::PI * (bin * i % n) as f32 / n as f32;
                let re = phase.cos() + self.rng.gen_range(-noise..noise);
                let im = phase.sin() + self.rng.gen_range(-noise..noise);
                [re, im]
            })
            .collect();
        (samples, bin as f32 * spectral::RANGE_RESOLUTION_M)
    }

    fn message(&mut self) -> (Vec<u8>, Vec<u8>) {
        let plain: Vec<u8> = (0..self.message_bytes).map(|_| self.rng.gen()).collect();
        let mut encoded = decoder::encode(&plain);
        // Corrupt at most one copy of each byte so the code can recover it.
        for chunk in encoded.chunks_exact_mut(decoder::CODE_RATE_INVERSE) {
            if self.rng.gen_bool(0.1) {
                let copy = self.rng.gen_range(0..decoder::CODE_RATE_INVERSE);
                chunk[copy] ^= self.rng.gen::<u8>() | 1;
            }
        }
        (encoded, plain)
    }

    fn frame(&mut self) -> (Vec<u8>, u8) {
        let label = self.rng.gen_range(0..classifier::LABELS.len()) as u8;
        let scores = (0..classifier::LABELS.len())
            .map(|i| {
                if i == label as usize {
                    self.rng.gen_range(200..=255)
                } else {
                    self.rng.gen_range(0..200)
                }
            })
            .collect();
        (scores, label)
    }
}

impl InputFeed for SyntheticFeed {
    fn next_cycle(&mut self) -> Option<CycleInputs> {
        if self.cycle >= self.cycles {
            return None;
        }
        let (samples, expected_distance) = self.radar_block();
        let (encoded, expected_message) = self.message();
        let (scores, expected_label) = self.frame();
        let inputs = CycleInputs {
            cycle: self.cycle,
            samples,
            expected_distance,
            encoded,
            expected_message,
            scores,
            expected_label,
        };
        self.cycle += 1;
        Some(inputs)
    }

    fn random_message(&mut self) -> (Vec<u8>, Vec<u8>) {
        self.message()
    }
}
