//! TOML configuration for accelsched.
//!
//! Layered like the rest of the stack: an explicit path wins, then the
//! `ACCELSCHED_CONFIG` environment variable, then `./accelsched.toml`, then
//! compiled-in defaults.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::accel::{AcceleratorBinding, AcceleratorType, InstanceSpec, SelectionPolicy};
use crate::scheduler::MAX_POOL_CAPACITY;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "ACCELSCHED_CONFIG";

/// Config file picked up from the working directory.
pub const LOCAL_CONFIG: &str = "accelsched.toml";

/// Upper bound on instances of one accelerator type.
pub const MAX_INSTANCES_PER_TYPE: u32 = 10;

/// Message sizes selectable through `workload.message_size`, in bytes.
pub const MESSAGE_SIZES: [usize; 4] = [4, 500, 1000, 1500];

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default = "default_inventory")]
    pub accelerators: Vec<AcceleratorConfig>,
    #[serde(default)]
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler: SchedulerSection::default(),
            accelerators: default_inventory(),
            workload: WorkloadConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration for a process.
    ///
    /// An explicit path must load; the environment variable and local file
    /// fall through to the next layer with a warning.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        Ok(Self::load_or_default())
    }

    /// Try, in order:
    /// 1. The path in `ACCELSCHED_CONFIG`.
    /// 2. `./accelsched.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "ACCELSCHED_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        let capacity = self.scheduler.pool_capacity;
        if capacity == 0 || capacity > MAX_POOL_CAPACITY {
            bail!(
                "scheduler.pool_capacity must be between 1 and {}, got {}",
                MAX_POOL_CAPACITY,
                capacity
            );
        }

        if self.accelerators.is_empty() {
            bail!("at least one [[accelerators]] entry is required");
        }
        let mut per_type: BTreeMap<AcceleratorType, u32> = BTreeMap::new();
        for acc in &self.accelerators {
            if acc.rank == 0 {
                bail!("accelerator {} has rank 0; ranks start at 1", acc.kind);
            }
            let total = per_type.entry(acc.kind).or_default();
            *total = total.saturating_add(acc.count);
        }
        for (ty, count) in &per_type {
            if *count > MAX_INSTANCES_PER_TYPE {
                bail!(
                    "{} {} instances configured, at most {} are supported",
                    count,
                    ty,
                    MAX_INSTANCES_PER_TYPE
                );
            }
        }
        if per_type.values().all(|&c| c == 0) {
            bail!("accelerator inventory has no instances");
        }

        let w = &self.workload;
        if w.fft_log2_samples != 10 && w.fft_log2_samples != 14 {
            bail!(
                "workload.fft_log2_samples must be 10 or 14, got {}",
                w.fft_log2_samples
            );
        }
        if w.message_size >= MESSAGE_SIZES.len() {
            bail!(
                "workload.message_size must be 0..={}, got {}",
                MESSAGE_SIZES.len() - 1,
                w.message_size
            );
        }
        Ok(())
    }

    /// Expand `[[accelerators]]` into one spec per instance. Instance ids are
    /// numbered per type in file order.
    pub fn inventory(&self) -> Vec<InstanceSpec> {
        let mut next_id: BTreeMap<AcceleratorType, u32> = BTreeMap::new();
        let mut specs = Vec::new();
        for acc in &self.accelerators {
            let next = next_id.entry(acc.kind).or_default();
            for _ in 0..acc.count {
                specs.push(InstanceSpec {
                    binding: AcceleratorBinding::new(acc.kind, *next),
                    rank: acc.rank,
                });
                *next += 1;
            }
        }
        specs
    }

    /// Simulated execution latency of every instance.
    pub fn latencies(&self) -> HashMap<AcceleratorBinding, Duration> {
        let mut next_id: BTreeMap<AcceleratorType, u32> = BTreeMap::new();
        let mut map = HashMap::new();
        for acc in &self.accelerators {
            let next = next_id.entry(acc.kind).or_default();
            for _ in 0..acc.count {
                map.insert(
                    AcceleratorBinding::new(acc.kind, *next),
                    Duration::from_micros(acc.latency_us),
                );
                *next += 1;
            }
        }
        map
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub policy: SelectionPolicy,
    /// Number of task descriptors in the pool.
    pub pool_capacity: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            policy: SelectionPolicy::SelectAndWait,
            pool_capacity: 32,
        }
    }
}

// ---------------------------------------------------------------------------
// Accelerators
// ---------------------------------------------------------------------------

/// One group of identical accelerator instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AcceleratorConfig {
    pub kind: AcceleratorType,
    pub count: u32,
    /// Relative speed; 1 is the fastest.
    pub rank: u32,
    /// Simulated time one job occupies an instance.
    #[serde(default)]
    pub latency_us: u64,
}

fn default_inventory() -> Vec<AcceleratorConfig> {
    vec![
        AcceleratorConfig {
            kind: AcceleratorType::Cpu,
            count: 4,
            rank: 3,
            latency_us: 2_000,
        },
        AcceleratorConfig {
            kind: AcceleratorType::SpectralUnit,
            count: 2,
            rank: 1,
            latency_us: 300,
        },
        AcceleratorConfig {
            kind: AcceleratorType::DecoderUnit,
            count: 2,
            rank: 1,
            latency_us: 300,
        },
        AcceleratorConfig {
            kind: AcceleratorType::ClassifierUnit,
            count: 1,
            rank: 2,
            latency_us: 800,
        },
    ]
}

// ---------------------------------------------------------------------------
// Workload
// ---------------------------------------------------------------------------

/// Simulated control-loop workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Control-loop cycles to run.
    pub cycles: u32,
    /// Additional non-critical spectral jobs per cycle.
    pub extra_spectral: u32,
    /// Additional non-critical decoding jobs per cycle.
    pub extra_decoding: u32,
    /// log2 of the spectral block length (10 or 14).
    pub fft_log2_samples: u32,
    /// Index into the message size table (0..=3).
    pub message_size: usize,
    /// 0 makes extra decoding jobs reuse the critical job's message.
    pub size_variability: u32,
    pub seed: u64,
}

impl WorkloadConfig {
    pub fn message_bytes(&self) -> usize {
        MESSAGE_SIZES[self.message_size.min(MESSAGE_SIZES.len() - 1)]
    }

    pub fn fft_samples(&self) -> usize {
        1 << self.fft_log2_samples
    }
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            cycles: 10,
            extra_spectral: 0,
            extra_decoding: 0,
            fft_log2_samples: 10,
            message_size: 1,
            size_variability: 0,
            seed: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable logs.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = Config::default();
        cfg.validate().unwrap();

        assert_eq!(cfg.scheduler.policy, SelectionPolicy::SelectAndWait);
        assert_eq!(cfg.scheduler.pool_capacity, 32);

        let inv = cfg.inventory();
        assert_eq!(inv.len(), 9);
        let cpus: Vec<_> = inv
            .iter()
            .filter(|s| s.binding.accel_type == AcceleratorType::Cpu)
            .collect();
        assert_eq!(cpus.len(), 4);
        assert!(cpus.iter().all(|s| s.rank == 3));

        assert_eq!(cfg.workload.fft_samples(), 1024);
        assert_eq!(cfg.workload.message_bytes(), 500);
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[scheduler]
policy = "fastest_first"
pool_capacity = 8

[[accelerators]]
kind = "cpu"
count = 2
rank = 2
latency_us = 100

[[accelerators]]
kind = "spectral_unit"
count = 1
rank = 1

[workload]
cycles = 3
extra_spectral = 2
fft_log2_samples = 14
message_size = 3
seed = 42

[logging]
level = "debug"
json = true
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.scheduler.policy, SelectionPolicy::FastestFirst);
        assert_eq!(cfg.scheduler.pool_capacity, 8);
        assert_eq!(cfg.accelerators.len(), 2);
        assert_eq!(cfg.accelerators[1].latency_us, 0);
        assert_eq!(cfg.workload.cycles, 3);
        assert_eq!(cfg.workload.extra_decoding, 0);
        assert_eq!(cfg.workload.fft_samples(), 16384);
        assert_eq!(cfg.workload.message_bytes(), 1500);
        assert!(cfg.logging.json);

        let lat = cfg.latencies();
        assert_eq!(
            lat[&AcceleratorBinding::new(AcceleratorType::Cpu, 1)],
            Duration::from_micros(100)
        );
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: Config = toml::from_str("[workload]\ncycles = 99\n").unwrap();
        assert_eq!(cfg.workload.cycles, 99);
        assert_eq!(cfg.scheduler.pool_capacity, 32);
        assert_eq!(cfg.accelerators, default_inventory());
    }

    #[test]
    fn test_instance_ids_continue_across_groups() {
        let cfg: Config = toml::from_str(
            r#"
[[accelerators]]
kind = "cpu"
count = 2
rank = 3

[[accelerators]]
kind = "cpu"
count = 1
rank = 1
"#,
        )
        .unwrap();
        let inv = cfg.inventory();
        assert_eq!(inv[2].binding, AcceleratorBinding::new(AcceleratorType::Cpu, 2));
        assert_eq!(inv[2].rank, 1);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.scheduler.pool_capacity = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.scheduler.pool_capacity = MAX_POOL_CAPACITY + 1;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.accelerators[0].count = MAX_INSTANCES_PER_TYPE + 1;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.accelerators[1].rank = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.workload.fft_log2_samples = 12;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.workload.message_size = 4;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.accelerators.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_huge_instance_counts() {
        let cfg: Config = toml::from_str(
            r#"
[[accelerators]]
kind = "cpu"
count = 4000000000
rank = 1

[[accelerators]]
kind = "cpu"
count = 4000000000
rank = 2
"#,
        )
        .unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("instances configured"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[scheduler]\npolicy = \"fastest_first\"").unwrap();
        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.scheduler.policy, SelectionPolicy::FastestFirst);

        let explicit = Config::resolve(Some(file.path())).unwrap();
        assert_eq!(explicit.scheduler.policy, SelectionPolicy::FastestFirst);
    }

    #[test]
    fn test_load_reports_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[scheduler]\npool_capacity = 1000").unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("pool_capacity"));

        assert!(Config::load(Path::new("/nonexistent/accelsched.toml")).is_err());
    }

    #[test]
    fn test_serializes_back_to_toml() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        assert!(text.contains("[[accelerators]]"));
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.accelerators, default_inventory());
    }
}
