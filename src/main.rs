use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};

use accelsched::accel::SelectionPolicy;
use accelsched::config::{Config, LoggingConfig};
use accelsched::scheduler::{format_summary, SchedError};

/// Exit status for scheduler integrity faults (EX_SOFTWARE).
const EXIT_INTEGRITY_FAULT: i32 = 70;

#[derive(Parser)]
#[command(
    name = "accelsched",
    about = "Criticality-aware task scheduler for heterogeneous accelerators",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the simulated perception/control loop
    Run {
        /// Config file (defaults: $ACCELSCHED_CONFIG, ./accelsched.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Accelerator selection policy: select_and_wait or fastest_first
        #[arg(long)]
        policy: Option<SelectionPolicy>,

        /// Number of control-loop cycles
        #[arg(long)]
        cycles: Option<u32>,

        /// Additional non-critical spectral jobs per cycle
        #[arg(long)]
        extra_spectral: Option<u32>,

        /// Additional non-critical decoding jobs per cycle
        #[arg(long)]
        extra_decoding: Option<u32>,

        /// Seed for the synthetic input feed
        #[arg(long)]
        seed: Option<u64>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show the configured accelerator inventory
    Inventory {
        /// Config file (defaults: $ACCELSCHED_CONFIG, ./accelsched.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Print the default configuration as TOML
    Config,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Resolve the config with a temporary stderr subscriber installed, so
/// fallback warnings are visible before the configured one exists.
fn resolve_config(explicit: Option<&Path>) -> Result<Config> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::with_default(bootstrap, || Config::resolve(explicit))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            policy,
            cycles,
            extra_spectral,
            extra_decoding,
            seed,
            json,
        } => {
            let mut cfg = resolve_config(config.as_deref())?;
            if let Some(policy) = policy {
                cfg.scheduler.policy = policy;
            }
            if let Some(cycles) = cycles {
                cfg.workload.cycles = cycles;
            }
            if let Some(n) = extra_spectral {
                cfg.workload.extra_spectral = n;
            }
            if let Some(n) = extra_decoding {
                cfg.workload.extra_decoding = n;
            }
            if let Some(seed) = seed {
                cfg.workload.seed = seed;
            }
            init_tracing(&cfg.logging);
            tracing::info!(policy = %cfg.scheduler.policy, cycles = cfg.workload.cycles, "Running control loop");

            let (report, usage) = match accelsched::run(&cfg).await {
                Ok(out) => out,
                Err(e) => {
                    if e
                        .downcast_ref::<SchedError>()
                        .is_some_and(SchedError::is_integrity_fault)
                    {
                        tracing::error!(error = %format!("{:#}", e), "scheduler integrity fault");
                        eprintln!("accelsched: scheduler integrity fault: {:#}", e);
                        std::process::exit(EXIT_INTEGRITY_FAULT);
                    }
                    return Err(e);
                }
            };

            if json {
                let out = serde_json::json!({ "run": report, "usage": usage });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("\naccelsched run {}", report.run_id);
                println!("policy {}, {} cycles", report.policy, report.cycles);
                println!(
                    "{:<16} | {:>8} | {:>8} | {:>9} | {:>6} | {:>7}",
                    "Critical job", "Launched", "Correct", "Incorrect", "Failed", "Skipped"
                );
                println!("{:-<16}-|-{:-<8}-|-{:-<8}-|-{:-<9}-|-{:-<6}-|-{:-<7}", "", "", "", "", "", "");
                for (kind, t) in &report.critical {
                    println!(
                        "{:<16} | {:>8} | {:>8} | {:>9} | {:>6} | {:>7}",
                        kind, t.launched, t.correct, t.incorrect, t.failed, t.skipped
                    );
                }
                println!(
                    "\nNon-critical: {} launched, {} completed, {} failed, {} skipped",
                    report.extras.launched,
                    report.extras.completed,
                    report.extras.failed,
                    report.extras.skipped
                );
                println!("\n=== Timing ===");
                println!("  total                 {:>10} usec", report.timing.total_us);
                println!("  dispatch              {:>10} usec", report.timing.dispatch_us);
                println!("  wait_all_critical     {:>10} usec", report.timing.wait_critical_us);
                println!("  finish                {:>10} usec", report.timing.finish_us);
                println!("\n{}", format_summary(&usage));
            }
        }
        Commands::Inventory { config, json } => {
            let cfg = resolve_config(config.as_deref())?;
            init_tracing(&cfg.logging);
            cfg.validate()?;

            let inventory = cfg.inventory();
            let latencies = cfg.latencies();
            if json {
                let rows: Vec<_> = inventory
                    .iter()
                    .map(|spec| {
                        serde_json::json!({
                            "accelerator": spec.binding,
                            "rank": spec.rank,
                            "latency_us": latencies
                                .get(&spec.binding)
                                .map(|d| d.as_micros() as u64)
                                .unwrap_or(0),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                println!("Policy: {}", cfg.scheduler.policy);
                println!("Descriptors: {}", cfg.scheduler.pool_capacity);
                println!("{:<20} | {:>4} | {:>10}", "Accelerator", "Rank", "Latency us");
                println!("{:-<20}-|-{:-<4}-|-{:-<10}", "", "", "");
                for spec in &inventory {
                    let latency = latencies
                        .get(&spec.binding)
                        .map(|d| d.as_micros())
                        .unwrap_or(0);
                    println!(
                        "{:<20} | {:>4} | {:>10}",
                        spec.binding.to_string(),
                        spec.rank,
                        latency
                    );
                }
            }
        }
        Commands::Config => {
            let text = toml::to_string_pretty(&Config::default())?;
            println!("{}", text);
        }
    }

    Ok(())
}
