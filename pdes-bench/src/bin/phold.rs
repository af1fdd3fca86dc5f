//! PHOLD driver.
//!
//! Run with: `phold [--config run.toml] [OPTIONS]`
//!
//! Command-line options override the file.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pdes_bench::{build_agents, BenchConfig, DelayDistribution};
use pdes_core::{MultiThreadedSimulation, NumaSetting, QueueKind};

#[derive(Parser)]
#[command(name = "phold")]
#[command(about = "Run the PHOLD benchmark on the pdes-core kernel")]
#[command(version)]
struct Cli {
    /// TOML file with [simulation] and [phold] sections
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Simulation threads
    #[arg(short, long)]
    threads: Option<usize>,

    /// Virtual end time
    #[arg(short, long)]
    end_time: Option<f64>,

    /// Torus rows
    #[arg(long)]
    rows: Option<u64>,

    /// Torus columns
    #[arg(long)]
    cols: Option<u64>,

    /// Initial events per agent
    #[arg(long)]
    events_per_agent: Option<usize>,

    /// Upper bound of the random delay
    #[arg(long)]
    max_delay: Option<u32>,

    /// Delay distribution
    #[arg(long, value_enum)]
    distribution: Option<DelayDistribution>,

    /// Fraction of events sent to self
    #[arg(long)]
    self_events: Option<f64>,

    /// Inbound queue: single-blocking, multi-blocking or multi-non-blocking
    #[arg(long)]
    queue: Option<QueueKind>,

    /// Place events with the NUMA manager: sender or receiver
    #[arg(long)]
    numa: Option<NumaSetting>,

    /// Clone events per destination instead of sharing one buffer
    #[arg(long)]
    clone_events: bool,

    /// Keep surplus free event buffers on the thread that reclaimed them
    #[arg(long)]
    no_redistribute: bool,

    /// Pin each thread to a CPU
    #[arg(long)]
    pin: bool,

    /// Base random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> Result<BenchConfig> {
        let mut config = match &self.config {
            Some(path) => BenchConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
            None => BenchConfig::default(),
        };
        let sim = &mut config.simulation;
        if let Some(threads) = self.threads {
            sim.threads = threads;
        }
        if let Some(end_time) = self.end_time {
            sim.end_time = end_time;
        }
        if let Some(queue) = self.queue {
            sim.queue_kind = queue;
        }
        if let Some(setting) = self.numa {
            sim.numa_enabled = setting != NumaSetting::None;
            sim.numa_setting = setting;
        }
        if self.clone_events {
            sim.share_events = false;
        }
        if self.no_redistribute {
            sim.redistribute_memory = false;
        }
        if self.pin {
            sim.cpu_pinning = true;
        }

        let phold = &mut config.phold;
        if let Some(rows) = self.rows {
            phold.rows = rows;
        }
        if let Some(cols) = self.cols {
            phold.cols = cols;
        }
        if let Some(n) = self.events_per_agent {
            phold.events_per_agent = n;
        }
        if let Some(max_delay) = self.max_delay {
            phold.max_delay = max_delay;
        }
        if let Some(distribution) = self.distribution {
            phold.distribution = distribution;
        }
        if let Some(self_events) = self.self_events {
            phold.self_events = self_events;
        }
        if let Some(seed) = self.seed {
            phold.seed = seed;
        }

        config.simulation.validate()?;
        config.phold.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = cli.into_config()?;
    info!(
        agents = config.phold.agents(),
        threads = config.simulation.threads,
        end_time = config.simulation.end_time,
        "running PHOLD"
    );

    let agents = build_agents(&config.phold, config.simulation.end_time);
    let report = MultiThreadedSimulation::new(config.simulation, agents)
        .run()
        .context("simulation failed")?;

    print!("{report}");
    if report.outstanding != 0 {
        anyhow::bail!("{} event buffers were never reclaimed", report.outstanding);
    }
    Ok(())
}
