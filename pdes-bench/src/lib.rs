//! PHOLD workload for exercising the pdes-core memory and GVT layers.
//!
//! Agents sit on a `rows × cols` torus. Every event handled sends exactly
//! one new event, either back to the handling agent or to one of its four
//! neighbours in turn, so the event population stays constant and the only
//! knobs are locality and timestamp spread:
//!
//! ```text
//! receive = now + lookahead + delay,   delay ~ distribution(0..=max_delay)
//! ```
//!
//! Events that would land at or past `end_time` are not scheduled.

use std::path::Path;

use bytemuck::{Pod, Zeroable};
use pdes_core::{Agent, AgentContext, AgentId, EventHandle, SimulationConfig, Time};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Shape of the random part of each event's delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DelayDistribution {
    /// Uniform over `0..=max_delay`.
    #[default]
    Uniform,
    /// Exponential with mean `max_delay / 2`, truncated to an integer.
    Exponential,
    /// `max_delay` minus an exponential draw: most events land far ahead.
    ReverseExponential,
}

/// Model parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PholdParams {
    /// Torus rows.
    pub rows: u64,
    /// Torus columns.
    pub cols: u64,
    /// Events each agent schedules to itself at start.
    pub events_per_agent: usize,
    /// Minimum delay of every event after the first.
    pub lookahead: f64,
    /// Upper bound of the random delay.
    pub max_delay: u32,
    /// Delay distribution.
    pub distribution: DelayDistribution,
    /// Fraction of events an agent sends to itself.
    pub self_events: f64,
    /// Busy-loop iterations per event, to emulate model work.
    pub granularity: u32,
    /// Payload bytes per event.
    pub payload_size: usize,
    /// Base seed; each agent mixes in its id.
    pub seed: u64,
}

impl Default for PholdParams {
    fn default() -> Self {
        Self {
            rows: 8,
            cols: 8,
            events_per_agent: 2,
            lookahead: 1.0,
            max_delay: 10,
            distribution: DelayDistribution::Uniform,
            self_events: 0.5,
            granularity: 0,
            payload_size: 0,
            seed: 0x5eed,
        }
    }
}

impl PholdParams {
    /// Number of agents on the torus.
    pub fn agents(&self) -> u64 {
        self.rows * self.cols
    }

    /// Rejects parameters the model cannot run with.
    pub fn validate(&self) -> pdes_core::Result<()> {
        if self.agents() == 0 {
            return Err(pdes_core::Error::Config("PHOLD needs at least one agent".into()));
        }
        if !(self.lookahead > 0.0) {
            return Err(pdes_core::Error::Config(format!(
                "lookahead {} must be positive",
                self.lookahead
            )));
        }
        if !(0.0..=1.0).contains(&self.self_events) {
            return Err(pdes_core::Error::Config(format!(
                "self_events {} must be in [0, 1]",
                self.self_events
            )));
        }
        Ok(())
    }
}

/// A TOML run description: `[simulation]` plus `[phold]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BenchConfig {
    /// Kernel configuration.
    pub simulation: SimulationConfig,
    /// Model parameters.
    pub phold: PholdParams,
}

impl BenchConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> pdes_core::Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.simulation.validate()?;
        config.phold.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&text)?)
    }
}

/// What an agent saves after every event.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PholdState {
    /// Events handled.
    pub handled: u64,
    /// Next neighbour to send to, 0..4.
    pub neighbour: u32,
    _pad: u32,
}

/// One PHOLD agent.
#[derive(Debug)]
pub struct PholdAgent {
    id: AgentId,
    params: PholdParams,
    end_time: Time,
    rng: StdRng,
    state: PholdState,
    payload: Vec<u8>,
}

impl PholdAgent {
    /// Agent `id` of a model ending at `end_time`.
    pub fn new(id: AgentId, params: PholdParams, end_time: Time) -> Self {
        let rng = StdRng::seed_from_u64(params.seed ^ id.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        let payload = vec![0; params.payload_size];
        Self {
            id,
            params,
            end_time,
            rng,
            state: PholdState::default(),
            payload,
        }
    }

    /// Saved state.
    pub fn phold_state(&self) -> PholdState {
        self.state
    }

    fn delay(&mut self) -> f64 {
        let max = f64::from(self.params.max_delay);
        if max == 0.0 {
            return 0.0;
        }
        match self.params.distribution {
            DelayDistribution::Uniform => f64::from(self.rng.gen_range(0..=self.params.max_delay)),
            DelayDistribution::Exponential => self.exponential(max).min(max),
            DelayDistribution::ReverseExponential => max - self.exponential(max).min(max),
        }
    }

    /// Integer draw from an exponential with mean `max / 2`.
    fn exponential(&mut self, max: f64) -> f64 {
        let u: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        (-u.ln() * max / 2.0).floor()
    }

    fn next_receiver(&mut self) -> AgentId {
        if self.rng.gen::<f64>() < self.params.self_events {
            return self.id;
        }
        let (rows, cols) = (self.params.rows, self.params.cols);
        let (row, col) = (self.id / cols, self.id % cols);
        let (row, col) = match self.state.neighbour {
            0 => (row, (col + cols - 1) % cols),
            1 => ((row + rows - 1) % rows, col),
            2 => ((row + 1) % rows, col),
            _ => (row, (col + 1) % cols),
        };
        self.state.neighbour = (self.state.neighbour + 1) % 4;
        row * cols + col
    }

    fn spin(&self) {
        let mut acc = 0.0f64;
        for i in 0..self.params.granularity {
            acc += std::hint::black_box(f64::from(i)).sin();
        }
        std::hint::black_box(acc);
    }
}

impl Agent for PholdAgent {
    fn id(&self) -> AgentId {
        self.id
    }

    fn initialize(&mut self, ctx: &mut AgentContext<'_>) {
        for _ in 0..self.params.events_per_agent {
            let receive = ctx.now() + 1.0 + self.delay();
            if receive < self.end_time {
                ctx.schedule_event(self.id, receive, &self.payload);
            }
        }
    }

    fn execute(&mut self, ctx: &mut AgentContext<'_>, _event: &EventHandle) {
        self.spin();
        self.state.handled += 1;
        let receive = ctx.now() + self.params.lookahead + self.delay();
        if receive < self.end_time {
            let receiver = self.next_receiver();
            ctx.schedule_event(receiver, receive, &self.payload);
        }
    }

    fn state(&self) -> &[u8] {
        bytemuck::bytes_of(&self.state)
    }
}

/// Every agent of the model, ready for [`pdes_core::MultiThreadedSimulation`].
pub fn build_agents(params: &PholdParams, end_time: Time) -> Vec<Box<dyn Agent>> {
    (0..params.agents())
        .map(|id| Box::new(PholdAgent::new(id, params.clone(), end_time)) as Box<dyn Agent>)
        .collect()
}
