//! Run configuration and compile-time constants.
//!
//! A [`SimulationConfig`] is usually read from TOML; every field has a
//! default so a partial file (or none) is enough:
//!
//! ```toml
//! threads = 4
//! end_time = 500.0
//! numa_enabled = true
//! numa_setting = "receiver"
//! queue_kind = "multi-non-blocking"
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Largest supported thread count.
pub const MAX_THREADS: usize = 256;

/// Cache line size used for padding shared counters.
pub const CACHE_LINE_SIZE: usize = 64;

/// Default block size for event buffers.
pub const EVENT_BLOCK_SIZE: usize = 64 * 1024;

/// Default block size for state buffers.
pub const STATE_BLOCK_SIZE: usize = 32 * 1024;

/// Free buffers per size a thread keeps when it gives its surplus away.
///
/// A list is only split once it holds more than twice this many.
pub const REDISTRIBUTE_KEEP: usize = 32;

/// Initial adaptive sweep rate.
pub const INITIAL_DEALLOC_RATE: u32 = 1;

/// Whether event buffers are recycled (`recycle-events` feature).
pub const RECYCLE_EVENTS: bool = cfg!(feature = "recycle-events");

/// Whether state buffers are recycled (`recycle-states` feature).
pub const RECYCLE_STATES: bool = cfg!(feature = "recycle-states");

/// Whether NUMA placement is compiled in (`numa` feature).
pub const NUMA_SUPPORT: bool = cfg!(feature = "numa");

/// Where event buffers are placed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumaSetting {
    /// Global heap with size-bucketed recycling.
    #[default]
    None,
    /// On the sending thread's node. Suits cloned (per-destination) events.
    Sender,
    /// On the node of the thread owning the receiver. Suits shared events.
    Receiver,
}

impl FromStr for NumaSetting {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "sender" => Ok(Self::Sender),
            "receiver" => Ok(Self::Receiver),
            other => Err(Error::Config(format!(
                "invalid NUMA setting `{other}` (expected none, sender or receiver)"
            ))),
        }
    }
}

impl fmt::Display for NumaSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Sender => "sender",
            Self::Receiver => "receiver",
        })
    }
}

/// Implementation of the per-thread inbound queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueKind {
    /// One mutex-guarded vector.
    #[default]
    SingleBlocking,
    /// Mutex-guarded sub-queues picked by sender thread.
    MultiBlocking,
    /// Lock-free sub-queues picked by sender thread.
    MultiNonBlocking,
}

impl FromStr for QueueKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "single-blocking" => Ok(Self::SingleBlocking),
            "multi-blocking" => Ok(Self::MultiBlocking),
            "multi-non-blocking" => Ok(Self::MultiNonBlocking),
            other => Err(Error::Config(format!(
                "invalid queue kind `{other}` (expected single-blocking, multi-blocking or multi-non-blocking)"
            ))),
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SingleBlocking => "single-blocking",
            Self::MultiBlocking => "multi-blocking",
            Self::MultiNonBlocking => "multi-non-blocking",
        })
    }
}

/// Everything a run needs besides the agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// Simulation threads in this process.
    pub threads: usize,
    /// Virtual time at which agents are initialized.
    pub start_time: f64,
    /// The run stops once GVT reaches this time.
    pub end_time: f64,
    /// Loop iterations between GVT rounds started by thread 0.
    pub gvt_delay: u32,
    /// Use the NUMA block manager for event and state buffers.
    pub numa_enabled: bool,
    /// Event placement policy when NUMA is enabled.
    pub numa_setting: NumaSetting,
    /// Inbound queue implementation.
    pub queue_kind: QueueKind,
    /// Sub-queues per inbound queue for the multi kinds.
    pub sub_queues: usize,
    /// Pin each thread to one CPU.
    pub cpu_pinning: bool,
    /// Explicit node per thread.
    pub thread_numa: Option<Vec<u32>>,
    /// Reclaimed fraction below which pending sweeps back off.
    pub gc_threshold: f64,
    /// Block size of the event NUMA manager.
    pub event_block_size: usize,
    /// Block size of the state NUMA manager.
    pub state_block_size: usize,
    /// Share one event buffer between sender and receiver threads instead
    /// of cloning it per destination.
    pub share_events: bool,
    /// Loop iterations between transport polls on thread 0.
    pub poll_rate: u32,
    /// After each collection, deal free event buffers above
    /// [`REDISTRIBUTE_KEEP`] per size out to the other threads.
    pub redistribute_memory: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            start_time: 0.0,
            end_time: 100.0,
            gvt_delay: 1,
            numa_enabled: false,
            numa_setting: NumaSetting::None,
            queue_kind: QueueKind::SingleBlocking,
            sub_queues: 2,
            cpu_pinning: false,
            thread_numa: None,
            gc_threshold: 0.1,
            event_block_size: EVENT_BLOCK_SIZE,
            state_block_size: STATE_BLOCK_SIZE,
            share_events: true,
            poll_rate: 1,
            redistribute_memory: true,
        }
    }
}

impl SimulationConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Placement actually used: [`NumaSetting::None`] unless NUMA is on.
    pub fn effective_numa_setting(&self) -> NumaSetting {
        if self.numa_enabled {
            self.numa_setting
        } else {
            NumaSetting::None
        }
    }

    /// Rejects configurations the kernel cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 || self.threads > MAX_THREADS {
            return Err(Error::InvalidThreads(self.threads));
        }
        if !(self.end_time > self.start_time) {
            return Err(Error::Config(format!(
                "end_time {} must be greater than start_time {}",
                self.end_time, self.start_time
            )));
        }
        if self.gvt_delay == 0 || self.poll_rate == 0 {
            return Err(Error::Config("gvt_delay and poll_rate must be at least 1".into()));
        }
        if self.sub_queues == 0 {
            return Err(Error::Config("sub_queues must be at least 1".into()));
        }
        if !(self.gc_threshold > 0.0 && self.gc_threshold <= 1.0) {
            return Err(Error::Config(format!(
                "gc_threshold {} must be in (0, 1]",
                self.gc_threshold
            )));
        }
        if self.event_block_size < 1024 || self.state_block_size < 1024 {
            return Err(Error::Config("NUMA block sizes must be at least 1 KiB".into()));
        }
        if self.numa_enabled {
            if self.numa_setting == NumaSetting::None {
                return Err(Error::Config(
                    "numa_enabled requires numa_setting sender or receiver".into(),
                ));
            }
            if !NUMA_SUPPORT {
                return Err(Error::NumaNotCompiled);
            }
            if !RECYCLE_EVENTS {
                return Err(Error::NumaWithoutRecycling);
            }
        }
        Ok(())
    }
}
