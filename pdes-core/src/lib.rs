//! PDES Core: Memory Recycling, NUMA Placement and GVT for Parallel Discrete-Event Simulation
//!
//! This crate is the memory-and-time core of a multi-threaded discrete-event
//! simulation kernel. It decides where every event and agent state lives,
//! how buffers are shared between threads, and when they may be reused.
//!
//! # Architecture
//!
//! Leaves first:
//! - [`barrier`]: generation-counted spin barrier used for wind-down
//! - [`numa`]: node-bound blocks carved by a per-thread bump allocator
//! - [`recycler`]: event and state recyclers, including the dual
//!   reference-count protocol for events shared across threads
//! - [`gvt`]: GVT tokens and Mattern's algorithm with one rank per thread
//! - [`simulation`]: the per-thread control loop tying it all together
//!
//! # Reclamation Invariant
//!
//! A shared event has one counter per side, each written by exactly one
//! thread:
//! ```text
//! reclaim(e) ⟺ reference_count(e) = 0 ∧ input_ref_count(e) = 0
//! ```
//! Receivers only release an event once GVT has passed its receive time, so
//! no buffer is reused while it can still be processed.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use pdes_core::recycler::EventRecycler;
//! use pdes_core::topology::MemoryTopology;
//!
//! let topology = Arc::new(MemoryTopology::single_node(1));
//! let mut recycler = EventRecycler::new(0, topology, 64 * 1024).unwrap();
//!
//! let event = recycler.allocate(128, 0);
//! recycler.increase_reference(event);
//! recycler.decrease_reference(event);
//!
//! // The same bucket serves the next allocation without the system allocator.
//! let again = recycler.allocate(128, 0);
//! assert_eq!(recycler.stats().recycle_hits, 1);
//! # recycler.increase_reference(again);
//! # recycler.decrease_reference(again);
//! ```
//!
//! # Feature Flags
//!
//! - `numa` (default): allow NUMA block placement
//! - `recycle-events` (default): recycle event buffers by size
//! - `recycle-states` (default): recycle state buffers by size
//! - `loom`: model-check the barrier (with `--cfg loom`)
//!
//! # References
//!
//! - Friedemann Mattern. "Efficient Algorithms for Distributed Snapshots and
//!   Global Virtual Time Approximation." JPDC, 1993.
//! - Richard Fujimoto. "Parallel and Distributed Simulation Systems." Wiley, 2000.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Conditional synchronization primitives for Loom integration
pub mod sync;

pub mod agent;
pub mod barrier;
pub mod config;
pub mod event;
pub mod gvt;
pub mod numa;
pub mod queue;
pub mod recycler;
pub mod scheduler;
pub mod simulation;
pub mod topology;
pub mod transport;

// Re-export main types at crate root for convenience
pub use agent::{Agent, AgentContext};
pub use barrier::{BarrierPoisoned, SpinBarrier};
pub use config::{NumaSetting, QueueKind, SimulationConfig};
pub use event::{AgentId, EventHandle, EventHeader, Time, TIME_INFINITY};
pub use gvt::{GvtManager, GvtMessage, GvtMsgKind};
pub use recycler::{Allocator, EventRecycler, StateRecycler};
pub use simulation::{MultiThreadedSimulation, SimulationReport, ThreadReport};
pub use topology::{MemoryTopology, NodeId};
pub use transport::{NullTransport, Transport};

/// Error types for the pdes-core crate
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// NUMA placement was requested without the `numa` feature.
    #[error("NUMA placement requested but the `numa` feature is not compiled in")]
    NumaNotCompiled,

    /// NUMA placement needs buffers to be recycled.
    #[error("NUMA placement requires the `recycle-events` feature")]
    NumaWithoutRecycling,

    /// Thread count of zero or above [`config::MAX_THREADS`].
    #[error("invalid thread count: {0}")]
    InvalidThreads(usize),

    /// Inconsistent configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// NUMA discovery or binding failed.
    #[error(transparent)]
    Numa(#[from] numa::NumaError),

    /// The configuration file is not valid TOML for [`SimulationConfig`].
    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// A worker thread panicked.
    #[error("simulation thread {0} panicked")]
    WorkerPanicked(usize),

    /// A worker thread could not be started.
    #[error("failed to spawn simulation thread {thread}")]
    Spawn {
        /// Thread that was being spawned.
        thread: usize,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A worker thread stopped because a peer failed.
    #[error("simulation thread {0} stopped after a peer failed")]
    Abandoned(usize),
}

/// Result type for pdes-core operations
pub type Result<T> = core::result::Result<T, Error>;
