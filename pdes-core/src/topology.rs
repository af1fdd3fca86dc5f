//! Process-wide memory topology.
//!
//! Built once before any worker starts and shared read-only through an
//! `Arc`. Every allocator consults it to turn a thread (or the thread that
//! owns an agent) into the NUMA node its buffers should live on.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{NumaSetting, SimulationConfig};
use crate::event::AgentId;
use crate::numa::NumaTopology;
use crate::{Error, Result};

/// Logical simulation thread index, `0..threads`.
pub type ThreadId = usize;

/// A NUMA node identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Creates a node id.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Raw id.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Id as a table index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for NodeId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Maps an agent to the simulation thread that owns it.
pub trait AgentMap: Send + Sync + fmt::Debug {
    /// Thread owning `agent`.
    fn thread_of(&self, agent: AgentId) -> ThreadId;
}

/// Round-robin ownership: agent `a` lives on thread `a % threads`.
#[derive(Debug, Clone, Copy)]
pub struct ModuloAgentMap {
    threads: usize,
}

impl ModuloAgentMap {
    /// Creates a map over `threads` threads.
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }
}

impl AgentMap for ModuloAgentMap {
    #[inline]
    fn thread_of(&self, agent: AgentId) -> ThreadId {
        (agent % self.threads as u64) as ThreadId
    }
}

/// Explicit ownership table with a modulo fallback for unlisted agents.
#[derive(Debug, Clone)]
pub struct TableAgentMap {
    table: HashMap<AgentId, ThreadId>,
    fallback: ModuloAgentMap,
}

impl TableAgentMap {
    /// Creates an empty table over `threads` threads.
    pub fn new(threads: usize) -> Self {
        Self {
            table: HashMap::new(),
            fallback: ModuloAgentMap::new(threads),
        }
    }

    /// Assigns `agent` to `thread`.
    pub fn assign(&mut self, agent: AgentId, thread: ThreadId) -> &mut Self {
        self.table.insert(agent, thread);
        self
    }
}

impl AgentMap for TableAgentMap {
    fn thread_of(&self, agent: AgentId) -> ThreadId {
        self.table
            .get(&agent)
            .copied()
            .unwrap_or_else(|| self.fallback.thread_of(agent))
    }
}

/// Write-once thread → node table plus the placement policy.
#[derive(Debug, Clone)]
pub struct MemoryTopology {
    thread_numa: Vec<NodeId>,
    numa_setting: NumaSetting,
    agent_map: Arc<dyn AgentMap>,
}

impl MemoryTopology {
    /// Creates a topology from an explicit thread → node table.
    pub fn new(thread_numa: Vec<NodeId>, numa_setting: NumaSetting, agent_map: Arc<dyn AgentMap>) -> Self {
        debug_assert!(!thread_numa.is_empty());
        Self {
            thread_numa,
            numa_setting,
            agent_map,
        }
    }

    /// `threads` threads on node 0, NUMA placement off, modulo agent map.
    pub fn single_node(threads: usize) -> Self {
        Self::new(
            vec![NodeId(0); threads.max(1)],
            NumaSetting::None,
            Arc::new(ModuloAgentMap::new(threads)),
        )
    }

    /// Builds the table for a run.
    ///
    /// An explicit `thread_numa` list wins. Otherwise pinned threads take
    /// the node of the CPU they will be pinned to and unpinned threads all
    /// use node 0.
    pub fn from_config(
        config: &SimulationConfig,
        host: &NumaTopology,
        agent_map: Arc<dyn AgentMap>,
    ) -> Result<Self> {
        let thread_numa: Vec<NodeId> = match &config.thread_numa {
            Some(nodes) => {
                if nodes.len() != config.threads {
                    return Err(Error::Config(format!(
                        "thread_numa lists {} nodes for {} threads",
                        nodes.len(),
                        config.threads
                    )));
                }
                nodes.iter().map(|&n| NodeId(n)).collect()
            }
            None if config.cpu_pinning => {
                let cpus = host.cpus_by_node();
                (0..config.threads)
                    .map(|t| {
                        cpus.get(t % cpus.len().max(1))
                            .map_or(NodeId(0), |&cpu| host.node_of_cpu(cpu))
                    })
                    .collect()
            }
            None => vec![NodeId(0); config.threads],
        };

        if config.numa_enabled {
            for &node in &thread_numa {
                host.check_node(node)?;
            }
        }

        Ok(Self::new(thread_numa, config.effective_numa_setting(), agent_map))
    }

    /// Number of simulation threads.
    #[inline]
    pub fn threads(&self) -> usize {
        self.thread_numa.len()
    }

    /// Node of `thread`; node 0 for out-of-range threads.
    #[inline]
    pub fn node_of_thread(&self, thread: ThreadId) -> NodeId {
        self.thread_numa.get(thread).copied().unwrap_or_default()
    }

    /// Thread owning `agent`.
    #[inline]
    pub fn thread_of(&self, agent: AgentId) -> ThreadId {
        self.agent_map.thread_of(agent)
    }

    /// Node of the thread owning `agent`.
    #[inline]
    pub fn node_of_agent(&self, agent: AgentId) -> NodeId {
        self.node_of_thread(self.thread_of(agent))
    }

    /// Placement policy for event buffers.
    #[inline]
    pub fn numa_setting(&self) -> NumaSetting {
        self.numa_setting
    }

    /// Whether buffers come from the NUMA block manager.
    #[inline]
    pub fn numa_enabled(&self) -> bool {
        self.numa_setting != NumaSetting::None
    }

    /// Distinct nodes used by any thread, ascending.
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes = self.thread_numa.clone();
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }

    /// The agent → thread map.
    pub fn agent_map(&self) -> &Arc<dyn AgentMap> {
        &self.agent_map
    }
}
