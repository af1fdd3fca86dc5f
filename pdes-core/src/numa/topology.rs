//! NUMA topology discovery.
//!
//! Reads `/sys/devices/system/node` once per process. The result decides
//! the default thread → node mapping when the configuration does not give
//! one explicitly.

use std::sync::OnceLock;

use super::{NodeId, NumaError, Result};

static TOPOLOGY: OnceLock<NumaTopology> = OnceLock::new();

/// A set of CPU IDs (up to 256).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuSet {
    mask: [u64; 4],
}

impl CpuSet {
    /// Creates an empty set.
    pub const fn new() -> Self {
        Self { mask: [0; 4] }
    }

    /// Adds `cpu`; ids of 256 and above are ignored.
    pub fn insert(&mut self, cpu: u32) {
        if cpu < 256 {
            self.mask[(cpu / 64) as usize] |= 1 << (cpu % 64);
        }
    }

    /// Whether `cpu` is in the set.
    pub fn contains(&self, cpu: u32) -> bool {
        cpu < 256 && self.mask[(cpu / 64) as usize] & (1 << (cpu % 64)) != 0
    }

    /// Number of CPUs in the set.
    pub fn count(&self) -> usize {
        self.mask.iter().map(|m| m.count_ones() as usize).sum()
    }

    /// CPUs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..256u32).filter(|&cpu| self.contains(cpu))
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.mask.iter().all(|&m| m == 0)
    }
}

/// Parses a kernel CPU list such as `0-3,8,10-11`.
///
/// Malformed ranges are skipped.
pub fn parse_cpu_list(list: &str) -> CpuSet {
    let mut cpus = CpuSet::new();
    for range in list.trim().split(',').filter(|r| !r.is_empty()) {
        match range.split_once('-') {
            Some((lo, hi)) => {
                if let (Ok(lo), Ok(hi)) = (lo.trim().parse::<u32>(), hi.trim().parse::<u32>()) {
                    (lo..=hi).for_each(|cpu| cpus.insert(cpu));
                }
            }
            None => {
                if let Ok(cpu) = range.trim().parse::<u32>() {
                    cpus.insert(cpu);
                }
            }
        }
    }
    cpus
}

fn parse_mem_total(meminfo: &str) -> Option<u64> {
    // "Node 0 MemTotal:       32766344 kB"
    meminfo
        .lines()
        .find(|l| l.contains("MemTotal:"))
        .and_then(|l| l.split_whitespace().nth(3))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

/// A NUMA node and its CPUs.
#[derive(Debug, Clone)]
pub struct NumaNode {
    id: NodeId,
    cpus: CpuSet,
    total_memory: u64,
}

impl NumaNode {
    /// Node identifier.
    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// CPUs local to this node.
    #[inline]
    pub fn cpus(&self) -> &CpuSet {
        &self.cpus
    }

    /// Installed memory in bytes (0 if unknown).
    #[inline]
    pub fn total_memory(&self) -> u64 {
        self.total_memory
    }
}

/// The host's NUMA layout.
#[derive(Debug, Clone)]
pub struct NumaTopology {
    nodes: Vec<NumaNode>,
    numa_available: bool,
}

impl NumaTopology {
    /// Process-wide topology, discovered on first use.
    pub fn get() -> &'static Self {
        TOPOLOGY.get_or_init(|| {
            Self::discover().unwrap_or_else(|err| {
                tracing::warn!(%err, "NUMA discovery failed, assuming a single node");
                Self::fallback()
            })
        })
    }

    /// Discovers the topology of this host.
    pub fn discover() -> Result<Self> {
        #[cfg(target_os = "linux")]
        {
            Self::discover_linux()
        }

        #[cfg(not(target_os = "linux"))]
        {
            Ok(Self::fallback())
        }
    }

    /// Single node owning every available CPU.
    pub fn fallback() -> Self {
        let num_cpus = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1);

        let mut cpus = CpuSet::new();
        (0..num_cpus as u32).for_each(|cpu| cpus.insert(cpu));

        Self {
            nodes: vec![NumaNode {
                id: NodeId(0),
                cpus,
                total_memory: 0,
            }],
            numa_available: false,
        }
    }

    /// Builds a topology from explicit per-node CPU sets, for tests and for
    /// hosts whose sysfs is unreadable.
    pub fn from_nodes(nodes: Vec<(NodeId, CpuSet)>) -> Self {
        let numa_available = nodes.len() > 1;
        Self {
            nodes: nodes
                .into_iter()
                .map(|(id, cpus)| NumaNode {
                    id,
                    cpus,
                    total_memory: 0,
                })
                .collect(),
            numa_available,
        }
    }

    #[cfg(target_os = "linux")]
    fn discover_linux() -> Result<Self> {
        use std::fs;
        use std::path::Path;

        let root = Path::new("/sys/devices/system/node");
        if !root.exists() {
            return Ok(Self::fallback());
        }

        let mut ids: Vec<u32> = fs::read_dir(root)
            .map_err(|_| NumaError::Topology)?
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name();
                name.to_str()
                    .and_then(|n| n.strip_prefix("node"))
                    .and_then(|id| id.parse::<u32>().ok())
            })
            .collect();

        if ids.is_empty() {
            return Ok(Self::fallback());
        }
        ids.sort_unstable();

        let nodes: Vec<NumaNode> = ids
            .iter()
            .map(|&id| {
                let dir = root.join(format!("node{id}"));
                let cpus = fs::read_to_string(dir.join("cpulist"))
                    .map(|list| parse_cpu_list(&list))
                    .unwrap_or_default();
                let total_memory = fs::read_to_string(dir.join("meminfo"))
                    .ok()
                    .and_then(|info| parse_mem_total(&info))
                    .unwrap_or(0);
                NumaNode {
                    id: NodeId(id),
                    cpus,
                    total_memory,
                }
            })
            .collect();

        tracing::debug!(nodes = nodes.len(), "discovered NUMA topology");
        Ok(Self {
            numa_available: nodes.len() > 1,
            nodes,
        })
    }

    /// Number of nodes.
    #[inline]
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the host has more than one node.
    #[inline]
    pub fn is_numa_available(&self) -> bool {
        self.numa_available
    }

    /// Looks up a node.
    pub fn node(&self, id: NodeId) -> Option<&NumaNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// All nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &NumaNode> {
        self.nodes.iter()
    }

    /// Node that owns `cpu`, or node 0 if no node claims it.
    pub fn node_of_cpu(&self, cpu: u32) -> NodeId {
        self.nodes
            .iter()
            .find(|n| n.cpus.contains(cpu))
            .map_or(NodeId(0), |n| n.id)
    }

    /// All CPUs, grouped node by node.
    ///
    /// Assigning threads to this list in order keeps consecutive threads
    /// on the same node.
    pub fn cpus_by_node(&self) -> Vec<u32> {
        self.nodes.iter().flat_map(|n| n.cpus.iter()).collect()
    }

    /// Node of the CPU the calling thread is running on.
    pub fn current_node(&self) -> NodeId {
        #[cfg(target_os = "linux")]
        {
            let cpu = unsafe { libc::sched_getcpu() };
            if cpu >= 0 {
                return self.node_of_cpu(cpu as u32);
            }
        }
        NodeId(0)
    }

    /// Fails with [`NumaError::InvalidNode`] if `node` is not present.
    pub fn check_node(&self, node: NodeId) -> Result<()> {
        self.node(node)
            .map(|_| ())
            .ok_or(NumaError::InvalidNode(node.0))
    }
}
