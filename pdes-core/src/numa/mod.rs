//! NUMA-aware memory placement.
//!
//! Event and state buffers are carved out of large blocks whose pages are
//! bound to one NUMA node, so the CPU that reads an event touches local
//! memory:
//!
//! ```text
//! ┌──────────── thread 3 (node 1) ────────────┐
//! │ NumaMemoryManager                         │
//! │   blocks[0]: [blk][blk][blk*]  ◄── bump   │
//! │   blocks[1]: [blk*]                       │
//! │   recycler[1][128] = [buf, buf, ...]      │
//! └───────────────────────────────────────────┘
//!   * top-of-stack block, still being carved
//! ```
//!
//! Blocks are only returned to the OS when their manager is dropped. At
//! simulation wind-down every worker hands its blocks to the main thread
//! (see [`NumaMemoryManager::move_numa_blocks_to`]) so memory that another
//! thread may still reference is never unmapped early.
//!
//! # Platform Support
//!
//! - Linux: `mmap` + `mbind(MPOL_BIND)` with pre-faulted pages
//! - Elsewhere: page-aligned heap blocks, every node treated as node 0

mod allocator;
mod manager;
mod topology;

pub use allocator::{NumaAllocator, NumaRegion, RegionOrigin};
pub use manager::{align_ptr, ManagerStats, NumaBlock, NumaBlocks, NumaMemoryManager, PREFIX};
pub use topology::{parse_cpu_list, CpuSet, NumaNode, NumaTopology};

pub use crate::topology::NodeId;

use core::sync::atomic::{AtomicU64, Ordering};

/// Maximum supported NUMA nodes.
pub const MAX_NUMA_NODES: usize = 64;

/// Errors raised while discovering or binding NUMA resources.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NumaError {
    /// NUMA is not available on this system.
    #[error("NUMA not available")]
    Unavailable,

    /// Node id outside the discovered topology.
    #[error("invalid NUMA node: {0}")]
    InvalidNode(u32),

    /// `sched_setaffinity` rejected the request.
    #[error("thread affinity error (errno {0})")]
    Affinity(i32),

    /// Reading `/sys/devices/system/node` failed.
    #[error("topology discovery failed")]
    Topology,
}

/// Result type for NUMA operations.
pub type Result<T> = core::result::Result<T, NumaError>;

/// Pins the calling thread to `cpu`.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: u32) -> Result<()> {
    // SAFETY: `cpu_set_t` is plain data and the call only reads it.
    unsafe {
        let mut cpuset: libc::cpu_set_t = core::mem::zeroed();
        libc::CPU_ZERO(&mut cpuset);
        libc::CPU_SET(cpu as usize, &mut cpuset);
        let result = libc::sched_setaffinity(0, core::mem::size_of::<libc::cpu_set_t>(), &cpuset);
        if result == 0 {
            Ok(())
        } else {
            Err(NumaError::Affinity(*libc::__errno_location()))
        }
    }
}

/// Pins the calling thread to `cpu`.
#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_cpu: u32) -> Result<()> {
    Err(NumaError::Unavailable)
}

/// Per-node mapping statistics.
///
/// Updated by the owning thread and read by whoever builds the final
/// report, hence atomic.
#[derive(Debug)]
pub struct NumaStats {
    /// Bytes currently mapped per node.
    pub bytes_mapped: [AtomicU64; MAX_NUMA_NODES],

    /// Blocks mapped per node over the lifetime of the allocator.
    pub regions_mapped: [AtomicU64; MAX_NUMA_NODES],

    /// `mbind` calls the kernel refused.
    pub bind_failures: AtomicU64,
}

impl Default for NumaStats {
    fn default() -> Self {
        const INIT: AtomicU64 = AtomicU64::new(0);
        Self {
            bytes_mapped: [INIT; MAX_NUMA_NODES],
            regions_mapped: [INIT; MAX_NUMA_NODES],
            bind_failures: AtomicU64::new(0),
        }
    }
}

impl NumaStats {
    /// Records a freshly mapped region.
    pub fn record_map(&self, node: NodeId, bytes: u64) {
        if node.index() < MAX_NUMA_NODES {
            self.bytes_mapped[node.index()].fetch_add(bytes, Ordering::Relaxed);
            self.regions_mapped[node.index()].fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a region handed back to the OS.
    ///
    /// Saturates at zero: a region may be released by a different manager
    /// than the one that mapped it.
    pub fn record_unmap(&self, node: NodeId, bytes: u64) {
        if node.index() < MAX_NUMA_NODES {
            let _ = self.bytes_mapped[node.index()]
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |b| Some(b.saturating_sub(bytes)));
        }
    }

    /// Records a failed `mbind`.
    pub fn record_bind_failure(&self) {
        self.bind_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes currently mapped on `node`.
    pub fn mapped_on(&self, node: NodeId) -> u64 {
        self.bytes_mapped
            .get(node.index())
            .map_or(0, |b| b.load(Ordering::Relaxed))
    }
}
