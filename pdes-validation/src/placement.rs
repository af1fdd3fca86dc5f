//! Physical page placement of NUMA blocks.
//!
//! Asks the kernel where pages actually live using `move_pages` with
//! `nodes = NULL`, which reports each page's node without moving it.
//! Pages never touched have no node yet and are counted separately.
//!
//! # Requirements
//!
//! - Linux
//! - More than one node for a meaningful answer; single-node hosts trivially
//!   pass

use std::collections::BTreeMap;

use pdes_core::numa::{NumaBlock, NumaMemoryManager, NumaTopology};
use pdes_core::NodeId;

/// Pages queried per `move_pages` call.
const PAGES_PER_CALL: usize = 512;

/// Placement check failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    /// `move_pages` is not available on this platform.
    #[error("page placement queries are only supported on Linux")]
    Unsupported,

    /// The caller may not query this process's pages.
    #[error("insufficient privileges for move_pages")]
    PermissionDenied,

    /// `move_pages` failed outright.
    #[error("move_pages failed with errno {0}")]
    Syscall(i32),

    /// Empty or null region.
    #[error("invalid region")]
    InvalidRegion,
}

/// Result type for placement checks.
pub type Result<T> = core::result::Result<T, PlacementError>;

/// Where a region's pages were found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementReport {
    /// Node the pages should be on.
    pub expected: NodeId,
    /// Pages queried.
    pub pages_checked: usize,
    /// Pages found on `expected`.
    pub pages_on_expected: usize,
    /// Pages not yet backed by memory.
    pub pages_unresident: usize,
    /// Resident pages per node.
    pub observed: BTreeMap<NodeId, usize>,
}

impl PlacementReport {
    /// Resident pages.
    pub fn pages_resident(&self) -> usize {
        self.pages_checked - self.pages_unresident
    }

    /// Whether every resident page is on the expected node.
    pub fn is_local(&self) -> bool {
        self.pages_on_expected == self.pages_resident()
    }

    /// Adds another report for the same node.
    pub fn merge(&mut self, other: &PlacementReport) {
        debug_assert_eq!(self.expected, other.expected);
        self.pages_checked += other.pages_checked;
        self.pages_on_expected += other.pages_on_expected;
        self.pages_unresident += other.pages_unresident;
        for (&node, &pages) in &other.observed {
            *self.observed.entry(node).or_default() += pages;
        }
    }
}

/// System page size.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    4096
}

/// Start addresses of every page overlapping `[ptr, ptr + len)`.
pub fn pages_of(ptr: *const u8, len: usize, page_size: usize) -> Vec<usize> {
    if len == 0 {
        return Vec::new();
    }
    let mask = !(page_size - 1);
    let first = ptr as usize & mask;
    let last = (ptr as usize + len - 1) & mask;
    (first..=last).step_by(page_size).collect()
}

/// Node of each page in `pages`: `Some(node)` if resident, `None` if not.
#[cfg(target_os = "linux")]
pub fn query_pages(pages: &[usize]) -> Result<Vec<Option<NodeId>>> {
    let mut nodes = Vec::with_capacity(pages.len());
    for chunk in pages.chunks(PAGES_PER_CALL) {
        let mut addrs: Vec<*mut libc::c_void> = chunk.iter().map(|&p| p as *mut libc::c_void).collect();
        let mut status = vec![-1i32; chunk.len()];
        // SAFETY: both arrays hold `chunk.len()` entries; nodes = NULL only
        // queries.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_move_pages,
                0 as libc::c_int,
                chunk.len() as libc::c_ulong,
                addrs.as_mut_ptr(),
                std::ptr::null::<libc::c_int>(),
                status.as_mut_ptr(),
                0 as libc::c_int,
            )
        };
        if ret != 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(match errno {
                libc::EPERM | libc::EACCES => PlacementError::PermissionDenied,
                _ => PlacementError::Syscall(errno),
            });
        }
        for &s in &status {
            nodes.push(if s >= 0 { Some(NodeId(s as u32)) } else { None });
        }
    }
    Ok(nodes)
}

/// Node of each page in `pages`.
#[cfg(not(target_os = "linux"))]
pub fn query_pages(_pages: &[usize]) -> Result<Vec<Option<NodeId>>> {
    Err(PlacementError::Unsupported)
}

/// Checks that the pages of `[ptr, ptr + len)` live on `expected`.
pub fn verify_region(ptr: *const u8, len: usize, expected: NodeId) -> Result<PlacementReport> {
    if ptr.is_null() || len == 0 {
        return Err(PlacementError::InvalidRegion);
    }
    let pages = pages_of(ptr, len, page_size());
    let nodes = query_pages(&pages)?;
    let mut report = PlacementReport {
        expected,
        pages_checked: pages.len(),
        ..Default::default()
    };
    for node in nodes {
        match node {
            Some(node) => {
                *report.observed.entry(node).or_default() += 1;
                if node == expected {
                    report.pages_on_expected += 1;
                }
            }
            None => report.pages_unresident += 1,
        }
    }
    Ok(report)
}

/// Checks one block against its node tag.
pub fn verify_block(block: &NumaBlock) -> Result<PlacementReport> {
    verify_region(block.as_ptr(), block.len(), block.node())
}

/// Checks every block `manager` owns, one report per node.
pub fn verify_manager(manager: &NumaMemoryManager, topology: &NumaTopology) -> Result<Vec<PlacementReport>> {
    let mut reports = Vec::new();
    for node in topology.nodes().map(|n| n.id()) {
        let blocks = manager.blocks_on(node);
        if blocks.is_empty() {
            continue;
        }
        let mut report = PlacementReport {
            expected: node,
            ..Default::default()
        };
        for block in blocks {
            report.merge(&verify_block(block)?);
        }
        if !report.is_local() {
            tracing::warn!(
                node = %node,
                on_node = report.pages_on_expected,
                resident = report.pages_resident(),
                observed = ?report.observed,
                "NUMA block pages found off their node"
            );
        }
        reports.push(report);
    }
    Ok(reports)
}
