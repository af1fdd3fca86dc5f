//! Node-bound region allocation.
//!
//! Hands out large page-aligned regions whose physical pages are bound to a
//! specific NUMA node. [`NumaMemoryManager`](super::NumaMemoryManager) carves
//! these into event and state buffers.

use core::alloc::Layout;
use core::ptr::NonNull;

use super::{NodeId, NumaStats, MAX_NUMA_NODES};

/// Below this size regions come from the global heap.
const MMAP_THRESHOLD: usize = 4096;

/// Alignment of heap-backed regions.
const REGION_ALIGN: usize = 4096;

/// How a region was obtained, which decides how it is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionOrigin {
    /// `mmap` + `mbind`.
    Mapped,
    /// `std::alloc` with [`REGION_ALIGN`].
    Heap,
}

/// A contiguous, node-tagged region of memory.
#[derive(Debug)]
pub struct NumaRegion {
    ptr: NonNull<u8>,
    len: usize,
    node: NodeId,
    origin: RegionOrigin,
}

// SAFETY: a region is plain memory with a single owner at a time.
unsafe impl Send for NumaRegion {}

impl NumaRegion {
    /// Start of the region.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty (never true for allocated regions).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Node the region was bound to.
    #[inline]
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// How the region was obtained.
    #[inline]
    pub fn origin(&self) -> RegionOrigin {
        self.origin
    }

    /// Whether `ptr` falls inside this region.
    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.ptr.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr < start + self.len
    }
}

/// Allocator for node-bound regions.
#[derive(Debug, Default)]
pub struct NumaAllocator {
    stats: NumaStats,
}

impl NumaAllocator {
    /// Creates an allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Region statistics.
    pub fn stats(&self) -> &NumaStats {
        &self.stats
    }

    /// Allocates `len` bytes bound to `node`.
    ///
    /// Returns `None` only if the OS refused the memory; binding failures
    /// (e.g. on a non-NUMA host) leave the region unbound but usable.
    pub fn allocate_region(&self, len: usize, node: NodeId) -> Option<NumaRegion> {
        debug_assert!(len > 0);

        #[cfg(target_os = "linux")]
        let region = if len >= MMAP_THRESHOLD {
            self.map_linux(len, node)
        } else {
            self.allocate_heap(len, node)
        };

        #[cfg(not(target_os = "linux"))]
        let region = self.allocate_heap(len, node);

        if let Some(r) = &region {
            self.stats.record_map(node, r.len as u64);
        }
        region
    }

    /// Returns a region to the OS.
    ///
    /// # Safety
    ///
    /// No pointer into the region may be used afterwards.
    pub unsafe fn release(&self, region: NumaRegion) {
        self.stats.record_unmap(region.node, region.len as u64);
        match region.origin {
            RegionOrigin::Mapped => {
                #[cfg(target_os = "linux")]
                {
                    libc::munmap(region.ptr.as_ptr().cast(), region.len);
                }
            }
            RegionOrigin::Heap => {
                if let Ok(layout) = Layout::from_size_align(region.len, REGION_ALIGN) {
                    std::alloc::dealloc(region.ptr.as_ptr(), layout);
                }
            }
        }
    }

    /// `mmap` a region, bind it with `MPOL_BIND` and fault every page in
    /// from the calling thread.
    #[cfg(target_os = "linux")]
    fn map_linux(&self, len: usize, node: NodeId) -> Option<NumaRegion> {
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }

        // Bind before the first touch so pages are faulted on `node`.
        let bits = core::mem::size_of::<libc::c_ulong>() * 8;
        let mut nodemask: [libc::c_ulong; MAX_NUMA_NODES / 64 + 1] = [0; MAX_NUMA_NODES / 64 + 1];
        let word = node.index() / bits;
        if word < nodemask.len() {
            nodemask[word] = 1 << (node.index() % bits);
        }
        let rc = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                ptr,
                len,
                1i32, // MPOL_BIND
                nodemask.as_ptr(),
                (nodemask.len() * bits) as libc::c_ulong,
                (1 << 1) as libc::c_uint, // MPOL_MF_MOVE
            )
        };
        if rc != 0 {
            self.stats.record_bind_failure();
            tracing::trace!(node = node.0, len, "mbind refused, region left unbound");
        }

        unsafe {
            let page = libc::sysconf(libc::_SC_PAGESIZE).max(1) as usize;
            let base = ptr.cast::<u8>();
            for offset in (0..len).step_by(page) {
                base.add(offset).write_volatile(0);
            }
        }

        NonNull::new(ptr.cast::<u8>()).map(|ptr| NumaRegion {
            ptr,
            len,
            node,
            origin: RegionOrigin::Mapped,
        })
    }

    fn allocate_heap(&self, len: usize, node: NodeId) -> Option<NumaRegion> {
        let layout = Layout::from_size_align(len, REGION_ALIGN).ok()?;
        let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) })?;
        Some(NumaRegion {
            ptr,
            len,
            node,
            origin: RegionOrigin::Heap,
        })
    }
}
