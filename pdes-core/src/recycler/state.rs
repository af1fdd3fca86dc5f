//! Agent state snapshot recycling.
//!
//! States are never shared between threads, so there is no reference
//! counting: a snapshot is saved, kept in its agent's history, and released
//! once GVT has passed it.

use std::alloc::{handle_alloc_error, Layout};
use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;

use parking_lot::Mutex;

use super::{Allocator, RecyclerStats};
use crate::config::{NUMA_SUPPORT, RECYCLE_STATES, STATE_BLOCK_SIZE};
use crate::numa::{ManagerStats, NumaBlocks, NumaMemoryManager};
use crate::topology::{MemoryTopology, NodeId, ThreadId};
use crate::{Error, Result};

const STATE_ALIGN: usize = 8;

/// A saved copy of an agent's state.
///
/// Owns its buffer until handed back with [`StateRecycler::release`].
pub struct StateSnapshot {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the snapshot is the only reference to its buffer.
unsafe impl Send for StateSnapshot {}

impl StateSnapshot {
    /// Saved bytes.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the buffer holds at least `len` initialized bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Number of saved bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the state was empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn alloc_size(&self) -> usize {
        self.len.max(1)
    }
}

impl fmt::Debug for StateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateSnapshot")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// A thread's state allocator.
#[derive(Debug)]
pub struct StateRecycler {
    thread_id: ThreadId,
    node: NodeId,
    use_numa: bool,
    numa: NumaMemoryManager,
    recycler: HashMap<usize, Vec<NonNull<u8>>>,
    stats: RecyclerStats,
}

// SAFETY: buffers are owned by this recycler or by outstanding snapshots of
// the same thread.
unsafe impl Send for StateRecycler {}

impl StateRecycler {
    /// Creates the recycler for `thread_id`, placed on the thread's node.
    pub fn new(thread_id: ThreadId, topology: &MemoryTopology) -> Result<Self> {
        Self::with_block_size(thread_id, topology, STATE_BLOCK_SIZE)
    }

    /// Like [`new`](Self::new) with an explicit NUMA block size.
    pub fn with_block_size(thread_id: ThreadId, topology: &MemoryTopology, block_size: usize) -> Result<Self> {
        let use_numa = topology.numa_enabled();
        if use_numa && !NUMA_SUPPORT {
            return Err(Error::NumaNotCompiled);
        }
        if use_numa && !RECYCLE_STATES {
            return Err(Error::NumaWithoutRecycling);
        }
        Ok(Self {
            thread_id,
            node: topology.node_of_thread(thread_id),
            use_numa,
            numa: NumaMemoryManager::new(block_size),
            recycler: HashMap::new(),
            stats: RecyclerStats::default(),
        })
    }

    /// Switches NUMA placement on or off and maps the first block on `node`.
    ///
    /// Must be called before any snapshot is saved.
    pub fn setup(&mut self, numa_enabled: bool, node: NodeId) {
        debug_assert_eq!(self.stats.allocations, 0, "setup after first save");
        self.use_numa = numa_enabled && NUMA_SUPPORT && RECYCLE_STATES;
        self.node = node;
        if self.use_numa {
            self.numa.start(&[node]);
        }
    }

    /// Owning thread.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Node snapshots are placed on.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Copies `state` into a recycled buffer.
    pub fn save(&mut self, state: &[u8]) -> StateSnapshot {
        let len = state.len();
        let ptr = self.obtain(len.max(1));
        // SAFETY: `ptr` is a fresh buffer of at least `len` bytes.
        unsafe { std::ptr::copy_nonoverlapping(state.as_ptr(), ptr.as_ptr(), len) };
        StateSnapshot { ptr, len }
    }

    /// Returns a snapshot's buffer to its bucket.
    pub fn release(&mut self, snapshot: StateSnapshot) {
        let size = snapshot.alloc_size();
        // SAFETY: the snapshot came from `save` and is consumed here.
        unsafe { self.give_back(snapshot.ptr, size) };
    }

    fn obtain(&mut self, size: usize) -> NonNull<u8> {
        self.stats.allocations += 1;
        if self.use_numa {
            let (mem, reused) = self.numa.allocate_with_reuse(self.node, size);
            if reused {
                self.stats.recycle_hits += 1;
            } else {
                self.stats.system_allocations += 1;
            }
            return mem;
        }
        if RECYCLE_STATES {
            if let Some(mem) = self.recycler.get_mut(&size).and_then(Vec::pop) {
                self.stats.recycle_hits += 1;
                return mem;
            }
        }
        self.stats.system_allocations += 1;
        let layout = Self::layout(size);
        // SAFETY: `layout` has a non-zero size.
        match NonNull::new(unsafe { std::alloc::alloc(layout) }) {
            Some(mem) => mem,
            None => handle_alloc_error(layout),
        }
    }

    unsafe fn give_back(&mut self, mem: NonNull<u8>, size: usize) {
        self.stats.reclaimed += 1;
        if self.use_numa {
            self.numa.deallocate(mem, size);
        } else if RECYCLE_STATES {
            self.recycler.entry(size).or_default().push(mem);
        } else {
            std::alloc::dealloc(mem.as_ptr(), Self::layout(size));
        }
    }

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size.max(1), STATE_ALIGN).unwrap_or(Layout::new::<u64>())
    }

    /// Buffers sitting in size buckets.
    pub fn recycled_count(&self) -> usize {
        if self.use_numa {
            self.numa.recycled_count()
        } else {
            self.recycler.values().map(Vec::len).sum()
        }
    }

    /// Releases every recycled buffer.
    ///
    /// Heap buffers are freed only when NUMA placement is off; NUMA buffers
    /// are forgotten and freed with their blocks.
    pub fn delete_recycled_states(&mut self) {
        if self.use_numa {
            self.numa.clear_recycled();
        } else {
            self.free_heap_buckets();
        }
    }

    fn free_heap_buckets(&mut self) {
        for (size, buffers) in self.recycler.drain() {
            let layout = Self::layout(size);
            for mem in buffers {
                // SAFETY: heap buffers were allocated with this layout.
                unsafe { std::alloc::dealloc(mem.as_ptr(), layout) };
            }
        }
    }

    /// Hands every NUMA block to `depot`.
    pub fn move_numa_blocks_to(&mut self, depot: &Mutex<NumaBlocks>) {
        self.numa.move_numa_blocks_to(depot);
    }

    /// Takes over every block in `depot`.
    pub fn adopt_numa_blocks(&mut self, depot: &Mutex<NumaBlocks>) {
        self.numa.adopt_blocks(depot);
    }

    /// The thread's NUMA block manager.
    pub fn numa_manager(&self) -> &NumaMemoryManager {
        &self.numa
    }

    /// NUMA manager counters.
    pub fn numa_stats(&self) -> ManagerStats {
        self.numa.stats()
    }

    /// Allocation counters.
    pub fn stats(&self) -> RecyclerStats {
        self.stats
    }
}

impl Allocator for StateRecycler {
    fn allocate_raw(&mut self, size: usize) -> NonNull<u8> {
        self.obtain(size.max(1))
    }

    unsafe fn deallocate_raw(&mut self, mem: NonNull<u8>, size: usize) {
        self.give_back(mem, size.max(1));
    }

    fn stats(&self) -> RecyclerStats {
        self.stats
    }
}

impl Drop for StateRecycler {
    fn drop(&mut self) {
        if !self.use_numa {
            self.free_heap_buckets();
        }
    }
}
