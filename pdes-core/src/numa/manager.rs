//! Per-thread NUMA block allocator with size-bucketed recycling.
//!
//! # Layout
//!
//! ```text
//! block: [prefix|buffer][prefix|buffer]......[  avail  ]
//!                                            ^ current
//! prefix (8 bytes): u32 node id + padding
//! ```
//!
//! Every buffer handed out is preceded by an 8-byte prefix holding the node
//! it was carved for, so [`NumaMemoryManager::deallocate`] can find the
//! right free list from the pointer alone.

use std::alloc::{handle_alloc_error, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;

use parking_lot::Mutex;

use super::{NodeId, NumaAllocator, NumaRegion};

/// Bytes reserved in front of every buffer; also the buffer alignment.
pub const PREFIX: usize = 8;

/// Default block size for event buffers.
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Carves an aligned `size`-byte region out of `[*ptr, *ptr + *space)`.
///
/// On success `*ptr` moves past the carved region, `*space` shrinks by the
/// padding plus `size`, and the aligned start is returned. If the region
/// does not fit nothing is modified.
///
/// `align` must be a power of two.
pub fn align_ptr(align: usize, size: usize, ptr: &mut *mut u8, space: &mut usize) -> Option<NonNull<u8>> {
    debug_assert!(align.is_power_of_two());
    let diff = (*ptr).align_offset(align);
    if diff == usize::MAX || size.checked_add(diff)? > *space {
        return None;
    }
    let aligned = (*ptr).wrapping_add(diff);
    *space -= diff + size;
    *ptr = aligned.wrapping_add(size);
    NonNull::new(aligned)
}

/// A node-tagged slab with a bump pointer.
#[derive(Debug)]
pub struct NumaBlock {
    region: NumaRegion,
    current: *mut u8,
    avail: usize,
}

// SAFETY: the bump pointer only ever points into `region`, which is owned.
unsafe impl Send for NumaBlock {}

impl NumaBlock {
    fn new(region: NumaRegion) -> Self {
        Self {
            current: region.as_ptr(),
            avail: region.len(),
            region,
        }
    }

    /// Node the block's pages are bound to.
    pub fn node(&self) -> NodeId {
        self.region.node()
    }

    /// Total block size.
    pub fn len(&self) -> usize {
        self.region.len()
    }

    /// Whether the block has zero capacity.
    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    /// Bytes not yet carved.
    pub fn avail(&self) -> usize {
        self.avail
    }

    /// Whether `ptr` lies in this block.
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.region.contains(ptr)
    }

    /// Start of the block.
    pub fn as_ptr(&self) -> *mut u8 {
        self.region.as_ptr()
    }

    fn carve(&mut self, size: usize) -> Option<NonNull<u8>> {
        align_ptr(PREFIX, size, &mut self.current, &mut self.avail)
    }
}

/// Blocks in transit between managers, grouped by node.
#[derive(Debug, Default)]
pub struct NumaBlocks {
    per_node: Vec<Vec<NumaBlock>>,
}

impl NumaBlocks {
    /// Total number of blocks.
    pub fn len(&self) -> usize {
        self.per_node.iter().map(Vec::len).sum()
    }

    /// Whether no blocks are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merges `other` into `self`.
    pub fn append(&mut self, mut other: NumaBlocks) {
        if self.per_node.len() < other.per_node.len() {
            self.per_node.resize_with(other.per_node.len(), Vec::new);
        }
        for (dst, src) in self.per_node.iter_mut().zip(other.per_node.iter_mut()) {
            dst.append(src);
        }
    }

    /// Iterates over every block.
    pub fn iter(&self) -> impl Iterator<Item = &NumaBlock> {
        self.per_node.iter().flatten()
    }
}

/// Counters kept by a [`NumaMemoryManager`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Calls to `allocate`.
    pub alloc_calls: u64,
    /// Calls to `deallocate`.
    pub dealloc_calls: u64,
    /// Allocations served from a free list.
    pub recycle_hits: u64,
    /// Blocks obtained from the OS.
    pub blocks_mapped: u64,
}

/// A thread's NUMA block allocator.
///
/// Not thread-safe: each simulation thread owns one. The only cross-thread
/// operations go through a `Mutex<NumaBlocks>` depot.
#[derive(Debug)]
pub struct NumaMemoryManager {
    block_size: usize,
    /// Per node; the last block is the one being carved.
    blocks: Vec<Vec<NumaBlock>>,
    /// Per node, size → free buffers.
    recycler: Vec<HashMap<usize, Vec<NonNull<u8>>>>,
    allocator: NumaAllocator,
    stats: ManagerStats,
}

// SAFETY: all raw pointers refer to blocks this manager (or a depot) owns;
// the manager is moved between threads but never shared.
unsafe impl Send for NumaMemoryManager {}

impl Default for NumaMemoryManager {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

impl NumaMemoryManager {
    /// Creates an empty manager; no memory is mapped until [`start`](Self::start)
    /// or the first allocation.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(PREFIX * 2),
            blocks: Vec::new(),
            recycler: Vec::new(),
            allocator: NumaAllocator::new(),
            stats: ManagerStats::default(),
        }
    }

    /// Pre-allocates one block on every node in `nodes`.
    pub fn start(&mut self, nodes: &[NodeId]) {
        if let Some(max) = nodes.iter().map(|n| n.index()).max() {
            self.ensure_node(max);
        }
        for &node in nodes {
            if self.blocks[node.index()].is_empty() {
                self.map_block(node, self.block_size);
            }
        }
        tracing::debug!(nodes = nodes.len(), block_size = self.block_size, "NUMA manager started");
    }

    /// Configured block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns `size` bytes on `node`, aligned to [`PREFIX`].
    ///
    /// Never fails: if the OS cannot supply a block the process aborts via
    /// [`handle_alloc_error`].
    pub fn allocate(&mut self, node: NodeId, size: usize) -> NonNull<u8> {
        self.allocate_with_reuse(node, size).0
    }

    /// Like [`allocate`](Self::allocate), also reporting whether the buffer
    /// came from a free list (and so still holds its previous contents).
    pub fn allocate_with_reuse(&mut self, node: NodeId, size: usize) -> (NonNull<u8>, bool) {
        let idx = node.index();
        self.ensure_node(idx);
        self.stats.alloc_calls += 1;

        if let Some(buf) = self.recycler[idx].get_mut(&size).and_then(Vec::pop) {
            self.stats.recycle_hits += 1;
            return (buf, true);
        }

        let need = size + PREFIX;
        let mem = match self.carve(idx, need) {
            Some(mem) => mem,
            None => {
                self.map_block(node, need.max(self.block_size));
                match self.carve(idx, need) {
                    Some(mem) => mem,
                    None => handle_alloc_error(Self::layout_for(need)),
                }
            }
        };

        // SAFETY: `mem` starts a fresh `need`-byte carve aligned to PREFIX.
        let buf = unsafe {
            mem.as_ptr().cast::<u32>().write(node.0);
            NonNull::new_unchecked(mem.as_ptr().add(PREFIX))
        };
        (buf, false)
    }

    /// Returns a buffer to the free list of the node it was carved on.
    ///
    /// # Safety
    ///
    /// `mem` must come from [`allocate`](Self::allocate) on a manager whose
    /// blocks are still alive, with the same `size`.
    pub unsafe fn deallocate(&mut self, mem: NonNull<u8>, size: usize) {
        let node = Self::node_of(mem);
        let idx = node.index();
        self.stats.dealloc_calls += 1;
        self.push_free(mem, size);
    }

    /// Splits every free list longer than `2 * keep` down to `keep`.
    ///
    /// Returns the removed buffers grouped by size; each still carries its
    /// node tag.
    pub fn take_surplus(&mut self, keep: usize) -> Vec<(usize, Vec<NonNull<u8>>)> {
        let mut surplus = Vec::new();
        for buckets in &mut self.recycler {
            for (&size, free) in buckets.iter_mut() {
                if free.len() > 2 * keep {
                    surplus.push((size, free.split_off(keep)));
                }
            }
        }
        surplus
    }

    /// Adds free buffers carved by any manager of this run to the lists of
    /// the nodes they were carved on.
    ///
    /// # Safety
    ///
    /// Every buffer must come from [`allocate`](Self::allocate) with `size`
    /// on a manager whose blocks outlive this one's use of them, and must
    /// not be in use.
    pub unsafe fn adopt_free(&mut self, size: usize, buffers: Vec<NonNull<u8>>) {
        for mem in buffers {
            self.push_free(mem, size);
        }
    }

    unsafe fn push_free(&mut self, mem: NonNull<u8>, size: usize) {
        let idx = Self::node_of(mem).index();
        self.ensure_node(idx);
        self.recycler[idx].entry(size).or_default().push(mem);
    }

    /// Reads the node tag written in front of `mem`.
    ///
    /// # Safety
    ///
    /// `mem` must come from [`allocate`](Self::allocate).
    pub unsafe fn node_of(mem: NonNull<u8>) -> NodeId {
        NodeId(mem.as_ptr().sub(PREFIX).cast::<u32>().read())
    }

    /// Forgets every recycled buffer without touching the blocks.
    pub fn clear_recycled(&mut self) {
        self.recycler.iter_mut().for_each(HashMap::clear);
    }

    /// Removes every block from this manager.
    ///
    /// Recycled buffers are forgotten as they point into the removed blocks.
    pub fn take_blocks(&mut self) -> NumaBlocks {
        self.clear_recycled();
        NumaBlocks {
            per_node: std::mem::take(&mut self.blocks),
        }
    }

    /// Takes ownership of `incoming`, keeping each node's active block on top.
    pub fn absorb(&mut self, incoming: NumaBlocks) {
        if let Some(last) = incoming.per_node.len().checked_sub(1) {
            self.ensure_node(last);
        }
        for (idx, mut blocks) in incoming.per_node.into_iter().enumerate() {
            let own = &mut self.blocks[idx];
            let active = own.pop();
            own.append(&mut blocks);
            own.extend(active);
        }
    }

    /// Hands every block to `depot` so a single thread can free them all.
    pub fn move_numa_blocks_to(&mut self, depot: &Mutex<NumaBlocks>) {
        let blocks = self.take_blocks();
        let moved = blocks.len();
        depot.lock().append(blocks);
        tracing::debug!(moved, "moved NUMA blocks to depot");
    }

    /// Takes every block out of `depot`.
    pub fn adopt_blocks(&mut self, depot: &Mutex<NumaBlocks>) {
        let blocks = std::mem::take(&mut *depot.lock());
        self.absorb(blocks);
    }

    /// Number of blocks owned.
    pub fn block_count(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum()
    }

    /// Blocks owned on `node`.
    pub fn blocks_on(&self, node: NodeId) -> &[NumaBlock] {
        self.blocks.get(node.index()).map_or(&[], Vec::as_slice)
    }

    /// Node of the block containing `ptr`, if this manager owns it.
    pub fn block_node_of(&self, ptr: *const u8) -> Option<NodeId> {
        self.blocks
            .iter()
            .flatten()
            .find(|b| b.contains(ptr))
            .map(NumaBlock::node)
    }

    /// Bytes in blocks on `node`.
    pub fn allocated_memory(&self, node: NodeId) -> usize {
        self.blocks_on(node).iter().map(NumaBlock::len).sum()
    }

    /// Bytes sitting in free lists for `node`.
    pub fn recycled_memory(&self, node: NodeId) -> usize {
        self.recycler
            .get(node.index())
            .map_or(0, |map| map.iter().map(|(size, bufs)| size * bufs.len()).sum())
    }

    /// Buffers sitting in free lists, across nodes.
    pub fn recycled_count(&self) -> usize {
        self.recycler
            .iter()
            .flat_map(HashMap::values)
            .map(Vec::len)
            .sum()
    }

    /// Allocation counters.
    pub fn stats(&self) -> ManagerStats {
        self.stats
    }

    fn ensure_node(&mut self, idx: usize) {
        if self.blocks.len() <= idx {
            self.blocks.resize_with(idx + 1, Vec::new);
        }
        if self.recycler.len() <= idx {
            self.recycler.resize_with(idx + 1, HashMap::new);
        }
    }

    fn carve(&mut self, idx: usize, need: usize) -> Option<NonNull<u8>> {
        self.blocks[idx].last_mut()?.carve(need)
    }

    fn map_block(&mut self, node: NodeId, len: usize) {
        let region = match self.allocator.allocate_region(len, node) {
            Some(region) => region,
            None => handle_alloc_error(Self::layout_for(len)),
        };
        tracing::debug!(node = node.0, len, "mapped NUMA block");
        self.stats.blocks_mapped += 1;
        self.blocks[node.index()].push(NumaBlock::new(region));
    }

    fn layout_for(len: usize) -> Layout {
        Layout::from_size_align(len, PREFIX).unwrap_or(Layout::new::<u64>())
    }
}

impl Drop for NumaMemoryManager {
    fn drop(&mut self) {
        self.clear_recycled();
        for block in self.blocks.drain(..).flatten() {
            // SAFETY: wind-down guarantees no thread still uses these blocks.
            unsafe { self.allocator.release(block.region) };
        }
    }
}
