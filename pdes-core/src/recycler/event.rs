//! Event buffer recycling and the dual reference-count protocol.
//!
//! # Counters
//!
//! ```text
//!                 sender thread                 receiver thread
//! unified   reference_count ──────────────────────────────► (same field)
//! split     reference_count (output side)     input_ref_count (input side)
//! ```
//!
//! Events that never leave their thread, and per-destination clones, use
//! the unified path: the buffer is reclaimed as soon as `reference_count`
//! drops to zero, by whichever thread drops it. Events shared between two
//! threads use the split path: the sender reclaims only once both counters
//! are zero. If the receiver still holds the event when the sender lets go,
//! the event waits on the sender's pending list until a later
//! [`EventRecycler::process_pending_deallocs`] sweep finds its input count
//! at zero.

use std::alloc::{handle_alloc_error, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Allocator, RecyclerStats};
use crate::config::{NumaSetting, NUMA_SUPPORT, RECYCLE_EVENTS};
use crate::event::{AgentId, EventHandle, EventHeader, EVENT_ALIGN, HEADER_SIZE, MAX_EVENT_SIZE};
use crate::numa::{ManagerStats, NumaBlocks, NumaMemoryManager};
use crate::topology::{MemoryTopology, NodeId, ThreadId};
use crate::{Error, Result};

/// Highest count a single holder chain is expected to reach.
const MAX_REFERENCES: u32 = 4;

/// Free event buffers handed from one thread's recycler to another's.
///
/// Dropping a non-empty set leaks its buffers; pass it to
/// [`EventRecycler::adopt_free`] instead.
#[derive(Debug, Default)]
pub struct FreeBuffers {
    numa: bool,
    buckets: Vec<(usize, Vec<NonNull<u8>>)>,
}

// SAFETY: the buffers are free; whoever holds the set is their only user.
unsafe impl Send for FreeBuffers {}

impl FreeBuffers {
    /// Buffers in the set.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|(_, free)| free.len()).sum()
    }

    /// Whether the set holds no buffer.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|(_, free)| free.is_empty())
    }
}

/// A thread's event allocator.
///
/// Owned by exactly one simulation thread. The only operations that touch
/// shared state are the explicit depot transfers, which lock.
#[derive(Debug)]
pub struct EventRecycler {
    thread_id: ThreadId,
    topology: Arc<MemoryTopology>,
    use_numa: bool,
    numa: NumaMemoryManager,
    /// Heap path: size → detached buffers.
    recycler: HashMap<usize, Vec<NonNull<u8>>>,
    /// Events whose output count is zero but whose input count is not.
    pending: Vec<EventHandle>,
    stats: RecyclerStats,
}

// SAFETY: every pointer refers to memory this thread's recycler owns or
// that the reference-count protocol hands over; the recycler is moved into
// its worker thread once and never shared.
unsafe impl Send for EventRecycler {}

impl EventRecycler {
    /// Creates the recycler for `thread_id`.
    ///
    /// Fails if the topology asks for NUMA placement that this build cannot
    /// provide.
    pub fn new(thread_id: ThreadId, topology: Arc<MemoryTopology>, block_size: usize) -> Result<Self> {
        let use_numa = topology.numa_enabled();
        if use_numa && !NUMA_SUPPORT {
            return Err(Error::NumaNotCompiled);
        }
        if use_numa && !RECYCLE_EVENTS {
            return Err(Error::NumaWithoutRecycling);
        }
        Ok(Self {
            thread_id,
            topology,
            use_numa,
            numa: NumaMemoryManager::new(block_size),
            recycler: HashMap::new(),
            pending: Vec::new(),
            stats: RecyclerStats::default(),
        })
    }

    /// Maps one block on every node any thread uses.
    ///
    /// Call on the owning thread so first-touch happens there.
    pub fn start(&mut self) {
        if self.use_numa {
            let nodes = self.topology.nodes();
            self.numa.start(&nodes);
        }
    }

    /// Owning thread.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// The shared topology.
    pub fn topology(&self) -> &Arc<MemoryTopology> {
        &self.topology
    }

    /// Whether buffers come from the NUMA manager.
    pub fn uses_numa(&self) -> bool {
        self.use_numa
    }

    /// Allocates a `size`-byte event (header included) for `receiver`,
    /// placed according to the topology's [`NumaSetting`].
    pub fn allocate(&mut self, size: usize, receiver: AgentId) -> EventHandle {
        self.allocate_numa(self.topology.numa_setting(), size, receiver)
    }

    /// Like [`allocate`](Self::allocate) with an explicit placement policy.
    pub fn allocate_numa(&mut self, setting: NumaSetting, size: usize, receiver: AgentId) -> EventHandle {
        let node = match setting {
            NumaSetting::Receiver => self.topology.node_of_agent(receiver),
            NumaSetting::Sender | NumaSetting::None => self.topology.node_of_thread(self.thread_id),
        };
        self.allocate_placed(node, size, receiver)
    }

    /// Allocates an event on the node of `thread`.
    ///
    /// Used for GVT messages, which are addressed to threads, not agents.
    pub fn allocate_on_thread(&mut self, size: usize, thread: ThreadId) -> EventHandle {
        let node = self.topology.node_of_thread(thread);
        self.allocate_placed(node, size, thread as AgentId)
    }

    /// Copies `src` into a new buffer placed for its receiver under
    /// `setting`. The copy starts with both counters at zero.
    pub fn clone_event(&mut self, src: EventHandle, setting: NumaSetting) -> EventHandle {
        let image = src.as_bytes();
        let node = match setting {
            NumaSetting::Receiver => self.topology.node_of_agent(src.receiver()),
            NumaSetting::Sender | NumaSetting::None => self.topology.node_of_thread(self.thread_id),
        };
        let (mem, generation) = self.obtain_event(node, image.len());
        // SAFETY: `mem` is a detached buffer of `image.len()` bytes.
        unsafe { EventHandle::init_copy(mem, image, generation) }
    }

    /// Rebuilds an event from its wire image.
    ///
    /// Returns `None` if the image is shorter than a header or its size
    /// field disagrees with its length.
    pub fn allocate_from_bytes(&mut self, image: &[u8]) -> Option<EventHandle> {
        if image.len() < HEADER_SIZE || image.len() > MAX_EVENT_SIZE {
            return None;
        }
        let size = u32::from_ne_bytes(image[32..36].try_into().ok()?) as usize;
        if size != image.len() {
            return None;
        }
        let receiver = AgentId::from_ne_bytes(image[8..16].try_into().ok()?);
        let node = match self.topology.numa_setting() {
            NumaSetting::Receiver => self.topology.node_of_agent(receiver),
            _ => self.topology.node_of_thread(self.thread_id),
        };
        let (mem, generation) = self.obtain_event(node, size);
        // SAFETY: `mem` is a detached buffer of `size` bytes.
        Some(unsafe { EventHandle::init_copy(mem, image, generation) })
    }

    fn allocate_placed(&mut self, node: NodeId, size: usize, receiver: AgentId) -> EventHandle {
        debug_assert!(size >= HEADER_SIZE, "event of {size} bytes is smaller than its header");
        let (mem, generation) = self.obtain_event(node, size);
        // SAFETY: `mem` is a detached buffer of `size` bytes.
        unsafe { EventHandle::init(mem, size, receiver, generation) }
    }

    /// A detached buffer plus the generation it carries.
    fn obtain_event(&mut self, node: NodeId, size: usize) -> (NonNull<u8>, u32) {
        assert!(size <= MAX_EVENT_SIZE, "event of {size} bytes exceeds the {MAX_EVENT_SIZE}-byte limit");
        let (mem, reused) = self.obtain(node, size);
        let generation = if reused {
            // SAFETY: recycled event buffers keep the header of their last use.
            unsafe { (*mem.cast::<EventHeader>().as_ptr()).generation() }
        } else {
            0
        };
        (mem, generation)
    }

    fn obtain(&mut self, node: NodeId, size: usize) -> (NonNull<u8>, bool) {
        self.stats.allocations += 1;
        if self.use_numa {
            let (mem, reused) = self.numa.allocate_with_reuse(node, size);
            if reused {
                self.stats.recycle_hits += 1;
            } else {
                self.stats.system_allocations += 1;
            }
            return (mem, reused);
        }

        if RECYCLE_EVENTS {
            if let Some(mem) = self.recycler.get_mut(&size).and_then(Vec::pop) {
                self.stats.recycle_hits += 1;
                return (mem, true);
            }
        }
        self.stats.system_allocations += 1;
        let layout = Self::layout(size);
        // SAFETY: `layout` has a non-zero size.
        match NonNull::new(unsafe { std::alloc::alloc(layout) }) {
            Some(mem) => (mem, false),
            None => handle_alloc_error(layout),
        }
    }

    /// Returns a detached buffer to its bucket.
    ///
    /// # Safety
    ///
    /// `mem` must have been obtained for `size` bytes from a recycler of
    /// this run and must not be used afterwards.
    unsafe fn release(&mut self, mem: NonNull<u8>, size: usize) {
        self.stats.reclaimed += 1;
        if self.use_numa {
            self.numa.deallocate(mem, size);
        } else if RECYCLE_EVENTS {
            self.recycler.entry(size).or_default().push(mem);
        } else {
            std::alloc::dealloc(mem.as_ptr(), Self::layout(size));
        }
    }

    /// Detaches the event and recycles its buffer.
    ///
    /// # Safety
    ///
    /// Both counters must be zero and no holder may use the handle again.
    unsafe fn reclaim(&mut self, event: EventHandle) {
        let header = event.header();
        debug_assert_eq!(header.reference_count(), 0);
        debug_assert_eq!(header.input_ref_count(), 0);
        let size = header.size();
        header.bump_generation();
        self.release(event.raw(), size);
    }

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size.max(1), EVENT_ALIGN).unwrap_or(Layout::new::<EventHeader>())
    }

    /// Current unified (or output-side) count.
    pub fn reference_count(event: EventHandle) -> u32 {
        event.header().reference_count()
    }

    /// Current input-side count.
    pub fn input_ref_count(event: EventHandle) -> u32 {
        event.header().input_ref_count()
    }

    /// Adds a holder on the unified path.
    pub fn increase_reference(&mut self, event: EventHandle) {
        let header = event.header();
        let count = header.reference_count();
        debug_assert!(count < MAX_REFERENCES, "reference count {count} on {event:?}");
        header.store_reference_count(count + 1);
    }

    /// Drops a holder on the unified path; reclaims at zero.
    pub fn decrease_reference(&mut self, event: EventHandle) {
        let header = event.header();
        let count = header.reference_count();
        debug_assert!(count > 0, "reference count underflow on {event:?}");
        header.store_reference_count(count - 1);
        if count == 1 {
            // SAFETY: the last holder just let go.
            unsafe { self.reclaim(event) };
        }
    }

    /// Adds a receiver-side holder. Receiving thread only.
    pub fn increase_input_ref_count(&self, event: EventHandle) {
        let header = event.header();
        let count = header.input_ref_count();
        debug_assert!(count < MAX_REFERENCES, "input count {count} on {event:?}");
        header.store_input_ref_count(count + 1);
    }

    /// Drops a receiver-side holder. Receiving thread only.
    ///
    /// Never reclaims: the sender's recycler owns that decision.
    pub fn decrease_input_ref_count(&self, event: EventHandle) {
        let header = event.header();
        let count = header.input_ref_count();
        debug_assert!(count > 0, "input count underflow on {event:?}");
        header.store_input_ref_count(count - 1);
    }

    /// Adds a sender-side holder. Sending thread only.
    pub fn increase_output_ref_count(&mut self, event: EventHandle) {
        self.increase_reference(event);
    }

    /// Drops a sender-side holder. Sending thread only.
    ///
    /// At zero the event is reclaimed if the receiver is done with it too,
    /// and parked on the pending list otherwise.
    pub fn decrease_output_ref_count(&mut self, event: EventHandle) {
        let header = event.header();
        let count = header.reference_count();
        debug_assert!(count > 0, "output count underflow on {event:?}");
        header.store_reference_count(count - 1);
        if count > 1 {
            return;
        }
        if header.input_ref_count() == 0 {
            // SAFETY: both sides have let go.
            unsafe { self.reclaim(event) };
        } else {
            self.pending.push(event);
        }
    }

    /// Receiver-side retain on the split (`shared`) or unified path.
    pub fn retain_input(&mut self, shared: bool, event: EventHandle) {
        if shared {
            self.increase_input_ref_count(event);
        } else {
            self.increase_reference(event);
        }
    }

    /// Receiver-side release on the split (`shared`) or unified path.
    pub fn release_input(&mut self, shared: bool, event: EventHandle) {
        if shared {
            self.decrease_input_ref_count(event);
        } else {
            self.decrease_reference(event);
        }
    }

    /// Sender-side retain on the split (`shared`) or unified path.
    pub fn retain_output(&mut self, _shared: bool, event: EventHandle) {
        self.increase_reference(event);
    }

    /// Sender-side release on the split (`shared`) or unified path.
    pub fn release_output(&mut self, shared: bool, event: EventHandle) {
        if shared {
            self.decrease_output_ref_count(event);
        } else {
            self.decrease_reference(event);
        }
    }

    /// Parks an event nobody on this thread holds any more but whose
    /// receiver still does.
    pub fn track_pending(&mut self, event: EventHandle) {
        debug_assert_eq!(event.header().reference_count(), 0);
        debug_assert!(event.header().input_ref_count() > 0);
        self.pending.push(event);
    }

    /// Reclaims every pending event whose input count reached zero.
    ///
    /// Returns the fraction reclaimed, or `None` if the list was empty.
    /// O(n) in the pending list; the caller decides how often to pay it.
    pub fn process_pending_deallocs(&mut self) -> Option<f64> {
        if self.pending.is_empty() {
            return None;
        }
        let full = self.pending.len();
        let mut reclaimed = 0usize;
        let mut idx = full;
        while idx > 0 {
            idx -= 1;
            let event = self.pending[idx];
            if event.header().input_ref_count() == 0 {
                self.pending.swap_remove(idx);
                // SAFETY: output count is zero by the pending invariant.
                unsafe { self.reclaim(event) };
                reclaimed += 1;
            }
        }
        Some(reclaimed as f64 / full as f64)
    }

    /// Events waiting for their receiver.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Hands the pending list to `main` for a single thread to finish.
    pub fn move_pending_deallocs_to(&mut self, main: &Mutex<Vec<EventHandle>>) {
        if self.pending.is_empty() {
            return;
        }
        let moved = self.pending.len();
        main.lock().append(&mut self.pending);
        tracing::debug!(thread = self.thread_id, moved, "moved pending events to main list");
    }

    /// Takes over every entry of `main`.
    pub fn adopt_pending(&mut self, main: &Mutex<Vec<EventHandle>>) {
        let mut adopted = std::mem::take(&mut *main.lock());
        self.pending.append(&mut adopted);
    }

    /// Hands every NUMA block to `depot`.
    pub fn move_numa_blocks_to(&mut self, depot: &Mutex<NumaBlocks>) {
        self.numa.move_numa_blocks_to(depot);
    }

    /// Takes over every block in `depot`.
    pub fn adopt_numa_blocks(&mut self, depot: &Mutex<NumaBlocks>) {
        self.numa.adopt_blocks(depot);
    }

    /// Buffers sitting in size buckets.
    pub fn recycled_count(&self) -> usize {
        if self.use_numa {
            self.numa.recycled_count()
        } else {
            self.recycler.values().map(Vec::len).sum()
        }
    }

    /// Splits every free list longer than `2 * keep` down to `keep` and
    /// deals the rest round-robin into `parts` sets.
    ///
    /// Returns no sets when nothing is above the threshold.
    pub fn take_surplus(&mut self, keep: usize, parts: usize) -> Vec<FreeBuffers> {
        if parts == 0 {
            return Vec::new();
        }
        let surplus = if self.use_numa {
            self.numa.take_surplus(keep)
        } else {
            self.recycler
                .iter_mut()
                .filter(|(_, free)| free.len() > 2 * keep)
                .map(|(&size, free)| (size, free.split_off(keep)))
                .collect()
        };
        if surplus.is_empty() {
            return Vec::new();
        }

        let mut sets: Vec<FreeBuffers> = (0..parts)
            .map(|_| FreeBuffers {
                numa: self.use_numa,
                buckets: Vec::new(),
            })
            .collect();
        let mut given = 0;
        for (size, free) in surplus {
            given += free.len();
            let mut split: Vec<Vec<NonNull<u8>>> =
                (0..parts).map(|_| Vec::with_capacity(free.len() / parts + 1)).collect();
            for (i, mem) in free.into_iter().enumerate() {
                split[i % parts].push(mem);
            }
            for (set, free) in sets.iter_mut().zip(split) {
                if !free.is_empty() {
                    set.buckets.push((size, free));
                }
            }
        }
        self.stats.donated += given as u64;
        sets
    }

    /// Adds buffers another thread gave away to this thread's free lists.
    ///
    /// # Safety
    ///
    /// `free` must come from [`take_surplus`](Self::take_surplus) on a
    /// recycler of this run, and the blocks its NUMA buffers were carved
    /// from must outlive this recycler's use of them.
    pub unsafe fn adopt_free(&mut self, free: FreeBuffers) {
        debug_assert_eq!(free.numa, self.use_numa, "free buffers from another placement mode");
        let mut adopted = 0;
        for (size, buffers) in free.buckets {
            adopted += buffers.len();
            if self.use_numa {
                self.numa.adopt_free(size, buffers);
            } else {
                self.recycler.entry(size).or_default().extend(buffers);
            }
        }
        self.stats.adopted += adopted as u64;
    }

    /// Sweeps pending events, then releases every recycled buffer.
    ///
    /// Heap buffers are freed. NUMA buffers are only forgotten, since their
    /// blocks own the memory.
    pub fn delete_recycled_events(&mut self) {
        self.process_pending_deallocs();
        if !self.pending.is_empty() {
            tracing::debug!(
                thread = self.thread_id,
                pending = self.pending.len(),
                "events still held by receivers at teardown"
            );
        }
        let freed = self.recycled_count();
        if self.use_numa {
            self.numa.clear_recycled();
        } else {
            self.free_heap_buckets();
        }
        tracing::debug!(thread = self.thread_id, freed, "deleted recycled events");
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
        RecyclerStats {
            pending: self.pending.len() as u64,
            ..self.stats
        }
    }
}

impl Allocator for EventRecycler {
    fn allocate_raw(&mut self, size: usize) -> NonNull<u8> {
        let node = self.topology.node_of_thread(self.thread_id);
        self.obtain(node, size).0
    }

    unsafe fn deallocate_raw(&mut self, mem: NonNull<u8>, size: usize) {
        self.release(mem, size);
    }

    fn sweep_pending(&mut self) -> Option<f64> {
        self.process_pending_deallocs()
    }

    fn stats(&self) -> RecyclerStats {
        EventRecycler::stats(self)
    }
}

impl Drop for EventRecycler {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!(
                thread = self.thread_id,
                pending = self.pending.len(),
                "dropping recycler with pending events"
            );
        }
        if !self.use_numa {
            self.free_heap_buckets();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NumaSetting;
    use crate::topology::ModuloAgentMap;

    fn heap_recycler() -> EventRecycler {
        EventRecycler::new(0, Arc::new(MemoryTopology::single_node(2)), 64 * 1024).unwrap()
    }

    fn numa_topology(setting: NumaSetting) -> Arc<MemoryTopology> {
        Arc::new(MemoryTopology::new(
            vec![NodeId(0), NodeId(1)],
            setting,
            Arc::new(ModuloAgentMap::new(2)),
        ))
    }

    #[test]
    fn unified_path_reclaims_at_zero() {
        let mut recycler = heap_recycler();
        let event = recycler.allocate(128, 0);
        recycler.increase_reference(event);
        recycler.increase_reference(event);
        recycler.decrease_reference(event);
        assert_eq!(recycler.stats().reclaimed, 0);
        recycler.decrease_reference(event);
        assert_eq!(recycler.stats().reclaimed, 1);
        assert_eq!(recycler.recycled_count(), 1);
        assert!(!event.is_live());
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    #[should_panic(expected = "exceeds")]
    fn oversized_event_is_refused_before_allocating() {
        heap_recycler().allocate(MAX_EVENT_SIZE + 1, 0);
    }

    #[test]
    fn surplus_is_dealt_to_peers_and_reused() {
        let mut sender = heap_recycler();
        let mut receiver = EventRecycler::new(1, Arc::new(MemoryTopology::single_node(2)), 64 * 1024).unwrap();
        let events: Vec<_> = (0..40).map(|_| sender.allocate(96, 1)).collect();
        for &event in &events {
            receiver.increase_reference(event);
            receiver.decrease_reference(event);
        }
        assert_eq!(receiver.recycled_count(), 40);

        // At or below twice the floor nothing moves.
        assert!(receiver.take_surplus(20, 1).is_empty());
        let sets = receiver.take_surplus(8, 2);
        assert_eq!(sets.len(), 2);
        assert_eq!(sets.iter().map(FreeBuffers::len).sum::<usize>(), 32);
        assert_eq!(sets[0].len(), 16);
        assert_eq!(receiver.recycled_count(), 8);
        assert_eq!(receiver.stats().donated, 32);

        for set in sets {
            unsafe { sender.adopt_free(set) };
        }
        assert_eq!(sender.stats().adopted, 32);
        let system = sender.stats().system_allocations;
        let again: Vec<_> = (0..32).map(|_| sender.allocate(96, 1)).collect();
        assert_eq!(sender.stats().system_allocations, system);
        let donated: Vec<*mut u8> = events.iter().map(EventHandle::as_ptr).collect();
        for &event in &again {
            assert!(donated.contains(&event.as_ptr()));
            sender.increase_reference(event);
            sender.decrease_reference(event);
        }
    }

    #[test]
    fn second_batch_is_served_from_buckets() {
        let mut recycler = heap_recycler();
        let first: Vec<_> = (0..1000).map(|_| recycler.allocate(128, 1)).collect();
        for &event in &first {
            recycler.increase_reference(event);
            recycler.decrease_reference(event);
        }
        let system = recycler.stats().system_allocations;
        assert_eq!(system, 1000);

        let second: Vec<_> = (0..1000).map(|_| recycler.allocate(128, 1)).collect();
        assert_eq!(recycler.stats().system_allocations, system);
        assert_eq!(recycler.stats().recycle_hits, 1000);
        for &event in &second {
            recycler.increase_reference(event);
            recycler.decrease_reference(event);
        }
    }

    #[test]
    fn buckets_are_keyed_by_exact_size() {
        let mut recycler = heap_recycler();
        let small = recycler.allocate(64, 0);
        recycler.increase_reference(small);
        recycler.decrease_reference(small);

        let large = recycler.allocate(72, 0);
        assert_eq!(recycler.stats().recycle_hits, 0);
        let again = recycler.allocate(64, 0);
        assert_eq!(again.as_ptr(), small.as_ptr());
        assert_eq!(again.generation(), small.generation() + 1);
        for event in [large, again] {
            recycler.increase_reference(event);
            recycler.decrease_reference(event);
        }
    }

    #[test]
    fn sender_first_release_waits_for_receiver() {
        let mut sender = heap_recycler();
        let event = sender.allocate(96, 1);
        sender.increase_output_ref_count(event);
        sender.increase_input_ref_count(event);

        sender.decrease_output_ref_count(event);
        assert_eq!(sender.pending_len(), 1);
        assert_eq!(sender.stats().reclaimed, 0);
        assert_eq!(sender.process_pending_deallocs(), Some(0.0));

        sender.decrease_input_ref_count(event);
        assert_eq!(sender.stats().reclaimed, 0);
        assert_eq!(sender.process_pending_deallocs(), Some(1.0));
        assert_eq!(sender.pending_len(), 0);
        assert_eq!(sender.stats().reclaimed, 1);
        assert_eq!(sender.process_pending_deallocs(), None);
    }

    #[test]
    fn receiver_first_release_reclaims_immediately() {
        let mut recycler = heap_recycler();
        let event = recycler.allocate(96, 1);
        recycler.increase_output_ref_count(event);
        recycler.increase_input_ref_count(event);
        recycler.decrease_input_ref_count(event);
        recycler.decrease_output_ref_count(event);
        assert_eq!(recycler.pending_len(), 0);
        assert_eq!(recycler.stats().reclaimed, 1);
    }

    #[test]
    fn sweep_reports_partial_fraction() {
        let mut recycler = heap_recycler();
        let events: Vec<_> = (0..4).map(|_| recycler.allocate(80, 1)).collect();
        for &event in &events {
            recycler.increase_output_ref_count(event);
            recycler.increase_input_ref_count(event);
            recycler.decrease_output_ref_count(event);
        }
        recycler.decrease_input_ref_count(events[0]);
        recycler.decrease_input_ref_count(events[3]);
        assert_eq!(recycler.process_pending_deallocs(), Some(0.5));
        assert_eq!(recycler.pending_len(), 2);

        recycler.decrease_input_ref_count(events[1]);
        recycler.decrease_input_ref_count(events[2]);
        recycler.delete_recycled_events();
        assert_eq!(recycler.pending_len(), 0);
        assert_eq!(recycler.recycled_count(), 0);
        assert_eq!(recycler.stats().reclaimed, 4);
    }

    #[test]
    fn bool_variants_select_counter() {
        let mut recycler = heap_recycler();
        let shared = recycler.allocate(64, 0);
        recycler.retain_output(true, shared);
        recycler.retain_input(true, shared);
        assert_eq!(EventRecycler::input_ref_count(shared), 1);
        recycler.release_input(true, shared);
        recycler.release_output(true, shared);
        assert_eq!(recycler.stats().reclaimed, 1);

        let cloned = recycler.allocate(64, 0);
        recycler.retain_output(false, cloned);
        recycler.retain_input(false, cloned);
        assert_eq!(EventRecycler::reference_count(cloned), 2);
        assert_eq!(EventRecycler::input_ref_count(cloned), 0);
        recycler.release_input(false, cloned);
        recycler.release_output(false, cloned);
        assert_eq!(recycler.stats().reclaimed, 2);
    }

    #[test]
    fn pending_moves_to_main_list() {
        let mut worker = heap_recycler();
        let mut main = heap_recycler();
        let event = worker.allocate(64, 1);
        worker.increase_output_ref_count(event);
        worker.increase_input_ref_count(event);
        worker.decrease_output_ref_count(event);

        let list = Mutex::new(Vec::new());
        worker.move_pending_deallocs_to(&list);
        assert_eq!(worker.pending_len(), 0);
        assert_eq!(list.lock().len(), 1);

        main.adopt_pending(&list);
        worker.decrease_input_ref_count(event);
        assert_eq!(main.process_pending_deallocs(), Some(1.0));
        assert_eq!(main.recycled_count(), 1);
    }

    #[test]
    fn receiver_placement_uses_owner_node() {
        let mut recycler = EventRecycler::new(0, numa_topology(NumaSetting::Receiver), 4096).unwrap();
        recycler.start();
        // Agent 1 lives on thread 1, which is on node 1.
        let event = recycler.allocate(128, 1);
        assert_eq!(
            recycler.numa_manager().block_node_of(event.as_ptr()),
            Some(NodeId(1))
        );
        let local = recycler.allocate(128, 2);
        assert_eq!(
            recycler.numa_manager().block_node_of(local.as_ptr()),
            Some(NodeId(0))
        );
        let override_sender = recycler.allocate_numa(NumaSetting::Sender, 128, 1);
        assert_eq!(
            recycler.numa_manager().block_node_of(override_sender.as_ptr()),
            Some(NodeId(0))
        );
        for event in [event, local, override_sender] {
            recycler.increase_reference(event);
            recycler.decrease_reference(event);
        }
        assert_eq!(recycler.recycled_count(), 3);
    }

    #[test]
    fn sender_placement_and_thread_placement() {
        let mut recycler = EventRecycler::new(1, numa_topology(NumaSetting::Sender), 4096).unwrap();
        let event = recycler.allocate(128, 0);
        assert_eq!(
            recycler.numa_manager().block_node_of(event.as_ptr()),
            Some(NodeId(1))
        );
        let token = recycler.allocate_on_thread(128, 0);
        assert_eq!(
            recycler.numa_manager().block_node_of(token.as_ptr()),
            Some(NodeId(0))
        );
        for event in [event, token] {
            recycler.increase_reference(event);
            recycler.decrease_reference(event);
        }
    }

    #[test]
    fn numa_blocks_move_to_main() {
        let topology = numa_topology(NumaSetting::Sender);
        let mut worker = EventRecycler::new(1, Arc::clone(&topology), 4096).unwrap();
        let mut main = EventRecycler::new(0, topology, 4096).unwrap();
        worker.start();
        main.start();
        let before = worker.numa_manager().block_count() + main.numa_manager().block_count();

        let depot = Mutex::new(NumaBlocks::default());
        worker.move_numa_blocks_to(&depot);
        main.adopt_numa_blocks(&depot);
        assert_eq!(main.numa_manager().block_count(), before);
        assert_eq!(worker.numa_manager().block_count(), 0);
    }

    #[test]
    fn clone_copies_payload_with_fresh_counters() {
        let mut recycler = heap_recycler();
        let mut src = recycler.allocate(HEADER_SIZE + 8, 1);
        unsafe {
            src.header_mut().receive_time = 2.5;
            src.payload_mut().copy_from_slice(&42u64.to_ne_bytes());
        }
        recycler.increase_reference(src);

        let copy = recycler.clone_event(src, NumaSetting::Receiver);
        assert_ne!(copy.as_ptr(), src.as_ptr());
        assert_eq!(copy.payload(), &42u64.to_ne_bytes()[..]);
        assert_eq!(copy.receive_time(), 2.5);
        assert_eq!(EventRecycler::reference_count(copy), 0);

        let wire = recycler.allocate_from_bytes(src.as_bytes()).unwrap();
        assert_eq!(wire.receiver(), 1);
        assert!(recycler.allocate_from_bytes(&src.as_bytes()[..40]).is_none());

        for event in [src, copy, wire] {
            if EventRecycler::reference_count(event) == 0 {
                recycler.increase_reference(event);
            }
            recycler.decrease_reference(event);
        }
        assert_eq!(recycler.stats().reclaimed, 3);
    }

    #[test]
    fn raw_allocator_capability() {
        let mut recycler = heap_recycler();
        let alloc: &mut dyn Allocator = &mut recycler;
        let mem = alloc.allocate_raw(200);
        unsafe { alloc.deallocate_raw(mem, 200) };
        assert_eq!(alloc.allocate_raw(200), mem);
        assert_eq!(alloc.sweep_pending(), None);
        assert_eq!(alloc.stats().recycle_hits, 1);
        unsafe { alloc.deallocate_raw(mem, 200) };
    }
}
