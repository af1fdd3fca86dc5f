//! Event and state recycling.
//!
//! Both recyclers keep a per-thread map from exact buffer size to a stack
//! of detached buffers, so the simulation's inner loop almost never reaches
//! the system allocator:
//!
//! ```text
//! allocate(128) ──► recycler[128].pop() ──hit──► reuse
//!                          │ miss
//!                          ▼
//!            NUMA block carve │ global heap
//! ```
//!
//! Each simulation thread owns one [`EventRecycler`] and one
//! [`StateRecycler`]; neither is shared. The control loop drives them
//! through the narrow [`Allocator`] capability.

mod event;
mod state;
mod sweep;

pub use event::{EventRecycler, FreeBuffers};
pub use state::{StateRecycler, StateSnapshot};
pub use sweep::AdaptiveSweeper;

use core::ptr::NonNull;

/// Allocation capability shared by both recyclers.
pub trait Allocator {
    /// Returns a buffer of exactly `size` bytes, recycled when possible.
    fn allocate_raw(&mut self, size: usize) -> NonNull<u8>;

    /// Returns a buffer to its size bucket.
    ///
    /// # Safety
    ///
    /// `mem` must come from [`allocate_raw`](Self::allocate_raw) on a
    /// recycler of the same kind with the same `size`, and must not be used
    /// afterwards.
    unsafe fn deallocate_raw(&mut self, mem: NonNull<u8>, size: usize);

    /// Reclaims deferred buffers whose last holder has let go.
    ///
    /// Returns the fraction reclaimed, or `None` if nothing was pending.
    fn sweep_pending(&mut self) -> Option<f64> {
        None
    }

    /// Counters for reporting.
    fn stats(&self) -> RecyclerStats;
}

/// Counters kept by a recycler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecyclerStats {
    /// Buffers handed out.
    pub allocations: u64,
    /// Allocations served from a size bucket.
    pub recycle_hits: u64,
    /// Allocations that reached the global heap or a NUMA block.
    pub system_allocations: u64,
    /// Buffers returned to a size bucket (or freed when recycling is off).
    pub reclaimed: u64,
    /// Entries currently waiting in the pending list.
    pub pending: u64,
    /// Free buffers given away to other threads.
    pub donated: u64,
    /// Free buffers taken over from other threads.
    pub adopted: u64,
}

impl RecyclerStats {
    /// Element-wise sum.
    pub fn merge(&mut self, other: &RecyclerStats) {
        self.allocations += other.allocations;
        self.recycle_hits += other.recycle_hits;
        self.system_allocations += other.system_allocations;
        self.reclaimed += other.reclaimed;
        self.pending += other.pending;
        self.donated += other.donated;
        self.adopted += other.adopted;
    }

    /// Fraction of allocations served from a bucket.
    pub fn hit_rate(&self) -> f64 {
        if self.allocations == 0 {
            0.0
        } else {
            self.recycle_hits as f64 / self.allocations as f64
        }
    }
}
