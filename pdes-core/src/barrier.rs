//! Generation-counted spin barrier.
//!
//! A reusable rendezvous for a fixed set of simulation threads. The thread
//! that completes a round resets the pending count *before* publishing the
//! new generation, so a fast thread re-entering [`SpinBarrier::wait`] can
//! never observe a stale count. No separate reset phase is needed.
//!
//! Waiters busy-wait (yielding the OS thread) rather than parking on a
//! condition variable. Thread counts in this kernel are small and the
//! barrier sits on the wind-down path, where wake-up latency matters more
//! than burned cycles.
//!
//! A participant that can no longer arrive (it panicked, or was never
//! spawned) [poisons](SpinBarrier::poison) the barrier. Every current and
//! later [`SpinBarrier::try_wait`] then returns [`BarrierPoisoned`] instead
//! of spinning forever.

use crossbeam_utils::CachePadded;

use crate::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use crate::sync::spin_yield;

/// A participant abandoned the barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("a barrier participant failed")]
pub struct BarrierPoisoned;

/// Reusable spin barrier for `n` threads.
#[derive(Debug)]
pub struct SpinBarrier {
    /// Threads still expected in the current round.
    pending: CachePadded<AtomicUsize>,
    /// Completed rounds.
    generation: CachePadded<AtomicU64>,
    /// Participants per round.
    threads: AtomicUsize,
    /// Set once a participant will never arrive again.
    poisoned: AtomicBool,
}

impl SpinBarrier {
    /// Creates a barrier for `threads` participants.
    pub fn new(threads: usize) -> Self {
        debug_assert!(threads > 0);
        Self {
            pending: CachePadded::new(AtomicUsize::new(threads)),
            generation: CachePadded::new(AtomicU64::new(0)),
            threads: AtomicUsize::new(threads),
            poisoned: AtomicBool::new(false),
        }
    }

    /// Changes the participant count.
    ///
    /// Must only be called while no thread is inside [`wait`](Self::wait).
    pub fn set_thread_count(&self, threads: usize) {
        debug_assert!(threads > 0);
        self.threads.store(threads, Ordering::Relaxed);
        self.pending.store(threads, Ordering::Release);
    }

    /// Number of participants per round.
    pub fn thread_count(&self) -> usize {
        self.threads.load(Ordering::Relaxed)
    }

    /// Number of completed rounds.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Releases every waiter, now and in later rounds.
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    /// Whether [`poison`](Self::poison) was called.
    #[inline]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Blocks until all participants have called `wait` for this round.
    ///
    /// Returns `true` on exactly one thread per round (the one that
    /// completed it). On a poisoned barrier it returns `false` at once;
    /// callers that must tell the two apart use [`try_wait`](Self::try_wait).
    pub fn wait(&self) -> bool {
        self.try_wait().unwrap_or(false)
    }

    /// Like [`wait`](Self::wait), failing if the barrier is or becomes
    /// poisoned before the round completes.
    pub fn try_wait(&self) -> Result<bool, BarrierPoisoned> {
        if self.is_poisoned() {
            return Err(BarrierPoisoned);
        }
        let generation = self.generation.load(Ordering::Acquire);
        let threads = self.threads.load(Ordering::Relaxed);

        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.pending.store(threads, Ordering::Relaxed);
            if self
                .generation
                .compare_exchange(
                    generation,
                    generation + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                tracing::error!(generation, "barrier generation changed mid-round");
                std::process::abort();
            }
            Ok(true)
        } else {
            while self.generation.load(Ordering::Acquire) == generation {
                if self.is_poisoned() {
                    return Err(BarrierPoisoned);
                }
                spin_yield();
            }
            Ok(false)
        }
    }
}
