//! Conditional synchronization primitives.
//!
//! Shared coordination state (the thread barrier, the lock-free inbound
//! queue counters) is written against this module instead of `std` so the
//! same code can be model checked with Loom:
//!
//! ```bash
//! RUSTFLAGS="--cfg loom" cargo test -p pdes-core --features loom --test loom_barrier
//! ```
//!
//! Outside of Loom builds everything here is a zero-cost re-export.
//!
//! Event headers deliberately use `core` atomics directly: they live in raw
//! recycled buffers which Loom cannot track.

#[cfg(all(feature = "loom", loom))]
pub mod atomic {
    //! Loom atomics.

    pub use loom::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
}

#[cfg(not(all(feature = "loom", loom)))]
pub mod atomic {
    //! `core` atomics.

    pub use core::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
}

#[cfg(all(feature = "loom", loom))]
pub mod thread {
    //! Loom thread primitives.

    pub use loom::thread::{spawn, yield_now, JoinHandle};

    /// Runs `f` under the Loom model checker, exploring every interleaving.
    pub fn model<F>(f: F)
    where
        F: Fn() + Sync + Send + 'static,
    {
        loom::model(f);
    }
}

#[cfg(not(all(feature = "loom", loom)))]
pub mod thread {
    //! `std` thread primitives.

    pub use std::thread::{spawn, yield_now, JoinHandle};

    /// Runs `f` exactly once.
    pub fn model<F>(f: F)
    where
        F: Fn() + Sync + Send + 'static,
    {
        f();
    }
}

#[cfg(all(feature = "loom", loom))]
pub mod sync {
    //! Loom shared-ownership primitives.

    pub use loom::sync::Arc;
}

#[cfg(not(all(feature = "loom", loom)))]
pub mod sync {
    //! `std` shared-ownership primitives.

    pub use std::sync::Arc;
}

/// Spins once, yielding the OS thread.
///
/// Under Loom this is a scheduling point, which keeps spin loops finite
/// during model checking.
#[inline]
pub fn spin_yield() {
    #[cfg(all(feature = "loom", loom))]
    {
        loom::thread::yield_now();
    }
    #[cfg(not(all(feature = "loom", loom)))]
    {
        core::hint::spin_loop();
        std::thread::yield_now();
    }
}
