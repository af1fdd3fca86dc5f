//! Loom model checks for the wind-down barrier.
//!
//! ```bash
//! RUSTFLAGS="--cfg loom" cargo test -p pdes-core --features loom --test loom_barrier --release
//! ```
//!
//! Two threads are enough to expose every ordering between the pending
//! count and the generation word.

#![cfg(loom)]

use loom::sync::atomic::{AtomicUsize, Ordering};
use loom::sync::Arc;
use loom::thread;

use pdes_core::barrier::BarrierPoisoned;
use pdes_core::SpinBarrier;

#[test]
fn loom_one_round_releases_everyone() {
    loom::model(|| {
        let barrier = Arc::new(SpinBarrier::new(2));
        let arrived = Arc::new(AtomicUsize::new(0));

        let b = Arc::clone(&barrier);
        let a = Arc::clone(&arrived);
        let peer = thread::spawn(move || {
            a.fetch_add(1, Ordering::SeqCst);
            let leader = b.wait();
            assert_eq!(a.load(Ordering::SeqCst), 2);
            leader
        });

        arrived.fetch_add(1, Ordering::SeqCst);
        let leader = barrier.wait();
        assert_eq!(arrived.load(Ordering::SeqCst), 2);

        let peer_leader = peer.join().unwrap();
        assert!(leader ^ peer_leader, "exactly one thread completes the round");
        assert_eq!(barrier.generation(), 1);
    });
}

#[test]
fn loom_back_to_back_rounds_do_not_bleed() {
    loom::model(|| {
        let barrier = Arc::new(SpinBarrier::new(2));
        let phase = Arc::new(AtomicUsize::new(0));

        let b = Arc::clone(&barrier);
        let p = Arc::clone(&phase);
        let peer = thread::spawn(move || {
            b.wait();
            // Round one has completed for both threads.
            assert!(b.generation() >= 1);
            p.fetch_add(1, Ordering::SeqCst);
            b.wait();
            assert_eq!(p.load(Ordering::SeqCst), 2);
        });

        barrier.wait();
        phase.fetch_add(1, Ordering::SeqCst);
        barrier.wait();
        assert_eq!(phase.load(Ordering::SeqCst), 2);

        peer.join().unwrap();
        assert_eq!(barrier.generation(), 2);
    });
}

#[test]
fn loom_writes_before_the_barrier_are_visible_after() {
    loom::model(|| {
        let barrier = Arc::new(SpinBarrier::new(2));
        let slot = Arc::new(AtomicUsize::new(0));

        let b = Arc::clone(&barrier);
        let s = Arc::clone(&slot);
        let writer = thread::spawn(move || {
            s.store(42, Ordering::Relaxed);
            b.wait();
        });

        barrier.wait();
        assert_eq!(slot.load(Ordering::Relaxed), 42);
        writer.join().unwrap();
    });
}

#[test]
fn loom_poison_releases_a_waiter_whose_round_cannot_complete() {
    loom::model(|| {
        // The third participant is never spawned.
        let barrier = Arc::new(SpinBarrier::new(3));

        let b = Arc::clone(&barrier);
        let waiter = thread::spawn(move || b.try_wait());

        barrier.poison();
        assert_eq!(waiter.join().unwrap(), Err(BarrierPoisoned));
        assert_eq!(barrier.generation(), 0);
    });
}
