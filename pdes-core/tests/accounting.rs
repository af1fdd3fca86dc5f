//! Accounting closure: whatever order references come and go in, every
//! buffer lands in its size bucket exactly once.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use pdes_core::recycler::EventRecycler;
use pdes_core::topology::MemoryTopology;
use pdes_core::EventHandle;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Allocate { size: usize, split: bool },
    Retain { idx: usize, input: bool },
    Release { idx: usize, input: bool },
    Sweep,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (prop::sample::select(vec![64usize, 96, 128]), any::<bool>())
            .prop_map(|(size, split)| Op::Allocate { size, split }),
        3 => (any::<usize>(), any::<bool>()).prop_map(|(idx, input)| Op::Retain { idx, input }),
        4 => (any::<usize>(), any::<bool>()).prop_map(|(idx, input)| Op::Release { idx, input }),
        1 => Just(Op::Sweep),
    ]
}

/// Counts the model expects on one live event.
#[derive(Debug)]
struct Held {
    event: EventHandle,
    split: bool,
    output: u32,
    input: u32,
}

impl Held {
    fn done(&self) -> bool {
        self.output == 0 && self.input == 0
    }
}

fn release(recycler: &mut EventRecycler, held: &mut Held, input: bool) {
    if input && held.input > 0 {
        recycler.release_input(held.split, held.event);
        held.input -= 1;
    } else if held.output > 0 {
        recycler.release_output(held.split, held.event);
        held.output -= 1;
    } else {
        recycler.release_input(held.split, held.event);
        held.input -= 1;
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn every_buffer_is_recycled_exactly_once(ops in prop::collection::vec(op(), 1..200)) {
        let mut recycler =
            EventRecycler::new(0, Arc::new(MemoryTopology::single_node(1)), 64 * 1024).unwrap();
        let mut live: Vec<Held> = Vec::new();
        let mut buffers: BTreeMap<usize, HashSet<usize>> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Allocate { size, split } => {
                    let event = recycler.allocate(size, 0);
                    for other in &live {
                        prop_assert_ne!(other.event.as_ptr(), event.as_ptr());
                    }
                    buffers.entry(size).or_default().insert(event.as_ptr() as usize);
                    recycler.retain_output(split, event);
                    live.push(Held { event, split, output: 1, input: 0 });
                }
                Op::Retain { idx, input } if !live.is_empty() => {
                    let len = live.len();
                    let held = &mut live[idx % len];
                    if input {
                        recycler.retain_input(held.split, held.event);
                        held.input += 1;
                    } else if held.output > 0 || !held.split {
                        // A parked split event never regains a sender.
                        recycler.retain_output(held.split, held.event);
                        held.output += 1;
                    }
                }
                Op::Release { idx, input } if !live.is_empty() => {
                    let at = idx % live.len();
                    release(&mut recycler, &mut live[at], input);
                    if live[at].done() {
                        live.swap_remove(at);
                    }
                }
                Op::Sweep => {
                    recycler.process_pending_deallocs();
                }
                _ => {}
            }
        }

        for mut held in live.drain(..) {
            while !held.done() {
                release(&mut recycler, &mut held, true);
            }
        }
        recycler.process_pending_deallocs();

        let stats = recycler.stats();
        prop_assert_eq!(stats.pending, 0);
        prop_assert_eq!(stats.allocations, stats.reclaimed);
        let distinct: usize = buffers.values().map(HashSet::len).sum();
        prop_assert_eq!(recycler.recycled_count(), distinct);
        prop_assert_eq!(stats.system_allocations as usize, distinct);

        // Draining the buckets yields every buffer once: no double free.
        let mut again = Vec::new();
        for (&size, ptrs) in &buffers {
            let mut seen = HashSet::new();
            for _ in 0..ptrs.len() {
                let event = recycler.allocate(size, 0);
                prop_assert!(ptrs.contains(&(event.as_ptr() as usize)));
                prop_assert!(seen.insert(event.as_ptr() as usize));
                again.push(event);
            }
        }
        prop_assert_eq!(recycler.stats().system_allocations as usize, distinct);
        for event in again {
            recycler.increase_reference(event);
            recycler.decrease_reference(event);
        }
    }
}
