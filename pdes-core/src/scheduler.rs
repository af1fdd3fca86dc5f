//! Timestamp-ordered event scheduling.
//!
//! The kernel's production scheduler lives elsewhere; this is the simple
//! heap every thread uses here. Ties on receive time are broken by arrival
//! order, so runs are deterministic for a given interleaving.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::event::{EventHandle, Time, TIME_INFINITY};

/// Orders the events a thread still has to process.
pub trait Scheduler: Send {
    /// Adds an event.
    fn schedule(&mut self, event: EventHandle);

    /// Receive time of the earliest event, or [`TIME_INFINITY`] if empty.
    fn next_time(&self) -> Time;

    /// Removes the earliest event if its receive time is below `limit`.
    fn pop_before(&mut self, limit: Time) -> Option<EventHandle>;

    /// Removes every event, in no particular order.
    fn drain(&mut self) -> Vec<EventHandle>;

    /// Number of scheduled events.
    fn len(&self) -> usize;

    /// Whether nothing is scheduled.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct Entry {
    time: Time,
    seq: u64,
    event: EventHandle,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed: BinaryHeap is a max-heap.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .total_cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Binary-heap scheduler ordered by `(receive_time, arrival)`.
#[derive(Debug, Default)]
pub struct HeapScheduler {
    heap: BinaryHeap<Entry>,
    seq: u64,
}

impl HeapScheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for HeapScheduler {
    fn schedule(&mut self, event: EventHandle) {
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(Entry {
            time: event.receive_time(),
            seq,
            event,
        });
    }

    fn next_time(&self) -> Time {
        self.heap.peek().map_or(TIME_INFINITY, |e| e.time)
    }

    fn pop_before(&mut self, limit: Time) -> Option<EventHandle> {
        if self.next_time() < limit {
            self.heap.pop().map(|e| e.event)
        } else {
            None
        }
    }

    fn drain(&mut self) -> Vec<EventHandle> {
        self.heap.drain().map(|e| e.event).collect()
    }

    fn len(&self) -> usize {
        self.heap.len()
    }
}
