//! Inbound event queues between simulation threads.
//!
//! Each thread owns one inbound queue; every other thread pushes into it.
//! Three variants trade lock contention against drain cost:
//!
//! ```text
//! SingleBlocking     one Mutex<Vec>               cheapest drain
//! MultiBlocking      Mutex<Vec> per src & mask    less push contention
//! MultiNonBlocking   SegQueue per src & mask      lock-free push
//! ```
//!
//! All variants keep events from one source in push order.

use std::fmt;

use crossbeam_queue::SegQueue;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::config::QueueKind;
use crate::event::EventHandle;
use crate::topology::ThreadId;

/// A multi-producer, single-consumer queue of events for one thread.
pub trait InboundQueue: Send + Sync + fmt::Debug {
    /// Appends `event`, sent by `src_thread`.
    fn push(&self, src_thread: ThreadId, event: EventHandle);

    /// Moves queued events into `out`, at most `max_events` if given.
    ///
    /// Returns the number of events moved.
    fn remove_all(&self, out: &mut Vec<EventHandle>, max_events: Option<usize>) -> usize;

    /// Whether nothing is queued.
    fn is_empty(&self) -> bool;
}

/// Builds the queue variant named by `kind`.
pub fn make_queue(kind: QueueKind, sub_queues: usize) -> Box<dyn InboundQueue> {
    match kind {
        QueueKind::SingleBlocking => Box::new(SingleBlockingQueue::new()),
        QueueKind::MultiBlocking => Box::new(MultiBlockingQueue::new(sub_queues)),
        QueueKind::MultiNonBlocking => Box::new(MultiNonBlockingQueue::new(sub_queues)),
    }
}

fn drain_vec(queue: &mut Vec<EventHandle>, out: &mut Vec<EventHandle>, budget: usize) -> usize {
    let take = queue.len().min(budget);
    if take == queue.len() {
        out.append(queue);
    } else {
        out.extend(queue.drain(..take));
    }
    take
}

/// One mutex-protected vector.
#[derive(Debug, Default)]
pub struct SingleBlockingQueue {
    queue: Mutex<Vec<EventHandle>>,
}

impl SingleBlockingQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }
}

impl InboundQueue for SingleBlockingQueue {
    fn push(&self, _src_thread: ThreadId, event: EventHandle) {
        self.queue.lock().push(event);
    }

    fn remove_all(&self, out: &mut Vec<EventHandle>, max_events: Option<usize>) -> usize {
        let mut queue = self.queue.lock();
        drain_vec(&mut queue, out, max_events.unwrap_or(usize::MAX))
    }

    fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

/// Mutex-protected sub-queues selected by `src_thread & mask`.
#[derive(Debug)]
pub struct MultiBlockingQueue {
    queues: Box<[CachePadded<Mutex<Vec<EventHandle>>>]>,
    mask: usize,
}

impl MultiBlockingQueue {
    /// Creates `sub_queues` sub-queues, rounded up to a power of two.
    pub fn new(sub_queues: usize) -> Self {
        let count = sub_queues.max(1).next_power_of_two();
        Self {
            queues: (0..count).map(|_| CachePadded::new(Mutex::new(Vec::new()))).collect(),
            mask: count - 1,
        }
    }

    /// Number of sub-queues.
    pub fn sub_queues(&self) -> usize {
        self.queues.len()
    }
}

impl InboundQueue for MultiBlockingQueue {
    fn push(&self, src_thread: ThreadId, event: EventHandle) {
        self.queues[src_thread & self.mask].lock().push(event);
    }

    fn remove_all(&self, out: &mut Vec<EventHandle>, max_events: Option<usize>) -> usize {
        let mut budget = max_events.unwrap_or(usize::MAX);
        let mut moved = 0;
        for queue in self.queues.iter() {
            if budget == 0 {
                break;
            }
            let mut queue = queue.lock();
            let n = drain_vec(&mut queue, out, budget);
            budget -= n;
            moved += n;
        }
        moved
    }

    fn is_empty(&self) -> bool {
        self.queues.iter().all(|q| q.lock().is_empty())
    }
}

/// Lock-free sub-queues selected by `src_thread & mask`.
#[derive(Debug)]
pub struct MultiNonBlockingQueue {
    queues: Box<[CachePadded<SegQueue<EventHandle>>]>,
    mask: usize,
}

impl MultiNonBlockingQueue {
    /// Creates `sub_queues` sub-queues, rounded up to a power of two.
    pub fn new(sub_queues: usize) -> Self {
        let count = sub_queues.max(1).next_power_of_two();
        Self {
            queues: (0..count).map(|_| CachePadded::new(SegQueue::new())).collect(),
            mask: count - 1,
        }
    }

    /// Number of sub-queues.
    pub fn sub_queues(&self) -> usize {
        self.queues.len()
    }
}

impl InboundQueue for MultiNonBlockingQueue {
    fn push(&self, src_thread: ThreadId, event: EventHandle) {
        self.queues[src_thread & self.mask].push(event);
    }

    fn remove_all(&self, out: &mut Vec<EventHandle>, max_events: Option<usize>) -> usize {
        let budget = max_events.unwrap_or(usize::MAX);
        let mut moved = 0;
        for queue in self.queues.iter() {
            while moved < budget {
                match queue.pop() {
                    Some(event) => {
                        out.push(event);
                        moved += 1;
                    }
                    None => break,
                }
            }
        }
        moved
    }

    fn is_empty(&self) -> bool {
        self.queues.iter().all(|q| q.is_empty())
    }
}
