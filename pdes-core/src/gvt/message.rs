//! GVT tokens carried through the event queues.
//!
//! # Wire Layout
//!
//! ```text
//! [EventHeader 56][GvtHeader 32][i32 counters × n (Ctrl only)]
//! ```

use core::sync::atomic::{AtomicU32, Ordering};

use bytemuck::{Pod, Zeroable};

use crate::event::{size_field, EventHandle, EventKind, GVT_SENDER, HEADER_SIZE, TIME_INFINITY};
use crate::recycler::EventRecycler;
use crate::topology::ThreadId;
use crate::Time;

/// Process-wide sequence for newly created messages.
static SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// GVT message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GvtMsgKind {
    /// Uninitialized.
    Invalid = 0,
    /// Control token circulating around the ring.
    Ctrl = 1,
    /// New GVT broadcast by the root.
    Estimate = 2,
    /// Acknowledgement.
    Ack = 3,
}

impl GvtMsgKind {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => GvtMsgKind::Ctrl,
            2 => GvtMsgKind::Estimate,
            3 => GvtMsgKind::Ack,
            _ => GvtMsgKind::Invalid,
        }
    }
}

/// Fixed part of a GVT payload.
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct GvtHeader {
    kind: u32,
    size: u32,
    sequence: u32,
    _pad: u32,
    t_min: f64,
    gvt_estimate: f64,
}

/// Bytes taken by [`GvtHeader`].
pub const GVT_HEADER_SIZE: usize = core::mem::size_of::<GvtHeader>();

/// A GVT token living in an event buffer.
///
/// Owned by exactly one thread at a time; it moves between threads through
/// the inbound queues and is destroyed by whoever consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct GvtMessage {
    event: EventHandle,
}

impl GvtMessage {
    /// Total buffer size of a message of `kind` for `n` ranks.
    pub fn size_of(kind: GvtMsgKind, n: usize) -> usize {
        let vec_size = if kind == GvtMsgKind::Ctrl { 4 * n } else { 0 };
        HEADER_SIZE + GVT_HEADER_SIZE + vec_size
    }

    /// Allocates a message on the node of `dest_rank`.
    ///
    /// Both times start at infinity and the counters at zero.
    pub fn create(kind: GvtMsgKind, n: usize, dest_rank: ThreadId, recycler: &mut EventRecycler) -> Self {
        let size = Self::size_of(kind, n);
        let mut event = recycler.allocate_on_thread(size, dest_rank);
        event.set_kind(EventKind::Gvt);
        // SAFETY: freshly allocated, not yet shared.
        unsafe {
            let header = event.header_mut();
            header.sender = GVT_SENDER;
            header.sent_time = TIME_INFINITY;
            header.receive_time = TIME_INFINITY;
            event.payload_mut().fill(0);
        }
        recycler.increase_reference(event);

        let mut msg = Self { event };
        *msg.gvt_header_mut() = GvtHeader {
            kind: kind as u32,
            size: size_field(size),
            sequence: SEQUENCE.fetch_add(1, Ordering::Relaxed),
            _pad: 0,
            t_min: TIME_INFINITY,
            gvt_estimate: TIME_INFINITY,
        };
        msg
    }

    /// Copies `src` into a buffer on the node of `dest_thread`, addressed
    /// to `dest_rank`. Size and sequence are preserved.
    pub fn create_from(src: &GvtMessage, dest_rank: ThreadId, dest_thread: ThreadId, recycler: &mut EventRecycler) -> Self {
        let image = src.as_bytes();
        let mut event = recycler.allocate_on_thread(image.len(), dest_thread);
        // SAFETY: freshly allocated with exactly `image.len()` bytes.
        unsafe {
            let generation = event.generation();
            event = EventHandle::init_copy(event.raw(), image, generation);
            event.header_mut().receiver = dest_rank as u64;
        }
        recycler.increase_reference(event);
        Self { event }
    }

    /// Wraps a GVT event taken off a queue.
    ///
    /// Returns `None` if `event` is not a GVT event.
    pub fn from_event(event: EventHandle) -> Option<Self> {
        (event.kind() == EventKind::Gvt).then_some(Self { event })
    }

    /// The underlying event.
    pub fn event(&self) -> EventHandle {
        self.event
    }

    /// Gives up ownership, returning the underlying event.
    pub fn into_event(self) -> EventHandle {
        self.event
    }

    fn gvt_header(&self) -> &GvtHeader {
        bytemuck::from_bytes(&self.event.payload()[..GVT_HEADER_SIZE])
    }

    fn gvt_header_mut(&mut self) -> &mut GvtHeader {
        // SAFETY: a message has a single owner at a time.
        let payload = unsafe { self.event.payload_mut() };
        bytemuck::from_bytes_mut(&mut payload[..GVT_HEADER_SIZE])
    }

    fn counters(&self) -> &[i32] {
        bytemuck::cast_slice(&self.event.payload()[GVT_HEADER_SIZE..])
    }

    fn counters_mut(&mut self) -> &mut [i32] {
        // SAFETY: a message has a single owner at a time.
        let payload = unsafe { self.event.payload_mut() };
        bytemuck::cast_slice_mut(&mut payload[GVT_HEADER_SIZE..])
    }

    /// Message kind.
    pub fn kind(&self) -> GvtMsgKind {
        GvtMsgKind::from_raw(self.gvt_header().kind)
    }

    /// Total buffer size.
    pub fn size(&self) -> usize {
        self.gvt_header().size as usize
    }

    /// Sequence number stamped at creation.
    pub fn sequence(&self) -> u32 {
        self.gvt_header().sequence
    }

    /// Rank the message is addressed to.
    pub fn dest_rank(&self) -> ThreadId {
        self.event.receiver() as ThreadId
    }

    /// Smallest receive time of a red event seen this round.
    pub fn t_min(&self) -> Time {
        self.gvt_header().t_min
    }

    /// Sets [`t_min`](Self::t_min).
    pub fn set_t_min(&mut self, t_min: Time) {
        self.gvt_header_mut().t_min = t_min;
    }

    /// Running LGVT minimum, or the final estimate.
    pub fn gvt_estimate(&self) -> Time {
        self.gvt_header().gvt_estimate
    }

    /// Sets [`gvt_estimate`](Self::gvt_estimate).
    pub fn set_gvt_estimate(&mut self, estimate: Time) {
        self.gvt_header_mut().gvt_estimate = estimate;
    }

    /// `min(gvt_estimate, t_min)`.
    pub fn min(&self) -> Time {
        let header = self.gvt_header();
        header.gvt_estimate.min(header.t_min)
    }

    /// Number of counter slots.
    pub fn counter_len(&self) -> usize {
        self.counters().len()
    }

    /// In-transit count for `rank`.
    pub fn counter(&self, rank: usize) -> i32 {
        self.counters()[rank]
    }

    /// Overwrites the count for `rank`.
    pub fn set_counter(&mut self, rank: usize, value: i32) {
        self.counters_mut()[rank] = value;
    }

    /// Adds `delta` to the count for `rank`.
    pub fn add_counter(&mut self, rank: usize, delta: i32) {
        self.counters_mut()[rank] += delta;
    }

    /// Whether slots `[0, n)` are all zero.
    ///
    /// Slots past [`counter_len`](Self::counter_len) count as zero.
    pub fn are_counters_zero(&self, n: usize) -> bool {
        debug_assert_eq!(self.kind(), GvtMsgKind::Ctrl);
        self.counters().iter().take(n).all(|&c| c == 0)
    }

    /// The flat wire image, event header included.
    pub fn as_bytes(&self) -> &[u8] {
        self.event.as_bytes()
    }

    /// Releases the message's buffer.
    pub fn destroy(msg: GvtMessage, recycler: &mut EventRecycler) {
        recycler.decrease_reference(msg.event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::MemoryTopology;
    use std::sync::Arc;

    fn recycler() -> EventRecycler {
        EventRecycler::new(0, Arc::new(MemoryTopology::single_node(4)), 64 * 1024).unwrap()
    }

    #[test]
    fn header_layout() {
        assert_eq!(GVT_HEADER_SIZE, 32);
        assert_eq!(GvtMessage::size_of(GvtMsgKind::Ctrl, 4), HEADER_SIZE + 32 + 16);
        assert_eq!(GvtMessage::size_of(GvtMsgKind::Estimate, 4), HEADER_SIZE + 32);
    }

    #[test]
    fn ctrl_message_carries_counters() {
        let mut recycler = recycler();
        let mut msg = GvtMessage::create(GvtMsgKind::Ctrl, 4, 1, &mut recycler);
        assert_eq!(msg.kind(), GvtMsgKind::Ctrl);
        assert_eq!(msg.size(), GvtMessage::size_of(GvtMsgKind::Ctrl, 4));
        assert_eq!(msg.as_bytes().len(), msg.size());
        assert_eq!(msg.counter_len(), 4);
        assert_eq!(msg.dest_rank(), 1);
        assert_eq!(msg.event().sender(), GVT_SENDER);
        assert!(msg.are_counters_zero(4));
        assert_eq!(msg.min(), TIME_INFINITY);

        msg.set_counter(2, 3);
        msg.add_counter(2, -1);
        assert_eq!(msg.counter(2), 2);
        assert!(!msg.are_counters_zero(4));
        assert!(msg.are_counters_zero(2));
        assert!(!msg.are_counters_zero(10));

        msg.set_gvt_estimate(7.0);
        msg.set_t_min(5.5);
        assert_eq!(msg.min(), 5.5);

        GvtMessage::destroy(msg, &mut recycler);
        assert_eq!(recycler.stats().reclaimed, 1);
    }

    #[test]
    fn counter_check_past_the_end_stops_at_the_last_slot() {
        let mut recycler = recycler();
        let mut msg = GvtMessage::create(GvtMsgKind::Ctrl, 4, 0, &mut recycler);
        assert_eq!(msg.counter_len(), 4);
        assert!(msg.are_counters_zero(10));
        msg.set_counter(3, 1);
        assert!(!msg.are_counters_zero(usize::MAX));
        assert!(msg.are_counters_zero(3));
        GvtMessage::destroy(msg, &mut recycler);
    }

    #[test]
    fn estimate_has_no_counters() {
        let mut recycler = recycler();
        let msg = GvtMessage::create(GvtMsgKind::Estimate, 8, 3, &mut recycler);
        assert_eq!(msg.counter_len(), 0);
        assert_eq!(msg.size(), HEADER_SIZE + GVT_HEADER_SIZE);
        GvtMessage::destroy(msg, &mut recycler);
    }

    #[test]
    fn sequences_increase() {
        let mut recycler = recycler();
        let a = GvtMessage::create(GvtMsgKind::Ack, 1, 0, &mut recycler);
        let b = GvtMessage::create(GvtMsgKind::Ack, 1, 0, &mut recycler);
        assert!(b.sequence() > a.sequence());
        GvtMessage::destroy(a, &mut recycler);
        GvtMessage::destroy(b, &mut recycler);
    }

    #[test]
    fn create_from_preserves_all_but_receiver() {
        let mut recycler = recycler();
        let mut src = GvtMessage::create(GvtMsgKind::Ctrl, 3, 1, &mut recycler);
        src.set_counter(0, -2);
        src.set_gvt_estimate(4.0);

        let copy = GvtMessage::create_from(&src, 2, 2, &mut recycler);
        assert_eq!(copy.dest_rank(), 2);
        assert_eq!(copy.sequence(), src.sequence());
        assert_eq!(copy.size(), src.size());
        assert_eq!(copy.counter(0), -2);
        assert_eq!(copy.gvt_estimate(), 4.0);
        assert_eq!(&copy.as_bytes()[HEADER_SIZE..], &src.as_bytes()[HEADER_SIZE..]);

        GvtMessage::destroy(src, &mut recycler);
        GvtMessage::destroy(copy, &mut recycler);
        assert_eq!(recycler.stats().reclaimed, 2);
    }

    #[test]
    fn regular_events_are_not_messages() {
        let mut recycler = recycler();
        let event = recycler.allocate(HEADER_SIZE + 8, 0);
        assert!(GvtMessage::from_event(event).is_none());
        recycler.increase_reference(event);
        recycler.decrease_reference(event);
    }
}
