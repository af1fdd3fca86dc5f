//! Event buffers and handles.
//!
//! An event is a flat record in a recycled buffer:
//!
//! ```text
//! ┌────────────────────── EventHeader (56 bytes) ──────────────────────┐
//! │ sender │ receiver │ sent_time │ receive_time │ size │ kind │ color │
//! │ generation │ reference_count │ input_ref_count                     │
//! └────────────────────────────────────────────────────────────────────┘
//! │ payload (size - HEADER_SIZE bytes)                                 │
//! ```
//!
//! The two counters follow a single-writer discipline: `reference_count`
//! is only written by the sending thread and `input_ref_count` only by the
//! receiving thread. Each side publishes its stores with `Release` and
//! reads the other side with `Acquire`, so no read-modify-write is needed.

use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

/// Agent identifier.
pub type AgentId = u64;

/// Virtual time.
pub type Time = f64;

/// A time later than every event.
pub const TIME_INFINITY: Time = f64::INFINITY;

/// Sender id stamped on GVT control traffic.
pub const GVT_SENDER: AgentId = AgentId::MAX;

/// Bytes taken by [`EventHeader`] at the start of every event buffer.
pub const HEADER_SIZE: usize = core::mem::size_of::<EventHeader>();

/// Alignment of every event buffer.
pub const EVENT_ALIGN: usize = core::mem::align_of::<EventHeader>();

/// Largest event, header included, the header's size field can describe.
pub const MAX_EVENT_SIZE: usize = u32::MAX as usize;

/// `size` as stored in the header.
///
/// # Panics
///
/// If `size` exceeds [`MAX_EVENT_SIZE`].
pub(crate) fn size_field(size: usize) -> u32 {
    match u32::try_from(size) {
        Ok(size) => size,
        Err(_) => panic!("event of {size} bytes exceeds the {MAX_EVENT_SIZE}-byte limit"),
    }
}

/// What an event buffer carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventKind {
    /// Agent-to-agent event.
    Regular = 0,
    /// GVT token or estimate.
    Gvt = 1,
}

/// Fixed header at the start of every event buffer.
#[repr(C)]
pub struct EventHeader {
    /// Agent that scheduled the event.
    pub sender: AgentId,
    /// Agent that will process the event.
    pub receiver: AgentId,
    /// Virtual time at which the event was sent.
    pub sent_time: Time,
    /// Virtual time at which the event is processed.
    pub receive_time: Time,
    size: u32,
    kind: u8,
    color: u8,
    _pad: [u8; 2],
    generation: AtomicU32,
    reference_count: AtomicU32,
    input_ref_count: AtomicU32,
}

impl EventHeader {
    /// Total buffer size including the header.
    #[inline]
    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Payload kind.
    #[inline]
    pub fn kind(&self) -> EventKind {
        if self.kind == EventKind::Gvt as u8 {
            EventKind::Gvt
        } else {
            EventKind::Regular
        }
    }

    /// GVT colour (0 or 1) stamped when the event left its thread.
    #[inline]
    pub fn color(&self) -> u8 {
        self.color
    }

    /// Sets the GVT colour.
    #[inline]
    pub fn set_color(&mut self, color: u8) {
        debug_assert!(color <= 1);
        self.color = color;
    }

    /// Reuse generation of the buffer.
    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Sender-side (or unified) count.
    #[inline]
    pub fn reference_count(&self) -> u32 {
        self.reference_count.load(Ordering::Acquire)
    }

    /// Receiver-side count.
    #[inline]
    pub fn input_ref_count(&self) -> u32 {
        self.input_ref_count.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn store_reference_count(&self, count: u32) {
        self.reference_count.store(count, Ordering::Release);
    }

    #[inline]
    pub(crate) fn store_input_ref_count(&self, count: u32) {
        self.input_ref_count.store(count, Ordering::Release);
    }

    #[inline]
    pub(crate) fn bump_generation(&self) {
        let generation = self.generation.load(Ordering::Relaxed);
        self.generation.store(generation.wrapping_add(1), Ordering::Relaxed);
    }
}

impl fmt::Debug for EventHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHeader")
            .field("sender", &self.sender)
            .field("receiver", &self.receiver)
            .field("sent_time", &self.sent_time)
            .field("receive_time", &self.receive_time)
            .field("size", &self.size)
            .field("kind", &self.kind())
            .field("color", &self.color)
            .field("reference_count", &self.reference_count())
            .field("input_ref_count", &self.input_ref_count())
            .finish()
    }
}

/// A handle to a live event buffer: `(pointer, generation)`.
///
/// Handles are plain copies. Holding one does not keep the buffer alive;
/// the reference counts do. Using a handle after the last count on its
/// buffer was released is a caller error, caught in debug builds by the
/// generation check.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EventHandle {
    ptr: NonNull<EventHeader>,
    generation: u32,
}

// SAFETY: buffers move between threads only through the inbound queues,
// and each counter has a single writer thread.
unsafe impl Send for EventHandle {}

impl EventHandle {
    /// Initializes a fresh header in `mem` and returns its handle.
    ///
    /// Both counters start at zero. `generation` is the buffer's current
    /// reuse generation.
    ///
    /// # Safety
    ///
    /// `mem` must be valid for `size` bytes, aligned to [`EVENT_ALIGN`],
    /// and not referenced by any other live handle.
    pub(crate) unsafe fn init(mem: NonNull<u8>, size: usize, receiver: AgentId, generation: u32) -> Self {
        debug_assert!(size >= HEADER_SIZE);
        debug_assert_eq!(mem.as_ptr() as usize % EVENT_ALIGN, 0);
        let ptr = mem.cast::<EventHeader>();
        ptr.as_ptr().write(EventHeader {
            sender: 0,
            receiver,
            sent_time: 0.0,
            receive_time: 0.0,
            size: size_field(size),
            kind: EventKind::Regular as u8,
            color: 0,
            _pad: [0; 2],
            generation: AtomicU32::new(generation),
            reference_count: AtomicU32::new(0),
            input_ref_count: AtomicU32::new(0),
        });
        Self { ptr, generation }
    }

    /// Copies a complete event image into `mem` and returns its handle.
    ///
    /// Counters start at zero and the buffer keeps `generation`; every
    /// other header field and the payload come from `image`.
    ///
    /// # Safety
    ///
    /// Same contract as [`init`](Self::init) with `size == image.len()`.
    pub(crate) unsafe fn init_copy(mem: NonNull<u8>, image: &[u8], generation: u32) -> Self {
        debug_assert!(image.len() >= HEADER_SIZE);
        debug_assert_eq!(mem.as_ptr() as usize % EVENT_ALIGN, 0);
        core::ptr::copy_nonoverlapping(image.as_ptr(), mem.as_ptr(), image.len());
        let ptr = mem.cast::<EventHeader>();
        let header = &mut *ptr.as_ptr();
        header.size = size_field(image.len());
        header.generation = AtomicU32::new(generation);
        header.reference_count = AtomicU32::new(0);
        header.input_ref_count = AtomicU32::new(0);
        Self { ptr, generation }
    }

    /// The event header.
    #[inline]
    pub fn header(&self) -> &EventHeader {
        self.check_live();
        // SAFETY: the buffer is live while any count is held.
        unsafe { self.ptr.as_ref() }
    }

    /// Mutable header access.
    ///
    /// # Safety
    ///
    /// The caller must be the only thread touching the event, e.g. its
    /// creator before it is queued.
    #[inline]
    pub unsafe fn header_mut(&mut self) -> &mut EventHeader {
        self.check_live();
        self.ptr.as_mut()
    }

    /// Payload bytes after the header.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        let len = self.header().size() - HEADER_SIZE;
        // SAFETY: the buffer is `size` bytes long.
        unsafe { core::slice::from_raw_parts(self.as_ptr().add(HEADER_SIZE), len) }
    }

    /// Mutable payload access.
    ///
    /// # Safety
    ///
    /// Same contract as [`header_mut`](Self::header_mut).
    #[inline]
    pub unsafe fn payload_mut(&mut self) -> &mut [u8] {
        let len = self.header().size() - HEADER_SIZE;
        core::slice::from_raw_parts_mut(self.as_ptr().add(HEADER_SIZE), len)
    }

    /// The whole buffer, header included, as written on the wire.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        let len = self.header().size();
        // SAFETY: the buffer is `size` bytes long.
        unsafe { core::slice::from_raw_parts(self.as_ptr(), len) }
    }

    /// Sender agent.
    #[inline]
    pub fn sender(&self) -> AgentId {
        self.header().sender
    }

    /// Receiver agent.
    #[inline]
    pub fn receiver(&self) -> AgentId {
        self.header().receiver
    }

    /// Send time.
    #[inline]
    pub fn sent_time(&self) -> Time {
        self.header().sent_time
    }

    /// Receive time.
    #[inline]
    pub fn receive_time(&self) -> Time {
        self.header().receive_time
    }

    /// Payload kind.
    #[inline]
    pub fn kind(&self) -> EventKind {
        self.header().kind()
    }

    /// Generation the handle was issued for.
    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Start of the buffer.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr().cast()
    }

    /// Whether the buffer still carries this handle's generation.
    #[inline]
    pub fn is_live(&self) -> bool {
        // SAFETY: recycled buffers stay mapped until their recycler is
        // torn down, so the generation word is always readable here.
        unsafe { self.ptr.as_ref().generation() == self.generation }
    }

    pub(crate) fn raw(&self) -> NonNull<u8> {
        self.ptr.cast()
    }

    pub(crate) fn set_kind(&mut self, kind: EventKind) {
        // SAFETY: only called by the creator before the event is shared.
        unsafe { self.ptr.as_mut().kind = kind as u8 };
    }

    #[inline]
    fn check_live(&self) {
        debug_assert!(self.is_live(), "event handle used after its buffer was reclaimed");
    }
}

impl fmt::Debug for EventHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandle")
            .field("ptr", &self.ptr)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(words: usize) -> Vec<u64> {
        vec![0u64; words]
    }

    #[test]
    fn header_layout_is_stable() {
        assert_eq!(HEADER_SIZE, 56);
        assert_eq!(EVENT_ALIGN, 8);
    }

    #[test]
    fn size_field_holds_the_largest_event() {
        assert_eq!(size_field(HEADER_SIZE), 56);
        assert_eq!(size_field(MAX_EVENT_SIZE), u32::MAX);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    #[should_panic(expected = "exceeds")]
    fn size_field_rejects_what_it_cannot_store() {
        size_field(MAX_EVENT_SIZE + 1);
    }

    #[test]
    fn init_writes_header() {
        let mut buf = buffer(16);
        let mem = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();
        let mut handle = unsafe { EventHandle::init(mem, 96, 7, 3) };
        unsafe {
            let header = handle.header_mut();
            header.sender = 2;
            header.sent_time = 1.0;
            header.receive_time = 4.5;
            handle.payload_mut().fill(0xEE);
        }

        assert_eq!(handle.receiver(), 7);
        assert_eq!(handle.sender(), 2);
        assert_eq!(handle.receive_time(), 4.5);
        assert_eq!(handle.header().size(), 96);
        assert_eq!(handle.payload().len(), 96 - HEADER_SIZE);
        assert!(handle.payload().iter().all(|&b| b == 0xEE));
        assert_eq!(handle.as_bytes().len(), 96);
        assert_eq!(handle.kind(), EventKind::Regular);
        assert_eq!(handle.generation(), 3);
        assert_eq!(handle.header().reference_count(), 0);
    }

    #[test]
    fn copy_resets_counters_only() {
        let mut src_buf = buffer(12);
        let mut dst_buf = buffer(12);
        let src_mem = NonNull::new(src_buf.as_mut_ptr().cast::<u8>()).unwrap();
        let dst_mem = NonNull::new(dst_buf.as_mut_ptr().cast::<u8>()).unwrap();

        let mut src = unsafe { EventHandle::init(src_mem, 80, 9, 5) };
        unsafe {
            src.header_mut().receive_time = 3.0;
            src.header_mut().set_color(1);
            src.payload_mut().copy_from_slice(&[7u8; 24]);
        }
        src.header().store_reference_count(2);

        let copy = unsafe { EventHandle::init_copy(dst_mem, src.as_bytes(), 1) };
        assert_eq!(copy.receiver(), 9);
        assert_eq!(copy.receive_time(), 3.0);
        assert_eq!(copy.header().color(), 1);
        assert_eq!(copy.payload(), &[7u8; 24][..]);
        assert_eq!(copy.header().reference_count(), 0);
        assert_eq!(copy.generation(), 1);
    }

    #[test]
    fn generation_bump_invalidates_handle() {
        let mut buf = buffer(8);
        let mem = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();
        let handle = unsafe { EventHandle::init(mem, HEADER_SIZE, 0, 0) };
        assert!(handle.is_live());
        handle.header().bump_generation();
        assert!(!handle.is_live());
    }

    #[test]
    fn counters_are_independent() {
        let mut buf = buffer(8);
        let mem = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();
        let handle = unsafe { EventHandle::init(mem, HEADER_SIZE, 0, 0) };
        handle.header().store_reference_count(2);
        handle.header().store_input_ref_count(1);
        assert_eq!(handle.header().reference_count(), 2);
        assert_eq!(handle.header().input_ref_count(), 1);
    }
}
