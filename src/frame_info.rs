//! Per-frame metadata records.
//!
//! The registrar reserves a prefix of the managed range and lays one
//! [`FrameInfo`] record over it per manageable frame. A record carries the
//! frame's reference count and, while the frame sits on a free list, the
//! link to the frame below it.

use core::{mem, ptr::NonNull, sync::atomic::{AtomicIsize, AtomicUsize, Ordering}};

use crate::frame::{round_up_pages, Frame, PhysicalAddress, PAGE_SIZE};

/// Metadata for one base frame.
///
/// `refcount` is the number of owners while the frame is allocated and zero
/// while it is free. `next` holds the base address of the next free frame
/// (zero for the end of the list) and is meaningless while allocated.
#[derive(Debug)]
pub(crate) struct FrameInfo {
    pub(crate) refcount: AtomicIsize,
    next: AtomicUsize,
}

impl FrameInfo {
    pub(crate) fn next_free(&self) -> Option<Frame> {
        let raw = self.next.load(Ordering::Relaxed);
        if raw == 0 {
            None
        } else {
            Some(Frame::containing(PhysicalAddress::new(raw)))
        }
    }
    pub(crate) fn set_next_free(&self, next: Option<Frame>) {
        let raw = next.map_or(0, |frame| frame.base().data());
        self.next.store(raw, Ordering::Relaxed);
    }
}

/// The record table carved out of the front of the managed range.
pub(crate) struct InfoTable {
    records: NonNull<FrameInfo>,
    slots: usize,
    /// Base address of the first manageable frame, which record 0 describes.
    first: usize,
}

// The table region is owned by the allocator for its whole lifetime and every
// record field is atomic, so shared references from any thread are sound.
unsafe impl Send for InfoTable {}
unsafe impl Sync for InfoTable {}

impl InfoTable {
    /// Bytes reserved for `slots` records, rounded up to a whole page.
    pub(crate) fn bytes_for(slots: usize) -> usize {
        round_up_pages(slots * mem::size_of::<FrameInfo>())
    }

    /// Lays a zeroed record table over `base`.
    ///
    /// # Safety
    ///
    /// `base` must be page-aligned, writable, unaliased for the lifetime of
    /// the table, and large enough for [`Self::bytes_for`]`(slots)` bytes.
    pub(crate) unsafe fn new(base: *mut u8, slots: usize, first: PhysicalAddress) -> Self {
        let records = if slots == 0 {
            NonNull::dangling()
        } else {
            let records = base.cast::<FrameInfo>();
            // A zeroed record reads as refcount 0, no next link.
            unsafe { base.write_bytes(0, slots * mem::size_of::<FrameInfo>()) };
            NonNull::new(records).expect("metadata table at address 0x0")
        };
        Self {
            records,
            slots,
            first: first.data(),
        }
    }

    pub(crate) fn get(&self, frame: Frame) -> Option<&FrameInfo> {
        let index = frame.base().data().checked_sub(self.first)? / PAGE_SIZE;
        if index >= self.slots {
            return None;
        }
        Some(unsafe { self.records.add(index).as_ref() })
    }
}
