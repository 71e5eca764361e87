//! Frame geometry: typed physical addresses and page-aligned frame handles.

use core::num::NonZeroUsize;

/// Size of a base frame in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Mask of the offset bits within a base frame.
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Number of base frames making up one superpage.
pub const FRAMES_PER_SUPERPAGE: usize = 512;
/// Size of a superpage in bytes.
pub const SUPERPAGE_SIZE: usize = FRAMES_PER_SUPERPAGE * PAGE_SIZE;
/// Mask of the offset bits within a superpage.
pub const SUPERPAGE_MASK: usize = SUPERPAGE_SIZE - 1;

pub const fn round_down_pages(number: usize) -> usize {
    number & !PAGE_MASK
}
pub const fn round_up_pages(number: usize) -> usize {
    round_down_pages(number + PAGE_MASK)
}

/// An address in physical memory.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysicalAddress(usize);

impl PhysicalAddress {
    #[inline(always)]
    pub const fn new(address: usize) -> Self {
        Self(address)
    }

    #[inline(always)]
    pub const fn data(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub fn add(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }

    #[inline(always)]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }
}

impl core::fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[phys addr {:#x}]", self.0)
    }
}

/// A page-aligned, non-null frame of physical memory.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Frame {
    physaddr: NonZeroUsize,
}

impl core::fmt::Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[frame at {:p}]", self.base().data() as *const u8)
    }
}

impl Frame {
    pub fn containing(address: PhysicalAddress) -> Frame {
        Frame {
            physaddr: NonZeroUsize::new(address.data() & !PAGE_MASK)
                .expect("frame 0x0 is reserved"),
        }
    }
    pub fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.physaddr.get())
    }
    /// The frame `n` base pages above this one.
    pub fn next_by(self, n: usize) -> Self {
        Self {
            physaddr: self
                .physaddr
                .get()
                .checked_add(n * PAGE_SIZE)
                .and_then(NonZeroUsize::new)
                .expect("overflow in Frame::next_by"),
        }
    }
    /// Number of base pages between `from` (the lower frame) and this one.
    pub fn offset_from(self, from: Self) -> usize {
        self.physaddr
            .get()
            .checked_sub(from.physaddr.get())
            .expect("overflow in Frame::offset_from")
            / PAGE_SIZE
    }
    pub fn is_superpage_aligned(self) -> bool {
        self.base().data() & SUPERPAGE_MASK == 0
    }
}
