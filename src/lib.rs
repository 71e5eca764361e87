//! # The physical frame allocator
//!
//! Reference-counted 4 KiB frames and one-way-split 2 MiB superpages over a
//! registered range of physical memory, kept on per-core LIFO free lists
//! with cross-core stealing when a local list runs dry.

#![deny(static_mut_refs)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]
#![cfg_attr(not(test), no_std)]

mod allocator;
mod cpu_id;
mod frame;
mod frame_info;
mod freelist;

pub use crate::allocator::{
    FrameAllocator, FrameGuard, OutOfFrames, JUNK_ALLOCATED, JUNK_FREED,
};
pub use crate::cpu_id::{LogicalCpuId, MAX_CPU_COUNT};
pub use crate::frame::{
    Frame, PhysicalAddress, FRAMES_PER_SUPERPAGE, PAGE_MASK, PAGE_SIZE, SUPERPAGE_MASK,
    SUPERPAGE_SIZE,
};
