//! The allocation engine: per-core free lists with cross-core stealing and
//! one-way superpage splitting over a single registered range of physical
//! memory.

use core::{
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use log::{debug, info, trace};
use spin::Mutex;
use thiserror::Error;

use crate::{
    cpu_id::{LogicalCpuId, MAX_CPU_COUNT},
    frame::{
        round_down_pages, round_up_pages, Frame, PhysicalAddress, FRAMES_PER_SUPERPAGE,
        PAGE_SIZE, SUPERPAGE_MASK, SUPERPAGE_SIZE,
    },
    frame_info::{FrameInfo, InfoTable},
    freelist::FreeList,
};

/// Byte written over a frame's contents when it returns to a free list.
pub const JUNK_FREED: u8 = 0x01;
/// Byte written over a frame's contents when it is handed to a caller.
pub const JUNK_ALLOCATED: u8 = 0x05;

/// Every pool was empty.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("out of physical frames")]
pub struct OutOfFrames;

/// A physical frame allocator over one contiguous range.
///
/// The front of the range is reserved for per-frame metadata. The rest is
/// carved into naturally aligned superpages, pooled globally, and loose base
/// frames on per-core LIFO free lists. Frames are reference counted; a count
/// that drops to zero puts the frame back on the releasing core's list.
pub struct FrameAllocator {
    table: InfoTable,
    /// First manageable frame address, directly above the metadata prefix.
    first: PhysicalAddress,
    /// End of the registered range, exclusive.
    end: PhysicalAddress,
    cpu_count: usize,
    cores: [Mutex<FreeList>; MAX_CPU_COUNT as usize],
    superpages: Mutex<FreeList>,
    /// Base frames currently turned over to callers. A live superpage
    /// counts all of its constituents.
    used: AtomicUsize,
    total: usize,
}

impl FrameAllocator {
    /// Registers `[range_start, range_end)` and brings it into circulation.
    ///
    /// Base frames are seeded onto the bootstrap processor's free list.
    /// Naturally aligned 2 MiB blocks go to the shared superpage pool
    /// instead and stay whole until split or allocated.
    ///
    /// # Safety
    ///
    /// The range must be writable at the addresses it describes (identity
    /// mapped on a kernel, plain buffer addresses in hosted tests), must not
    /// contain address zero, must not be used by anything else, and must
    /// stay mapped for the allocator's lifetime.
    #[cold]
    pub unsafe fn new(
        range_start: PhysicalAddress,
        range_end: PhysicalAddress,
        cpu_count: usize,
    ) -> Self {
        assert!(
            cpu_count >= 1 && cpu_count <= MAX_CPU_COUNT as usize,
            "cpu count {cpu_count} not in 1..={MAX_CPU_COUNT}"
        );
        assert!(
            range_start.data() <= range_end.data(),
            "range ends {range_end:?} before it starts {range_start:?}"
        );

        let table_base = round_up_pages(range_start.data());
        // One record per page from the table base to the end of the range.
        // The records shadowing the metadata prefix itself are never indexed.
        let slots = range_end.data().saturating_sub(table_base) / PAGE_SIZE;
        let first = PhysicalAddress::new(table_base + InfoTable::bytes_for(slots));

        // Carve the manageable span: whole superpages in the middle, loose
        // base frames on both flanks. Only whole frames count.
        let last = round_down_pages(range_end.data());
        let superpage_start = (first.data() + SUPERPAGE_MASK) & !SUPERPAGE_MASK;
        let superpage_count = if superpage_start < last {
            (last - superpage_start) / SUPERPAGE_SIZE
        } else {
            0
        };
        let (head_end, tail_start) = if superpage_count == 0 {
            (last, last)
        } else {
            (
                superpage_start,
                superpage_start + superpage_count * SUPERPAGE_SIZE,
            )
        };
        let base_count = head_end.saturating_sub(first.data()) / PAGE_SIZE
            + last.saturating_sub(tail_start) / PAGE_SIZE;

        let allocator = Self {
            table: unsafe { InfoTable::new(table_base as *mut u8, slots, first) },
            first,
            end: range_end,
            cpu_count,
            cores: [const { Mutex::new(FreeList::new()) }; MAX_CPU_COUNT as usize],
            superpages: Mutex::new(FreeList::new()),
            used: AtomicUsize::new(0),
            total: base_count + superpage_count * FRAMES_PER_SUPERPAGE,
        };

        for address in (first.data()..head_end).step_by(PAGE_SIZE) {
            allocator.seed_frame(
                LogicalCpuId::BSP,
                Frame::containing(PhysicalAddress::new(address)),
            );
        }
        for address in (tail_start..last).step_by(PAGE_SIZE) {
            allocator.seed_frame(
                LogicalCpuId::BSP,
                Frame::containing(PhysicalAddress::new(address)),
            );
        }
        {
            let mut superpages = allocator.superpages.lock();
            for n in 0..superpage_count {
                let head = Frame::containing(PhysicalAddress::new(
                    superpage_start + n * SUPERPAGE_SIZE,
                ));
                superpages.push(&allocator.table, head);
            }
        }

        info!(
            "registered {range_start:?}..{range_end:?}: {base_count} base frames, \
             {superpage_count} superpages, {} KiB metadata",
            InfoTable::bytes_for(slots) / 1024
        );

        allocator
    }

    /// Allocates one base frame for `cpu`, junk-filled and with a reference
    /// count of one.
    ///
    /// Falls back from `cpu`'s own list to splitting a pooled superpage, and
    /// then to stealing from another core. Returns `None` only once all
    /// three sources are empty.
    pub fn allocate(&self, cpu: LogicalCpuId) -> Option<Frame> {
        let local = self.core(cpu).lock().pop(&self.table);
        // The local lock is already released; each fallback below takes at
        // most one list lock at a time.
        let frame = local
            .or_else(|| self.split_superpage(cpu))
            .or_else(|| self.steal(cpu))?;
        Some(self.hand_out(frame))
    }

    /// Allocates one naturally aligned superpage, junk-filled, with every
    /// constituent base frame's reference count set to one.
    ///
    /// There is no superpage free: the caller releases the constituents one
    /// base frame at a time, and they never recombine.
    pub fn allocate_superpage(&self) -> Option<Frame> {
        let head = self.superpages.lock().pop(&self.table)?;
        for n in 0..FRAMES_PER_SUPERPAGE {
            let constituent = head.next_by(n);
            let info = self.require_managed(constituent.base()).1;
            let old = info.refcount.fetch_add(1, Ordering::Relaxed);
            if old != 0 {
                panic!("pooled superpage frame {constituent:?} had refcount {old}!");
            }
        }
        self.used.fetch_add(FRAMES_PER_SUPERPAGE, Ordering::Relaxed);
        unsafe { fill(head, FRAMES_PER_SUPERPAGE, JUNK_ALLOCATED) };
        Some(head)
    }

    /// Drops one reference to the frame at `address`, returning it to
    /// `cpu`'s free list when the last owner lets go.
    pub fn free(&self, cpu: LogicalCpuId, address: PhysicalAddress) {
        self.refcount_add(cpu, address, -1);
    }

    /// Adjusts the reference count of the frame at `address` by `delta`.
    ///
    /// A count reaching exactly zero frees the frame onto `cpu`'s list. Any
    /// adjustment that starts from a free frame or would end below zero is
    /// corruption and panics.
    pub fn refcount_add(&self, cpu: LogicalCpuId, address: PhysicalAddress, delta: isize) {
        // Validate cpu up front, not only on the release path.
        let _ = self.core(cpu);
        let (frame, info) = self.require_managed(address);

        let old = info.refcount.fetch_add(delta, Ordering::Relaxed);
        if old <= 0 {
            panic!("refcount_add on free frame {frame:?} (count {old})");
        }
        let new = old + delta;
        if new < 0 {
            panic!("refcount of {frame:?} dropped below zero ({new})");
        }
        if new == 0 {
            // Reaching zero confers sole ownership of the frame.
            unsafe { fill(frame, 1, JUNK_FREED) };
            self.core(cpu).lock().push(&self.table, frame);
            self.used.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Reads the current reference count of the frame at `address`.
    pub fn refcount(&self, address: PhysicalAddress) -> isize {
        let (_, info) = self.require_managed(address);
        info.refcount.load(Ordering::Relaxed)
    }

    pub fn total_frames(&self) -> usize {
        self.total
    }
    pub fn used_frames(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
    pub fn free_frames(&self) -> usize {
        self.total_frames().saturating_sub(self.used_frames())
    }
    pub fn free_superpages(&self) -> usize {
        self.superpages.lock().len()
    }

    /// Breaks one pooled superpage into base frames. The caller gets the
    /// first constituent back still free; the other 511 go onto `cpu`'s
    /// list through the regular free path.
    fn split_superpage(&self, cpu: LogicalCpuId) -> Option<Frame> {
        let head = self.superpages.lock().pop(&self.table)?;
        for n in 1..FRAMES_PER_SUPERPAGE {
            self.seed_frame(cpu, head.next_by(n));
        }
        debug!("split superpage at {head:?} for cpu {cpu}");
        Some(head)
    }

    /// Scans every other core's list in fixed order, starting from core 0,
    /// and takes a single frame from the first list that has one. At most
    /// one list lock is held at any instant.
    fn steal(&self, cpu: LogicalCpuId) -> Option<Frame> {
        for victim in (0..self.cpu_count as u32).map(LogicalCpuId::new) {
            if victim == cpu {
                continue;
            }
            let stolen = self.cores[victim.get() as usize].lock().pop(&self.table);
            if let Some(frame) = stolen {
                trace!("cpu {cpu} stole {frame:?} from cpu {victim}");
                return Some(frame);
            }
        }
        None
    }

    /// Turns a frame popped off a free list into an allocation.
    fn hand_out(&self, frame: Frame) -> Frame {
        let info = self
            .table
            .get(frame)
            .unwrap_or_else(|| panic!("no metadata record for allocated frame {frame:?}"));
        let old = info.refcount.fetch_add(1, Ordering::Relaxed);
        if old != 0 {
            panic!("freelist frame {frame:?} had refcount {old}!");
        }
        self.used.fetch_add(1, Ordering::Relaxed);
        unsafe { fill(frame, 1, JUNK_ALLOCATED) };
        frame
    }

    /// Puts a never-circulated frame into circulation through the regular
    /// free path, so it lands junk-filled on `cpu`'s list.
    fn seed_frame(&self, cpu: LogicalCpuId, frame: Frame) {
        let info = self.require_managed(frame.base()).1;
        let old = info.refcount.fetch_add(1, Ordering::Relaxed);
        if old != 0 {
            panic!("frame {frame:?} entering circulation had refcount {old}!");
        }
        self.used.fetch_add(1, Ordering::Relaxed);
        self.free(cpu, frame.base());
    }

    /// Checks that `address` denotes a manageable frame, fatally otherwise.
    #[track_caller]
    fn require_managed(&self, address: PhysicalAddress) -> (Frame, &FrameInfo) {
        if !address.is_page_aligned() {
            panic!("frame op on unaligned address {address:?}");
        }
        if address.data() < self.first.data() || address.data() >= self.end.data() {
            panic!("frame op on unmanaged address {address:?}");
        }
        let frame = Frame::containing(address);
        let info = self
            .table
            .get(frame)
            .unwrap_or_else(|| panic!("no metadata record for managed frame {frame:?}"));
        (frame, info)
    }

    #[track_caller]
    fn core(&self, cpu: LogicalCpuId) -> &Mutex<FreeList> {
        assert!(
            (cpu.get() as usize) < self.cpu_count,
            "cpu {cpu} outside the registered cpu count {}",
            self.cpu_count
        );
        &self.cores[cpu.get() as usize]
    }
}

/// Overwrites `count` frames starting at `frame` with `junk`.
///
/// # Safety
///
/// The caller must exclusively own all `count` frames: just popped off a
/// list, or just transitioned to a zero reference count.
unsafe fn fill(frame: Frame, count: usize, junk: u8) {
    unsafe { ptr::write_bytes(frame.base().data() as *mut u8, junk, count * PAGE_SIZE) }
}

/// An allocated frame that frees itself on drop.
pub struct FrameGuard<'a> {
    allocator: &'a FrameAllocator,
    cpu: LogicalCpuId,
    inner: Frame,
}

impl<'a> FrameGuard<'a> {
    pub fn allocate(allocator: &'a FrameAllocator, cpu: LogicalCpuId) -> Result<Self, OutOfFrames> {
        let inner = allocator.allocate(cpu).ok_or(OutOfFrames)?;
        Ok(Self {
            allocator,
            cpu,
            inner,
        })
    }
    /// # Safety
    ///
    /// The guard takes over one reference to `inner`, which must have been
    /// handed out by `allocator`.
    pub unsafe fn new_unchecked(
        allocator: &'a FrameAllocator,
        cpu: LogicalCpuId,
        inner: Frame,
    ) -> Self {
        Self {
            allocator,
            cpu,
            inner,
        }
    }
    pub fn get(&self) -> Frame {
        self.inner
    }
    pub fn take(self) -> Frame {
        let frame = self.inner;
        core::mem::forget(self);
        frame
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.allocator.free(self.cpu, self.inner.base());
    }
}
