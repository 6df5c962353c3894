//! Physical page allocator.
//!
//! A flat bitmap over every frame up to the highest usable address. The
//! bitmap itself is carved out of the first free region large enough to
//! hold it, before the kernel heap exists. All state sits behind the
//! allocator's own lock; callers never see partial updates.

use crate::boot::entry::{MemoryKind, MemoryRegion};
use crate::sync::IrqSpinLock;
use x86_64::PhysAddr;

pub const PAGE_SIZE: usize = 4096;

/// Boundary for the legacy-DMA low-memory hint.
const LOW_MEMORY_LIMIT: u64 = 16 * 1024 * 1024;

bitflags::bitflags! {
    /// Hints for contiguous allocations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PmmFlags: u32 {
        /// Allocate below 16 MiB for legacy DMA devices.
        const LOW_MEMORY = 1 << 0;
    }
}

/// Snapshot of physical memory accounting.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhysMemoryStatus {
    pub usable_pages: usize,
    pub used_pages: usize,
    pub reserved_pages: usize,
    pub highest_address: u64,
}

struct Pmm {
    /// One bit per frame; set = in use or reserved.
    bitmap: &'static mut [u8],
    total_frames: usize,
    usable_pages: usize,
    used_pages: usize,
    reserved_pages: usize,
    highest_address: u64,
    /// Rotating search start to keep allocation O(1) amortised.
    next_hint: usize,
}

// IRQ-masking: allocation happens from preemption-disabled worker paths
// too, and a holder preempted on the same CPU could never be resumed.
static PMM: IrqSpinLock<Option<Pmm>> = IrqSpinLock::new(None);

impl Pmm {
    fn test(&self, frame: usize) -> bool {
        self.bitmap[frame / 8] & (1 << (frame % 8)) != 0
    }

    fn set(&mut self, frame: usize) {
        self.bitmap[frame / 8] |= 1 << (frame % 8);
    }

    fn clear(&mut self, frame: usize) {
        self.bitmap[frame / 8] &= !(1 << (frame % 8));
    }

    fn find_run(&self, count: usize, limit_frames: usize) -> Option<usize> {
        let end = self.total_frames.min(limit_frames);
        let start = if count == 1 && self.next_hint < end {
            self.next_hint
        } else {
            0
        };

        let mut scan = |from: usize, to: usize| -> Option<usize> {
            let mut run = 0usize;
            let mut run_start = from;
            for frame in from..to {
                if self.test(frame) {
                    run = 0;
                    run_start = frame + 1;
                } else {
                    run += 1;
                    if run == count {
                        return Some(run_start);
                    }
                }
            }
            None
        };

        scan(start, end).or_else(|| if start > 0 { scan(0, start) } else { None })
    }
}

/// Build the allocator from the boot memory map.
///
/// Frames covering non-free regions are accounted reserved; the bitmap's
/// own frames are marked used.
pub fn init(memory_map: &[MemoryRegion]) {
    let highest = memory_map
        .iter()
        .filter(|r| matches!(r.kind, MemoryKind::Free | MemoryKind::Reclaim))
        .map(|r| r.base + r.size)
        .max()
        .unwrap_or(0);
    let total_frames = (highest as usize).div_ceil(PAGE_SIZE);
    let bitmap_bytes = total_frames.div_ceil(8);
    let bitmap_pages = bitmap_bytes.div_ceil(PAGE_SIZE);

    // Carve the bitmap from the first free region that fits it.
    let mut bitmap_base = 0u64;
    for region in memory_map {
        if matches!(region.kind, MemoryKind::Free)
            && region.size as usize >= bitmap_pages * PAGE_SIZE
        {
            bitmap_base = region.base;
            break;
        }
    }
    if bitmap_base == 0 {
        panic!("pmm: no region large enough for the frame bitmap");
    }

    // SAFETY: the region is free RAM reachable through the direct map and
    // nothing else references it yet.
    let bitmap: &'static mut [u8] = unsafe {
        let ptr = crate::memory::phys_to_virt(bitmap_base) as *mut u8;
        core::ptr::write_bytes(ptr, 0xFF, bitmap_bytes);
        core::slice::from_raw_parts_mut(ptr, bitmap_bytes)
    };

    let mut pmm = Pmm {
        bitmap,
        total_frames,
        usable_pages: 0,
        used_pages: 0,
        reserved_pages: 0,
        highest_address: highest,
        next_hint: 0,
    };

    // Free frames start cleared; everything else stays set.
    for region in memory_map {
        if !matches!(region.kind, MemoryKind::Free) {
            pmm.reserved_pages += (region.size as usize) / PAGE_SIZE;
            continue;
        }
        let first = (region.base as usize).div_ceil(PAGE_SIZE);
        let last = ((region.base + region.size) as usize) / PAGE_SIZE;
        for frame in first..last.min(total_frames) {
            pmm.clear(frame);
            pmm.usable_pages += 1;
        }
    }

    // The bitmap's own frames are in use.
    let first = (bitmap_base as usize) / PAGE_SIZE;
    for frame in first..first + bitmap_pages {
        pmm.set(frame);
        pmm.used_pages += 1;
    }

    log::info!(
        "pmm: {} MiB usable, {} frames tracked, bitmap {} KiB",
        pmm.usable_pages * PAGE_SIZE / (1024 * 1024),
        total_frames,
        bitmap_bytes / 1024
    );

    *PMM.lock() = Some(pmm);
}

/// Allocate one frame. Returns `None` when memory is exhausted; callers
/// surface that as an out-of-memory error, never a panic.
pub fn allocate() -> Option<PhysAddr> {
    allocate_contiguous(1, PmmFlags::empty())
}

/// Allocate `count` physically contiguous frames.
pub fn allocate_contiguous(count: usize, flags: PmmFlags) -> Option<PhysAddr> {
    if count == 0 {
        return None;
    }
    let mut guard = PMM.lock();
    let pmm = guard.as_mut()?;

    let limit = if flags.contains(PmmFlags::LOW_MEMORY) {
        (LOW_MEMORY_LIMIT as usize) / PAGE_SIZE
    } else {
        usize::MAX
    };

    let start = pmm.find_run(count, limit)?;
    for frame in start..start + count {
        pmm.set(frame);
    }
    pmm.used_pages += count;
    pmm.next_hint = start + count;
    Some(PhysAddr::new((start * PAGE_SIZE) as u64))
}

/// Return one frame to the allocator.
pub fn free(addr: PhysAddr) {
    free_contiguous(addr, 1);
}

/// Return `count` contiguous frames to the allocator.
pub fn free_contiguous(addr: PhysAddr, count: usize) {
    let mut guard = PMM.lock();
    let Some(pmm) = guard.as_mut() else {
        return;
    };
    let first = (addr.as_u64() as usize) / PAGE_SIZE;
    for frame in first..first + count {
        if frame < pmm.total_frames && pmm.test(frame) {
            pmm.clear(frame);
            pmm.used_pages -= 1;
        }
    }
}

/// Fill `out` with the current accounting figures.
pub fn status(out: &mut PhysMemoryStatus) {
    let guard = PMM.lock();
    if let Some(pmm) = guard.as_ref() {
        out.usable_pages = pmm.usable_pages;
        out.used_pages = pmm.used_pages;
        out.reserved_pages = pmm.reserved_pages;
        out.highest_address = pmm.highest_address;
    }
}
