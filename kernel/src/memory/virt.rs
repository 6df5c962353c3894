//! Virtual memory windows and the page-fault classifier.
//!
//! All operations act on the address space that is currently active;
//! callers switch first (see `thread_use_context`). The kernel half is
//! shared between every root, so kernel-window allocations made here are
//! visible everywhere.

use crate::arch::x86_64::paging::{self, PAGE_SIZE};
use crate::memory::phys;
use crate::sync::IrqSpinLock;
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::PageTableFlags;

/// Serializes window scans and mapping updates; IRQ-masking for the same
/// reason as the frame allocator's lock.
static VIRT_LOCK: IrqSpinLock<()> = IrqSpinLock::new(());

bitflags::bitflags! {
    /// Permission bits for a virtual allocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmFlags: u32 {
        const USER  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

fn page_flags(flags: VmFlags) -> PageTableFlags {
    let mut out = PageTableFlags::PRESENT;
    if flags.contains(VmFlags::USER) {
        out |= PageTableFlags::USER_ACCESSIBLE;
    }
    if flags.contains(VmFlags::WRITE) {
        out |= PageTableFlags::WRITABLE;
    }
    if !flags.contains(VmFlags::EXEC) {
        out |= PageTableFlags::NO_EXECUTE;
    }
    out
}

fn active_root() -> u64 {
    Cr3::read().0.start_address().as_u64()
}

/// Reserve `pages` contiguous virtual pages inside `[range_low,
/// range_high)`, back each with a freshly allocated (zeroed) frame, and
/// install the requested permissions. Returns the base address, or 0 when
/// either virtual or physical space is exhausted.
pub fn allocate(range_low: u64, range_high: u64, pages: usize, flags: VmFlags) -> u64 {
    if pages == 0 {
        return 0;
    }
    let _window = VIRT_LOCK.lock();
    let root = active_root();
    let span = (pages * PAGE_SIZE) as u64;

    // First-fit scan for an unmapped run.
    let mut base = align_up(range_low, PAGE_SIZE as u64);
    'search: while base + span <= range_high {
        for i in 0..pages {
            if paging::translate(root, base + (i * PAGE_SIZE) as u64).is_some() {
                base += ((i + 1) * PAGE_SIZE) as u64;
                continue 'search;
            }
        }
        break;
    }
    if base + span > range_high {
        return 0;
    }

    for i in 0..pages {
        let virt = base + (i * PAGE_SIZE) as u64;
        let Some(frame) = phys::allocate() else {
            // Roll back what we mapped so far.
            free_locked(root, base, i);
            return 0;
        };
        // SAFETY: fresh frame through the direct map.
        unsafe {
            core::ptr::write_bytes(
                crate::memory::phys_to_virt(frame.as_u64()) as *mut u8,
                0,
                PAGE_SIZE,
            );
        }
        if paging::map_page(root, virt, frame.as_u64(), page_flags(flags)).is_err() {
            phys::free(frame);
            free_locked(root, base, i);
            return 0;
        }
    }
    base
}

/// Back `pages` pages at exactly `virt` with fresh zeroed frames.
///
/// Fails (returns 0) if any page in the range is already mapped. Used by
/// the ELF loader, which must honour fixed segment addresses.
pub fn allocate_at(virt: u64, pages: usize, flags: VmFlags) -> u64 {
    if pages == 0 || virt % PAGE_SIZE as u64 != 0 {
        return 0;
    }
    let _window = VIRT_LOCK.lock();
    let root = active_root();
    for i in 0..pages {
        if paging::translate(root, virt + (i * PAGE_SIZE) as u64).is_some() {
            return 0;
        }
    }
    for i in 0..pages {
        let addr = virt + (i * PAGE_SIZE) as u64;
        let Some(frame) = phys::allocate() else {
            free_locked(root, virt, i);
            return 0;
        };
        // SAFETY: fresh frame through the direct map.
        unsafe {
            core::ptr::write_bytes(
                crate::memory::phys_to_virt(frame.as_u64()) as *mut u8,
                0,
                PAGE_SIZE,
            );
        }
        if paging::map_page(root, addr, frame.as_u64(), page_flags(flags)).is_err() {
            phys::free(frame);
            free_locked(root, virt, i);
            return 0;
        }
    }
    virt
}

/// Undo [`allocate`]: unmap `pages` pages at `virt` and free their frames.
pub fn free(virt: u64, pages: usize) {
    let _window = VIRT_LOCK.lock();
    free_locked(active_root(), virt, pages);
}

fn free_locked(root: u64, virt: u64, pages: usize) {
    for i in 0..pages {
        if let Some(frame) = paging::unmap_page(root, virt + (i * PAGE_SIZE) as u64) {
            phys::free(x86_64::PhysAddr::new(frame));
        }
    }
}

bitflags::bitflags! {
    /// Page-fault error-code bits as delivered by the CPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultStatus: u64 {
        /// Set when the fault was a protection violation on a present page.
        const PRESENT = 1 << 0;
        /// Set for writes, clear for reads.
        const WRITE   = 1 << 1;
        /// Set when the access came from user mode.
        const USER    = 1 << 2;
        /// Set for instruction fetches.
        const FETCH   = 1 << 4;
    }
}

/// What the trap handler should do about a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultVerdict {
    /// Kill the faulting thread; the kernel carries on.
    TerminateThread,
    /// Fault in kernel mode: unrecoverable.
    Fatal,
}

/// Classify a page fault at `addr`.
///
/// The kernel does no demand paging: a user access outside its mappings
/// is a programming error and terminates the thread. A kernel-mode fault
/// means the kernel itself is broken.
pub fn page_fault(addr: u64, status: FaultStatus) -> FaultVerdict {
    if status.contains(FaultStatus::USER) {
        log::warn!(
            "page fault in tid {}: addr {:#x} ({}{}{})",
            crate::arch::x86_64::percpu::current_tid(),
            addr,
            if status.contains(FaultStatus::WRITE) { "write" } else { "read" },
            if status.contains(FaultStatus::FETCH) { ", fetch" } else { "" },
            if status.contains(FaultStatus::PRESENT) { ", protection" } else { ", not present" },
        );
        FaultVerdict::TerminateThread
    } else {
        log::error!("kernel page fault at {:#x}, status {:?}", addr, status);
        FaultVerdict::Fatal
    }
}

/// Page-fault trap entry: classify, then apply the verdict.
///
/// Called by the platform's page-fault stub with CR2 in `addr` and the
/// raw error code in `code`, IRQs masked. Never returns: a user fault
/// kills the offending thread and the CPU goes back through the
/// scheduler; a kernel fault panics.
pub extern "C" fn page_fault_trap(addr: u64, code: u64) -> ! {
    let status = FaultStatus::from_bits_truncate(code);
    match page_fault(addr, status) {
        FaultVerdict::TerminateThread => {
            let tid = crate::arch::x86_64::percpu::current_tid();
            if tid != 0 {
                let mut sched = crate::process::sched_lock();
                sched.terminate_thread(tid, -1, false);
            }
            loop {
                crate::process::schedule();
                crate::arch::x86_64::idle();
            }
        }
        FaultVerdict::Fatal => {
            panic!("unrecoverable page fault at {:#x} ({:?})", addr, status);
        }
    }
}

#[inline]
fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}
