// Memory management: physical frames, virtual windows, kernel heap.

pub mod heap;
pub mod phys;
pub mod userslice;
pub mod virt;

use crate::boot::entry::MemoryRegion;
use core::sync::atomic::{AtomicU64, Ordering};

/// First address past user space; the kernel half starts here (in
/// canonical form) and is identical in every address-space root.
pub const USER_LIMIT: u64 = 0x0000_8000_0000_0000;

/// Kernel heap window, shared by all address spaces.
pub const KERNEL_HEAP_BASE: u64 = 0xFFFF_A000_0000_0000;
pub const KERNEL_HEAP_END: u64 = 0xFFFF_A010_0000_0000;

/// Higher-half direct map offset, set once from the boot hand-off.
static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

pub fn set_hhdm_offset(offset: u64) {
    HHDM_OFFSET.store(offset, Ordering::Relaxed);
}

/// Physical to direct-mapped virtual.
#[inline]
pub fn phys_to_virt(phys: u64) -> u64 {
    phys.wrapping_add(HHDM_OFFSET.load(Ordering::Relaxed))
}

/// Direct-mapped virtual back to physical.
#[inline]
pub fn virt_to_phys(virt: u64) -> u64 {
    virt.wrapping_sub(HHDM_OFFSET.load(Ordering::Relaxed))
}

/// Bring up physical memory and the shared kernel page-table half.
pub fn init(memory_map: &[MemoryRegion]) {
    phys::init(memory_map);
    crate::arch::x86_64::paging::init();
}

pub use userslice::{read_user_str, UserSliceRead, UserSliceWrite};
