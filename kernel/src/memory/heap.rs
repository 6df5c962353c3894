//! The kernel heap.
//!
//! Every allocation is backed by a whole number of kernel pages. A small
//! header at the base of the allocation records the requested byte size
//! and the page count; the caller receives a pointer just past it.
//! `dealloc` recovers the header by rounding the pointer down to a page
//! boundary (or back one full page when the pointer itself is aligned).
//! Coarse on purpose; small-object packing is not this allocator's job.

use crate::arch::x86_64::paging::PAGE_SIZE;
use crate::memory::{virt, KERNEL_HEAP_BASE, KERNEL_HEAP_END};
use core::alloc::{GlobalAlloc, Layout};
use core::sync::atomic::{AtomicU64, Ordering};

#[repr(C)]
struct AllocHeader {
    byte_size: usize,
    page_size: usize,
}

const HEADER_SIZE: usize = core::mem::size_of::<AllocHeader>();
static_assertions::const_assert_eq!(HEADER_SIZE, 16);

/// Search hint so repeated allocations do not rescan the whole window.
static CURSOR: AtomicU64 = AtomicU64::new(KERNEL_HEAP_BASE);

pub struct KernelHeap;

#[global_allocator]
static HEAP: KernelHeap = KernelHeap;

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Data offset within the allocation: past the header, then up to
        // the requested alignment. Alignments of a page or more push the
        // data to the second page so the header keeps a page of its own.
        let offset = if layout.align() >= PAGE_SIZE {
            PAGE_SIZE
        } else {
            layout.align().max(HEADER_SIZE)
        };
        let pages = (offset + layout.size()).div_ceil(PAGE_SIZE);

        let hint = CURSOR.load(Ordering::Relaxed);
        let mut base = virt::allocate(hint, KERNEL_HEAP_END, pages, virt::VmFlags::WRITE);
        if base == 0 && hint != KERNEL_HEAP_BASE {
            // Wrap the search once before giving up.
            base = virt::allocate(KERNEL_HEAP_BASE, KERNEL_HEAP_END, pages, virt::VmFlags::WRITE);
        }
        if base == 0 {
            return core::ptr::null_mut();
        }
        CURSOR.store(base + (pages * PAGE_SIZE) as u64, Ordering::Relaxed);

        let header = base as *mut AllocHeader;
        unsafe {
            (*header).byte_size = layout.size();
            (*header).page_size = pages;
        }
        (base as usize + offset) as *mut u8
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if ptr.is_null() {
            return;
        }
        let addr = ptr as usize;
        let base = if addr % PAGE_SIZE == 0 {
            addr - PAGE_SIZE
        } else {
            addr & !(PAGE_SIZE - 1)
        };
        let header = base as *const AllocHeader;
        let pages = unsafe { (*header).page_size };
        virt::free(base as u64, pages);
    }
}

#[alloc_error_handler]
fn alloc_error(layout: Layout) -> ! {
    panic!("kernel heap exhausted allocating {:?}", layout);
}
