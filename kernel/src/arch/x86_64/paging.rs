//! Four-level page-table construction and teardown.
//!
//! Every address space shares the kernel half: the 256 upper PML4 slots
//! are pre-populated at init and copied by reference into each new root,
//! so a kernel mapping made in one address space is visible in all of
//! them. The lower half belongs to exactly one process and is built from
//! 4 KiB mappings only.

use crate::memory::{self, phys};
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::PageTableFlags;
use x86_64::PhysAddr;

pub const PAGE_SIZE: usize = 4096;
const ENTRIES: usize = 512;
/// First PML4 slot belonging to the kernel half.
const KERNEL_PML4_START: usize = 256;
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

use core::sync::atomic::{AtomicU64, Ordering};

/// Root of the boot address space; template for the shared kernel half.
static KERNEL_ROOT: AtomicU64 = AtomicU64::new(0);

fn table(phys_addr: u64) -> *mut u64 {
    memory::phys_to_virt(phys_addr) as *mut u64
}

fn entry_addr(entry: u64) -> u64 {
    entry & ADDR_MASK
}

fn entry_present(entry: u64) -> bool {
    entry & PageTableFlags::PRESENT.bits() != 0
}

fn entry_huge(entry: u64) -> bool {
    entry & PageTableFlags::HUGE_PAGE.bits() != 0
}

/// Allocate one zeroed table page.
fn alloc_table() -> Option<u64> {
    let frame = phys::allocate()?;
    // SAFETY: freshly allocated frame, mapped through the direct map.
    unsafe {
        core::ptr::write_bytes(table(frame.as_u64()), 0, ENTRIES);
    }
    Some(frame.as_u64())
}

/// Capture the boot root and make sure every kernel-half PML4 slot has a
/// backing table, so later address spaces can alias them all.
pub fn init() {
    let (frame, _) = Cr3::read();
    let root = frame.start_address().as_u64();
    KERNEL_ROOT.store(root, Ordering::Release);

    let pml4 = table(root);
    for i in KERNEL_PML4_START..ENTRIES {
        // SAFETY: the boot root is live and exclusively ours this early.
        unsafe {
            if !entry_present(*pml4.add(i)) {
                let sub = alloc_table().expect("out of memory building kernel half");
                *pml4.add(i) = sub
                    | (PageTableFlags::PRESENT | PageTableFlags::WRITABLE).bits();
            }
        }
    }
}

/// Physical root of the shared kernel address space.
pub fn kernel_root() -> u64 {
    KERNEL_ROOT.load(Ordering::Acquire)
}

/// Build a fresh root whose upper half aliases the kernel and whose lower
/// half is empty. Returns the root's physical address, or `None` when out
/// of memory.
pub fn clone_kernel_space() -> Option<u64> {
    let root = alloc_table()?;
    let src = table(kernel_root());
    let dst = table(root);
    // SAFETY: both tables are valid; the kernel half of the template is
    // immutable at the PML4 level after init().
    unsafe {
        for i in KERNEL_PML4_START..ENTRIES {
            *dst.add(i) = *src.add(i);
        }
    }
    Some(root)
}

/// Map one 4 KiB page in the given root, allocating intermediate tables
/// as needed. Intermediate entries carry USER and WRITABLE so the leaf
/// flags alone decide access.
pub fn map_page(root: u64, virt: u64, frame: u64, flags: PageTableFlags) -> Result<(), ()> {
    let mut current = root;
    for level in (2..=4).rev() {
        let index = ((virt >> (3 + 9 * level)) & 0x1FF) as usize;
        let tbl = table(current);
        // SAFETY: `current` always names a live table page.
        unsafe {
            let entry = *tbl.add(index);
            if entry_present(entry) {
                current = entry_addr(entry);
            } else {
                let sub = alloc_table().ok_or(())?;
                *tbl.add(index) = sub
                    | (PageTableFlags::PRESENT
                        | PageTableFlags::WRITABLE
                        | PageTableFlags::USER_ACCESSIBLE)
                        .bits();
                current = sub;
            }
        }
    }

    let index = ((virt >> 12) & 0x1FF) as usize;
    // SAFETY: `current` is the level-1 table for `virt`.
    unsafe {
        *table(current).add(index) = (frame & ADDR_MASK) | flags.bits();
    }
    Ok(())
}

/// Remove a 4 KiB mapping; returns the frame it pointed at.
pub fn unmap_page(root: u64, virt: u64) -> Option<u64> {
    let mut current = root;
    for level in (2..=4).rev() {
        let index = ((virt >> (3 + 9 * level)) & 0x1FF) as usize;
        // SAFETY: walking live tables.
        let entry = unsafe { *table(current).add(index) };
        if !entry_present(entry) {
            return None;
        }
        current = entry_addr(entry);
    }

    let index = ((virt >> 12) & 0x1FF) as usize;
    // SAFETY: level-1 table for `virt`.
    unsafe {
        let slot = table(current).add(index);
        let entry = *slot;
        if !entry_present(entry) {
            return None;
        }
        *slot = 0;
        x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt));
        Some(entry_addr(entry))
    }
}

/// Translate a virtual address in the given root.
pub fn translate(root: u64, virt: u64) -> Option<(u64, PageTableFlags)> {
    let mut current = root;
    for level in (2..=4).rev() {
        let index = ((virt >> (3 + 9 * level)) & 0x1FF) as usize;
        // SAFETY: walking live tables.
        let entry = unsafe { *table(current).add(index) };
        if !entry_present(entry) {
            return None;
        }
        if entry_huge(entry) {
            // Kernel direct-map regions may use large pages; report the
            // containing frame.
            let flags = PageTableFlags::from_bits_truncate(entry);
            return Some((entry_addr(entry), flags));
        }
        current = entry_addr(entry);
    }

    let index = ((virt >> 12) & 0x1FF) as usize;
    // SAFETY: level-1 table for `virt`.
    let entry = unsafe { *table(current).add(index) };
    if !entry_present(entry) {
        return None;
    }
    Some((entry_addr(entry), PageTableFlags::from_bits_truncate(entry)))
}

/// Translate in the address space that is currently active.
pub fn translate_active(virt: u64) -> Option<(u64, PageTableFlags)> {
    let (frame, _) = Cr3::read();
    translate(frame.start_address().as_u64(), virt)
}

// Deep copy of the user half: bounded-depth recursive walk, no heap
// allocation, only frame allocations for the copied pages and tables.

fn clone_level(dst_table_phys: u64, src_table_phys: u64, level: u8) -> Result<(), ()> {
    let limit = if level == 4 { KERNEL_PML4_START } else { ENTRIES };
    let src = table(src_table_phys);
    let dst = table(dst_table_phys);

    for i in 0..limit {
        // SAFETY: both tables are live; the source space is quiescent
        // (its only thread is trapped in the kernel).
        let entry = unsafe { *src.add(i) };
        if !entry_present(entry) {
            continue;
        }
        let flag_bits = entry & !ADDR_MASK;

        if level == 1 {
            let frame = phys::allocate().ok_or(())?;
            // SAFETY: fresh frame and a mapped source frame, both through
            // the direct map.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    memory::phys_to_virt(entry_addr(entry)) as *const u8,
                    memory::phys_to_virt(frame.as_u64()) as *mut u8,
                    PAGE_SIZE,
                );
                *dst.add(i) = frame.as_u64() | flag_bits;
            }
        } else {
            let sub = alloc_table().ok_or(())?;
            // SAFETY: dst is a live table page.
            unsafe {
                *dst.add(i) = sub | flag_bits;
            }
            clone_level(sub, entry_addr(entry), level - 1)?;
        }
    }
    Ok(())
}

/// Deep-copy the user half of `src_root` into `dst_root`.
///
/// Every mapped user page gets a private copy; the child and parent never
/// share a writable frame.
pub fn clone_user_space(dst_root: u64, src_root: u64) -> Result<(), ()> {
    clone_level(dst_root, src_root, 4)
}

fn free_level(table_phys: u64, level: u8) {
    let limit = if level == 4 { KERNEL_PML4_START } else { ENTRIES };
    let tbl = table(table_phys);

    for i in 0..limit {
        // SAFETY: table pages stay live until freed below.
        let entry = unsafe { *tbl.add(i) };
        if !entry_present(entry) {
            continue;
        }
        if level == 1 {
            phys::free(PhysAddr::new(entry_addr(entry)));
        } else {
            free_level(entry_addr(entry), level - 1);
        }
        // SAFETY: clearing an entry in a live table.
        unsafe {
            *tbl.add(i) = 0;
        }
    }

    if level < 4 {
        phys::free(PhysAddr::new(table_phys));
    }
}

/// Free every user page and every user table page under `root`, then the
/// root itself. The kernel half is shared and untouched.
pub fn free_user_space(root: u64) {
    free_level(root, 4);
    phys::free(PhysAddr::new(root));
}
