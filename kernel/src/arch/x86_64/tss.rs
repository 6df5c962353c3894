//! Per-CPU task-state segments with I/O-port bitmaps.
//!
//! The TSS proper is followed in memory by an 8 KiB permission bitmap plus
//! the mandatory trailing 0xFF byte. A set bit denies access to the port.
//! Threads start with every port denied; a thread granted ports carries its
//! own bitmap inside its context, and the context switch copies it here
//! when either the incoming or the outgoing thread deviated from the
//! default.
//!
//! Loading TR and publishing these blocks in the GDT is part of the
//! platform bring-up contract.

use super::percpu::{self, MAX_CPUS};
use core::sync::atomic::Ordering;

/// Bytes in an I/O permission bitmap (65536 ports, one bit each).
pub const IO_BITMAP_SIZE: usize = 8192;

/// TSS image plus bitmap, laid out the way the CPU walks it.
#[repr(C, packed)]
pub struct TssBlock {
    reserved0: u32,
    /// Stack pointers loaded on privilege transitions; rsp0 is the kernel
    /// stack used when a user thread traps.
    pub rsp: [u64; 3],
    reserved1: u64,
    pub ist: [u64; 7],
    reserved2: u64,
    reserved3: u16,
    /// Offset from the TSS base to `io_bitmap`.
    pub iomap_base: u16,
    pub io_bitmap: [u8; IO_BITMAP_SIZE],
    /// Required terminator; must stay 0xFF.
    terminator: u8,
}

const IOMAP_OFFSET: u16 = 104;

impl TssBlock {
    const fn new() -> Self {
        TssBlock {
            reserved0: 0,
            rsp: [0; 3],
            reserved1: 0,
            ist: [0; 7],
            reserved2: 0,
            reserved3: 0,
            iomap_base: IOMAP_OFFSET,
            io_bitmap: [0xFF; IO_BITMAP_SIZE],
            terminator: 0xFF,
        }
    }
}

static mut TSS_BLOCKS: [TssBlock; MAX_CPUS] = [const { TssBlock::new() }; MAX_CPUS];

/// Copy a thread's I/O permission bitmap into the calling CPU's TSS.
///
/// `default` threads get the all-denied bitmap; the copy is skipped when
/// the TSS already holds the default and the incoming thread is default
/// too (tracked via the per-CPU dirty flag).
pub fn load_io_bitmap(bitmap: &[u8; IO_BITMAP_SIZE], default: bool) {
    let cpu = percpu::current_cpu();
    let dirty = cpu.io_bitmap_dirty.load(Ordering::Acquire);
    if default && !dirty {
        return;
    }

    let index = cpu.cpu_index.load(Ordering::Acquire) as usize;
    // SAFETY: each CPU only ever writes its own TSS block, and the timer
    // cannot interrupt a context switch (IRQs are off on that path).
    unsafe {
        let block = &raw mut TSS_BLOCKS[index];
        if default {
            (*block).io_bitmap.fill(0xFF);
        } else {
            (*block).io_bitmap.copy_from_slice(bitmap);
        }
    }
    cpu.io_bitmap_dirty.store(!default, Ordering::Release);
}

/// Set the kernel stack used when a user thread on this CPU traps.
pub fn set_kernel_stack(rsp0: u64) {
    let index = percpu::current_cpu().cpu_index.load(Ordering::Acquire) as usize;
    // SAFETY: per-CPU block, IRQs off on every caller path.
    unsafe {
        (*(&raw mut TSS_BLOCKS[index])).rsp[0] = rsp0;
    }
}
