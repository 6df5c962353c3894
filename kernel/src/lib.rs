//! Lucerne-OS Kernel
//!
//! A minimal microkernel handling:
//! - Scheduling and the thread state machine
//! - Local-socket IPC
//! - Memory primitives
//! - Syscall queueing and dispatch
//!
//! File systems, networking, drivers, and policy run in user space; the
//! lumen router started from the ramdisk brokers all of it over the
//! kernel's server socket.

#![no_std]
#![no_main]
#![feature(alloc_error_handler)]

extern crate alloc;

pub mod arch;
pub mod boot;
pub mod ipc;
pub mod memory;
pub mod panic;
pub mod process;
pub mod server;
pub mod sync;
pub mod syscall;

// kmain (the Limine entry point) lives in boot::limine.
pub use boot::limine::kmain;

use boot::entry::{KernelArgs, MemoryRegion};
use core::sync::atomic::{AtomicU64, Ordering};

/// Iterations of the worker/idle loops between forced halts; derived
/// from the CPU count at boot.
static IDLE_THRESHOLD: AtomicU64 = AtomicU64::new(8);

fn idle_threshold() -> u64 {
    IDLE_THRESHOLD.load(Ordering::Acquire)
}

/// Kernel panic handler.
#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo) -> ! {
    panic::panic_handler(info)
}

/// Main kernel initialization, called by the boot protocol entry.
///
/// # Safety
///
/// `args` must point to a fully populated hand-off structure whose
/// memory map and ramdisk module stay mapped.
pub unsafe fn kernel_main(args: *const KernelArgs) -> ! {
    // ===========================================
    // Phase 1: console and logging
    // ===========================================
    boot::logger::init();

    kprintln!("");
    kprintln!("lucerne kernel v{}", env!("CARGO_PKG_VERSION"));
    kprintln!("");

    if args.is_null() {
        kprintln!("[CRIT] no KernelArgs provided, halting");
        arch::x86_64::halt_forever();
    }
    let args = &*args;

    // ===========================================
    // Phase 2: memory
    // ===========================================
    memory::set_hhdm_offset(args.hhdm_offset);
    log::info!("hhdm offset {:#x}", args.hhdm_offset);

    let mmap_ptr = args.memory_map_base as *const MemoryRegion;
    let mmap_len = args.memory_map_size as usize / core::mem::size_of::<MemoryRegion>();
    let mmap = core::slice::from_raw_parts(mmap_ptr, mmap_len);
    memory::init(mmap);
    log::info!("memory manager ready");

    // ===========================================
    // Phase 3: per-CPU state and the ramdisk
    // ===========================================
    arch::x86_64::percpu::init_cpu(0);
    arch::x86_64::percpu::set_cpu_count(args.cpu_count as usize);
    boot::ramdisk::init(args.ramdisk_base, args.ramdisk_size);

    // Each CPU gets one trap stack: the syscall path never returns to
    // the interrupted frame, so a single stack per CPU is enough.
    let trap_stack = memory::virt::allocate(
        memory::KERNEL_HEAP_BASE,
        memory::KERNEL_HEAP_END,
        8,
        memory::virt::VmFlags::WRITE,
    );
    if trap_stack == 0 {
        log::error!("failed to allocate the trap stack");
        arch::x86_64::halt_forever();
    }
    arch::x86_64::tss::set_kernel_stack(trap_stack + 8 * 4096);

    // ===========================================
    // Phase 4: sockets and the scheduler
    // ===========================================
    ipc::socket_init();

    let cpus = (args.cpu_count as usize).max(1);
    let threshold = if cpus > 16 {
        2
    } else if cpus > 8 {
        4
    } else {
        8
    };
    IDLE_THRESHOLD.store(threshold, Ordering::Release);
    log::info!("{} cpu(s), idle threshold {}", cpus, threshold);

    // One kernel worker plus one idle thread per CPU.
    if let Err(e) = process::kthread_create(kernel_thread, 0, "kernel") {
        log::error!("failed to create the kernel thread: {}", e);
        arch::x86_64::halt_forever();
    }
    for i in 0..cpus {
        if let Err(e) = process::kthread_create(idle_thread, i as u64, "idle") {
            log::error!("failed to create idle thread {}: {}", i, e);
        }
    }

    #[cfg(feature = "selftest")]
    {
        ipc::test::create_ipc_test_tasks();
        process::test::create_sched_test_task();
        syscall::test::create_syscall_test_task();
        server::test::create_server_test_task();
    }

    // ===========================================
    // Phase 5: go
    // ===========================================
    process::set_scheduling(true);
    log::info!("scheduler enabled");

    // The bootstrap context is done; the scheduler takes the CPU from
    // here (schedule() does not return once it finds a thread).
    loop {
        process::schedule();
        arch::x86_64::idle();
    }
}

/// The kernel worker: brings up the server socket, launches lumen, then
/// pumps server replies and the syscall queue forever.
extern "C" fn kernel_thread(_arg: u64) -> ! {
    sync::set_local_sched(false);
    process::set_scheduling(false);

    let pid = arch::x86_64::percpu::current_pid();
    process::set_kernel_pid(pid);

    server::server_init();

    log::debug!("attempting to load lumen from the ramdisk...");
    let size = boot::ramdisk::file_size("lumen");
    if size <= 9 {
        log::error!("lumen not present on the ramdisk, halting because there's nothing to do");
        arch::x86_64::halt_forever();
    }

    let mut image = alloc::vec![0u8; size as usize];
    if boot::ramdisk::read("lumen", &mut image) != size {
        log::error!("failed to read lumen into memory, halting because there's nothing to do");
        arch::x86_64::halt_forever();
    }

    match process::execve_memory(&image, &["lumen"], &[]) {
        Ok(lumen) => {
            process::set_lumen_pid(lumen);
            log::info!("lumen started as pid {}", lumen);
        }
        Err(e) => {
            log::error!("failed to start lumen ({}), halting because there's nothing to do", e);
            arch::x86_64::halt_forever();
        }
    }
    drop(image);

    let mut status = memory::phys::PhysMemoryStatus::default();
    memory::phys::status(&mut status);
    log::debug!(
        "early boot complete, memory usage: {} MiB / {} MiB",
        status.used_pages >> 8,
        status.usable_pages >> 8
    );

    sync::set_local_sched(true);
    process::set_scheduling(true);

    let threshold = idle_threshold();
    let mut count = 0u64;
    loop {
        server::server_idle();
        if syscall::syscall_process() == 0 {
            arch::x86_64::idle();
        }
        count += 1;
        if count >= threshold {
            count = 0;
            arch::x86_64::idle();
        }
    }
}

/// Idle threads drain the syscall queue; an empty queue halts the CPU
/// until the next interrupt.
extern "C" fn idle_thread(_arg: u64) -> ! {
    let threshold = idle_threshold();
    let mut count = 0u64;
    loop {
        if syscall::syscall_process() == 0 {
            arch::x86_64::idle();
        }
        count += 1;
        if count >= threshold {
            count = 0;
            arch::x86_64::idle();
        }
    }
}
