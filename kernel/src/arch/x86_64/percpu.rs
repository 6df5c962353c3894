//! Per-CPU kernel state.
//!
//! Each CPU owns one [`KernelCpuInfo`] slot: the thread and process it is
//! currently dispatching, its preemption depth, and whether the task-state
//! segment currently carries a non-default I/O-port bitmap. The slot index
//! is published through `IA32_GS_BASE` during bring-up so that trap paths
//! can find their CPU without a table scan.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use x86_64::registers::model_specific::GsBase;
use x86_64::VirtAddr;

/// Upper bound on supported CPUs.
pub const MAX_CPUS: usize = 32;

/// Per-CPU bookkeeping. All fields are only mutated from the owning CPU or
/// under the scheduler lock.
#[repr(C)]
pub struct KernelCpuInfo {
    /// Index of this slot, also the CPU number used by the scheduler.
    pub cpu_index: AtomicU32,
    /// TID currently dispatched on this CPU, 0 when idle.
    pub current_tid: AtomicU32,
    /// PID owning `current_tid`, 0 when idle.
    pub current_pid: AtomicU32,
    /// Preemption-disable depth; the timer tick is a no-op while > 0.
    pub preempt_depth: AtomicU32,
    /// True while the TSS holds a thread-specific I/O-port bitmap, so the
    /// next switch must refresh it even for a default-permission thread.
    pub io_bitmap_dirty: AtomicBool,
    present: AtomicBool,
}

impl KernelCpuInfo {
    const fn new() -> Self {
        KernelCpuInfo {
            cpu_index: AtomicU32::new(0),
            current_tid: AtomicU32::new(0),
            current_pid: AtomicU32::new(0),
            preempt_depth: AtomicU32::new(0),
            io_bitmap_dirty: AtomicBool::new(false),
            present: AtomicBool::new(false),
        }
    }
}

static CPUS: [KernelCpuInfo; MAX_CPUS] = [const { KernelCpuInfo::new() }; MAX_CPUS];
static CPU_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Register the calling CPU and point its GS base at the slot.
///
/// Called once per CPU during bring-up, before scheduling is enabled.
pub fn init_cpu(index: usize) {
    let cpu = &CPUS[index];
    cpu.cpu_index.store(index as u32, Ordering::Release);
    cpu.present.store(true, Ordering::Release);
    CPU_COUNT.fetch_add(1, Ordering::AcqRel);
    GsBase::write(VirtAddr::new(cpu as *const KernelCpuInfo as u64));
}

/// Record the total CPU count reported by the boot protocol.
pub fn set_cpu_count(count: usize) {
    CPU_COUNT.store(count.clamp(1, MAX_CPUS), Ordering::Release);
}

/// Number of CPUs known to the kernel.
pub fn cpu_count() -> usize {
    CPU_COUNT.load(Ordering::Acquire).max(1)
}

/// The calling CPU's slot.
pub fn current_cpu() -> &'static KernelCpuInfo {
    let base = GsBase::read().as_u64();
    if base == 0 {
        // Pre-init fallback: the boot CPU before init_cpu() ran.
        return &CPUS[0];
    }
    // SAFETY: GS base is only ever written by init_cpu() with a pointer
    // into the static CPUS array.
    unsafe { &*(base as *const KernelCpuInfo) }
}

/// Slot for an arbitrary CPU index (scheduler use, under its lock).
pub fn cpu_info(index: usize) -> Option<&'static KernelCpuInfo> {
    CPUS.get(index)
}

/// TID dispatched on the calling CPU, 0 if idle.
pub fn current_tid() -> u32 {
    current_cpu().current_tid.load(Ordering::Acquire)
}

/// PID dispatched on the calling CPU, 0 if idle.
pub fn current_pid() -> u32 {
    current_cpu().current_pid.load(Ordering::Acquire)
}

/// Raise the preemption depth on the calling CPU.
pub fn preempt_disable() {
    current_cpu().preempt_depth.fetch_add(1, Ordering::AcqRel);
}

/// Lower the preemption depth; returns true when it reaches zero.
pub fn preempt_enable() -> bool {
    let cpu = current_cpu();
    let prev = cpu.preempt_depth.load(Ordering::Acquire);
    if prev == 0 {
        return true;
    }
    cpu.preempt_depth.fetch_sub(1, Ordering::AcqRel) == 1
}

/// True when the timer tick may switch tasks on the calling CPU.
pub fn preemptible() -> bool {
    current_cpu().preempt_depth.load(Ordering::Acquire) == 0
}
