//! Processes, threads, and the scheduler.

pub mod elf;
pub mod lifecycle;
pub mod process;
pub mod scheduler;
#[cfg(feature = "selftest")]
pub mod test;
pub mod thread;

pub use lifecycle::{execve_memory, exit, fork, try_wait, WaitResult};
pub use process::{IoDescriptor, IoKind, Process, MAX_IO_DESCRIPTORS};
pub use scheduler::{
    current_thread, get_thread, kernel_pid, kthread_create, lumen_pid, sched_lock, schedule,
    set_kernel_pid, set_lumen_pid, set_scheduling, ticks, timeslice, timer_tick,
    thread_use_context,
};
pub use thread::{Pid, Priority, SyncUnsafeCell, Thread, ThreadState, Tid, PRIORITY_LEVELS};
