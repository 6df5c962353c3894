//! Thread objects.
//!
//! A [`Thread`] lives in the scheduler's thread table for its whole life;
//! everything else refers to it by TID. Fields that the scheduler mutates
//! in place sit in [`SyncUnsafeCell`]s and are only touched under the
//! scheduler lock (or, for the context, from the trap path of the thread
//! itself).

use crate::arch::x86_64::context::Context;
use crate::ipc::signal::SignalState;
use crate::syscall::request::SyscallRequest;
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU64};

/// Process identifier. The main thread of a process has `tid == pid`.
pub type Pid = u32;
/// Thread identifier.
pub type Tid = u32;

/// UnsafeCell that may sit in a Sync structure; all access is serialized
/// externally by the scheduler lock.
pub struct SyncUnsafeCell<T> {
    inner: UnsafeCell<T>,
}

unsafe impl<T> Sync for SyncUnsafeCell<T> {}

impl<T> SyncUnsafeCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: UnsafeCell::new(value),
        }
    }

    pub fn get(&self) -> *mut T {
        self.inner.get()
    }
}

/// The thread state machine.
///
/// Queued ⇄ Running, Running → Blocked (syscall issued), Blocked → Queued
/// (syscall completed), Running → Sleeping (deadline wait), any → Zombie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Runnable, waiting for a CPU. A thread is linked in a ready queue
    /// iff it is in this state.
    Queued,
    /// Dispatched on some CPU.
    Running,
    /// Suspended awaiting syscall completion or an IPC reply.
    Blocked,
    /// Suspended until a deadline.
    Sleeping,
    /// Exited; kept in the table until the parent reaps it.
    Zombie,
}

/// Scheduling priority. Selection is highest-first, round-robin within a
/// level; timeslices shrink as priority rises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Normal = 0,
    High = 1,
    Highest = 2,
}

pub const PRIORITY_LEVELS: usize = 3;

impl Priority {
    pub fn index(self) -> usize {
        self as usize
    }
}

pub struct Thread {
    pub tid: Tid,
    /// Owning process.
    pub pid: Pid,
    pub priority: Priority,
    pub state: SyncUnsafeCell<ThreadState>,
    /// Remaining timeslice in timer ticks.
    pub time: AtomicU64,
    /// Platform context blob (registers, address-space root, I/O bitmap).
    pub context: SyncUnsafeCell<Box<Context>>,
    /// Highest user address in use; heap and exec layout grow above it.
    pub highest: AtomicU64,
    /// The thread's single in-flight syscall slot.
    pub syscall: SyncUnsafeCell<SyscallRequest>,
    /// Signal mask, pending set, and handler table.
    pub signals: SyncUnsafeCell<SignalState>,
    /// User address of the signal-return trampoline, 0 until exec.
    pub signal_trampoline: AtomicU64,
    /// True while executing inside a user signal handler.
    pub handling_signal: AtomicBool,
    /// Register file saved when diverting into a signal handler.
    pub signal_saved: SyncUnsafeCell<Option<crate::arch::x86_64::context::RegisterFile>>,
    pub exit_status: AtomicI64,
    /// True when the thread exited voluntarily rather than being killed.
    pub normal_exit: AtomicBool,
}

impl Thread {
    pub fn new(tid: Tid, pid: Pid, priority: Priority) -> Arc<Thread> {
        Arc::new(Thread {
            tid,
            pid,
            priority,
            state: SyncUnsafeCell::new(ThreadState::Queued),
            time: AtomicU64::new(0),
            context: SyncUnsafeCell::new(Context::zeroed()),
            highest: AtomicU64::new(0),
            syscall: SyncUnsafeCell::new(SyscallRequest::idle(tid)),
            signals: SyncUnsafeCell::new(SignalState::new()),
            signal_trampoline: AtomicU64::new(0),
            handling_signal: AtomicBool::new(false),
            signal_saved: SyncUnsafeCell::new(None),
            exit_status: AtomicI64::new(0),
            normal_exit: AtomicBool::new(false),
        })
    }
}
