//! Signal delivery.
//!
//! Signals are delivered only at syscall boundaries: the worker calls
//! [`signal_handle`] before dispatching a dequeued request. Delivery
//! either applies the default disposition (terminate), drops an ignored
//! signal, or reroutes the thread into its user handler: the saved
//! context is stashed, the handler address becomes the new instruction
//! pointer with the trampoline as its return address, and the thread
//! goes back to Queued so the interrupted syscall retries after the
//! handler returns through sigreturn.

use crate::process::sched_lock;
use crate::process::thread::{Pid, Thread, ThreadState};
use crate::syscall::errno::Errno;
use crate::syscall::request::SyscallRequest;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

/// Number of signals tracked.
pub const NSIG: usize = 32;

pub const SIGKILL: u32 = 9;
pub const SIGTERM: u32 = 15;

/// Per-signal disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigAction {
    Default,
    Ignore,
    Handler(u64),
}

/// Per-thread signal bookkeeping, guarded by the scheduler lock.
#[derive(Clone)]
pub struct SignalState {
    /// Blocked-signal bitmask.
    pub mask: u64,
    /// Delivery queue, FIFO.
    pub pending: VecDeque<u32>,
    pub actions: [SigAction; NSIG],
}

impl SignalState {
    pub fn new() -> Self {
        SignalState {
            mask: 0,
            pending: VecDeque::new(),
            actions: [SigAction::Default; NSIG],
        }
    }
}

/// Queue a signal for the main thread of `pid` and kick its syscall so
/// delivery happens promptly.
pub fn send_signal(pid: Pid, signum: u32) -> Result<u64, Errno> {
    if signum == 0 || signum as usize >= NSIG {
        return Err(Errno::InvalidArgument);
    }

    let mut sched = sched_lock();
    let thread = sched.threads.get(&pid).cloned().ok_or(Errno::NoSuchProcess)?;

    // SAFETY: scheduler lock held.
    let state = unsafe { *thread.state.get() };
    unsafe {
        (*thread.signals.get()).pending.push_back(signum);
    }

    match state {
        ThreadState::Sleeping => {
            // Cut the sleep short; the wake path re-checks signals.
            sched.unblock(thread.tid);
        }
        ThreadState::Blocked => {
            // SAFETY: scheduler lock held.
            let (queued, busy) = unsafe {
                let req = &*thread.syscall.get();
                (req.queued, req.busy)
            };
            if !queued && !busy {
                // Parked on an external completion: push it through the
                // queue so the worker runs signal_handle soon.
                crate::syscall::queue::enqueue_locked(&mut sched, thread.tid);
            }
        }
        _ => {}
    }
    Ok(0)
}

/// Deliver one pending unmasked signal, if any. Called by the syscall
/// worker with no locks held, before dispatching the thread's request.
pub fn signal_handle(thread: &Arc<Thread>) {
    let mut sched = sched_lock();

    // SAFETY: scheduler lock held for all slot/state access below.
    unsafe {
        let signals = &mut *thread.signals.get();
        let mask = signals.mask;
        let Some(pos) = signals
            .pending
            .iter()
            .position(|&s| s == SIGKILL || mask & (1 << s) == 0)
        else {
            return;
        };
        let signum = signals.pending.remove(pos).unwrap();
        let action = signals.actions[signum as usize];

        match (signum, action) {
            (SIGKILL, _) | (_, SigAction::Default) => {
                sched.terminate_thread(thread.tid, signum as i64, false);
            }
            (_, SigAction::Ignore) => {}
            (_, SigAction::Handler(entry)) => {
                let trampoline = thread.signal_trampoline.load(Ordering::Acquire);
                if trampoline == 0 {
                    // No trampoline installed (kernel thread): fall back
                    // to the default disposition.
                    sched.terminate_thread(thread.tid, signum as i64, false);
                    return;
                }

                // Stash the interrupted state and retarget the saved
                // context at the handler. The handler returns through the
                // trampoline, which issues sigreturn. The stashed RIP is
                // rewound past the 2-byte trap instruction so the
                // interrupted syscall re-executes once the handler is
                // done (the marked-for-retry queue entry is dropped when
                // a worker finds the thread no longer blocked).
                let ctx = &mut **thread.context.get();
                let mut saved = ctx.regs;
                saved.rip -= 2;
                *thread.signal_saved.get() = Some(saved);
                thread.handling_signal.store(true, Ordering::Release);

                ctx.regs.rip = entry;
                ctx.regs.rdi = signum as u64;
                // Push the trampoline as the handler's return address;
                // the write needs the thread's address space active.
                crate::arch::x86_64::context::use_context(ctx);
                ctx.regs.rsp -= 8;
                core::ptr::write(ctx.regs.rsp as *mut u64, trampoline);

                // Retry the interrupted syscall after the handler.
                let req = &mut *thread.syscall.get();
                req.retry = true;
                *thread.state.get() = ThreadState::Queued;
                thread
                    .time
                    .store(crate::process::timeslice(thread.priority), Ordering::Release);
                sched.enqueue(thread);
            }
        }
    }
}

/// Restore the pre-signal context; the syscall return value is the
/// restored RAX so the queue's writeback does not clobber it.
pub fn sigreturn(thread: &Arc<Thread>, req: &mut SyscallRequest) {
    let sched = sched_lock();
    let _ = &sched;

    // SAFETY: scheduler lock held.
    unsafe {
        if let Some(saved) = (*thread.signal_saved.get()).take() {
            let ctx = &mut **thread.context.get();
            ctx.regs = saved;
            req.ret = saved.rax;
        } else {
            req.ret = Errno::InvalidArgument.to_ret();
        }
    }
    thread.handling_signal.store(false, Ordering::Release);
    req.unblock = true;
}

/// Install a handler. `handler` of 0 selects the default, 1 ignore.
pub fn sigaction(thread: &Arc<Thread>, signum: u32, handler: u64) -> Result<u64, Errno> {
    if signum == 0 || signum as usize >= NSIG || signum == SIGKILL {
        return Err(Errno::InvalidArgument);
    }
    let sched = sched_lock();
    let _ = &sched;
    // SAFETY: scheduler lock held.
    unsafe {
        let signals = &mut *thread.signals.get();
        signals.actions[signum as usize] = match handler {
            0 => SigAction::Default,
            1 => SigAction::Ignore,
            addr => SigAction::Handler(addr),
        };
    }
    Ok(0)
}

/// Replace the blocked-signal mask, returning the previous one.
pub fn set_mask(thread: &Arc<Thread>, mask: u64) -> u64 {
    let sched = sched_lock();
    let _ = &sched;
    // SAFETY: scheduler lock held.
    unsafe {
        let signals = &mut *thread.signals.get();
        let old = signals.mask;
        // SIGKILL cannot be masked.
        signals.mask = mask & !(1 << SIGKILL);
        old
    }
}
