//! The global syscall FIFO and the worker drain loop.
//!
//! Queued requests are TIDs on a single FIFO protected by the scheduler
//! lock; the request body lives in the thread's embedded slot. Kernel
//! worker threads call [`syscall_process`] in a loop: dequeue, validate,
//! deliver signals, switch into the requester's address space, run the
//! handler, and wake the thread when the result is final.

use super::dispatcher::dispatch_slot;
use super::numbers::MAX_SYSCALL;
use crate::ipc::signal;
use crate::process::scheduler::{self, sched_lock, Scheduler};
use crate::process::thread::{Thread, ThreadState, Tid};
use crate::sync::set_local_sched;
use alloc::sync::Arc;

/// Append a request to the FIFO. The slot transitions to queued (not
/// busy, not unblocked).
pub fn enqueue_locked(sched: &mut Scheduler, tid: Tid) {
    let Some(thread) = sched.threads.get(&tid).cloned() else {
        return;
    };
    // SAFETY: scheduler lock held.
    unsafe {
        let req = &mut *thread.syscall.get();
        req.queued = true;
        req.busy = false;
        req.unblock = false;
    }
    sched.syscall_queue.push_back(tid);
}

/// Take the scheduler lock and enqueue.
pub fn syscall_enqueue(tid: Tid) {
    let mut sched = sched_lock();
    enqueue_locked(&mut sched, tid);
}

/// Pop the head of the FIFO and mark it busy. Entries whose thread has
/// disappeared are discarded.
pub fn syscall_dequeue() -> Option<Arc<Thread>> {
    let mut sched = sched_lock();
    while let Some(tid) = sched.syscall_queue.pop_front() {
        if let Some(thread) = sched.threads.get(&tid).cloned() {
            // SAFETY: scheduler lock held.
            unsafe {
                let req = &mut *thread.syscall.get();
                req.busy = true;
                req.queued = false;
            }
            return Some(thread);
        }
    }
    None
}

/// Service one queued request. Returns 0 when the queue was empty so the
/// caller can idle the CPU.
pub fn syscall_process() -> i32 {
    {
        let sched = sched_lock();
        if sched.syscall_queue.is_empty() {
            return 0;
        }
    }

    let Some(thread) = syscall_dequeue() else {
        return 0;
    };

    // A thread that stopped being blocked while queued (killed, or
    // rerouted by a signal) abandoned this request: drop it.
    // SAFETY: the busy flag gives this worker sole ownership of the slot.
    let (function, tid) = unsafe {
        let req = &*thread.syscall.get();
        (req.function, req.tid)
    };
    {
        let sched = sched_lock();
        let _ = &sched;
        // SAFETY: scheduler lock held.
        if unsafe { *thread.state.get() } != ThreadState::Blocked {
            unsafe {
                (*thread.syscall.get()).busy = false;
            }
            return 0;
        }
    }

    set_local_sched(false);

    if function > MAX_SYSCALL || dispatch_slot(function).is_none() {
        log::warn!(
            "undefined syscall request {} from tid {}, killing thread",
            function,
            tid
        );
        let mut sched = sched_lock();
        sched.terminate_thread(tid, -1, false);
        set_local_sched(true);
        return 1;
    }

    // Deliver pending signals first; they may kill the thread or reroute
    // it into a handler (in which case the request retries afterwards).
    signal::signal_handle(&thread);

    // SAFETY: scheduler lock held for the state read.
    let state = {
        let _sched = sched_lock();
        unsafe { *thread.state.get() }
    };
    match state {
        ThreadState::Zombie => {
            set_local_sched(true);
            return 1;
        }
        ThreadState::Queued => {
            // Signal rerouted the thread; run the syscall again after the
            // handler returns.
            syscall_enqueue(tid);
            set_local_sched(true);
            return 1;
        }
        ThreadState::Blocked => {
            // Enter the requester's address space and dispatch.
            if scheduler::thread_use_context(tid).is_ok() {
                let handler = dispatch_slot(function).unwrap();
                // SAFETY: busy flag; only this worker touches the slot.
                let req = unsafe { &mut *thread.syscall.get() };
                handler(req);
                let ret = req.ret;
                let sched = sched_lock();
                let _ = &sched;
                // SAFETY: scheduler lock held; thread is not running.
                unsafe {
                    crate::arch::x86_64::context::set_context_return(
                        &mut **thread.context.get(),
                        ret,
                    );
                }
            }
        }
        _ => {}
    }

    finish_request(&thread);
    set_local_sched(true);
    1
}

/// Resolve the request after its handler ran: wake the thread when the
/// result is final, re-enqueue when the handler asked to retry, or leave
/// it blocked awaiting an external completion.
pub fn finish_request(thread: &Arc<Thread>) {
    let mut sched = sched_lock();
    // SAFETY: scheduler lock held.
    unsafe {
        let req = &mut *thread.syscall.get();
        if *thread.state.get() == ThreadState::Blocked && req.unblock {
            req.busy = false;
            sched.unblock(thread.tid);
        } else if *thread.state.get() == ThreadState::Blocked && req.retry && !req.queued {
            // The handler asked to be run again (would-block paths).
            req.retry = false;
            enqueue_locked(&mut sched, thread.tid);
        } else {
            // Sleeping, zombie, or waiting on a server reply.
            req.busy = false;
        }
    }
}
