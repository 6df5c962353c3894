//! Trap-entry classification and the dispatch table.
//!
//! A user trap lands in [`syscall_handle`], which saves the context,
//! materialises the thread's request slot, and splits by function
//! number: socket operations, read/write, and lseek run inline on the
//! calling CPU (the fast path); everything else joins the global FIFO
//! for a kernel worker. Either way the trap never returns; the CPU goes
//! back through the scheduler.

use super::numbers::*;
use super::request::{SyscallHandler, SyscallRequest};
use super::{fs_calls, ipc_calls, proc_calls};
use crate::arch::x86_64::context::{self, TrapFrame};
use crate::arch::x86_64::percpu;
use crate::process::scheduler::sched_lock;
use crate::process::thread::ThreadState;
use crate::process::{current_thread, schedule};
use crate::syscall::queue;

/// The dispatch table. Function numbers without a slot kill the caller.
pub fn dispatch_slot(function: u64) -> Option<SyscallHandler> {
    Some(match function {
        SYS_EXIT => proc_calls::sys_exit,
        SYS_FORK => proc_calls::sys_fork,
        SYS_YIELD => proc_calls::sys_yield,
        SYS_WAITPID => proc_calls::sys_waitpid,
        SYS_EXECVE => proc_calls::sys_execve,
        SYS_MSLEEP => proc_calls::sys_msleep,
        SYS_GETPID => proc_calls::sys_getpid,
        SYS_GETTID => proc_calls::sys_gettid,
        SYS_SIGRETURN => proc_calls::sys_sigreturn,
        SYS_KILL => proc_calls::sys_kill,
        SYS_SIGACTION => proc_calls::sys_sigaction,
        SYS_SIGMASK => proc_calls::sys_sigmask,
        SYS_UMASK => proc_calls::sys_umask,
        SYS_BRK => proc_calls::sys_brk,

        SYS_SOCKET => ipc_calls::sys_socket,
        SYS_BIND => ipc_calls::sys_bind,
        SYS_LISTEN => ipc_calls::sys_listen,
        SYS_CONNECT => ipc_calls::sys_connect,
        SYS_ACCEPT => ipc_calls::sys_accept,
        SYS_SEND => ipc_calls::sys_send,
        SYS_RECV => ipc_calls::sys_recv,
        SYS_SOCKCLOSE => ipc_calls::sys_sockclose,

        SYS_OPEN => fs_calls::sys_open,
        SYS_CLOSE => fs_calls::sys_close,
        SYS_STAT => fs_calls::sys_stat,
        SYS_MOUNT => fs_calls::sys_mount,
        SYS_UMOUNT => fs_calls::sys_umount,
        SYS_CHOWN => fs_calls::sys_chown,
        SYS_CHMOD => fs_calls::sys_chmod,
        SYS_FLUSH => fs_calls::sys_flush,

        SYS_READ => fs_calls::sys_read,
        SYS_WRITE => fs_calls::sys_write,
        SYS_LSEEK => fs_calls::sys_lseek,

        _ => return None,
    })
}

/// Fast-path function numbers: handled inline at trap time.
fn is_fast_path(function: u64) -> bool {
    (SYSCALL_IPC_START..=SYSCALL_IPC_END).contains(&function)
        || (SYSCALL_RW_START..=SYSCALL_RW_END).contains(&function)
        || function == SYS_LSEEK
}

/// Trap entry for system calls. Never returns to the stub.
///
/// Called by the platform's syscall vector with IRQs masked and the full
/// register state in `frame`.
pub extern "C" fn syscall_handle(frame: &mut TrapFrame) -> ! {
    crate::sync::set_local_sched(false);

    if let Some(thread) = current_thread() {
        {
            let sched = sched_lock();
            let _ = &sched;
            // SAFETY: scheduler lock held; this is the thread's own trap.
            unsafe {
                context::save_context(&mut **thread.context.get(), frame);
            }
            context::create_syscall_context(&thread);
        }

        // SAFETY: the thread is trapped; its slot belongs to this path.
        let req: &mut SyscallRequest = unsafe { &mut *thread.syscall.get() };

        if is_fast_path(req.function) && dispatch_slot(req.function).is_some() {
            let handler = dispatch_slot(req.function).unwrap();
            handler(req);

            if req.unblock {
                // Result ready: hand it straight back without a context
                // switch. The thread keeps running on this CPU.
                let ret = req.ret;
                let sched = sched_lock();
                let _ = &sched;
                // SAFETY: scheduler lock held.
                let ctx_ptr = unsafe {
                    let ctx = &mut **thread.context.get();
                    *thread.state.get() = ThreadState::Running;
                    context::set_context_return(ctx, ret);
                    ctx as *const context::Context
                };
                drop(sched);
                // Balance the preempt-disable at entry; IRQs stay masked
                // until the IRETQ restores the thread's flags.
                percpu::preempt_enable();
                // SAFETY: live context of the current thread.
                unsafe { context::load_context(&*ctx_ptr) }
            }

            // Blocked: either an external completion wakes the thread,
            // or the handler asked to retry through the queue.
            let mut sched = sched_lock();
            // SAFETY: scheduler lock held.
            unsafe {
                if *thread.state.get() == ThreadState::Running {
                    *thread.state.get() = ThreadState::Blocked;
                }
                if req.retry && !req.queued {
                    req.retry = false;
                    queue::enqueue_locked(&mut sched, thread.tid);
                }
            }
        } else {
            // Queued path: block and let a worker pick it up.
            let mut sched = sched_lock();
            // SAFETY: scheduler lock held.
            unsafe {
                *thread.state.get() = ThreadState::Blocked;
            }
            queue::enqueue_locked(&mut sched, thread.tid);
        }

        let cpu = percpu::current_cpu();
        cpu.current_tid.store(0, core::sync::atomic::Ordering::Release);
        cpu.current_pid.store(0, core::sync::atomic::Ordering::Release);
    }

    // Balance the preempt-disable at entry, keep IRQs masked; schedule()
    // manages its own interrupt state from here.
    percpu::preempt_enable();
    loop {
        schedule();
        crate::arch::x86_64::idle();
    }
}
