//! Process-lifecycle syscall handlers (queued path).

use super::errno::{encode, Errno};
use super::request::SyscallRequest;
use crate::ipc::signal;
use crate::memory::UserSliceWrite;
use crate::process::lifecycle::{self, WaitResult, WNOHANG};
use crate::process::{get_thread, sched_lock, ticks};

/// SYS_EXIT: terminate the calling thread; children go to lumen.
pub fn sys_exit(req: &mut SyscallRequest) {
    if let Some(thread) = get_thread(req.tid) {
        lifecycle::exit(&thread, req.params[0] as i64);
    }
    // The thread is a zombie; nothing to return to.
    req.unblock = false;
}

/// SYS_FORK: duplicate the calling process.
pub fn sys_fork(req: &mut SyscallRequest) {
    let Some(thread) = get_thread(req.tid) else {
        return;
    };
    req.ret = encode(lifecycle::fork(&thread).map(|pid| pid as u64));
    req.unblock = true;
}

/// SYS_YIELD: round-trip through the queue is the yield.
pub fn sys_yield(req: &mut SyscallRequest) {
    req.ret = 0;
    req.unblock = true;
}

/// SYS_WAITPID: reap a zombie child, or wait for one.
pub fn sys_waitpid(req: &mut SyscallRequest) {
    let Some(thread) = get_thread(req.tid) else {
        return;
    };
    let target = req.params[0] as i64;
    let status_ptr = req.params[1];
    let options = req.params[2];

    match lifecycle::try_wait(&thread, target) {
        WaitResult::Reaped { pid, status } => {
            if status_ptr != 0 {
                if let Ok(out) = UserSliceWrite::new(status_ptr, 8) {
                    out.copy_from(&status.to_ne_bytes());
                }
            }
            req.ret = pid as u64;
            req.unblock = true;
        }
        WaitResult::NoChildren => {
            req.ret = Errno::NoChildren.to_ret();
            req.unblock = true;
        }
        WaitResult::StillRunning => {
            if options & WNOHANG != 0 {
                req.ret = 0;
                req.unblock = true;
            } else {
                // Stay blocked; the queue retries until a child dies.
                req.retry = true;
            }
        }
    }
}

/// SYS_EXECVE: loading from a file needs the file servers, which arrive
/// with lumen; not wired up in the core yet.
pub fn sys_execve(req: &mut SyscallRequest) {
    req.ret = Errno::NotImplemented.to_ret();
    req.unblock = true;
}

/// SYS_MSLEEP: park the thread until the deadline.
pub fn sys_msleep(req: &mut SyscallRequest) {
    let ms = req.params[0];
    req.ret = 0;
    if ms == 0 {
        req.unblock = true;
        return;
    }
    let mut sched = sched_lock();
    sched.sleep_until(req.tid, ticks() + ms);
    // The timer wakes us; no unblock here.
    req.unblock = false;
}

/// SYS_GETPID.
pub fn sys_getpid(req: &mut SyscallRequest) {
    req.ret = get_thread(req.tid).map(|t| t.pid as u64).unwrap_or(0);
    req.unblock = true;
}

/// SYS_GETTID.
pub fn sys_gettid(req: &mut SyscallRequest) {
    req.ret = req.tid as u64;
    req.unblock = true;
}

/// SYS_SIGRETURN: unwind from a signal handler.
pub fn sys_sigreturn(req: &mut SyscallRequest) {
    if let Some(thread) = get_thread(req.tid) {
        signal::sigreturn(&thread, req);
    }
}

/// SYS_KILL.
pub fn sys_kill(req: &mut SyscallRequest) {
    req.ret = encode(signal::send_signal(req.params[0] as u32, req.params[1] as u32));
    req.unblock = true;
}

/// SYS_SIGACTION.
pub fn sys_sigaction(req: &mut SyscallRequest) {
    let Some(thread) = get_thread(req.tid) else {
        return;
    };
    req.ret = encode(signal::sigaction(&thread, req.params[0] as u32, req.params[1]));
    req.unblock = true;
}

/// SYS_SIGMASK: replace the mask, return the old one.
pub fn sys_sigmask(req: &mut SyscallRequest) {
    let Some(thread) = get_thread(req.tid) else {
        return;
    };
    req.ret = signal::set_mask(&thread, req.params[0]);
    req.unblock = true;
}

/// SYS_BRK: grow the heap by raising the highest-user-address watermark.
/// Runs inside the requester's address space, so the new pages land in
/// the right tables.
pub fn sys_brk(req: &mut SyscallRequest) {
    use crate::arch::x86_64::paging::PAGE_SIZE;
    use crate::memory::{virt, USER_LIMIT};
    use core::sync::atomic::Ordering;

    let Some(thread) = get_thread(req.tid) else {
        return;
    };
    let current = thread.highest.load(Ordering::Acquire);
    let want = req.params[0];

    if want == 0 || want <= current {
        req.ret = current;
        req.unblock = true;
        return;
    }
    if want >= USER_LIMIT {
        req.ret = Errno::OutOfMemory.to_ret();
        req.unblock = true;
        return;
    }

    let page = PAGE_SIZE as u64;
    let base = (current + page - 1) & !(page - 1);
    let end = (want + page - 1) & !(page - 1);
    if end > base {
        let pages = ((end - base) / page) as usize;
        if virt::allocate_at(base, pages, virt::VmFlags::USER | virt::VmFlags::WRITE) != base {
            req.ret = Errno::OutOfMemory.to_ret();
            req.unblock = true;
            return;
        }
    }
    thread.highest.store(want, Ordering::Release);
    req.ret = want;
    req.unblock = true;
}

/// SYS_UMASK: replace the file creation mask, return the old one.
pub fn sys_umask(req: &mut SyscallRequest) {
    let Some(thread) = get_thread(req.tid) else {
        return;
    };
    let mut sched = sched_lock();
    if let Some(proc) = sched.processes.get_mut(&thread.pid) {
        req.ret = proc.umask as u64;
        proc.umask = (req.params[0] & 0o777) as u32;
    } else {
        req.ret = Errno::NoSuchProcess.to_ret();
    }
    req.unblock = true;
}
