//! Process lifecycle: fork, exec-from-memory, exit, and reaping.

use super::elf;
use super::process::{IoKind, Process, IO_CLOFORK};
use super::scheduler::{self, sched_lock, timeslice};
use super::thread::{Pid, Priority, Thread, ThreadState, Tid};
use crate::arch::x86_64::context;
use crate::syscall::errno::Errno;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use core::sync::atomic::Ordering;
use x86_64::registers::control::{Cr3, Cr3Flags};

/// Exit-status tag: thread ended by calling exit.
pub const EXIT_NORMAL: i64 = 0x100;
/// Exit-status tag: thread was killed.
pub const EXIT_SIGNALED: i64 = 0x200;

/// waitpid: return immediately instead of blocking.
pub const WNOHANG: u64 = 0x02;

/// Fork the calling thread into a new single-threaded process.
///
/// The child gets a byte-copy of the register file, a private deep copy
/// of the parent's user memory, the parent's descriptors (bumping socket
/// reference counts, dropping close-on-fork slots), working directory,
/// umask and process group. Returns the child PID; the child itself
/// resumes with 0 in the return register.
pub fn fork(parent: &Arc<Thread>) -> Result<Pid, Errno> {
    let mut sched = sched_lock();

    let child_pid = sched.allocate_id();
    let child = Thread::new(child_pid, child_pid, parent.priority);

    // SAFETY: scheduler lock held; the parent is trapped in this syscall
    // and the child is not yet published.
    unsafe {
        context::clone_context(&mut **child.context.get(), &**parent.context.get())?;
        *child.signals.get() = (*parent.signals.get()).clone();
        context::set_context_return(&mut **child.context.get(), 0);
    }
    child.highest.store(
        parent.highest.load(Ordering::Acquire),
        Ordering::Release,
    );
    child.signal_trampoline.store(
        parent.signal_trampoline.load(Ordering::Acquire),
        Ordering::Release,
    );
    child.time.store(timeslice(parent.priority), Ordering::Release);

    let mut proc = Process::new(child_pid, parent.pid);
    proc.threads.push(child_pid);

    if let Some(parent_proc) = sched.processes.get_mut(&parent.pid) {
        proc.umask = parent_proc.umask;
        proc.pgrp = parent_proc.pgrp;
        proc.uid = parent_proc.uid;
        proc.gid = parent_proc.gid;
        proc.cwd = parent_proc.cwd.clone();
        proc.name = parent_proc.name.clone();
        proc.command = parent_proc.command.clone();

        for (i, slot) in parent_proc.io.iter().enumerate() {
            if !slot.valid || slot.flags & IO_CLOFORK != 0 {
                continue;
            }
            proc.io[i] = *slot;
            proc.iod_count += 1;
            if slot.kind == IoKind::Socket {
                crate::ipc::socket::socket_ref(slot.data);
            }
        }

        parent_proc.children.push(child_pid);
    }

    sched.processes.insert(child_pid, proc);
    sched.threads.insert(child_pid, child.clone());
    sched.enqueue(&child);

    Ok(child_pid)
}

/// Start a new user process from an executable image already in kernel
/// memory. This is how the bootstrap thread launches lumen.
pub fn execve_memory(
    image: &[u8],
    argv: &[&str],
    envp: &[&str],
) -> Result<Pid, Errno> {
    let mut sched = sched_lock();

    let pid = sched.allocate_id();
    let thread = Thread::new(pid, pid, Priority::Normal);

    // SAFETY: thread not yet published.
    unsafe {
        context::create_context(
            &mut **thread.context.get(),
            context::CONTEXT_USER,
            0,
            0,
        )?;
    }

    // Build the image inside the new address space, then come back.
    let (old_root, _) = Cr3::read();
    // SAFETY: the new root carries the full kernel half; our stack and
    // code remain mapped across the switch.
    let built: Result<(), Errno> = unsafe {
        context::use_context(&**thread.context.get());
        let result = elf::load(image).and_then(|loaded| {
            context::set_context(&thread, loaded.entry, loaded.highest, argv, envp)
                .map(|_| ())
        });
        Cr3::write(old_root, Cr3Flags::empty());
        result
    };

    if let Err(e) = built {
        // SAFETY: thread never ran; tearing down its half-built space.
        unsafe {
            let highest = thread.highest.load(Ordering::Acquire);
            context::clean_thread(&mut **thread.context.get(), highest);
        }
        return Err(e);
    }

    thread
        .time
        .store(timeslice(Priority::Normal), Ordering::Release);

    let mut proc = Process::new(pid, scheduler::kernel_pid());
    proc.name = argv.first().map(|s| s.to_string()).unwrap_or_default();
    proc.command = argv.join(" ");
    proc.threads.push(pid);
    sched.processes.insert(pid, proc);
    sched.threads.insert(pid, thread.clone());
    sched.enqueue(&thread);

    log::info!("sched: spawned user process pid={} ({})", pid, image.len());
    Ok(pid)
}

/// Voluntary exit of the calling thread. Children are adopted by lumen.
pub fn exit(thread: &Arc<Thread>, status: i64) {
    let mut sched = sched_lock();
    sched.terminate_thread(thread.tid, status, true);
}

/// Outcome of a reap attempt.
pub enum WaitResult {
    /// A child was reaped.
    Reaped { pid: Pid, status: i64 },
    /// Children exist but none is a zombie yet.
    StillRunning,
    /// The caller has no matching children.
    NoChildren,
}

/// Try to reap one zombie child of `parent`'s process.
///
/// `target` of -1 matches any child. On success the child's thread and
/// process are removed from the tables and its descriptors released.
pub fn try_wait(parent: &Arc<Thread>, target: i64) -> WaitResult {
    let mut sched = sched_lock();

    let children = match sched.processes.get(&parent.pid) {
        Some(p) if !p.children.is_empty() => p.children.clone(),
        _ => return WaitResult::NoChildren,
    };

    let candidates: alloc::vec::Vec<Pid> = children
        .iter()
        .copied()
        .filter(|&c| target < 0 || c == target as Pid)
        .collect();
    if candidates.is_empty() {
        return WaitResult::NoChildren;
    }

    for child_pid in candidates {
        let zombie = sched
            .processes
            .get(&child_pid)
            .map(|p| p.zombie)
            .unwrap_or(false);
        if !zombie {
            continue;
        }

        // Collect the exit status from the main thread.
        let status = sched
            .threads
            .get(&child_pid)
            .map(|t| {
                let code = t.exit_status.load(Ordering::Acquire) & 0xFF;
                if t.normal_exit.load(Ordering::Acquire) {
                    code | EXIT_NORMAL
                } else {
                    code | EXIT_SIGNALED
                }
            })
            .unwrap_or(EXIT_SIGNALED);

        reap(&mut sched, child_pid);
        if let Some(p) = sched.processes.get_mut(&parent.pid) {
            p.children.retain(|&c| c != child_pid);
        }
        return WaitResult::Reaped {
            pid: child_pid,
            status,
        };
    }

    WaitResult::StillRunning
}

/// Remove a fully dead process and its threads from the tables, closing
/// whatever its descriptor table still holds.
fn reap(sched: &mut scheduler::Scheduler, pid: Pid) {
    if let Some(proc) = sched.processes.remove(&pid) {
        for slot in proc.io.iter().filter(|s| s.valid) {
            if slot.kind == IoKind::Socket {
                crate::ipc::socket::socket_unref(slot.data);
            }
        }
        for tid in proc.threads {
            sched.threads.remove(&tid);
        }
        // Surviving children keep running under lumen.
        let lumen = scheduler::lumen_pid();
        for child in proc.children {
            if let Some(c) = sched.processes.get_mut(&child) {
                c.orphan = true;
                c.parent = lumen;
            }
        }
    }
}

/// Name of the process owning `tid`, for diagnostics.
pub fn process_name(tid: Tid) -> String {
    let sched = sched_lock();
    sched
        .threads
        .get(&tid)
        .and_then(|t| sched.processes.get(&t.pid))
        .map(|p| p.name.clone())
        .unwrap_or_default()
}

/// True when `pid` is lumen or one of lumen's immediate children.
pub fn is_lumen_or_child(pid: Pid) -> bool {
    let lumen = scheduler::lumen_pid();
    if lumen == 0 {
        return false;
    }
    if pid == lumen {
        return true;
    }
    let sched = sched_lock();
    sched
        .processes
        .get(&pid)
        .map(|p| p.parent == lumen)
        .unwrap_or(false)
}

/// Is the thread still something the scheduler would run?
pub fn thread_alive(tid: Tid) -> bool {
    scheduler::get_thread(tid)
        .map(|t| {
            // SAFETY: a racing state change reads as stale, which every
            // caller tolerates (they re-check under the lock).
            unsafe { *t.state.get() != ThreadState::Zombie }
        })
        .unwrap_or(false)
}
