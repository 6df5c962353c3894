//! The scheduler.
//!
//! One coarse lock (IRQ-masking) serializes every scheduling structure:
//! the per-priority ready queues, the thread and process tables, the
//! global syscall FIFO, the sleeping set, and the per-CPU dispatch slots.
//! Lock order across subsystems is scheduler → socket table → descriptor.
//!
//! Selection is highest-priority-first with round-robin inside a level.
//! Timeslices are monotonically non-increasing in priority: urgent
//! threads preempt often but run short.

use super::process::Process;
use super::thread::{Pid, Priority, Thread, ThreadState, Tid, PRIORITY_LEVELS};
use crate::arch::x86_64::context::{self, Context, TrapFrame};
use crate::arch::x86_64::{paging, percpu};
use crate::sync::{IrqSpinLock, IrqSpinLockGuard};
use crate::syscall::errno::Errno;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::ToString;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

/// Timeslices in timer ticks, indexed by priority.
const TIMESLICE: [u64; PRIORITY_LEVELS] = [6, 4, 2];

pub struct Scheduler {
    /// One FIFO per priority; a TID appears here iff its thread is Queued.
    ready: [VecDeque<Tid>; PRIORITY_LEVELS],
    pub threads: BTreeMap<Tid, Arc<Thread>>,
    pub processes: BTreeMap<Pid, Process>,
    /// The global syscall FIFO (see `crate::syscall::queue`).
    pub syscall_queue: VecDeque<Tid>,
    /// Sleeping threads and their wake deadlines in ticks.
    sleeping: BTreeMap<Tid, u64>,
    scheduling: bool,
    next_id: u32,
}

static SCHED: IrqSpinLock<Scheduler> = IrqSpinLock::new(Scheduler {
    ready: [const { VecDeque::new() }; PRIORITY_LEVELS],
    threads: BTreeMap::new(),
    processes: BTreeMap::new(),
    syscall_queue: VecDeque::new(),
    sleeping: BTreeMap::new(),
    scheduling: false,
    next_id: 1,
});

static TICKS: AtomicU64 = AtomicU64::new(0);
static KERNEL_PID: AtomicU32 = AtomicU32::new(0);
static LUMEN_PID: AtomicU32 = AtomicU32::new(0);

/// Acquire the scheduler lock. IRQs stay masked until the guard drops.
pub fn sched_lock() -> IrqSpinLockGuard<'static, Scheduler> {
    SCHED.lock()
}

/// Monotonic timer tick count.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Acquire)
}

/// Timeslice granted to a thread of the given priority.
pub fn timeslice(priority: Priority) -> u64 {
    TIMESLICE[priority.index()]
}

/// Gate scheduling globally. While off, `schedule()` and the timer tick
/// dispatch nothing.
pub fn set_scheduling(enabled: bool) {
    SCHED.lock().scheduling = enabled;
}

pub fn set_kernel_pid(pid: Pid) {
    KERNEL_PID.store(pid, Ordering::Release);
}

pub fn kernel_pid() -> Pid {
    KERNEL_PID.load(Ordering::Acquire)
}

pub fn set_lumen_pid(pid: Pid) {
    LUMEN_PID.store(pid, Ordering::Release);
}

pub fn lumen_pid() -> Pid {
    LUMEN_PID.load(Ordering::Acquire)
}

/// Look up a thread by TID.
pub fn get_thread(tid: Tid) -> Option<Arc<Thread>> {
    SCHED.lock().threads.get(&tid).cloned()
}

/// The thread dispatched on the calling CPU.
pub fn current_thread() -> Option<Arc<Thread>> {
    let tid = percpu::current_tid();
    if tid == 0 {
        None
    } else {
        get_thread(tid)
    }
}

impl Scheduler {
    /// Allocate a fresh PID/TID. The spaces are shared so a process's
    /// main thread satisfies `tid == pid`.
    pub fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Insert a blank process.
    pub fn create_process(&mut self, parent: Pid) -> Pid {
        let pid = self.allocate_id();
        self.processes.insert(pid, Process::new(pid, parent));
        pid
    }

    /// Put a Queued thread on its ready queue.
    pub fn enqueue(&mut self, thread: &Arc<Thread>) {
        self.ready[thread.priority.index()].push_back(thread.tid);
    }

    /// Transition a Blocked or Sleeping thread back to Queued with a
    /// fresh timeslice.
    pub fn unblock(&mut self, tid: Tid) {
        if let Some(thread) = self.threads.get(&tid).cloned() {
            // SAFETY: scheduler lock held.
            unsafe {
                *thread.state.get() = ThreadState::Queued;
            }
            thread
                .time
                .store(timeslice(thread.priority), Ordering::Release);
            self.sleeping.remove(&tid);
            self.enqueue(&thread);
        }
    }

    /// Record a sleep deadline for the current thread.
    pub fn sleep_until(&mut self, tid: Tid, deadline: u64) {
        if let Some(thread) = self.threads.get(&tid) {
            // SAFETY: scheduler lock held.
            unsafe {
                *thread.state.get() = ThreadState::Sleeping;
            }
            self.sleeping.insert(tid, deadline);
        }
    }

    /// Wake every sleeper whose deadline has passed.
    pub fn wake_sleepers(&mut self, now: u64) {
        let expired: alloc::vec::Vec<Tid> = self
            .sleeping
            .iter()
            .filter(|(_, &deadline)| deadline <= now)
            .map(|(&tid, _)| tid)
            .collect();
        for tid in expired {
            self.sleeping.remove(&tid);
            self.unblock(tid);
        }
    }

    /// Pop the next runnable thread: highest priority first, round-robin
    /// within a level. Entries whose thread died or changed state since
    /// being queued are discarded on the way.
    pub fn pick_next(&mut self) -> Option<Arc<Thread>> {
        for level in (0..PRIORITY_LEVELS).rev() {
            while let Some(tid) = self.ready[level].pop_front() {
                if let Some(thread) = self.threads.get(&tid) {
                    // SAFETY: scheduler lock held.
                    if unsafe { *thread.state.get() } == ThreadState::Queued {
                        return Some(thread.clone());
                    }
                }
            }
        }
        None
    }

    /// Is `tid` linked on some ready queue? (Self-test support.)
    pub fn is_ready_queued(&self, tid: Tid) -> bool {
        self.ready.iter().any(|q| q.contains(&tid))
    }

    /// Live thread and process counts (sysinfo).
    pub fn counts(&self) -> (usize, usize) {
        (self.threads.len(), self.processes.len())
    }

    pub fn scheduling_enabled(&self) -> bool {
        self.scheduling
    }

    /// Mark a thread Zombie: pull it off every queue, release its user
    /// pages, and leave the object in the table for the parent to reap.
    /// With `reparent`, the children of a fully-dead process are adopted
    /// by lumen.
    pub fn terminate_thread(&mut self, tid: Tid, status: i64, reparent: bool) {
        let Some(thread) = self.threads.get(&tid).cloned() else {
            return;
        };

        // SAFETY: scheduler lock held.
        unsafe {
            *thread.state.get() = ThreadState::Zombie;
        }
        thread.exit_status.store(status, Ordering::Release);
        thread.normal_exit.store(reparent, Ordering::Release);

        for queue in self.ready.iter_mut() {
            queue.retain(|&t| t != tid);
        }
        self.syscall_queue.retain(|&t| t != tid);
        self.sleeping.remove(&tid);

        let cpu = percpu::current_cpu();
        if cpu.current_tid.load(Ordering::Acquire) == tid {
            cpu.current_tid.store(0, Ordering::Release);
            cpu.current_pid.store(0, Ordering::Release);
        }

        // Free the address space. If it is live on this CPU, step off it
        // first; the kernel half of the boot root covers us.
        // SAFETY: scheduler lock held; the thread cannot be running
        // elsewhere (it was trapped or blocked to get here).
        unsafe {
            let ctx = &mut **thread.context.get();
            let (active, _) = Cr3::read();
            if active.start_address().as_u64() == ctx.cr3 {
                Cr3::write(
                    PhysFrame::containing_address(PhysAddr::new(paging::kernel_root())),
                    Cr3Flags::empty(),
                );
            }
            let highest = thread.highest.load(Ordering::Acquire);
            context::clean_thread(ctx, highest);
        }

        // Process-level bookkeeping.
        let lumen = lumen_pid();
        let mut orphans: alloc::vec::Vec<Pid> = alloc::vec::Vec::new();
        if let Some(proc) = self.processes.get_mut(&thread.pid) {
            let all_dead = proc.threads.iter().all(|t| {
                self_state(&self.threads, *t)
                    .map(|s| s == ThreadState::Zombie)
                    .unwrap_or(true)
            });
            proc.zombie = all_dead;
            if all_dead && reparent {
                orphans = proc.children.clone();
            }
        }
        for child in orphans {
            if let Some(c) = self.processes.get_mut(&child) {
                c.orphan = true;
                c.parent = lumen;
            }
        }
    }
}

fn self_state(threads: &BTreeMap<Tid, Arc<Thread>>, tid: Tid) -> Option<ThreadState> {
    // SAFETY: only called with the scheduler lock held.
    threads.get(&tid).map(|t| unsafe { *t.state.get() })
}

/// Create a kernel thread: its own process under its own PID, a
/// kernel-level context running `entry(arg)`, queued immediately.
pub fn kthread_create(
    entry: extern "C" fn(u64) -> !,
    arg: u64,
    name: &str,
) -> Result<Tid, Errno> {
    let mut sched = SCHED.lock();
    let pid = sched.allocate_id();
    let thread = Thread::new(pid, pid, Priority::Normal);

    // SAFETY: the thread is not yet visible to anyone else.
    unsafe {
        context::create_context(
            &mut **thread.context.get(),
            context::CONTEXT_KERNEL,
            entry as usize as u64,
            arg,
        )?;
    }
    thread
        .time
        .store(timeslice(Priority::Normal), Ordering::Release);

    let mut proc = Process::new(pid, 0);
    proc.name = name.to_string();
    proc.threads.push(pid);
    sched.processes.insert(pid, proc);
    sched.threads.insert(pid, thread.clone());
    sched.enqueue(&thread);

    log::debug!("sched: created kernel thread '{}' tid={}", name, pid);
    Ok(pid)
}

/// Switch the calling CPU into the address space of `tid` without
/// dispatching it.
pub fn thread_use_context(tid: Tid) -> Result<(), Errno> {
    let thread = get_thread(tid).ok_or(Errno::NoSuchProcess)?;
    // SAFETY: the context's root is stable while the thread exists.
    unsafe {
        context::use_context(&**thread.context.get());
    }
    Ok(())
}

/// Dispatch the next runnable thread on this CPU, if any. When a thread
/// is found this call does not return; when the ready queues are empty it
/// returns with IRQs masked and the caller decides how to idle.
///
/// The calling context must already be accounted for: saved and requeued,
/// blocked, or abandoned.
pub fn schedule() {
    x86_64::instructions::interrupts::disable();
    let mut sched = SCHED.lock();
    if !sched.scheduling {
        return;
    }
    sched.wake_sleepers(ticks());

    let cpu = percpu::current_cpu();
    let Some(next) = sched.pick_next() else {
        cpu.current_tid.store(0, Ordering::Release);
        cpu.current_pid.store(0, Ordering::Release);
        return;
    };

    dispatch(sched, next)
}

/// Commit to `next` on this CPU and jump into it. Consumes the guard so
/// the lock is released before the context load.
fn dispatch(sched: IrqSpinLockGuard<'static, Scheduler>, next: Arc<Thread>) -> ! {
    let cpu = percpu::current_cpu();
    // SAFETY: scheduler lock held.
    unsafe {
        *next.state.get() = ThreadState::Running;
    }
    if next.time.load(Ordering::Acquire) == 0 {
        next.time.store(timeslice(next.priority), Ordering::Release);
    }
    cpu.current_tid.store(next.tid, Ordering::Release);
    cpu.current_pid.store(next.pid, Ordering::Release);

    let ctx_ptr: *const Context = unsafe { &**next.context.get() };
    drop(sched); // IRQs stay masked: they were disabled before locking

    // SAFETY: the context belongs to a live thread now marked Running on
    // this CPU; IRQs are masked until the IRETQ.
    unsafe { context::load_context(&*ctx_ptr) }
}

/// Timer IRQ entry: bump the clock, wake sleepers, and preempt the
/// current thread when its timeslice runs out.
///
/// Called by the platform timer stub with IRQs masked and `frame`
/// pointing at the interrupted register state.
pub extern "C" fn timer_tick(frame: &mut TrapFrame) {
    let now = TICKS.fetch_add(1, Ordering::AcqRel) + 1;

    if !percpu::preemptible() {
        return;
    }

    let mut sched = SCHED.lock();
    if !sched.scheduling {
        return;
    }
    sched.wake_sleepers(now);

    let cpu = percpu::current_cpu();
    let tid = cpu.current_tid.load(Ordering::Acquire);

    if tid == 0 {
        // Idle CPU: pick up work if there is any.
        if let Some(next) = sched.pick_next() {
            dispatch(sched, next);
        }
        return;
    }

    let Some(thread) = sched.threads.get(&tid).cloned() else {
        cpu.current_tid.store(0, Ordering::Release);
        cpu.current_pid.store(0, Ordering::Release);
        return;
    };

    // SAFETY: scheduler lock held.
    if unsafe { *thread.state.get() } != ThreadState::Running {
        // Killed (or otherwise descheduled) while on the CPU: abandon
        // the interrupted context and move on.
        cpu.current_tid.store(0, Ordering::Release);
        cpu.current_pid.store(0, Ordering::Release);
        if let Some(next) = sched.pick_next() {
            dispatch(sched, next);
        }
        return;
    }

    let left = thread.time.load(Ordering::Acquire).saturating_sub(1);
    thread.time.store(left, Ordering::Release);
    if left > 0 {
        return;
    }

    // Timeslice exhausted: demote to Queued and pick again.
    // SAFETY: scheduler lock held.
    unsafe {
        context::save_context(&mut **thread.context.get(), frame);
        *thread.state.get() = ThreadState::Queued;
    }
    thread
        .time
        .store(timeslice(thread.priority), Ordering::Release);
    sched.enqueue(&thread);
    cpu.current_tid.store(0, Ordering::Release);
    cpu.current_pid.store(0, Ordering::Release);

    if let Some(next) = sched.pick_next() {
        if next.tid == thread.tid {
            // Round-robin came straight back: resume via the IRET path.
            // SAFETY: scheduler lock held.
            unsafe {
                *next.state.get() = ThreadState::Running;
            }
            cpu.current_tid.store(next.tid, Ordering::Release);
            cpu.current_pid.store(next.pid, Ordering::Release);
            return;
        }
        dispatch(sched, next);
    }
}
