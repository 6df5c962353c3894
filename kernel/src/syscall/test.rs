//! Syscall queue self-tests: FIFO structure, flag exclusivity, and the
//! kill-while-blocked drop path.

use crate::process::scheduler::sched_lock;
use crate::process::thread::{ThreadState, Tid};
use crate::process::{get_thread, kthread_create};
use crate::syscall::numbers::{MAX_SYSCALL, SYS_YIELD};
use crate::syscall::queue;
use core::sync::atomic::{AtomicU32, Ordering};

static PARKER_A: AtomicU32 = AtomicU32::new(0);
static PARKER_B: AtomicU32 = AtomicU32::new(0);

pub fn create_syscall_test_task() {
    kthread_create(syscall_test_main, 0, "syscall-test").expect("syscall test task");
}

fn check(name: &str, ok: bool) -> bool {
    if ok {
        crate::kprintln!("[syscall-test] {}: ok", name);
    } else {
        crate::kprintln!("[syscall-test] {}: FAIL", name);
    }
    ok
}

/// A parker publishes its TID and spins; the test thread manipulates its
/// request slot under the scheduler lock as if it had trapped.
extern "C" fn parker_a_main(_arg: u64) -> ! {
    PARKER_A.store(crate::arch::x86_64::percpu::current_tid(), Ordering::Release);
    loop {
        core::hint::spin_loop();
    }
}

extern "C" fn parker_b_main(_arg: u64) -> ! {
    PARKER_B.store(crate::arch::x86_64::percpu::current_tid(), Ordering::Release);
    loop {
        core::hint::spin_loop();
    }
}

fn wait_tid(cell: &AtomicU32) -> Tid {
    loop {
        let tid = cell.load(Ordering::Acquire);
        if tid != 0 {
            return tid;
        }
        core::hint::spin_loop();
    }
}

/// Stage a fake request on a parked thread: set the function number,
/// mark it blocked, and enqueue. Mirrors what the trap path does.
fn stage_request(tid: Tid, function: u64) {
    let thread = get_thread(tid).expect("staged thread exists");
    let mut sched = sched_lock();
    // SAFETY: scheduler lock held.
    unsafe {
        let req = &mut *thread.syscall.get();
        req.tid = tid;
        req.function = function;
        req.params = [0; 4];
        req.unblock = false;
        req.retry = false;
        req.busy = false;
        *thread.state.get() = ThreadState::Blocked;
    }
    queue::enqueue_locked(&mut sched, tid);
}

extern "C" fn syscall_test_main(_arg: u64) -> ! {
    let mut pass = true;

    kthread_create(parker_a_main, 0, "syscall-parker-a").expect("parker a");
    kthread_create(parker_b_main, 0, "syscall-parker-b").expect("parker b");
    let a = wait_tid(&PARKER_A);
    let b = wait_tid(&PARKER_B);

    // FIFO order: the queue holds [a, b] in enqueue order, and at most
    // one of queued/busy is set on every staged slot.
    stage_request(a, SYS_YIELD);
    stage_request(b, SYS_YIELD);
    {
        let sched = sched_lock();
        let position_a = sched.syscall_queue.iter().position(|&t| t == a);
        let position_b = sched.syscall_queue.iter().position(|&t| t == b);
        pass &= position_a.is_some() && position_b.is_some() && position_a < position_b;

        let mut exclusive = true;
        for tid in [a, b] {
            let thread = sched.threads.get(&tid).unwrap();
            // SAFETY: scheduler lock held.
            let req = unsafe { &*thread.syscall.get() };
            if req.queued && req.busy {
                exclusive = false;
            }
        }
        pass &= exclusive;
    }
    check("fifo-order-and-flag-exclusivity", pass);

    // Drain both: yield handlers unblock the threads with a fresh
    // timeslice; the queue empties.
    while crate::syscall::syscall_process() != 0 {}
    {
        let sched = sched_lock();
        pass &= check("queue-drained", sched.syscall_queue.is_empty());
        for tid in [a, b] {
            let thread = sched.threads.get(&tid).unwrap();
            // SAFETY: scheduler lock held.
            let state = unsafe { *thread.state.get() };
            pass &= state == ThreadState::Queued || state == ThreadState::Running;
        }
    }
    check("yield-unblocked", pass);

    // Out-of-range function number: the worker kills the thread without
    // writing a return value.
    let sentinel = 0xDEAD_BEEF_u64;
    {
        let thread = get_thread(a).expect("parker a alive");
        let sched = sched_lock();
        let _ = &sched;
        // SAFETY: scheduler lock held.
        unsafe {
            (**thread.context.get()).regs.rax = sentinel;
        }
    }
    stage_request(a, MAX_SYSCALL + 1);
    while crate::syscall::syscall_process() != 0 {}
    {
        let thread = get_thread(a).expect("zombie still in table");
        let sched = sched_lock();
        let _ = &sched;
        // SAFETY: scheduler lock held.
        let (state, rax) = unsafe {
            (*thread.state.get(), (**thread.context.get()).regs.rax)
        };
        pass &= check(
            "out-of-range-terminates",
            state == ThreadState::Zombie && rax == sentinel,
        );
    }

    // Kill-while-queued: a request whose thread died before a worker
    // reached it is dropped without dispatch.
    stage_request(b, SYS_YIELD);
    {
        let mut sched = sched_lock();
        sched.terminate_thread(b, -1, false);
        pass &= check(
            "killed-request-leaves-queue",
            !sched.syscall_queue.contains(&b),
        );
    }

    crate::kprintln!(
        "[syscall-test] summary: {}",
        if pass { "PASS" } else { "FAIL" }
    );
    loop {
        crate::arch::x86_64::idle();
    }
}
