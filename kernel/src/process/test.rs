//! Scheduler self-tests: preemption, the ready-queue invariant, the
//! timeslice ordering, and kill-while-running.

use crate::process::scheduler::{sched_lock, timeslice};
use crate::process::thread::{Priority, ThreadState};
use crate::process::{get_thread, kthread_create};
use core::sync::atomic::{AtomicU64, Ordering};

static SPIN_PROGRESS: AtomicU64 = AtomicU64::new(0);

pub fn create_sched_test_task() {
    kthread_create(sched_test_main, 0, "sched-test").expect("sched test task");
}

fn check(name: &str, ok: bool) -> bool {
    if ok {
        crate::kprintln!("[sched-test] {}: ok", name);
    } else {
        crate::kprintln!("[sched-test] {}: FAIL", name);
    }
    ok
}

/// A worker that never yields; only preemption lets anyone else run.
extern "C" fn spinner_main(_arg: u64) -> ! {
    loop {
        SPIN_PROGRESS.fetch_add(1, Ordering::Relaxed);
    }
}

extern "C" fn sched_test_main(_arg: u64) -> ! {
    let mut pass = true;

    // Timeslices must not grow with priority.
    pass &= check(
        "timeslice-non-increasing",
        timeslice(Priority::Normal) >= timeslice(Priority::High)
            && timeslice(Priority::High) >= timeslice(Priority::Highest),
    );

    // Preemption: a busy spinner cannot starve us, and we observe its
    // progress from here, so both sides got CPU time.
    let spinner = kthread_create(spinner_main, 0, "sched-spinner").expect("spinner");
    let before = SPIN_PROGRESS.load(Ordering::Relaxed);
    let start = crate::process::ticks();
    while crate::process::ticks() < start + 50 {
        core::hint::spin_loop();
    }
    let after = SPIN_PROGRESS.load(Ordering::Relaxed);
    pass &= check("preemption-shares-cpu", after > before);

    // Ready-queue invariant: a thread is linked on a ready queue iff it
    // is Queued.
    {
        let sched = sched_lock();
        let mut ok = true;
        let tids: alloc::vec::Vec<u32> = sched.threads.keys().copied().collect();
        for tid in tids {
            let thread = sched.threads.get(&tid).unwrap();
            // SAFETY: scheduler lock held.
            let state = unsafe { *thread.state.get() };
            let linked = sched.is_ready_queued(tid);
            if (state == ThreadState::Queued) != linked {
                ok = false;
            }
        }
        drop(sched);
        pass &= check("ready-queue-iff-queued", ok);
    }

    // Kill the spinner mid-run: it must become a zombie, leave every
    // queue, and stop making progress.
    {
        let mut sched = sched_lock();
        sched.terminate_thread(spinner, -1, false);
    }
    let frozen = SPIN_PROGRESS.load(Ordering::Relaxed);
    let start = crate::process::ticks();
    while crate::process::ticks() < start + 20 {
        core::hint::spin_loop();
    }
    let still = SPIN_PROGRESS.load(Ordering::Relaxed);
    let zombie = get_thread(spinner)
        .map(|t| {
            let sched = sched_lock();
            let _ = &sched;
            // SAFETY: scheduler lock held.
            unsafe { *t.state.get() == ThreadState::Zombie }
        })
        .unwrap_or(false);
    pass &= check("kill-stops-thread", zombie && still == frozen);

    {
        let sched = sched_lock();
        pass &= check("killed-not-ready-queued", !sched.is_ready_queued(spinner));
    }

    crate::kprintln!(
        "[sched-test] summary: {}",
        if pass { "PASS" } else { "FAIL" }
    );
    loop {
        crate::arch::x86_64::idle();
    }
}
