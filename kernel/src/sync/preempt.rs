//! Preemption control for the current CPU.
//!
//! `set_local_sched(false)` raises the per-CPU preemption depth and masks
//! interrupts, so the timer tick cannot switch tasks on this CPU until a
//! matching `set_local_sched(true)`. Calls nest: preemption resumes only
//! when the depth returns to zero.
//!
//! This protects per-CPU state only. Data shared between CPUs still needs
//! a [`crate::sync::SpinLock`].

use crate::arch::x86_64::percpu;

/// Gate preemption on the current CPU.
///
/// `false` disables preemption (and local IRQs), `true` re-enables it
/// once every outstanding disable has been balanced.
pub fn set_local_sched(enabled: bool) {
    if enabled {
        if percpu::preempt_enable() {
            x86_64::instructions::interrupts::enable();
        }
    } else {
        x86_64::instructions::interrupts::disable();
        percpu::preempt_disable();
    }
}

/// RAII form of [`set_local_sched`]: preemption is off for the guard's
/// lifetime.
#[must_use = "dropping the guard re-enables preemption immediately"]
pub struct PreemptGuard {
    // The guard must be dropped on the CPU that created it.
    _not_send: core::marker::PhantomData<*mut ()>,
}

impl PreemptGuard {
    #[inline]
    pub fn new() -> Self {
        set_local_sched(false);
        PreemptGuard {
            _not_send: core::marker::PhantomData,
        }
    }
}

impl Drop for PreemptGuard {
    #[inline]
    fn drop(&mut self) {
        set_local_sched(true);
    }
}
