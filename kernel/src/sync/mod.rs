// Kernel synchronization primitives.

pub mod preempt;
pub mod spinlock;

pub use preempt::{set_local_sched, PreemptGuard};
pub use spinlock::{IrqSpinLock, IrqSpinLockGuard, SpinLock, SpinLockGuard};
