// Spinlocks for kernel synchronization.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// A busy-waiting mutual exclusion lock.
pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: access to the inner data is serialized by the atomic flag.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, spinning until it becomes available.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        SpinLockGuard { lock: self }
    }

    /// Acquire the lock without spinning.
    ///
    /// Returns `None` if the lock is already held. Interrupt-context
    /// callers that must not spin use this.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }
}

/// RAII guard for [`SpinLock`].
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// A spinlock that also masks local interrupts for the guard lifetime.
///
/// The scheduler lock and everything it protects (ready queues, syscall
/// FIFO, per-CPU dispatch slots) must only be held with IRQs disabled;
/// a timer tick taken while holding the plain lock on the same CPU would
/// deadlock against itself.
pub struct IrqSpinLock<T> {
    inner: SpinLock<T>,
}

// SAFETY: same argument as SpinLock; the IRQ state is purely per-CPU.
unsafe impl<T: Send> Sync for IrqSpinLock<T> {}
unsafe impl<T: Send> Send for IrqSpinLock<T> {}

impl<T> IrqSpinLock<T> {
    pub const fn new(data: T) -> Self {
        IrqSpinLock {
            inner: SpinLock::new(data),
        }
    }

    /// Disable local interrupts, then acquire the lock.
    ///
    /// The previous interrupt state is restored when the guard drops.
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let were_enabled = x86_64::instructions::interrupts::are_enabled();
        x86_64::instructions::interrupts::disable();
        let guard = self.inner.lock();
        IrqSpinLockGuard {
            guard: core::mem::ManuallyDrop::new(guard),
            restore_irq: were_enabled,
        }
    }
}

/// RAII guard for [`IrqSpinLock`]; re-enables IRQs on drop if they were
/// enabled at acquisition time.
pub struct IrqSpinLockGuard<'a, T> {
    guard: core::mem::ManuallyDrop<SpinLockGuard<'a, T>>,
    restore_irq: bool,
}

impl<'a, T> Deref for IrqSpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> DerefMut for IrqSpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<'a, T> Drop for IrqSpinLockGuard<'a, T> {
    fn drop(&mut self) {
        // Release the lock before touching the interrupt flag.
        // SAFETY: the guard is dropped exactly once, here.
        unsafe { core::mem::ManuallyDrop::drop(&mut self.guard) };
        if self.restore_irq {
            x86_64::instructions::interrupts::enable();
        }
    }
}
