//! x86_64 platform support.
//!
//! The trap and interrupt plumbing (IDT, GDT/TR, vector stubs) lives in
//! the platform bring-up outside this tree and is consumed here by
//! contract:
//!
//! * the syscall vector stub pushes a full [`context::TrapFrame`] and
//!   tail calls [`crate::syscall::syscall_handle`] (never returns);
//! * the timer vector stub pushes a [`context::TrapFrame`] and calls
//!   [`crate::process::scheduler::timer_tick`];
//! * the page-fault stub reads CR2 and tail calls
//!   [`crate::memory::virt::page_fault_trap`] with the fault address
//!   and error code (never returns: the thread is either killed or the
//!   fault is fatal).

pub mod context;
pub mod paging;
pub mod percpu;
pub mod tss;

/// Halt the CPU until the next interrupt.
#[inline]
pub fn hlt() {
    x86_64::instructions::hlt();
}

/// Enable interrupts.
#[inline]
pub fn sti() {
    x86_64::instructions::interrupts::enable();
}

/// Disable interrupts.
#[inline]
pub fn cli() {
    x86_64::instructions::interrupts::disable();
}

/// Low-power wait used by the idle loops.
#[inline]
pub fn idle() {
    x86_64::instructions::interrupts::enable_and_hlt();
}

/// Stop this CPU permanently. Used on fatal boot errors.
pub fn halt_forever() -> ! {
    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
}
