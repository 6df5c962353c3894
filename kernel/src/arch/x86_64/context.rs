//! Thread context management.
//!
//! A [`Context`] is the fixed-size blob the scheduler moves between CPU
//! and memory: the full register file, the address-space root, and the
//! thread's I/O-port permission bitmap. The layout is opaque to every
//! other subsystem; only the operations below touch it.
//!
//! Syscall ABI: function number in RBX, up to four arguments in
//! RDI/RSI/RDX/RCX, return value in RAX, trap through `int SYSCALL_VECTOR`.

use crate::memory::{self, virt::VmFlags};
use crate::process::thread::Thread;
use crate::syscall::errno::Errno;
use alloc::boxed::Box;
use alloc::sync::Arc;
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

use super::paging::{self, PAGE_SIZE};
use super::tss::{self, IO_BITMAP_SIZE};

/// Context privilege level: ring 0.
pub const CONTEXT_KERNEL: u8 = 0;
/// Context privilege level: ring 3.
pub const CONTEXT_USER: u8 = 3;

/// Software interrupt vector used for system calls.
pub const SYSCALL_VECTOR: u8 = 0x80;

/// Fixed per-thread stack size.
pub const THREAD_STACK_SIZE: usize = 64 * 1024;
const STACK_PAGES: usize = THREAD_STACK_SIZE / PAGE_SIZE;

// Segment selectors published by the platform bring-up GDT.
const KERNEL_CS: u64 = 0x08;
const KERNEL_SS: u64 = 0x10;
const USER_CS: u64 = 0x20 | 3;
const USER_SS: u64 = 0x18 | 3;

/// RFLAGS with interrupts enabled.
const RFLAGS_IF: u64 = 0x202;

/// Saved general-purpose register file, in the order the restore path
/// pops it. The last five fields form the IRETQ frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterFile {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

static_assertions::const_assert_eq!(core::mem::size_of::<RegisterFile>(), 160);

/// Register state pushed by a trap stub; layout-identical to the saved
/// register file so save/restore are plain copies.
pub type TrapFrame = RegisterFile;

/// Everything the CPU needs to resume a thread.
#[repr(C)]
pub struct Context {
    pub regs: RegisterFile,
    /// Physical root of this thread's address space.
    pub cr3: u64,
    /// I/O-port permission bitmap; a set bit denies the port.
    pub io_bitmap: [u8; IO_BITMAP_SIZE],
    /// True while `io_bitmap` is still the all-denied default.
    pub io_default: bool,
    /// Kernel-level contexts own their stack; recorded for teardown.
    pub kstack_base: u64,
    pub kstack_pages: usize,
}

/// Size of the opaque context blob.
pub const CONTEXT_SIZE: usize = core::mem::size_of::<Context>();

impl Context {
    pub fn zeroed() -> Box<Context> {
        Box::new(Context {
            regs: RegisterFile::default(),
            cr3: 0,
            io_bitmap: [0xFF; IO_BITMAP_SIZE],
            io_default: true,
            kstack_base: 0,
            kstack_pages: 0,
        })
    }
}

/// Build a context for a new thread.
///
/// The blob is zeroed, the instruction pointer seeded with `entry`, the
/// first argument register with `arg`, interrupts enabled in the saved
/// flags, and a fresh address space created whose upper half aliases the
/// kernel. I/O ports start denied. Kernel-level contexts also get a
/// stack; user-level entry and stack stay empty until [`set_context`].
pub fn create_context(ctx: &mut Context, level: u8, entry: u64, arg: u64) -> Result<(), Errno> {
    ctx.regs = RegisterFile::default();
    ctx.regs.rip = entry;
    ctx.regs.rdi = arg;
    ctx.regs.rflags = RFLAGS_IF;
    ctx.io_bitmap.fill(0xFF);
    ctx.io_default = true;
    ctx.kstack_base = 0;
    ctx.kstack_pages = 0;

    ctx.cr3 = paging::clone_kernel_space().ok_or(Errno::OutOfMemory)?;

    if level == CONTEXT_KERNEL {
        let stack = memory::virt::allocate(
            memory::KERNEL_HEAP_BASE,
            memory::KERNEL_HEAP_END,
            STACK_PAGES,
            VmFlags::WRITE,
        );
        if stack == 0 {
            paging::free_user_space(ctx.cr3);
            ctx.cr3 = 0;
            return Err(Errno::OutOfMemory);
        }
        ctx.kstack_base = stack;
        ctx.kstack_pages = STACK_PAGES;
        ctx.regs.rsp = stack + THREAD_STACK_SIZE as u64;
        ctx.regs.cs = KERNEL_CS;
        ctx.regs.ss = KERNEL_SS;
    } else {
        ctx.regs.rip = 0;
        ctx.regs.cs = USER_CS;
        ctx.regs.ss = USER_SS;
    }
    Ok(())
}

/// Machine code of the signal-return trampoline: loads the sigreturn
/// function number into RBX and traps.
fn trampoline_code() -> [u8; 9] {
    let nr = crate::syscall::numbers::SYS_SIGRETURN as u32;
    let b = nr.to_le_bytes();
    [0x48, 0xC7, 0xC3, b[0], b[1], b[2], b[3], 0xCD, SYSCALL_VECTOR]
}

fn copy_to_user_page(page: u64, bytes: &[u8]) {
    // SAFETY: `page` was just allocated and mapped writable in the active
    // address space; `bytes` fits in one page on every caller.
    unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), page as *mut u8, bytes.len());
    }
}

/// Lay out the user-mode half of a thread: argument and environment
/// strings, their pointer arrays, the signal-return trampoline, and the
/// stack, all above `highest` (plus a guard page) and below the user
/// limit. Must run with the thread's address space active.
///
/// Returns the new high-water mark; the thread's watermark and argument
/// registers are updated in place.
pub fn set_context(
    thread: &Arc<Thread>,
    entry: u64,
    highest: u64,
    argv: &[&str],
    envp: &[&str],
) -> Result<u64, Errno> {
    let mut cursor = align_up(highest, PAGE_SIZE as u64) + PAGE_SIZE as u64;

    let string_page = |s: &str, cursor: &mut u64| -> Result<u64, Errno> {
        if s.len() >= PAGE_SIZE {
            return Err(Errno::ArgumentListTooLong);
        }
        let page = memory::virt::allocate(
            *cursor,
            memory::USER_LIMIT,
            1,
            VmFlags::USER | VmFlags::WRITE,
        );
        if page == 0 {
            return Err(Errno::OutOfMemory);
        }
        copy_to_user_page(page, s.as_bytes());
        // NUL terminator: the page arrives zeroed.
        *cursor = page + PAGE_SIZE as u64;
        Ok(page)
    };

    let mut argv_ptrs: alloc::vec::Vec<u64> = alloc::vec::Vec::with_capacity(argv.len() + 1);
    for s in argv {
        argv_ptrs.push(string_page(s, &mut cursor)?);
    }
    argv_ptrs.push(0);

    let mut envp_ptrs: alloc::vec::Vec<u64> = alloc::vec::Vec::with_capacity(envp.len() + 1);
    for s in envp {
        envp_ptrs.push(string_page(s, &mut cursor)?);
    }
    envp_ptrs.push(0);

    let array_page = |ptrs: &[u64], cursor: &mut u64| -> Result<u64, Errno> {
        if ptrs.len() > PAGE_SIZE / 8 {
            return Err(Errno::ArgumentListTooLong);
        }
        let page = memory::virt::allocate(
            *cursor,
            memory::USER_LIMIT,
            1,
            VmFlags::USER | VmFlags::WRITE,
        );
        if page == 0 {
            return Err(Errno::OutOfMemory);
        }
        // SAFETY: freshly mapped writable page in the active space.
        unsafe {
            core::ptr::copy_nonoverlapping(ptrs.as_ptr(), page as *mut u64, ptrs.len());
        }
        *cursor = page + PAGE_SIZE as u64;
        Ok(page)
    };

    let argv_array = array_page(&argv_ptrs, &mut cursor)?;
    let envp_array = array_page(&envp_ptrs, &mut cursor)?;

    // Signal-return trampoline.
    let tramp = memory::virt::allocate(
        cursor,
        memory::USER_LIMIT,
        1,
        VmFlags::USER | VmFlags::WRITE | VmFlags::EXEC,
    );
    if tramp == 0 {
        return Err(Errno::OutOfMemory);
    }
    copy_to_user_page(tramp, &trampoline_code());
    cursor = tramp + PAGE_SIZE as u64;
    thread
        .signal_trampoline
        .store(tramp, core::sync::atomic::Ordering::Release);

    // Stack, preceded by an unmapped guard page.
    cursor += PAGE_SIZE as u64;
    let stack = memory::virt::allocate(
        cursor,
        memory::USER_LIMIT,
        STACK_PAGES,
        VmFlags::USER | VmFlags::WRITE,
    );
    if stack == 0 {
        return Err(Errno::OutOfMemory);
    }
    let stack_top = stack + THREAD_STACK_SIZE as u64;

    // SAFETY: caller holds the scheduler lock; the thread is not running.
    let ctx = unsafe { &mut **thread.context.get() };
    ctx.regs.rip = entry;
    ctx.regs.rsp = stack_top;
    ctx.regs.rdi = argv_array;
    ctx.regs.rsi = envp_array;
    ctx.regs.cs = USER_CS;
    ctx.regs.ss = USER_SS;
    ctx.regs.rflags = RFLAGS_IF;

    thread
        .highest
        .store(stack_top, core::sync::atomic::Ordering::Release);
    Ok(stack_top)
}

/// Duplicate `parent` into `child`: byte-copy of the register file and
/// bitmap, plus a new root whose upper half aliases the kernel and whose
/// lower half is a private deep copy of the parent's user memory.
pub fn clone_context(child: &mut Context, parent: &Context) -> Result<(), Errno> {
    child.regs = parent.regs;
    child.io_bitmap = parent.io_bitmap;
    child.io_default = parent.io_default;
    child.kstack_base = 0;
    child.kstack_pages = 0;

    child.cr3 = paging::clone_kernel_space().ok_or(Errno::OutOfMemory)?;
    if paging::clone_user_space(child.cr3, parent.cr3).is_err() {
        paging::free_user_space(child.cr3);
        child.cr3 = 0;
        return Err(Errno::OutOfMemory);
    }
    Ok(())
}

/// Save trap state into a context.
#[inline]
pub fn save_context(ctx: &mut Context, frame: &TrapFrame) {
    ctx.regs = *frame;
}

/// Write the syscall return register of a saved context.
#[inline]
pub fn set_context_return(ctx: &mut Context, value: u64) {
    ctx.regs.rax = value;
}

/// Switch only the address space to the one owned by `ctx`.
pub fn use_context(ctx: &Context) {
    let target = PhysFrame::containing_address(PhysAddr::new(ctx.cr3));
    let (current, _) = Cr3::read();
    if current != target {
        // SAFETY: ctx.cr3 was produced by clone_kernel_space and carries
        // the full kernel half.
        unsafe {
            Cr3::write(target, Cr3Flags::empty());
        }
    }
}

/// Resume a thread. Never returns.
///
/// # Safety
///
/// `ctx` must hold a complete register file and a live address-space
/// root. Interrupts must be disabled; the IRETQ frame re-enables them.
pub unsafe fn load_context(ctx: &Context) -> ! {
    use_context(ctx);
    tss::load_io_bitmap(&ctx.io_bitmap, ctx.io_default);
    unsafe { restore_registers(&ctx.regs) }
}

/// Pop a full register file and IRETQ into the thread.
#[unsafe(naked)]
unsafe extern "C" fn restore_registers(_regs: *const RegisterFile) -> ! {
    core::arch::naked_asm!(
        "mov rsp, rdi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
    );
}

/// Release everything a dead thread's context owns: every user page and
/// table page up to the watermark, the root itself, and the kernel stack
/// if the context had one.
pub fn clean_thread(ctx: &mut Context, _highest: u64) {
    if ctx.cr3 != 0 {
        paging::free_user_space(ctx.cr3);
        ctx.cr3 = 0;
    }
    if ctx.kstack_base != 0 {
        memory::virt::free(ctx.kstack_base, ctx.kstack_pages);
        ctx.kstack_base = 0;
        ctx.kstack_pages = 0;
    }
}

/// Materialise the thread's syscall slot from its saved context: function
/// number from RBX, four parameters from the argument registers. Clears
/// the busy and retry flags.
pub fn create_syscall_context(thread: &Arc<Thread>) {
    // SAFETY: caller is the trap path for this very thread; the context
    // was just saved and nothing else touches the slot while the thread
    // is trapped.
    unsafe {
        let ctx = &**thread.context.get();
        let req = &mut *thread.syscall.get();
        req.tid = thread.tid;
        req.function = ctx.regs.rbx;
        req.params = [ctx.regs.rdi, ctx.regs.rsi, ctx.regs.rdx, ctx.regs.rcx];
        req.ret = 0;
        req.busy = false;
        req.retry = false;
        req.unblock = false;
        req.progress = 0;
    }
}

#[inline]
fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}
