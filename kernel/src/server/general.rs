//! General (kernel-intrinsic) request handlers.
//!
//! These are the few things user space asks the kernel for directly:
//! log output, system information, random numbers, I/O-port grants, and
//! the framebuffer hand-off. Only lumen and its immediate children may
//! issue them; anything else is silently dropped. Every path here holds
//! its locks through RAII guards, so no early return can leak one.

use super::message::{
    FramebufferResponse, IoRequest, LogCommand, MessageHeader, ResponseHeader, SysInfoResponse,
    COMMAND_FRAMEBUFFER, COMMAND_IO, COMMAND_LOG, COMMAND_RAND, COMMAND_SYSINFO,
};
use crate::arch::x86_64::paging::{self, PAGE_SIZE};
use crate::ipc::{socket, sockio};
use crate::memory::phys::{self, PhysMemoryStatus};
use crate::process::thread::Tid;
use crate::process::{lifecycle, sched_lock};
use crate::sync::SpinLock;
use crate::syscall::errno::Errno;
use core::sync::atomic::Ordering;
use x86_64::structures::paging::PageTableFlags;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Dispatch one general request arriving on connection `fd`.
pub fn handle_general_request(fd: usize, msg: &[u8]) {
    let Some(header) = MessageHeader::read_from_prefix(msg) else {
        return;
    };

    // Security boundary: general requests are a privilege of lumen and
    // its direct children. Everyone else's messages vanish.
    let Some(owner) = socket::peer_owner(None, fd) else {
        return;
    };
    if !lifecycle::is_lumen_or_child(owner) {
        log::debug!(
            "dropping general request {:#06x} from pid {}",
            header.command,
            owner
        );
        return;
    }

    match header.command {
        COMMAND_LOG => handle_log(msg),
        COMMAND_SYSINFO => reply(fd, sysinfo_response(&header).as_bytes()),
        COMMAND_RAND => {
            let resp = ResponseHeader {
                header: header.reply(core::mem::size_of::<ResponseHeader>()),
                status: rand64(),
            };
            reply(fd, resp.as_bytes());
        }
        COMMAND_IO => handle_io_request(fd, msg, &header),
        COMMAND_FRAMEBUFFER => handle_framebuffer_request(fd, &header),
        _ => {
            // PROCESS_IO / PROCESS_LIST / PROCESS_STATUS are not wired
            // up yet; answer so the server does not hang on us.
            let resp = ResponseHeader {
                header: header.reply(core::mem::size_of::<ResponseHeader>()),
                status: Errno::NotImplemented.to_ret(),
            };
            reply(fd, resp.as_bytes());
        }
    }
}

fn reply(fd: usize, bytes: &[u8]) {
    if let Err(e) = sockio::send(None, fd, bytes, 0) {
        log::warn!("failed to send server reply: {}", e);
    }
}

/// Relay a server's log line into the kernel log.
fn handle_log(msg: &[u8]) {
    let Some(cmd) = LogCommand::read_from_prefix(msg) else {
        return;
    };
    let server = cstr(&cmd.server);
    let text = cstr(&cmd.message);
    match cmd.level {
        0 => log::error!("{}: {}", server, text),
        1 => log::warn!("{}: {}", server, text),
        _ => log::info!("{}: {}", server, text),
    }
}

fn cstr(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    core::str::from_utf8(&bytes[..end]).unwrap_or("?")
}

fn sysinfo_response(header: &MessageHeader) -> SysInfoResponse {
    let mut status = PhysMemoryStatus::default();
    phys::status(&mut status);
    let (threads, processes) = {
        let sched = sched_lock();
        sched.counts()
    };

    let mut resp = SysInfoResponse::new_zeroed();
    resp.response.header = header.reply(core::mem::size_of::<SysInfoResponse>());
    resp.response.status = 0;
    let version = concat!("lucerne ", env!("CARGO_PKG_VERSION"));
    resp.kernel[..version.len()].copy_from_slice(version.as_bytes());
    resp.uptime = crate::process::ticks();
    resp.max_sockets = socket::MAX_SOCKETS as u32;
    resp.processes = processes as u32;
    resp.threads = threads as u32;
    resp.page_size = PAGE_SIZE as u32;
    resp.memory_size = status.usable_pages as u32;
    resp.memory_usage = status.used_pages as u32;
    resp
}

/// xorshift over a tick-seeded state; entropy quality is not a goal.
static RAND_STATE: SpinLock<u64> = SpinLock::new(0);

fn rand64() -> u64 {
    let mut state = RAND_STATE.lock();
    if *state == 0 {
        *state = crate::process::ticks() | 0x9E37_79B9_7F4A_7C15;
    }
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

/// Grant the requesting thread access to a run of I/O ports by clearing
/// their deny bits in its context bitmap. The new bitmap reaches the TSS
/// on the thread's next dispatch.
fn handle_io_request(fd: usize, msg: &[u8], header: &MessageHeader) {
    let status = (|| -> Result<u64, Errno> {
        let cmd = IoRequest::read_from_prefix(msg).ok_or(Errno::InvalidArgument)?;
        let base = cmd.base as usize;
        let count = cmd.count as usize;
        if count == 0 || base + count > 0x10000 {
            return Err(Errno::InvalidArgument);
        }

        let tid = header.requester as Tid;
        let sched = sched_lock();
        let thread = sched.threads.get(&tid).ok_or(Errno::NoSuchProcess)?;
        // SAFETY: scheduler lock held; the requester is blocked in the
        // syscall that carried this command.
        unsafe {
            let ctx = &mut **thread.context.get();
            for port in base..base + count {
                ctx.io_bitmap[port / 8] &= !(1 << (port % 8));
            }
            ctx.io_default = false;
        }
        Ok(0)
    })();

    let resp = ResponseHeader {
        header: header.reply(core::mem::size_of::<ResponseHeader>()),
        status: match status {
            Ok(v) => v,
            Err(e) => e.to_ret(),
        },
    };
    reply(fd, resp.as_bytes());
}

/// Map the boot framebuffer into the requester's address space and hand
/// back its user address and geometry.
fn handle_framebuffer_request(fd: usize, header: &MessageHeader) {
    let mut resp = FramebufferResponse::new_zeroed();
    resp.response.header = header.reply(core::mem::size_of::<FramebufferResponse>());

    let Some(fb) = crate::boot::limine::framebuffer_info() else {
        resp.response.status = Errno::NotImplemented.to_ret();
        reply(fd, resp.as_bytes());
        return;
    };

    let status = (|| -> Result<u64, Errno> {
        let tid = header.requester as Tid;
        let sched = sched_lock();
        let thread = sched.threads.get(&tid).ok_or(Errno::NoSuchProcess)?;

        let size = fb.pitch as usize * fb.height as usize;
        let pages = size.div_ceil(PAGE_SIZE);
        let base = (thread.highest.load(Ordering::Acquire) + PAGE_SIZE as u64 * 2)
            & !(PAGE_SIZE as u64 - 1);

        let flags = PageTableFlags::PRESENT
            | PageTableFlags::WRITABLE
            | PageTableFlags::USER_ACCESSIBLE
            | PageTableFlags::NO_EXECUTE;
        // SAFETY: scheduler lock held; the requester is blocked, its
        // root is stable, and the framebuffer frames are reserved RAM.
        let cr3 = unsafe { (**thread.context.get()).cr3 };
        for i in 0..pages {
            paging::map_page(
                cr3,
                base + (i * PAGE_SIZE) as u64,
                fb.phys_base + (i * PAGE_SIZE) as u64,
                flags,
            )
            .map_err(|_| Errno::OutOfMemory)?;
        }
        thread
            .highest
            .store(base + (pages * PAGE_SIZE) as u64, Ordering::Release);
        Ok(base)
    })();

    match status {
        Ok(base) => {
            resp.response.status = 0;
            resp.buffer = base;
            resp.width = fb.width;
            resp.height = fb.height;
            resp.pitch = fb.pitch;
            resp.bpp = fb.bpp;
        }
        Err(e) => {
            resp.response.status = e.to_ret();
        }
    }
    reply(fd, resp.as_bytes());
}
