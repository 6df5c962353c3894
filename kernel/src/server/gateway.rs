//! The kernel's end of the server protocol.
//!
//! `server_init` opens the well-known kernel socket; lumen and the
//! subsystem servers connect to it. `request_server` relays a framed
//! command on behalf of a blocked thread and files it in the pending
//! table under a fresh id; `server_idle`, run by the kernel worker,
//! accepts new connections, answers general requests, and matches
//! responses back to their requesters.

use super::message::{
    MessageHeader, ResponseHeader, COMMAND_READ, COMMAND_STAT, MAX_GENERAL_COMMAND,
    MAX_SYSCALL_COMMAND, SERVER_MAX_SIZE,
};
use crate::arch::x86_64::context;
use crate::ipc::socket::{self, SocketAddress, MSG_PEEK, SOCK_DGRAM, SOCK_NONBLOCK};
use crate::ipc::{connection, sockio};
use crate::memory::UserSliceWrite;
use crate::process::thread::{Thread, ThreadState, Tid};
use crate::process::{get_thread, sched_lock, thread_use_context};
use crate::sync::{set_local_sched, SpinLock};
use crate::syscall::errno::Errno;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use zerocopy::FromBytes;

/// Well-known address of the kernel's listening socket. Not a real file.
pub const SERVER_KERNEL_PATH: &str = "lucerne://kernel";
/// Address lumen binds for its own listener.
pub const SERVER_LUMEN_PATH: &str = "lucerne://lumen";
/// Cap on simultaneously connected servers.
pub const SERVER_MAX_CONNECTIONS: usize = 512;

struct ServerState {
    kernel_socket: usize,
    lumen_socket: usize,
    lumen_connected: bool,
    connections: Vec<usize>,
}

static SERVER: SpinLock<ServerState> = SpinLock::new(ServerState {
    kernel_socket: 0,
    lumen_socket: 0,
    lumen_connected: false,
    connections: Vec::new(),
});

/// In-flight relayed requests: id → requesting TID.
static PENDING: SpinLock<BTreeMap<u64, Tid>> = SpinLock::new(BTreeMap::new());
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Open, bind, and listen on the kernel socket. Runs under the kernel
/// PID before lumen is spawned; failure here is fatal.
pub fn server_init() {
    let fd = match socket::socket(None, socket::AF_UNIX, SOCK_DGRAM | SOCK_NONBLOCK, 0) {
        Ok(fd) => fd as usize,
        Err(e) => {
            log::error!("failed to open kernel socket: {}", e);
            crate::arch::x86_64::halt_forever();
        }
    };

    let addr = SocketAddress::local(SERVER_KERNEL_PATH);
    if let Err(e) = socket::bind(None, fd, &addr, core::mem::size_of::<SocketAddress>()) {
        log::error!("failed to bind kernel socket: {}", e);
        crate::arch::x86_64::halt_forever();
    }
    if let Err(e) = connection::listen(None, fd, SERVER_MAX_CONNECTIONS) {
        log::error!("failed to listen on kernel socket: {}", e);
        crate::arch::x86_64::halt_forever();
    }

    SERVER.lock().kernel_socket = fd;
    log::debug!(
        "kernel is listening on socket {}: {}",
        fd,
        SERVER_KERNEL_PATH
    );
}

/// Relay a framed command for `thread` and file it as pending.
///
/// `sd` of 0 targets the lumen router; any other value is a previously
/// accepted connection to a specific server. The thread stays blocked;
/// the reply pump wakes it when the response arrives.
pub fn request_server(thread: &Arc<Thread>, sd: usize, mut msg: Vec<u8>) -> Result<(), Errno> {
    if msg.len() < core::mem::size_of::<MessageHeader>() || msg.len() > SERVER_MAX_SIZE {
        return Err(Errno::InvalidArgument);
    }

    let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
    {
        let header = MessageHeader::mut_from_prefix(&mut msg).ok_or(Errno::InvalidArgument)?;
        header.id = id;
        header.requester = thread.tid as u64;
    }
    // SAFETY: the caller is the worker servicing this request (busy set),
    // so the slot is exclusively ours.
    unsafe {
        (*thread.syscall.get()).request_id = id;
    }

    let dest = if sd == 0 {
        let server = SERVER.lock();
        if !server.lumen_connected {
            return Err(Errno::NotConnected);
        }
        server.lumen_socket
    } else {
        sd
    };

    PENDING.lock().insert(id, thread.tid);

    match sockio::send(None, dest, &msg, 0) {
        Ok(n) if n == msg.len() => Ok(()),
        Ok(_) => {
            PENDING.lock().remove(&id);
            Err(Errno::NoBuffers)
        }
        Err(e) => {
            PENDING.lock().remove(&id);
            Err(e)
        }
    }
}

/// One pass of the reply pump: accept a pending connection, then drain
/// every connected socket. Run by the kernel worker between queue
/// drains.
pub fn server_idle() {
    set_local_sched(false);

    let kernel_socket = SERVER.lock().kernel_socket;
    if let Ok((fd, _addr, _len)) = connection::accept(None, kernel_socket) {
        let mut server = SERVER.lock();
        if server.connections.len() < SERVER_MAX_CONNECTIONS {
            server.connections.push(fd as usize);
            if !server.lumen_connected {
                server.lumen_connected = true;
                server.lumen_socket = fd as usize;
                log::debug!("connected to lumen at socket {}", fd);
            }
        }
    }

    let connections = SERVER.lock().connections.clone();
    for fd in connections {
        drain_connection(fd);
    }

    set_local_sched(true);
}

/// Read every complete message waiting on one connection.
fn drain_connection(fd: usize) {
    loop {
        // Peek the header first to learn the full length.
        let mut head = [0u8; core::mem::size_of::<MessageHeader>()];
        let n = match sockio::recv(None, fd, &mut head, MSG_PEEK) {
            Ok(n) => n,
            Err(_) => return,
        };
        if n < head.len() {
            return;
        }
        let Some(header) = MessageHeader::read_from(&head[..]) else {
            return;
        };

        let total = (header.length as usize)
            .clamp(core::mem::size_of::<MessageHeader>(), SERVER_MAX_SIZE);
        let mut msg = alloc::vec![0u8; total];
        match sockio::recv(None, fd, &mut msg, 0) {
            Ok(_) => {}
            Err(_) => return,
        }

        if header.command <= MAX_GENERAL_COMMAND {
            super::general::handle_general_request(fd, &msg);
        } else if (0x8000..=MAX_SYSCALL_COMMAND).contains(&header.command)
            && header.response != 0
        {
            handle_syscall_response(&msg);
        } else {
            log::warn!(
                "unimplemented message command {:#06x}, dropping",
                header.command
            );
        }
    }
}

/// Match a server response to its pending request, copy any response
/// payload to the requester, and wake the thread.
fn handle_syscall_response(msg: &[u8]) {
    let Some(resp) = ResponseHeader::read_from_prefix(msg) else {
        return;
    };
    let id = resp.header.id;

    let Some(tid) = PENDING.lock().remove(&id) else {
        log::warn!(
            "response for command {:#06x} id {} matches no pending request",
            resp.header.command,
            id
        );
        return;
    };
    let Some(thread) = get_thread(tid) else {
        return;
    };

    // SAFETY: the thread is blocked on this very request; the slot has
    // no other writer until we unblock it below.
    let request_id = unsafe { (*thread.syscall.get()).request_id };
    if request_id != id {
        log::warn!(
            "response id {} mismatches in-flight request {} of tid {}; terminating thread",
            id,
            request_id,
            tid
        );
        let mut sched = sched_lock();
        sched.terminate_thread(tid, -1, false);
        return;
    }

    // Read data (and stat buffers) ride after the status word; land them
    // in the requester's buffer before it wakes.
    let payload = &msg[core::mem::size_of::<ResponseHeader>().min(msg.len())..];
    let status = resp.status as i64;
    if !payload.is_empty() && status >= 0 {
        // SAFETY: blocked thread's slot, as above.
        let (dest, cap) = unsafe {
            let req = &*thread.syscall.get();
            (req.params[1], req.params[2] as usize)
        };
        let n = match resp.header.command {
            COMMAND_READ => payload.len().min(status as usize).min(cap),
            COMMAND_STAT => payload.len(),
            _ => 0,
        };
        if n > 0 && dest != 0 && thread_use_context(tid).is_ok() {
            if let Ok(out) = UserSliceWrite::new(dest, n) {
                out.copy_from(&payload[..n]);
            }
        }
    }

    let mut sched = sched_lock();
    // SAFETY: scheduler lock held.
    unsafe {
        let req = &mut *thread.syscall.get();
        req.ret = resp.status;
        req.unblock = true;
        req.busy = false;
        req.retry = false;
        context::set_context_return(&mut **thread.context.get(), resp.status);
        if *thread.state.get() == ThreadState::Blocked {
            sched.unblock(tid);
        }
    }
}

/// Connection fd for a named server, if one is connected (matched by the
/// peer's bound address).
pub fn server_socket(path: &str) -> Option<usize> {
    let connections = SERVER.lock().connections.clone();
    let want = SocketAddress::local(path);
    for fd in connections {
        let Ok(sock) = socket::resolve(None, fd) else {
            continue;
        };
        let peer = sock.state.lock().peer;
        if let Some(peer) = peer.and_then(socket::by_index) {
            if peer.state.lock().address.path_eq(&want) {
                return Some(fd);
            }
        }
    }
    None
}

/// Pending-table size (self-test support).
pub fn pending_count() -> usize {
    PENDING.lock().len()
}
