//! Socket syscall handlers (fast path).
//!
//! These run inline at trap time on the calling CPU, inside the
//! requester's address space. Would-block outcomes on blocking sockets
//! turn into a retry through the global queue instead of an error.

use super::errno::{encode, Errno};
use super::request::SyscallRequest;
use crate::ipc::{connection, socket, sockio, ConnectProgress};
use crate::ipc::socket::{SocketAddress, MSG_PEEK, MSG_WAITALL, SOCK_PATH_MAX};
use crate::memory::{UserSliceRead, UserSliceWrite};
use crate::process::{get_thread, Thread};
use alloc::sync::Arc;

/// Read a `sockaddr` image from user memory.
fn read_sockaddr(ptr: u64, len: u64) -> Result<(SocketAddress, usize), Errno> {
    let len = len as usize;
    if len < 2 || len > 2 + SOCK_PATH_MAX {
        return Err(Errno::InvalidArgument);
    }
    let slice = UserSliceRead::new(ptr, len).map_err(Errno::from)?;
    let mut raw = [0u8; 2 + SOCK_PATH_MAX];
    slice.copy_to(&mut raw[..len]);

    let mut addr = SocketAddress::empty();
    addr.family = u16::from_ne_bytes([raw[0], raw[1]]);
    addr.path[..len - 2].copy_from_slice(&raw[2..len]);
    Ok((addr, len))
}

/// Write a `sockaddr` image back to user memory, honouring the caller's
/// in/out length pointer.
fn write_sockaddr(addr_ptr: u64, len_ptr: u64, addr: &SocketAddress) -> Result<(), Errno> {
    if addr_ptr == 0 || len_ptr == 0 {
        return Ok(());
    }
    let len_in = {
        let slice = UserSliceRead::new(len_ptr, 8).map_err(Errno::from)?;
        let mut b = [0u8; 8];
        slice.copy_to(&mut b);
        u64::from_ne_bytes(b) as usize
    };

    let mut raw = [0u8; 2 + SOCK_PATH_MAX];
    raw[..2].copy_from_slice(&addr.family.to_ne_bytes());
    raw[2..].copy_from_slice(&addr.path);
    let n = len_in.min(raw.len());

    UserSliceWrite::new(addr_ptr, n)
        .map_err(Errno::from)?
        .copy_from(&raw[..n]);
    UserSliceWrite::new(len_ptr, 8)
        .map_err(Errno::from)?
        .copy_from(&(n as u64).to_ne_bytes());
    Ok(())
}

fn requester(req: &SyscallRequest) -> Option<Arc<Thread>> {
    get_thread(req.tid)
}

/// SYS_SOCKET.
pub fn sys_socket(req: &mut SyscallRequest) {
    let Some(thread) = requester(req) else {
        return;
    };
    req.ret = encode(socket::socket(
        Some(&thread),
        req.params[0] as u16,
        req.params[1] as u32,
        req.params[2] as u32,
    ));
    req.unblock = true;
}

/// SYS_BIND.
pub fn sys_bind(req: &mut SyscallRequest) {
    let Some(thread) = requester(req) else {
        return;
    };
    req.ret = encode(
        read_sockaddr(req.params[1], req.params[2]).and_then(|(addr, len)| {
            socket::bind(Some(&thread), req.params[0] as usize, &addr, len)
        }),
    );
    req.unblock = true;
}

/// SYS_LISTEN.
pub fn sys_listen(req: &mut SyscallRequest) {
    let Some(thread) = requester(req) else {
        return;
    };
    req.ret = encode(connection::listen(
        Some(&thread),
        req.params[0] as usize,
        req.params[1] as usize,
    ));
    req.unblock = true;
}

/// SYS_CONNECT: parks in the listener's backlog and blocks until an
/// accept pairs us (retried through the queue).
pub fn sys_connect(req: &mut SyscallRequest) {
    let Some(thread) = requester(req) else {
        return;
    };
    let fd = req.params[0] as usize;

    let addr = match read_sockaddr(req.params[1], req.params[2]) {
        Ok((addr, _)) => addr,
        Err(e) => {
            req.ret = e.to_ret();
            req.unblock = true;
            return;
        }
    };

    match connection::connect(Some(&thread), fd, &addr) {
        Ok(ConnectProgress::Connected) => {
            req.ret = 0;
            req.unblock = true;
        }
        Ok(ConnectProgress::Pending) => {
            req.retry = true;
            req.unblock = false;
        }
        Err(e) => {
            req.ret = e.to_ret();
            req.unblock = true;
        }
    }
}

/// SYS_ACCEPT: dequeue a pending connector, or block (fail when the
/// socket is non-blocking).
pub fn sys_accept(req: &mut SyscallRequest) {
    let Some(thread) = requester(req) else {
        return;
    };
    let fd = req.params[0] as usize;

    match connection::accept(Some(&thread), fd) {
        Ok((new_fd, peer_addr, _len)) => {
            if let Err(e) = write_sockaddr(req.params[1], req.params[2], &peer_addr) {
                req.ret = e.to_ret();
            } else {
                req.ret = new_fd;
            }
            req.unblock = true;
        }
        Err(Errno::WouldBlock) => {
            if socket::fd_nonblocking(Some(&thread), fd) {
                req.ret = Errno::WouldBlock.to_ret();
                req.unblock = true;
            } else {
                req.retry = true;
                req.unblock = false;
            }
        }
        Err(e) => {
            req.ret = e.to_ret();
            req.unblock = true;
        }
    }
}

/// SYS_SEND. Shared with the write fast path for socket descriptors.
pub fn do_send(req: &mut SyscallRequest, flags: u32) {
    let Some(thread) = requester(req) else {
        return;
    };
    let fd = req.params[0] as usize;
    let len = req.params[2] as usize;

    let data = match UserSliceRead::new(req.params[1], len) {
        Ok(slice) => slice.read_to_vec(),
        Err(e) => {
            req.ret = Errno::from(e).to_ret();
            req.unblock = true;
            return;
        }
    };

    match sockio::send(Some(&thread), fd, &data, flags) {
        Ok(n) => {
            req.ret = n as u64;
            req.unblock = true;
        }
        Err(Errno::WouldBlock) => {
            if socket::fd_nonblocking(Some(&thread), fd) {
                // Nothing was enqueued; occupancy is untouched.
                req.ret = Errno::WouldBlock.to_ret();
                req.unblock = true;
            } else {
                req.retry = true;
                req.unblock = false;
            }
        }
        Err(e) => {
            req.ret = e.to_ret();
            req.unblock = true;
        }
    }
}

pub fn sys_send(req: &mut SyscallRequest) {
    let flags = req.params[3] as u32;
    do_send(req, flags);
}

/// SYS_RECV. Shared with the read fast path for socket descriptors.
///
/// `MSG_WAITALL` accumulates across retries using the request's progress
/// counter until the requested length is reached or the peer closes.
pub fn do_recv(req: &mut SyscallRequest, flags: u32) {
    let Some(thread) = requester(req) else {
        return;
    };
    let fd = req.params[0] as usize;
    let buf_ptr = req.params[1];
    let want = req.params[2] as usize;
    let waitall = flags & MSG_WAITALL != 0 && flags & MSG_PEEK == 0;

    loop {
        let done = req.progress as usize;
        if done >= want {
            break;
        }

        let mut chunk = alloc::vec![0u8; want - done];
        match sockio::recv(Some(&thread), fd, &mut chunk, flags) {
            Ok(n) => {
                match UserSliceWrite::new(buf_ptr + done as u64, n) {
                    Ok(out) => {
                        out.copy_from(&chunk[..n]);
                    }
                    Err(e) => {
                        req.ret = Errno::from(e).to_ret();
                        req.unblock = true;
                        return;
                    }
                }
                req.progress += n as u64;
                if !waitall {
                    break;
                }
            }
            Err(Errno::WouldBlock) => {
                let sock = match socket::resolve(Some(&thread), fd) {
                    Ok(s) => s,
                    Err(e) => {
                        req.ret = e.to_ret();
                        req.unblock = true;
                        return;
                    }
                };
                if req.progress > 0 && (!waitall || socket::peer_closed(&sock)) {
                    // Deliver what we have.
                    break;
                }
                if req.progress == 0 && socket::fd_nonblocking(Some(&thread), fd) {
                    req.ret = Errno::WouldBlock.to_ret();
                    req.unblock = true;
                    return;
                }
                if req.progress == 0 && !waitall {
                    // Plain blocking recv with nothing queued yet.
                    req.retry = true;
                    req.unblock = false;
                    return;
                }
                if waitall && !socket::peer_closed(&sock) {
                    // Partial fill; keep waiting for the rest.
                    req.retry = true;
                    req.unblock = false;
                    return;
                }
                break;
            }
            Err(e) => {
                req.ret = e.to_ret();
                req.unblock = true;
                return;
            }
        }
    }

    req.ret = req.progress;
    req.unblock = true;
}

pub fn sys_recv(req: &mut SyscallRequest) {
    let flags = req.params[3] as u32;
    do_recv(req, flags);
}

/// SYS_SOCKCLOSE.
pub fn sys_sockclose(req: &mut SyscallRequest) {
    let Some(thread) = requester(req) else {
        return;
    };
    req.ret = encode(socket::close_socket(Some(&thread), req.params[0] as usize));
    req.unblock = true;
}
