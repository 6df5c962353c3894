//! Socket connection establishment: connect, listen, accept.
//!
//! None of these block in here. A connector that must wait (listener
//! backlog full, or parked waiting to be accepted) reports
//! [`ConnectProgress::Pending`] and the syscall layer re-queues the
//! request until it resolves; accept reports would-block and the caller
//! decides between failing (non-blocking sockets) and retrying.

use super::socket::{self, SocketAddress, SocketDescriptor, SOCKET_DEFAULT_BACKLOG};
use crate::process::thread::Thread;
use crate::process::IoKind;
use crate::syscall::errno::Errno;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

/// Outcome of a connect attempt that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectProgress {
    /// Paired with the peer; the call is complete.
    Connected,
    /// Parked in the listener's backlog (or waiting for backlog space);
    /// retry until an accept picks us up.
    Pending,
}

/// Begin or continue a connection to the socket bound at `addr`.
pub fn connect(
    t: Option<&Arc<Thread>>,
    fd: usize,
    addr: &SocketAddress,
) -> Result<ConnectProgress, Errno> {
    let this = socket::resolve(t, fd)?;

    // A retry after accept() paired us: done.
    {
        let state = this.state.lock();
        if state.peer.is_some() {
            return Ok(ConnectProgress::Connected);
        }
        if state.connecting {
            return Ok(ConnectProgress::Pending);
        }
    }

    let peer = socket::get_local_socket(addr).ok_or(Errno::AddressNotAvailable)?;

    // Never hold both descriptor locks at once: a crossed pair of
    // connects would deadlock.
    let this_family = this.state.lock().address.family;

    {
        let mut peer_state = peer.state.lock();
        if this_family != peer_state.address.family {
            return Err(Errno::FamilyNotSupported);
        }
        if !peer_state.listener || peer_state.backlog_max == 0 {
            // Bound but not listening: nothing will ever accept us.
            return Err(Errno::ConnectionRefused);
        }
        if peer_state.backlog.len() >= peer_state.backlog_max {
            // Backlog full: wait for accept to drain it, don't reject.
            return Ok(ConnectProgress::Pending);
        }
        peer_state.backlog.push_back(this.global_index);
    }

    this.state.lock().connecting = true;
    Ok(ConnectProgress::Pending)
}

/// Mark a socket as a listener with the given backlog capacity (zero
/// selects the default; the default is also the cap).
pub fn listen(t: Option<&Arc<Thread>>, fd: usize, backlog: usize) -> Result<u64, Errno> {
    let sock = socket::resolve(t, fd)?;
    let mut state = sock.state.lock();
    state.backlog.clear();
    state.backlog_max = if backlog > 0 {
        backlog.min(SOCKET_DEFAULT_BACKLOG)
    } else {
        SOCKET_DEFAULT_BACKLOG
    };
    state.listener = true;
    Ok(0)
}

/// Accept the first pending connection on a listener.
///
/// Creates a fresh descriptor in the calling process, pairs it with the
/// dequeued connector, and returns `(fd, peer address, address length)`.
/// Returns `WouldBlock` when the backlog is empty; the caller blocks or
/// fails depending on the socket's non-blocking flag.
pub fn accept(
    t: Option<&Arc<Thread>>,
    fd: usize,
) -> Result<(u64, SocketAddress, usize), Errno> {
    let listener = socket::resolve(t, fd)?;

    let (connector_index, listener_addr, sock_type, protocol) = {
        let mut state = listener.state.lock();
        if !state.listener || state.backlog_max == 0 {
            return Err(Errno::InvalidArgument);
        }
        let Some(index) = state.backlog.pop_front() else {
            return Err(Errno::WouldBlock);
        };
        (index, state.address, state.sock_type, state.protocol)
    };

    let Some(connector) = socket::by_index(connector_index) else {
        // The connector died while parked.
        return Err(Errno::ConnectionAborted);
    };

    // New connected socket in the acceptor's process, inheriting the
    // listener's identity and flags.
    let flags = socket::fd_flags(t, fd)?;
    let new_fd = socket::socket(
        t,
        listener_addr.family,
        sock_type | (flags & (socket::SOCK_NONBLOCK | socket::SOCK_CLOEXEC)),
        protocol,
    )? as usize;
    let accepted = socket::resolve(t, new_fd)?;

    {
        let mut astate = accepted.state.lock();
        astate.address = listener_addr;
        astate.address_len = core::mem::size_of::<SocketAddress>();
        astate.peer = Some(connector.global_index);
    }
    let peer_addr = {
        let mut cstate = connector.state.lock();
        cstate.peer = Some(accepted.global_index);
        cstate.connecting = false;
        cstate.address
    };

    Ok((new_fd as u64, peer_addr, core::mem::size_of::<SocketAddress>()))
}

/// Was this descriptor created by `socket()` (still has the slot kind)?
/// Used by the read/write fast path to tell sockets from relayed files.
pub fn fd_is_socket(t: Option<&Arc<Thread>>, fd: usize) -> bool {
    let pid = match t {
        Some(thread) => thread.pid,
        None => crate::process::kernel_pid(),
    };
    let sched = crate::process::sched_lock();
    sched
        .processes
        .get(&pid)
        .and_then(|p| p.io_slot(fd))
        .map(|s| s.kind == IoKind::Socket)
        .unwrap_or(false)
}

/// Self-test support: backlog occupancy of a listener.
pub fn backlog_len(sock: &Arc<SocketDescriptor>) -> usize {
    sock.state.lock().backlog.len()
}

/// Self-test support: reference count of a descriptor.
pub fn refcount(sock: &Arc<SocketDescriptor>) -> usize {
    sock.refcount.load(Ordering::Acquire)
}
