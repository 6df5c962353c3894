//! Socket data transfer: send and recv.
//!
//! Messages are discrete for all three socket types and preserve send
//! order between a connected pair. A send lands on the *peer's* inbound
//! ring; the ring bound is the same buffer seen from either end, so a
//! full peer ring is what "outbound full" means to the sender.

use super::socket::{self, SocketMessage, MSG_PEEK};
use crate::process::thread::Thread;
use crate::syscall::errno::Errno;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Queue `data` on the connected peer's inbound ring.
///
/// Returns the number of bytes queued, `WouldBlock` when the ring is at
/// capacity (the syscall layer blocks or fails depending on the
/// descriptor), or an error for unconnected or foreign-family sockets.
pub fn send(
    t: Option<&Arc<Thread>>,
    fd: usize,
    data: &[u8],
    _flags: u32,
) -> Result<usize, Errno> {
    let this = socket::resolve(t, fd)?;

    let peer_index = this
        .state
        .lock()
        .peer
        .ok_or(Errno::DestinationRequired)?;
    let peer = socket::by_index(peer_index).ok_or(Errno::NotConnected)?;

    let family = this.state.lock().address.family;
    if family != socket::AF_UNIX {
        return Err(Errno::NotConnected);
    }

    let mut pstate = peer.state.lock();
    if pstate.inbound.len() >= pstate.inbound_max {
        return Err(Errno::WouldBlock);
    }

    let mut message = Vec::new();
    if message.try_reserve_exact(data.len()).is_err() {
        return Err(Errno::NoBuffers);
    }
    message.extend_from_slice(data);
    pstate.inbound.push_back(SocketMessage { data: message });
    Ok(data.len())
}

/// Take (or, with `MSG_PEEK`, copy) the head message of this socket's
/// inbound ring into `buf`. Longer messages are truncated to `buf`.
///
/// Returns `WouldBlock` when the ring is empty.
pub fn recv(
    t: Option<&Arc<Thread>>,
    fd: usize,
    buf: &mut [u8],
    flags: u32,
) -> Result<usize, Errno> {
    let this = socket::resolve(t, fd)?;

    {
        let state = this.state.lock();
        if state.peer.is_none() {
            return Err(Errno::DestinationRequired);
        }
        if state.address.family != socket::AF_UNIX {
            return Err(Errno::NotConnected);
        }
    }

    let mut state = this.state.lock();
    let Some(head) = state.inbound.front() else {
        return Err(Errno::WouldBlock);
    };

    let n = head.data.len().min(buf.len());
    buf[..n].copy_from_slice(&head.data[..n]);

    if flags & MSG_PEEK == 0 {
        state.inbound.pop_front();
    }
    Ok(n)
}

/// Occupancy of this socket's inbound ring (self-test support).
pub fn inbound_len(t: Option<&Arc<Thread>>, fd: usize) -> Result<usize, Errno> {
    let sock = socket::resolve(t, fd)?;
    let len = sock.state.lock().inbound.len();
    Ok(len)
}
