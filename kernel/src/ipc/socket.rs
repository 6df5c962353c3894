//! Local (Unix-domain) socket descriptors and the global socket table.
//!
//! Sockets are the kernel's only IPC substrate: user programs talk to
//! each other over them, and the kernel itself talks to lumen and the
//! subsystem servers over one. A descriptor lives in the global table
//! under its `global_index`; processes refer to it through an I/O
//! descriptor slot holding that index. Peers and backlog entries are
//! also indices, never owning references.
//!
//! Lock order: scheduler lock → socket table lock → descriptor lock.

use crate::process::thread::{Pid, Thread};
use crate::process::IoKind;
use crate::sync::{IrqSpinLock, IrqSpinLockGuard};
use crate::syscall::errno::Errno;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

/// System-wide cap on live sockets.
pub const MAX_SOCKETS: usize = 1 << 18;
/// Default backlog for listeners that pass zero.
pub const SOCKET_DEFAULT_BACKLOG: usize = 1024;
/// Default depth of the inbound/outbound message rings.
pub const SOCKET_IO_BACKLOG: usize = 64;
/// Longest socket path, excluding the family tag.
pub const SOCK_PATH_MAX: usize = 512;

pub const AF_UNIX: u16 = 1;
pub const AF_LOCAL: u16 = AF_UNIX;

pub const SOCK_STREAM: u32 = 1;
pub const SOCK_DGRAM: u32 = 2;
pub const SOCK_SEQPACKET: u32 = 3;

pub const SOCK_NONBLOCK: u32 = 0x100;
pub const SOCK_CLOEXEC: u32 = 0x200;

pub const MSG_PEEK: u32 = 0x01;
pub const MSG_OOB: u32 = 0x02;
pub const MSG_WAITALL: u32 = 0x04;

/// A bound or peer address: family tag plus path bytes.
#[derive(Clone, Copy)]
pub struct SocketAddress {
    pub family: u16,
    pub path: [u8; SOCK_PATH_MAX],
}

impl SocketAddress {
    pub const fn empty() -> Self {
        SocketAddress {
            family: 0,
            path: [0; SOCK_PATH_MAX],
        }
    }

    pub fn local(path: &str) -> Self {
        let mut addr = SocketAddress::empty();
        addr.family = AF_UNIX;
        let n = path.len().min(SOCK_PATH_MAX - 1);
        addr.path[..n].copy_from_slice(&path.as_bytes()[..n]);
        addr
    }

    pub fn path_eq(&self, other: &SocketAddress) -> bool {
        self.family == other.family && self.path == other.path
    }
}

/// One queued message: the payload buffer owns its bytes, the length is
/// carried alongside so truncating receives can report the original.
pub struct SocketMessage {
    pub data: Vec<u8>,
}

/// Mutable socket state, behind the per-descriptor lock.
pub struct SocketState {
    pub address: SocketAddress,
    pub address_len: usize,
    pub listener: bool,
    pub sock_type: u32,
    pub protocol: u32,
    /// Pending connectors (global indices), FIFO.
    pub backlog: VecDeque<usize>,
    pub backlog_max: usize,
    /// Messages waiting to be received on this socket.
    pub inbound: VecDeque<SocketMessage>,
    pub inbound_max: usize,
    /// Send-side bound; one buffer observed from the other end.
    pub outbound_max: usize,
    /// Connected peer's global index.
    pub peer: Option<usize>,
    /// A connect() is parked in some listener's backlog.
    pub connecting: bool,
}

pub struct SocketDescriptor {
    /// Owning process.
    pub owner: Pid,
    /// Slot in the global socket table.
    pub global_index: usize,
    pub refcount: AtomicUsize,
    pub state: IrqSpinLock<SocketState>,
}

impl SocketDescriptor {
    fn new(owner: Pid, index: usize, domain: u16, sock_type: u32, protocol: u32) -> Arc<Self> {
        let mut address = SocketAddress::empty();
        address.family = domain;
        Arc::new(SocketDescriptor {
            owner,
            global_index: index,
            refcount: AtomicUsize::new(1),
            state: IrqSpinLock::new(SocketState {
                address,
                address_len: 0,
                listener: false,
                sock_type,
                protocol,
                backlog: VecDeque::new(),
                backlog_max: 0,
                inbound: VecDeque::new(),
                inbound_max: SOCKET_IO_BACKLOG,
                outbound_max: SOCKET_IO_BACKLOG,
                peer: None,
                connecting: false,
            }),
        })
    }
}

struct SocketTable {
    slots: Vec<Option<Arc<SocketDescriptor>>>,
    count: usize,
}

static SOCKETS: IrqSpinLock<SocketTable> = IrqSpinLock::new(SocketTable {
    slots: Vec::new(),
    count: 0,
});

/// Initialize the socket subsystem.
pub fn socket_init() {
    let mut table = SOCKETS.lock();
    table.slots.clear();
    table.count = 0;
    log::info!("ipc: socket table ready (max {})", MAX_SOCKETS);
}

/// Take the socket table lock.
fn table_lock() -> IrqSpinLockGuard<'static, SocketTable> {
    SOCKETS.lock()
}

/// Register a descriptor; fails when the table is at its cap.
fn register(table: &mut SocketTable, make: impl FnOnce(usize) -> Arc<SocketDescriptor>) -> Result<usize, Errno> {
    if table.count >= MAX_SOCKETS {
        return Err(Errno::NoBuffers);
    }
    let index = table
        .slots
        .iter()
        .position(|s| s.is_none())
        .unwrap_or_else(|| {
            table.slots.push(None);
            table.slots.len() - 1
        });
    table.slots[index] = Some(make(index));
    table.count += 1;
    Ok(index)
}

/// Look up a descriptor by global index.
pub fn by_index(index: usize) -> Option<Arc<SocketDescriptor>> {
    table_lock().slots.get(index).and_then(|s| s.clone())
}

/// Find the bound socket with this address.
pub fn get_local_socket(addr: &SocketAddress) -> Option<Arc<SocketDescriptor>> {
    let table = table_lock();
    for slot in table.slots.iter().flatten() {
        let state = slot.state.lock();
        if state.address_len != 0 && state.address.path_eq(addr) {
            return Some(slot.clone());
        }
    }
    None
}

/// Resolve `(t, fd)` to the socket behind a process's descriptor slot.
/// `t = None` means the kernel process.
pub fn resolve(t: Option<&Arc<Thread>>, fd: usize) -> Result<Arc<SocketDescriptor>, Errno> {
    let pid = owner_pid(t);
    let index = {
        let sched = crate::process::sched_lock();
        let proc = sched.processes.get(&pid).ok_or(Errno::NoSuchProcess)?;
        let slot = proc.io_slot(fd).ok_or(Errno::BadDescriptor)?;
        if slot.kind != IoKind::Socket {
            return Err(Errno::NotSocket);
        }
        slot.data
    };
    by_index(index).ok_or(Errno::NotSocket)
}

/// The descriptor-slot flags of `(t, fd)`.
pub fn fd_flags(t: Option<&Arc<Thread>>, fd: usize) -> Result<u32, Errno> {
    let pid = owner_pid(t);
    let sched = crate::process::sched_lock();
    let proc = sched.processes.get(&pid).ok_or(Errno::NoSuchProcess)?;
    let slot = proc.io_slot(fd).ok_or(Errno::BadDescriptor)?;
    Ok(slot.flags)
}

/// Does `(t, fd)` have SOCK_NONBLOCK set?
pub fn fd_nonblocking(t: Option<&Arc<Thread>>, fd: usize) -> bool {
    fd_flags(t, fd).map(|f| f & SOCK_NONBLOCK != 0).unwrap_or(false)
}

fn owner_pid(t: Option<&Arc<Thread>>) -> Pid {
    match t {
        Some(thread) => thread.pid,
        None => crate::process::kernel_pid(),
    }
}

/// Open a socket: allocate a descriptor, register it globally, and
/// install it into the first free I/O slot of the owning process.
/// Only the local family is accepted.
pub fn socket(
    t: Option<&Arc<Thread>>,
    domain: u16,
    sock_type: u32,
    protocol: u32,
) -> Result<u64, Errno> {
    if domain != AF_UNIX {
        return Err(Errno::FamilyNotSupported);
    }
    let base_type = sock_type & 0xFF;
    if !matches!(base_type, SOCK_STREAM | SOCK_DGRAM | SOCK_SEQPACKET) {
        return Err(Errno::InvalidArgument);
    }
    let pid = owner_pid(t);

    let mut sched = crate::process::sched_lock();
    let mut table = table_lock();

    let index = register(&mut table, |i| {
        SocketDescriptor::new(pid, i, domain, base_type, protocol)
    })?;

    let Some(proc) = sched.processes.get_mut(&pid) else {
        unregister(&mut table, index);
        return Err(Errno::NoSuchProcess);
    };
    let Some(fd) = proc.open_io() else {
        unregister(&mut table, index);
        return Err(Errno::TooManyFiles);
    };
    let slot = &mut proc.io[fd];
    slot.kind = IoKind::Socket;
    slot.data = index;
    slot.flags = sock_type & (SOCK_NONBLOCK | SOCK_CLOEXEC);
    if sock_type & SOCK_CLOEXEC != 0 {
        slot.flags |= crate::process::process::IO_CLOEXEC;
    }

    Ok(fd as u64)
}

/// Bind a socket to an address. Duplicate addresses are rejected.
pub fn bind(
    t: Option<&Arc<Thread>>,
    fd: usize,
    addr: &SocketAddress,
    len: usize,
) -> Result<u64, Errno> {
    if addr.family != AF_UNIX {
        return Err(Errno::FamilyNotSupported);
    }
    let sock = resolve(t, fd)?;

    // Uniqueness scan under the table lock, then commit under the
    // descriptor lock; the table lock spans both so no raced bind can
    // slip a duplicate in.
    let table = table_lock();
    for slot in table.slots.iter().flatten() {
        if slot.global_index == sock.global_index {
            continue;
        }
        let state = slot.state.lock();
        if state.address_len != 0 && state.address.path_eq(addr) {
            return Err(Errno::AddressInUse);
        }
    }

    let mut state = sock.state.lock();
    state.address = *addr;
    state.address_len = len.min(core::mem::size_of::<SocketAddress>());
    Ok(0)
}

/// Bump a socket's reference count (descriptor duplicated by fork).
pub fn socket_ref(index: usize) {
    if let Some(sock) = by_index(index) {
        sock.refcount.fetch_add(1, Ordering::AcqRel);
    }
}

/// Drop one reference; the last one frees the buffers and unregisters.
pub fn socket_unref(index: usize) {
    let Some(sock) = by_index(index) else {
        return;
    };
    if sock.refcount.fetch_sub(1, Ordering::AcqRel) != 1 {
        return;
    }

    // Sever the peer link so the other end sees a closed connection.
    let peer_index = {
        let mut state = sock.state.lock();
        state.inbound.clear();
        state.backlog.clear();
        state.peer.take()
    };
    if let Some(peer) = peer_index.and_then(by_index) {
        let mut pstate = peer.state.lock();
        if pstate.peer == Some(index) {
            pstate.peer = None;
        }
    }

    let mut table = table_lock();
    unregister(&mut table, index);
}

fn unregister(table: &mut SocketTable, index: usize) {
    if let Some(slot) = table.slots.get_mut(index) {
        if slot.take().is_some() {
            table.count -= 1;
        }
    }
}

/// Close the socket behind `(t, fd)`: free the I/O slot and drop one
/// table reference.
pub fn close_socket(t: Option<&Arc<Thread>>, fd: usize) -> Result<u64, Errno> {
    let pid = owner_pid(t);
    let index = {
        let mut sched = crate::process::sched_lock();
        let proc = sched.processes.get_mut(&pid).ok_or(Errno::NoSuchProcess)?;
        let slot = proc.io_slot(fd).ok_or(Errno::BadDescriptor)?;
        if slot.kind != IoKind::Socket {
            return Err(Errno::NotSocket);
        }
        let index = slot.data;
        proc.close_io(fd);
        index
    };
    socket_unref(index);
    Ok(0)
}

/// Is the peer of this socket gone (or never there)?
pub fn peer_closed(sock: &Arc<SocketDescriptor>) -> bool {
    // Drop the descriptor lock before touching the table; the table is
    // the outer lock everywhere else.
    let peer = sock.state.lock().peer;
    match peer {
        Some(peer) => by_index(peer).is_none(),
        None => true,
    }
}

/// Number of live sockets (sysinfo and tests).
pub fn socket_count() -> usize {
    table_lock().count
}

/// The PID owning the peer of `(kernel, fd)`. Policy checks use this to
/// tell lumen's connections from impostors.
pub fn peer_owner(t: Option<&Arc<Thread>>, fd: usize) -> Option<Pid> {
    let sock = resolve(t, fd).ok()?;
    let peer_index = sock.state.lock().peer?;
    by_index(peer_index).map(|p| p.owner)
}
