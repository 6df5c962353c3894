//! Inter-process communication: local sockets and signals.

pub mod connection;
pub mod signal;
pub mod socket;
pub mod sockio;
#[cfg(feature = "selftest")]
pub mod test;

pub use connection::{accept, connect, listen, ConnectProgress};
pub use socket::{
    bind, close_socket, socket, socket_init, SocketAddress, SocketDescriptor, AF_LOCAL, AF_UNIX,
    MSG_OOB, MSG_PEEK, MSG_WAITALL, SOCK_CLOEXEC, SOCK_DGRAM, SOCK_NONBLOCK, SOCK_SEQPACKET,
    SOCK_STREAM,
};
pub use sockio::{recv, send};
