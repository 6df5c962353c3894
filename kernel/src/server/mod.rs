//! Kernel ↔ user-space server gateway.

pub mod gateway;
pub mod general;
pub mod message;
#[cfg(feature = "selftest")]
pub mod test;

pub use gateway::{
    request_server, server_idle, server_init, server_socket, SERVER_KERNEL_PATH,
    SERVER_LUMEN_PATH, SERVER_MAX_CONNECTIONS,
};
pub use message::{MessageHeader, ResponseHeader, SERVER_MAX_SIZE};
