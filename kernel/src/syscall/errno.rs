//! Errno-style error codes.
//!
//! Handlers return these as negative values in the syscall return
//! register; the names follow the usual Unix meanings.

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, thiserror::Error)]
#[must_use]
#[repr(i64)]
pub enum Errno {
    #[error("Operation not permitted")]
    NotPermitted = -1,
    #[error("No such process")]
    NoSuchProcess = -3,
    #[error("Interrupted system call")]
    Interrupted = -4,
    #[error("Input/output error")]
    Io = -5,
    #[error("Argument list too long")]
    ArgumentListTooLong = -7,
    #[error("Exec format error")]
    ExecFormat = -8,
    #[error("Bad file descriptor")]
    BadDescriptor = -9,
    #[error("No child processes")]
    NoChildren = -10,
    #[error("Resource temporarily unavailable")]
    WouldBlock = -11,
    #[error("Cannot allocate memory")]
    OutOfMemory = -12,
    #[error("Permission denied")]
    AccessDenied = -13,
    #[error("Bad address")]
    Fault = -14,
    #[error("Invalid argument")]
    InvalidArgument = -22,
    #[error("Too many open files")]
    TooManyFiles = -24,
    #[error("Function not implemented")]
    NotImplemented = -38,
    #[error("Destination address required")]
    DestinationRequired = -89,
    #[error("Not a socket")]
    NotSocket = -88,
    #[error("Protocol family not supported")]
    FamilyNotSupported = -97,
    #[error("Address already in use")]
    AddressInUse = -98,
    #[error("Address not available")]
    AddressNotAvailable = -99,
    #[error("No buffer space available")]
    NoBuffers = -105,
    #[error("Socket is not connected")]
    NotConnected = -107,
    #[error("Connection refused")]
    ConnectionRefused = -111,
    #[error("Connection timed out")]
    TimedOut = -110,
    #[error("Connection aborted")]
    ConnectionAborted = -103,
}

impl Errno {
    /// The negative value as stored in the return register.
    #[inline]
    pub fn to_ret(self) -> u64 {
        (self as i64) as u64
    }
}

/// Collapse a handler result into the return-register encoding.
#[inline]
pub fn encode(result: Result<u64, Errno>) -> u64 {
    match result {
        Ok(v) => v,
        Err(e) => e.to_ret(),
    }
}
