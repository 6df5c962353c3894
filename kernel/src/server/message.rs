//! Framed messages between the kernel and its user-space servers.
//!
//! Every message starts with a [`MessageHeader`]. `length` is the total
//! message size including the header; `id` is chosen by the requesting
//! side and echoed in the reply; `response` is 0 for requests and 1 for
//! replies; `requester` carries the TID the request is being fulfilled
//! for. Replies lead their payload with a status word
//! ([`ResponseHeader`]), followed by any response data (read payloads,
//! stat buffers).

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Longest path carried in a framed command.
pub const MAX_FILE_PATH: usize = 256;

/// Cap on a single framed message.
pub const SERVER_MAX_SIZE: usize = 0x80000;

// Commands requested by lumen and the servers, fulfilled by the kernel.
pub const COMMAND_LOG: u16 = 0x0000;
pub const COMMAND_SYSINFO: u16 = 0x0001;
pub const COMMAND_RAND: u16 = 0x0002;
pub const COMMAND_IO: u16 = 0x0003;
pub const COMMAND_PROCESS_IO: u16 = 0x0004;
pub const COMMAND_PROCESS_LIST: u16 = 0x0005;
pub const COMMAND_PROCESS_STATUS: u16 = 0x0006;
pub const COMMAND_FRAMEBUFFER: u16 = 0x0007;
pub const MAX_GENERAL_COMMAND: u16 = 0x0007;

// Commands requested by the kernel, fulfilled by lumen.
pub const COMMAND_STAT: u16 = 0x8000;
pub const COMMAND_FLUSH: u16 = 0x8001;
pub const COMMAND_MOUNT: u16 = 0x8002;
pub const COMMAND_UMOUNT: u16 = 0x8003;
pub const COMMAND_OPEN: u16 = 0x8004;
pub const COMMAND_READ: u16 = 0x8005;
pub const COMMAND_WRITE: u16 = 0x8006;
pub const COMMAND_CHOWN: u16 = 0x8007;
pub const COMMAND_CHMOD: u16 = 0x8008;
pub const COMMAND_LSEEK: u16 = 0x8009;
pub const MAX_SYSCALL_COMMAND: u16 = 0x8009;

/// The fixed message prefix.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct MessageHeader {
    pub command: u16,
    /// Total message size including this header.
    pub length: u16,
    /// 0 = request, 1 = response.
    pub response: u8,
    reserved: [u8; 3],
    /// Request pairing key, echoed by the responder.
    pub id: u64,
    /// TID of the thread the request is on behalf of.
    pub requester: u64,
}

assert_eq_size!(MessageHeader, [u8; 24]);

impl MessageHeader {
    pub fn request(command: u16, length: usize) -> Self {
        MessageHeader {
            command,
            length: length as u16,
            response: 0,
            reserved: [0; 3],
            id: 0,
            requester: 0,
        }
    }

    /// A reply header echoing this request.
    pub fn reply(&self, length: usize) -> Self {
        MessageHeader {
            command: self.command,
            length: length as u16,
            response: 1,
            reserved: [0; 3],
            id: self.id,
            requester: self.requester,
        }
    }
}

/// Replies carry their status word right after the header.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct ResponseHeader {
    pub header: MessageHeader,
    /// Return value for the relayed syscall (errno-negative on failure).
    pub status: u64,
}

/// open(): path, flags, mode, and the caller's credentials.
#[repr(C)]
#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct OpenCommand {
    pub header: MessageHeader,
    pub path: [u8; MAX_FILE_PATH],
    pub flags: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// stat(): path only; the reply payload is the stat buffer.
#[repr(C)]
#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct StatCommand {
    pub header: MessageHeader,
    pub path: [u8; MAX_FILE_PATH],
}

/// mount(): source, target, fs type, flags.
#[repr(C)]
#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct MountCommand {
    pub header: MessageHeader,
    pub source: [u8; MAX_FILE_PATH],
    pub target: [u8; MAX_FILE_PATH],
    pub fs_type: [u8; 32],
    pub flags: u32,
    reserved: u32,
}

/// umount(): target path.
#[repr(C)]
#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct UmountCommand {
    pub header: MessageHeader,
    pub target: [u8; MAX_FILE_PATH],
}

/// chown()/chmod(): path plus the new attribute pair.
#[repr(C)]
#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct AttrCommand {
    pub header: MessageHeader,
    pub path: [u8; MAX_FILE_PATH],
    /// uid for chown, mode for chmod.
    pub attr1: u32,
    /// gid for chown, unused for chmod.
    pub attr2: u32,
}

/// read()/write()/lseek()/flush(): descriptor, position, length. Write
/// requests append their data after the struct; read replies append the
/// data after the response status.
#[repr(C)]
#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct RwCommand {
    pub header: MessageHeader,
    pub fd: u64,
    pub position: u64,
    pub length: u64,
}

/// log command: level and a bounded message, relayed to the kernel log.
#[repr(C)]
#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct LogCommand {
    pub header: MessageHeader,
    pub level: u32,
    reserved: u32,
    pub server: [u8; 64],
    pub message: [u8; 256],
}

/// sysinfo reply payload.
#[repr(C)]
#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct SysInfoResponse {
    pub response: ResponseHeader,
    pub kernel: [u8; 64],
    pub uptime: u64,
    pub max_sockets: u32,
    pub processes: u32,
    pub threads: u32,
    pub page_size: u32,
    /// In pages.
    pub memory_size: u32,
    pub memory_usage: u32,
}

/// I/O-port access request payload: first port and count.
#[repr(C)]
#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct IoRequest {
    pub header: MessageHeader,
    pub base: u16,
    pub count: u16,
    reserved: u32,
}

/// framebuffer reply payload.
#[repr(C)]
#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct FramebufferResponse {
    pub response: ResponseHeader,
    /// User-space address the framebuffer was mapped at.
    pub buffer: u64,
    pub width: u16,
    pub height: u16,
    pub pitch: u16,
    pub bpp: u16,
}

/// Copy a path string into a fixed command field, NUL-terminated.
pub fn fill_path(dest: &mut [u8], path: &str) {
    let n = path.len().min(dest.len() - 1);
    dest[..n].copy_from_slice(&path.as_bytes()[..n]);
    dest[n..].fill(0);
}
