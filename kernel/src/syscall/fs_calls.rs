//! File syscall handlers.
//!
//! The kernel has no file systems: every file operation is marshalled
//! into a framed command and relayed to lumen over the kernel socket.
//! The handler returns with the thread still blocked; the reply pump
//! (`server_idle`) writes the status back and wakes the thread. The
//! read/write/lseek numbers are fast-path because socket descriptors
//! short-circuit locally; file descriptors fall through to the relay.

use super::errno::Errno;
use super::request::SyscallRequest;
use crate::ipc::connection::fd_is_socket;
use crate::memory::{read_user_str, UserSliceRead};
use crate::process::get_thread;
use crate::server::gateway::request_server;
use crate::server::message::{
    self, fill_path, AttrCommand, MessageHeader, MountCommand, OpenCommand, RwCommand,
    StatCommand, UmountCommand, MAX_FILE_PATH,
};
use alloc::vec::Vec;
use zerocopy::{AsBytes, FromZeroes};

fn fail(req: &mut SyscallRequest, e: Errno) {
    req.ret = e.to_ret();
    req.unblock = true;
}

/// Marshal and relay; on success the thread stays blocked for the reply.
fn relay(req: &mut SyscallRequest, bytes: Vec<u8>) {
    let Some(thread) = get_thread(req.tid) else {
        return;
    };
    match request_server(&thread, 0, bytes) {
        Ok(()) => {
            req.unblock = false;
        }
        Err(e) => fail(req, e),
    }
}

/// Credentials of the requesting process.
fn credentials(req: &SyscallRequest) -> (u32, u32, u32) {
    let Some(thread) = get_thread(req.tid) else {
        return (0, 0, 0o022);
    };
    let sched = crate::process::sched_lock();
    sched
        .processes
        .get(&thread.pid)
        .map(|p| (p.uid, p.gid, p.umask))
        .unwrap_or((0, 0, 0o022))
}

/// SYS_OPEN: relay an open command carrying path, flags, mode, and the
/// caller's credentials. The reply status is the descriptor.
pub fn sys_open(req: &mut SyscallRequest) {
    let path = match read_user_str(req.params[0], MAX_FILE_PATH) {
        Ok(p) => p,
        Err(e) => return fail(req, e),
    };
    let (uid, gid, umask) = credentials(req);

    let mut cmd = OpenCommand {
        header: MessageHeader::request(
            message::COMMAND_OPEN,
            core::mem::size_of::<OpenCommand>(),
        ),
        path: [0; MAX_FILE_PATH],
        flags: req.params[1] as u32,
        mode: req.params[2] as u32 & !umask,
        uid,
        gid,
    };
    fill_path(&mut cmd.path, &path);
    relay(req, cmd.as_bytes().to_vec());
}

/// SYS_CLOSE: sockets close locally; file descriptors get a flush relay
/// so lumen can retire its side before the slot is forgotten.
pub fn sys_close(req: &mut SyscallRequest) {
    let Some(thread) = get_thread(req.tid) else {
        return;
    };
    let fd = req.params[0] as usize;
    if fd_is_socket(Some(&thread), fd) {
        req.ret = super::errno::encode(crate::ipc::socket::close_socket(Some(&thread), fd));
        req.unblock = true;
        return;
    }
    let cmd = RwCommand {
        header: MessageHeader::request(
            message::COMMAND_FLUSH,
            core::mem::size_of::<RwCommand>(),
        ),
        fd: req.params[0],
        position: 0,
        length: 0,
    };
    relay(req, cmd.as_bytes().to_vec());
}

/// SYS_STAT: the reply payload is the stat buffer, copied back to the
/// caller's pointer by the reply pump.
pub fn sys_stat(req: &mut SyscallRequest) {
    let path = match read_user_str(req.params[0], MAX_FILE_PATH) {
        Ok(p) => p,
        Err(e) => return fail(req, e),
    };
    let mut cmd = StatCommand {
        header: MessageHeader::request(
            message::COMMAND_STAT,
            core::mem::size_of::<StatCommand>(),
        ),
        path: [0; MAX_FILE_PATH],
    };
    fill_path(&mut cmd.path, &path);
    relay(req, cmd.as_bytes().to_vec());
}

/// SYS_MOUNT.
pub fn sys_mount(req: &mut SyscallRequest) {
    let source = match read_user_str(req.params[0], MAX_FILE_PATH) {
        Ok(p) => p,
        Err(e) => return fail(req, e),
    };
    let target = match read_user_str(req.params[1], MAX_FILE_PATH) {
        Ok(p) => p,
        Err(e) => return fail(req, e),
    };
    let fs_type = match read_user_str(req.params[2], 32) {
        Ok(p) => p,
        Err(e) => return fail(req, e),
    };

    let mut cmd = MountCommand::new_zeroed();
    cmd.header = MessageHeader::request(
        message::COMMAND_MOUNT,
        core::mem::size_of::<MountCommand>(),
    );
    fill_path(&mut cmd.source, &source);
    fill_path(&mut cmd.target, &target);
    fill_path(&mut cmd.fs_type, &fs_type);
    cmd.flags = req.params[3] as u32;
    relay(req, cmd.as_bytes().to_vec());
}

/// SYS_UMOUNT.
pub fn sys_umount(req: &mut SyscallRequest) {
    let target = match read_user_str(req.params[0], MAX_FILE_PATH) {
        Ok(p) => p,
        Err(e) => return fail(req, e),
    };
    let mut cmd = UmountCommand::new_zeroed();
    cmd.header = MessageHeader::request(
        message::COMMAND_UMOUNT,
        core::mem::size_of::<UmountCommand>(),
    );
    fill_path(&mut cmd.target, &target);
    relay(req, cmd.as_bytes().to_vec());
}

fn attr_command(req: &mut SyscallRequest, command: u16, attr1: u32, attr2: u32) {
    let path = match read_user_str(req.params[0], MAX_FILE_PATH) {
        Ok(p) => p,
        Err(e) => return fail(req, e),
    };
    let mut cmd = AttrCommand::new_zeroed();
    cmd.header = MessageHeader::request(command, core::mem::size_of::<AttrCommand>());
    fill_path(&mut cmd.path, &path);
    cmd.attr1 = attr1;
    cmd.attr2 = attr2;
    relay(req, cmd.as_bytes().to_vec());
}

/// SYS_CHOWN.
pub fn sys_chown(req: &mut SyscallRequest) {
    attr_command(
        req,
        message::COMMAND_CHOWN,
        req.params[1] as u32,
        req.params[2] as u32,
    );
}

/// SYS_CHMOD.
pub fn sys_chmod(req: &mut SyscallRequest) {
    attr_command(req, message::COMMAND_CHMOD, req.params[1] as u32, 0);
}

/// SYS_FLUSH.
pub fn sys_flush(req: &mut SyscallRequest) {
    let cmd = RwCommand {
        header: MessageHeader::request(
            message::COMMAND_FLUSH,
            core::mem::size_of::<RwCommand>(),
        ),
        fd: req.params[0],
        position: 0,
        length: 0,
    };
    relay(req, cmd.as_bytes().to_vec());
}

/// SYS_READ: sockets receive locally; files relay a read command whose
/// reply carries the data.
pub fn sys_read(req: &mut SyscallRequest) {
    let Some(thread) = get_thread(req.tid) else {
        return;
    };
    if fd_is_socket(Some(&thread), req.params[0] as usize) {
        return super::ipc_calls::do_recv(req, 0);
    }

    let len = (req.params[2] as usize).min(message::SERVER_MAX_SIZE);
    let cmd = RwCommand {
        header: MessageHeader::request(message::COMMAND_READ, core::mem::size_of::<RwCommand>()),
        fd: req.params[0],
        position: 0,
        length: len as u64,
    };
    relay(req, cmd.as_bytes().to_vec());
}

/// SYS_WRITE: sockets send locally; files relay a write command with the
/// data appended after the fixed part.
pub fn sys_write(req: &mut SyscallRequest) {
    let Some(thread) = get_thread(req.tid) else {
        return;
    };
    if fd_is_socket(Some(&thread), req.params[0] as usize) {
        return super::ipc_calls::do_send(req, 0);
    }

    let len = (req.params[2] as usize)
        .min(message::SERVER_MAX_SIZE - core::mem::size_of::<RwCommand>());
    let data = match UserSliceRead::new(req.params[1], len) {
        Ok(slice) => slice.read_to_vec(),
        Err(e) => return fail(req, Errno::from(e)),
    };

    let total = core::mem::size_of::<RwCommand>() + data.len();
    let cmd = RwCommand {
        header: MessageHeader::request(message::COMMAND_WRITE, total),
        fd: req.params[0],
        position: 0,
        length: data.len() as u64,
    };
    let mut bytes = cmd.as_bytes().to_vec();
    bytes.extend_from_slice(&data);
    relay(req, bytes);
}

/// SYS_LSEEK: meaningless on sockets; files relay with the offset and
/// whence packed into the command.
pub fn sys_lseek(req: &mut SyscallRequest) {
    let Some(thread) = get_thread(req.tid) else {
        return;
    };
    if fd_is_socket(Some(&thread), req.params[0] as usize) {
        return fail(req, Errno::InvalidArgument);
    }
    let cmd = RwCommand {
        header: MessageHeader::request(
            message::COMMAND_LSEEK,
            core::mem::size_of::<RwCommand>(),
        ),
        fd: req.params[0],
        position: req.params[1],
        // whence rides in the length field for seeks.
        length: req.params[2],
    };
    relay(req, cmd.as_bytes().to_vec());
}
