//! Syscall function numbers.
//!
//! Organised in blocks. The IPC block, the read/write pair, and LSEEK are
//! fast-path: the trap handler runs them inline on the calling CPU.
//! Everything else goes through the global syscall FIFO and is serviced
//! by a kernel worker thread.

// ============================================================
// Block 0-15: process lifecycle (queued)
// ============================================================

/// Terminate the calling thread. arg1 = exit code.
pub const SYS_EXIT: u64 = 0;

/// Duplicate the calling process. Returns child PID, 0 in the child.
pub const SYS_FORK: u64 = 1;

/// Give up the rest of the timeslice.
pub const SYS_YIELD: u64 = 2;

/// Reap a child. arg1 = pid (-1 for any), arg2 = status out pointer
/// (nullable), arg3 = options (WNOHANG supported).
pub const SYS_WAITPID: u64 = 3;

/// Execute a program from a file. arg1 = path, arg2 = argv, arg3 = envp.
pub const SYS_EXECVE: u64 = 4;

/// Sleep. arg1 = milliseconds.
pub const SYS_MSLEEP: u64 = 5;

/// Return the calling process ID.
pub const SYS_GETPID: u64 = 6;

/// Return the calling thread ID.
pub const SYS_GETTID: u64 = 7;

/// Return from a signal handler. Only reachable from the signal
/// trampoline installed at exec time.
pub const SYS_SIGRETURN: u64 = 8;

/// Send a signal. arg1 = pid, arg2 = signal number.
pub const SYS_KILL: u64 = 9;

/// Install a signal handler. arg1 = signal number, arg2 = handler
/// address (0 = default, 1 = ignore).
pub const SYS_SIGACTION: u64 = 10;

/// Set the signal mask. arg1 = new mask. Returns the old mask.
pub const SYS_SIGMASK: u64 = 11;

/// Set the file creation mask. arg1 = mask. Returns the old mask.
pub const SYS_UMASK: u64 = 12;

/// Grow the heap: move the highest user address up to arg1 (0 queries).
/// Returns the new (or current) break.
pub const SYS_BRK: u64 = 13;

// ============================================================
// Block 16-23: local sockets (fast path)
// ============================================================

pub const SYSCALL_IPC_START: u64 = 16;

/// Open a socket. arg1 = domain, arg2 = type, arg3 = protocol.
pub const SYS_SOCKET: u64 = 16;

/// Bind to an address. arg1 = fd, arg2 = sockaddr ptr, arg3 = length.
pub const SYS_BIND: u64 = 17;

/// Listen for connections. arg1 = fd, arg2 = backlog.
pub const SYS_LISTEN: u64 = 18;

/// Connect to a listener. arg1 = fd, arg2 = sockaddr ptr, arg3 = length.
pub const SYS_CONNECT: u64 = 19;

/// Accept a pending connection. arg1 = fd, arg2 = sockaddr out ptr
/// (nullable), arg3 = length in/out ptr.
pub const SYS_ACCEPT: u64 = 20;

/// Send a message. arg1 = fd, arg2 = buffer, arg3 = length, arg4 = flags.
pub const SYS_SEND: u64 = 21;

/// Receive a message. arg1 = fd, arg2 = buffer, arg3 = length,
/// arg4 = flags.
pub const SYS_RECV: u64 = 22;

/// Close a socket descriptor. arg1 = fd.
pub const SYS_SOCKCLOSE: u64 = 23;

pub const SYSCALL_IPC_END: u64 = 23;

// ============================================================
// Block 32-39: files, relayed to lumen (queued)
// ============================================================

/// Open a path. arg1 = path ptr, arg2 = flags, arg3 = mode.
pub const SYS_OPEN: u64 = 32;

/// Close a descriptor. arg1 = fd.
pub const SYS_CLOSE: u64 = 33;

/// Stat a path. arg1 = path ptr, arg2 = stat out ptr.
pub const SYS_STAT: u64 = 34;

/// Mount a file system. arg1 = mount command ptr.
pub const SYS_MOUNT: u64 = 35;

/// Unmount a file system. arg1 = target path ptr.
pub const SYS_UMOUNT: u64 = 36;

/// Change ownership. arg1 = path ptr, arg2 = uid, arg3 = gid.
pub const SYS_CHOWN: u64 = 37;

/// Change permissions. arg1 = path ptr, arg2 = mode.
pub const SYS_CHMOD: u64 = 38;

/// Flush cached writes. arg1 = fd.
pub const SYS_FLUSH: u64 = 39;

// ============================================================
// Block 48-50: descriptor I/O (fast path)
// ============================================================

pub const SYSCALL_RW_START: u64 = 48;

/// Read from a descriptor. arg1 = fd, arg2 = buffer, arg3 = length.
pub const SYS_READ: u64 = 48;

/// Write to a descriptor. arg1 = fd, arg2 = buffer, arg3 = length.
pub const SYS_WRITE: u64 = 49;

pub const SYSCALL_RW_END: u64 = 49;

/// Seek. arg1 = fd, arg2 = offset, arg3 = whence.
pub const SYS_LSEEK: u64 = 50;

/// Highest valid function number.
pub const MAX_SYSCALL: u64 = 50;
