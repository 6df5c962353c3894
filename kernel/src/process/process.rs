//! Process objects and their I/O descriptor tables.

use super::thread::{Pid, Tid};
use alloc::string::String;
use alloc::vec::Vec;

/// Fixed number of I/O descriptor slots per process.
pub const MAX_IO_DESCRIPTORS: usize = 1024;

/// Close the descriptor when the process forks.
pub const IO_CLOFORK: u32 = 1 << 16;
/// Close the descriptor when the process execs.
pub const IO_CLOEXEC: u32 = 1 << 17;

/// What an I/O descriptor slot refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    None,
    File,
    Socket,
}

/// One slot in a process's descriptor table. `data` is an index into the
/// table owning the real object (the socket table for sockets); no slot
/// ever stores an owning pointer.
#[derive(Debug, Clone, Copy)]
pub struct IoDescriptor {
    pub valid: bool,
    pub kind: IoKind,
    pub flags: u32,
    pub data: usize,
}

impl IoDescriptor {
    const fn empty() -> Self {
        IoDescriptor {
            valid: false,
            kind: IoKind::None,
            flags: 0,
            data: 0,
        }
    }
}

pub struct Process {
    pub pid: Pid,
    pub parent: Pid,
    pub pgrp: Pid,
    pub uid: u32,
    pub gid: u32,
    pub umask: u32,
    /// Absolute working directory.
    pub cwd: String,
    /// Executable name and full command line, for diagnostics.
    pub name: String,
    pub command: String,
    pub io: Vec<IoDescriptor>,
    pub iod_count: usize,
    pub threads: Vec<Tid>,
    pub children: Vec<Pid>,
    /// Parent exited; lumen has adopted this process.
    pub orphan: bool,
    /// Every thread is a zombie.
    pub zombie: bool,
}

impl Process {
    pub fn new(pid: Pid, parent: Pid) -> Self {
        let mut io = Vec::new();
        io.resize(MAX_IO_DESCRIPTORS, IoDescriptor::empty());
        Process {
            pid,
            parent,
            pgrp: pid,
            uid: 0,
            gid: 0,
            umask: 0o022,
            cwd: String::from("/"),
            name: String::new(),
            command: String::new(),
            io,
            iod_count: 0,
            threads: Vec::new(),
            children: Vec::new(),
            orphan: false,
            zombie: false,
        }
    }

    /// Claim the first free descriptor slot. Returns its index.
    pub fn open_io(&mut self) -> Option<usize> {
        if self.iod_count >= MAX_IO_DESCRIPTORS {
            return None;
        }
        for (i, slot) in self.io.iter_mut().enumerate() {
            if !slot.valid {
                slot.valid = true;
                slot.kind = IoKind::None;
                slot.flags = 0;
                slot.data = 0;
                self.iod_count += 1;
                return Some(i);
            }
        }
        None
    }

    /// Release a descriptor slot.
    pub fn close_io(&mut self, index: usize) {
        if let Some(slot) = self.io.get_mut(index) {
            if slot.valid {
                *slot = IoDescriptor::empty();
                self.iod_count -= 1;
            }
        }
    }

    /// The descriptor at `index`, if valid.
    pub fn io_slot(&self, index: usize) -> Option<&IoDescriptor> {
        self.io.get(index).filter(|d| d.valid)
    }
}
