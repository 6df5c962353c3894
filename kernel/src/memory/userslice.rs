//! Validated user-space memory windows.
//!
//! The kernel never dereferences a raw user pointer without first
//! checking that the whole range lies in the user half, does not wrap,
//! and is mapped with the needed permissions in the *active* page tables.
//! Syscall handlers run inside the requester's address space (the worker
//! switched before dispatch), so the active tables are the right ones.

use crate::arch::x86_64::paging::{self, PAGE_SIZE};
use crate::memory::USER_LIMIT;
use crate::syscall::errno::Errno;
use alloc::vec::Vec;
use x86_64::structures::paging::PageTableFlags;

/// Upper bound on a single validated window (16 MiB): keeps a hostile
/// length from walking millions of table entries.
const MAX_USER_SLICE_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UserSliceError {
    #[error("null user pointer")]
    NullPointer,
    #[error("range reaches kernel space")]
    KernelAddress,
    #[error("range wraps the address space")]
    Overflow,
    #[error("range too long")]
    TooLong,
    #[error("page not mapped")]
    NotMapped,
    #[error("mapping lacks required permission")]
    PermissionDenied,
}

impl From<UserSliceError> for Errno {
    fn from(e: UserSliceError) -> Self {
        match e {
            UserSliceError::TooLong => Errno::InvalidArgument,
            _ => Errno::Fault,
        }
    }
}

#[derive(Clone, Copy)]
enum Access {
    Read,
    Write,
}

fn validate(base: u64, len: usize, access: Access) -> Result<(), UserSliceError> {
    if len == 0 {
        return Ok(());
    }
    if base == 0 {
        return Err(UserSliceError::NullPointer);
    }
    if len > MAX_USER_SLICE_LEN {
        return Err(UserSliceError::TooLong);
    }
    let end = base
        .checked_add(len as u64)
        .ok_or(UserSliceError::Overflow)?;
    if base >= USER_LIMIT || end > USER_LIMIT {
        return Err(UserSliceError::KernelAddress);
    }

    let mut required = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
    if matches!(access, Access::Write) {
        required |= PageTableFlags::WRITABLE;
    }

    let mut page = base & !(PAGE_SIZE as u64 - 1);
    while page < end {
        match paging::translate_active(page) {
            Some((_, flags)) if flags.contains(required) => {}
            Some(_) => return Err(UserSliceError::PermissionDenied),
            None => return Err(UserSliceError::NotMapped),
        }
        page += PAGE_SIZE as u64;
    }
    Ok(())
}

/// A user range the kernel may read from.
pub struct UserSliceRead {
    base: u64,
    len: usize,
}

impl UserSliceRead {
    pub fn new(base: u64, len: usize) -> Result<Self, UserSliceError> {
        validate(base, len, Access::Read)?;
        Ok(UserSliceRead { base, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Copy into `dest`; returns the number of bytes copied.
    pub fn copy_to(&self, dest: &mut [u8]) -> usize {
        let n = self.len.min(dest.len());
        // SAFETY: validated at construction, still mapped (no unmap can
        // race: the owning thread is trapped in this very syscall).
        unsafe {
            core::ptr::copy_nonoverlapping(self.base as *const u8, dest.as_mut_ptr(), n);
        }
        n
    }

    pub fn read_to_vec(&self) -> Vec<u8> {
        let mut out = alloc::vec![0u8; self.len];
        self.copy_to(&mut out);
        out
    }
}

/// A user range the kernel may write to.
pub struct UserSliceWrite {
    base: u64,
    len: usize,
}

impl UserSliceWrite {
    pub fn new(base: u64, len: usize) -> Result<Self, UserSliceError> {
        validate(base, len, Access::Write)?;
        Ok(UserSliceWrite { base, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Copy from `src`; returns the number of bytes copied.
    pub fn copy_from(&self, src: &[u8]) -> usize {
        let n = self.len.min(src.len());
        // SAFETY: validated at construction; see UserSliceRead::copy_to.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), self.base as *mut u8, n);
        }
        n
    }
}

/// Read a NUL-terminated user string of at most `max` bytes.
pub fn read_user_str(base: u64, max: usize) -> Result<alloc::string::String, Errno> {
    let mut bytes: Vec<u8> = Vec::new();
    let mut offset = 0u64;
    while (offset as usize) < max {
        let slice = UserSliceRead::new(base + offset, 1).map_err(Errno::from)?;
        let mut b = [0u8; 1];
        slice.copy_to(&mut b);
        if b[0] == 0 {
            return alloc::string::String::from_utf8(bytes).map_err(|_| Errno::InvalidArgument);
        }
        bytes.push(b[0]);
        offset += 1;
    }
    Err(Errno::ArgumentListTooLong)
}
