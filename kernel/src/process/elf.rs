//! Minimal ELF64 loader for statically linked executables.
//!
//! Only what `execve_memory` needs: validate the header, map each
//! `PT_LOAD` segment into the active (target) address space, and report
//! the entry point and the highest mapped user address.

use crate::arch::x86_64::paging::PAGE_SIZE;
use crate::memory::{virt, virt::VmFlags, USER_LIMIT};
use crate::syscall::errno::Errno;
use zerocopy::{FromBytes, FromZeroes};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELF_CLASS_64: u8 = 2;
const ELF_MACHINE_X86_64: u16 = 62;
const ELF_TYPE_EXEC: u16 = 2;
const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;

#[repr(C)]
#[derive(FromZeroes, FromBytes)]
struct FileHeader {
    ident: [u8; 16],
    etype: u16,
    machine: u16,
    version: u32,
    entry: u64,
    phoff: u64,
    shoff: u64,
    flags: u32,
    ehsize: u16,
    phentsize: u16,
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

#[repr(C)]
#[derive(FromZeroes, FromBytes, Clone, Copy)]
struct ProgramHeader {
    ptype: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    paddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
}

pub struct LoadedImage {
    pub entry: u64,
    /// Highest user address any segment reaches.
    pub highest: u64,
}

/// Map the image's segments into the active address space.
///
/// The caller must have switched into the target root first and owns the
/// cleanup of partially built spaces on error.
pub fn load(image: &[u8]) -> Result<LoadedImage, Errno> {
    // By-value reads: the image buffer has no alignment guarantees.
    let header = FileHeader::read_from_prefix(image).ok_or(Errno::ExecFormat)?;
    if header.ident[0..4] != ELF_MAGIC {
        log::warn!("elf: bad magic");
        return Err(Errno::ExecFormat);
    }
    if header.ident[4] != ELF_CLASS_64
        || header.machine != ELF_MACHINE_X86_64
        || header.etype != ELF_TYPE_EXEC
        || header.phnum == 0
    {
        log::warn!("elf: not a static x86_64 executable");
        return Err(Errno::ExecFormat);
    }

    let mut highest = 0u64;
    for i in 0..header.phnum as usize {
        let off = header.phoff as usize + i * header.phentsize as usize;
        let ph = ProgramHeader::read_from_prefix(image.get(off..).ok_or(Errno::ExecFormat)?)
            .ok_or(Errno::ExecFormat)?;

        if ph.ptype != PT_LOAD {
            continue;
        }
        if ph.vaddr.checked_add(ph.memsz).map_or(true, |end| end > USER_LIMIT) {
            return Err(Errno::ExecFormat);
        }
        let file_end = (ph.offset as usize)
            .checked_add(ph.filesz as usize)
            .ok_or(Errno::ExecFormat)?;
        if file_end > image.len() || ph.filesz > ph.memsz {
            return Err(Errno::ExecFormat);
        }

        let base = ph.vaddr & !(PAGE_SIZE as u64 - 1);
        let span = (ph.vaddr + ph.memsz) - base;
        let pages = (span as usize).div_ceil(PAGE_SIZE);

        let mut flags = VmFlags::USER;
        if ph.flags & PF_W != 0 {
            flags |= VmFlags::WRITE;
        }
        if ph.flags & PF_X != 0 {
            flags |= VmFlags::EXEC;
        }
        // Mapped writable for the copy; segment permissions are best
        // effort at this granularity.
        if virt::allocate_at(base, pages, flags | VmFlags::WRITE) == 0 {
            return Err(Errno::OutOfMemory);
        }

        // SAFETY: the pages were just mapped writable in the active
        // space; the source range was bounds-checked above.
        unsafe {
            core::ptr::copy_nonoverlapping(
                image.as_ptr().add(ph.offset as usize),
                ph.vaddr as *mut u8,
                ph.filesz as usize,
            );
        }
        // memsz beyond filesz is BSS; allocate_at hands out zeroed pages.

        highest = highest.max(ph.vaddr + ph.memsz);
    }

    if highest == 0 {
        return Err(Errno::ExecFormat);
    }
    Ok(LoadedImage {
        entry: header.entry,
        highest,
    })
}
