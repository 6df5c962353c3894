//! Ustar ramdisk reader.
//!
//! The boot module is a plain POSIX ustar archive; the bootstrap thread
//! only ever asks it for the `lumen` image. Entries are 512-byte header
//! blocks followed by the file data rounded up to a block.

use core::sync::atomic::{AtomicU64, Ordering};

const BLOCK: usize = 512;

static RAMDISK_BASE: AtomicU64 = AtomicU64::new(0);
static RAMDISK_SIZE: AtomicU64 = AtomicU64::new(0);

/// Record the ramdisk module location from the boot hand-off.
pub fn init(base: u64, size: u64) {
    RAMDISK_BASE.store(base, Ordering::Release);
    RAMDISK_SIZE.store(size, Ordering::Release);
    if size != 0 {
        log::debug!("ramdisk at {:#x}, {} KiB", base, size / 1024);
    }
}

fn archive() -> Option<&'static [u8]> {
    let base = RAMDISK_BASE.load(Ordering::Acquire);
    let size = RAMDISK_SIZE.load(Ordering::Acquire);
    if base == 0 || size == 0 {
        return None;
    }
    // SAFETY: the boot protocol maps the module; it is never freed.
    Some(unsafe { core::slice::from_raw_parts(base as *const u8, size as usize) })
}

fn octal_field(field: &[u8]) -> usize {
    let mut value = 0usize;
    for &b in field {
        match b {
            b'0'..=b'7' => value = value * 8 + (b - b'0') as usize,
            _ => break,
        }
    }
    value
}

fn entry_name(header: &[u8]) -> &[u8] {
    let name = &header[0..100];
    let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    &name[..end]
}

/// Find a file in the archive; returns its data slice.
fn find(name: &str) -> Option<&'static [u8]> {
    let data = archive()?;
    let mut offset = 0usize;

    while offset + BLOCK <= data.len() {
        let header = &data[offset..offset + BLOCK];
        if header[0] == 0 {
            break; // end-of-archive marker
        }
        let size = octal_field(&header[124..136]);
        let file_name = entry_name(header);
        // ustar names may carry a leading "./".
        let trimmed = file_name.strip_prefix(b"./").unwrap_or(file_name);

        if trimmed == name.as_bytes() {
            let start = offset + BLOCK;
            if start + size > data.len() {
                return None;
            }
            return Some(&data[start..start + size]);
        }

        offset += BLOCK + size.div_ceil(BLOCK) * BLOCK;
    }
    None
}

/// Size of a ramdisk file in bytes, or -1 when absent.
pub fn file_size(name: &str) -> i64 {
    find(name).map(|d| d.len() as i64).unwrap_or(-1)
}

/// Copy up to `buf.len()` bytes of a ramdisk file. Returns bytes copied,
/// or -1 when the file is absent.
pub fn read(name: &str, buf: &mut [u8]) -> i64 {
    let Some(data) = find(name) else {
        return -1;
    };
    let n = data.len().min(buf.len());
    buf[..n].copy_from_slice(&data[..n]);
    n as i64
}
