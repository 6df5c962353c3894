//! Limine boot protocol entry point.
//!
//! Limine drops us in 64-bit long mode with paging, a stack, and the
//! higher-half direct map already in place. This module translates the
//! protocol responses into [`KernelArgs`] and jumps to `kernel_main`.

use super::entry::{KernelArgs, MemoryKind, MemoryRegion};
use limine::request::*;
use limine::BaseRevision;

#[used]
#[link_section = ".requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[link_section = ".requests"]
static MEMORY_MAP: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[link_section = ".requests"]
static HHDM: HhdmRequest = HhdmRequest::new();

#[used]
#[link_section = ".requests"]
static FRAMEBUFFER: FramebufferRequest = FramebufferRequest::new();

/// The ramdisk rides as the first Limine module.
#[used]
#[link_section = ".requests"]
static MODULES: ModuleRequest = ModuleRequest::new();

#[used]
#[link_section = ".requests"]
static MP: MpRequest = MpRequest::new();

#[used]
#[link_section = ".requests_start_marker"]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

#[used]
#[link_section = ".requests_end_marker"]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

/// Boot framebuffer geometry, kept for the framebuffer hand-off command.
#[derive(Clone, Copy)]
pub struct FramebufferInfo {
    pub phys_base: u64,
    pub width: u16,
    pub height: u16,
    /// Bytes per scanline.
    pub pitch: u16,
    pub bpp: u16,
}

static mut FRAMEBUFFER_INFO: Option<FramebufferInfo> = None;

/// Boot framebuffer, if the protocol provided one.
pub fn framebuffer_info() -> Option<FramebufferInfo> {
    // SAFETY: written once during early boot, read-only afterwards.
    unsafe { FRAMEBUFFER_INFO }
}

/// Translated memory map storage; Limine's own buffers are reclaimable.
const MAX_REGIONS: usize = 128;
static mut REGIONS: [MemoryRegion; MAX_REGIONS] = [MemoryRegion {
    base: 0,
    size: 0,
    kind: MemoryKind::Null,
}; MAX_REGIONS];

fn hlt_loop() -> ! {
    loop {
        unsafe {
            core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
        }
    }
}

/// Kernel entry point called by Limine.
#[no_mangle]
pub unsafe extern "C" fn kmain() -> ! {
    assert!(BASE_REVISION.is_supported());

    let Some(memory_map) = MEMORY_MAP.get_response() else {
        hlt_loop();
    };
    let hhdm_offset = HHDM.get_response().map(|r| r.offset()).unwrap_or(0);

    // Translate the protocol memory map into the hand-off format.
    let mut count = 0usize;
    for entry in memory_map.entries().iter() {
        if count >= MAX_REGIONS {
            break;
        }
        use limine::memory_map::EntryType;
        let kind = if entry.entry_type == EntryType::USABLE {
            MemoryKind::Free
        } else if entry.entry_type == EntryType::BOOTLOADER_RECLAIMABLE
            || entry.entry_type == EntryType::ACPI_RECLAIMABLE
        {
            MemoryKind::Reclaim
        } else {
            MemoryKind::Reserved
        };
        REGIONS[count] = MemoryRegion {
            base: entry.base,
            size: entry.length,
            kind,
        };
        count += 1;
    }

    if let Some(fb) = FRAMEBUFFER
        .get_response()
        .and_then(|r| r.framebuffers().next())
    {
        FRAMEBUFFER_INFO = Some(FramebufferInfo {
            phys_base: (fb.addr() as u64).wrapping_sub(hhdm_offset),
            width: fb.width() as u16,
            height: fb.height() as u16,
            pitch: fb.pitch() as u16,
            bpp: fb.bpp(),
        });
    }

    let (ramdisk_base, ramdisk_size) = MODULES
        .get_response()
        .and_then(|r| r.modules().first().copied())
        .map(|module| (module.addr() as u64, module.size()))
        .unwrap_or((0, 0));

    let cpu_count = MP
        .get_response()
        .map(|r| r.cpus().len() as u64)
        .unwrap_or(1);

    let args = KernelArgs {
        memory_map_base: REGIONS.as_ptr() as u64,
        memory_map_size: (count * core::mem::size_of::<MemoryRegion>()) as u64,
        ramdisk_base,
        ramdisk_size,
        hhdm_offset,
        cpu_count,
    };

    crate::kernel_main(&args as *const _)
}
