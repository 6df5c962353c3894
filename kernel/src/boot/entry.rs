// Boot hand-off structures. The boot protocol front-end (Limine today)
// fills these in; everything past kmain() consumes only this contract.

/// Arguments handed to `kernel_main`.
#[repr(C, packed(8))]
pub struct KernelArgs {
    pub memory_map_base: u64,
    pub memory_map_size: u64,
    /// Ramdisk module (ustar archive); 0 when absent.
    pub ramdisk_base: u64,
    pub ramdisk_size: u64,
    /// Higher-half direct map offset.
    pub hhdm_offset: u64,
    /// CPUs brought up by the boot protocol.
    pub cpu_count: u64,
}

#[repr(C, packed(8))]
#[derive(Clone, Copy)]
pub struct MemoryRegion {
    pub base: u64,
    pub size: u64,
    pub kind: MemoryKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum MemoryKind {
    Null = 0,
    Free = 1,
    Reclaim = 2,
    Reserved = 3,
}
