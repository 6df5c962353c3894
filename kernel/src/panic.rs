//! Panic handling: log the location and stop the CPU. Kernel-mode
//! faults and broken invariants land here; user faults never do.

use core::panic::PanicInfo;

pub fn panic_handler(info: &PanicInfo) -> ! {
    crate::kprintln!("");
    crate::kprintln!("==================== KERNEL PANIC ====================");
    if let Some(location) = info.location() {
        crate::kprintln!(
            "at {}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        );
    }
    crate::kprintln!("{}", info.message());
    crate::kprintln!("======================================================");

    crate::arch::x86_64::halt_forever()
}
