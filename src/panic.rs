//! Kernel panic handling

use core::panic::PanicInfo;

use crate::arch::Architecture;
use crate::log_error;

/// Log the panic and halt the current CPU
///
/// The system never attempts to continue from an inconsistent state;
/// interrupts stay disabled and the CPU parks in a halt loop.
pub fn kernel_panic(info: &PanicInfo) -> ! {
    crate::arch::ArchImpl::disable_interrupts();

    if let Some(location) = info.location() {
        log_error!(
            "panic",
            "kernel panic at {}:{}: {}",
            location.file(),
            location.line(),
            info.message()
        );
    } else {
        log_error!("panic", "kernel panic: {}", info.message());
    }

    loop {
        crate::arch::ArchImpl::wait_for_interrupt();
    }
}
