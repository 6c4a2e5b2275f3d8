//! Kestrel kernel binary entry point

#![no_std]
#![no_main]

extern crate alloc;
extern crate kestrel;

use core::panic::PanicInfo;

use kestrel::arch::Architecture;
use kestrel::boot::BootInfo;
use kestrel::{kernel, log_error, sched, smp};

/// Kernel entry point
///
/// The boot stub hands over a populated `BootInfo` after setting up
/// the initial stack and the identity map.
#[no_mangle]
pub extern "C" fn _start(boot_info: &'static BootInfo) -> ! {
    kernel_main(boot_info)
}

/// Main kernel initialization
fn kernel_main(boot_info: &'static BootInfo) -> ! {
    if let Err(e) = kernel::init(boot_info) {
        log_error!("kernel", "init failed: {}", e);
        halt_forever();
    }

    kestrel::println!("{} v{} ready", kestrel::NAME, kestrel::VERSION);

    // Hand the CPU to the scheduler. The boot context becomes the
    // idle task, so control returns here whenever nothing is ready.
    if let Err(e) = sched::start() {
        log_error!("kernel", "scheduler start failed: {}", e);
        halt_forever();
    }

    loop {
        smp::cpu_sleep();
    }
}

fn halt_forever() -> ! {
    kestrel::arch::ArchImpl::disable_interrupts();
    loop {
        kestrel::arch::ArchImpl::wait_for_interrupt();
    }
}

/// Panic handler for the kernel binary
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    kestrel::panic::kernel_panic(info)
}
