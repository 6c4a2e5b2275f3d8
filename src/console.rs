//! Console output for the Kestrel kernel
//!
//! Serial console on COM1. The kernel proper never formats into heap
//! buffers; everything goes byte-at-a-time through the UART with
//! LSR-polled transmit. Under test the output is captured into a
//! fixed buffer so tests can assert on it.

use core::fmt::{self, Write};
use spin::Mutex;

/// COM1 base port
const COM1: u16 = 0x3F8;

/// Line status register offset
const LSR: u16 = 5;

/// LSR transmit-holding-register-empty bit
const LSR_THRE: u8 = 1 << 5;

/// Capture buffer size for test builds
#[cfg(test)]
const CAPTURE_LEN: usize = 32768;

/// Console writer interface
pub struct Console {
    #[cfg(test)]
    buffer: heapless::String<CAPTURE_LEN>,
}

impl Console {
    /// Create a new console instance
    pub const fn new() -> Self {
        Console {
            #[cfg(test)]
            buffer: heapless::String::new(),
        }
    }

    /// Write a byte to the console
    pub fn write_byte(&mut self, byte: u8) {
        #[cfg(test)]
        {
            if byte.is_ascii() {
                let _ = self.buffer.push(byte as char);
            }
        }

        #[cfg(not(test))]
        {
            use crate::arch;
            while arch::inb(COM1 + LSR) & LSR_THRE == 0 {
                core::hint::spin_loop();
            }
            arch::outb(COM1, byte);
        }
    }

    /// Write a string to the console
    pub fn write_str(&mut self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
    }

    /// Clear the console state
    pub fn clear(&mut self) {
        #[cfg(test)]
        self.buffer.clear();
    }

    /// Captured output (test builds only)
    #[cfg(test)]
    pub fn captured(&self) -> &str {
        self.buffer.as_str()
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_str(s);
        Ok(())
    }
}

/// Global console instance
static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

/// Initialize the console subsystem
pub fn init() {
    #[cfg(not(test))]
    {
        use crate::arch;
        // 115200 8N1: DLAB on, divisor 1, then 8 data bits, no parity
        arch::outb(COM1 + 1, 0x00); // interrupts off
        arch::outb(COM1 + 3, 0x80); // DLAB
        arch::outb(COM1, 0x01); // divisor low
        arch::outb(COM1 + 1, 0x00); // divisor high
        arch::outb(COM1 + 3, 0x03); // 8N1
        arch::outb(COM1 + 2, 0xC7); // FIFO on, cleared, 14-byte threshold
    }
    CONSOLE.lock().clear();
}

/// Print formatted text to the console
pub fn print(args: fmt::Arguments) {
    let _ = CONSOLE.lock().write_fmt(args);
}

/// Run a closure against the captured output (test builds only)
#[cfg(test)]
pub fn with_captured<R>(f: impl FnOnce(&str) -> R) -> R {
    f(CONSOLE.lock().captured())
}

/// Reset the captured output (test builds only)
#[cfg(test)]
pub fn clear_captured() {
    CONSOLE.lock().clear();
}

/// Print macro for kernel use
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::print(format_args!($($arg)*));
    };
}

/// Print with newline macro
#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n");
    };
    ($($arg:tt)*) => {
        $crate::console::print(format_args!("{}\n", format_args!($($arg)*)))
    };
}
