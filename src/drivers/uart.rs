//! PL011 UART Driver for QEMU virt machine
//!
//! This driver provides serial console output for the kernel.
//!
//! # Memory Map (QEMU virt)
//! - Physical base: 0x0900_0000
//! - Register size: 0x1000 bytes
//! - After the switch to virtual addressing the same registers are reached
//!   through the high alias `0x0900_0000 | HIGH_BASE`
//!
//! # Security Considerations
//! - Output only
//! - Unsafe code is limited to the two MMIO accesses in `write_byte_at`
//! - Uses spinlock for thread-safe access

use core::fmt::{self, Write};
use spin::Mutex;

use crate::config::UART_PHYS_BASE;
use crate::console::Console;

/// PL011 Register offsets
mod regs {
    /// Data Register - read/write data
    pub const DR: usize = 0x00;
    /// Flag Register - status flags
    pub const FR: usize = 0x18;
}

/// Flag Register bits
mod flags {
    /// Transmit FIFO full
    pub const TXFF: u32 = 1 << 5;
}

/// PL011 UART driver
pub struct Uart {
    base: usize,
    initialized: bool,
}

impl Uart {
    /// Create a new UART instance (not yet initialized)
    pub const fn new(base: usize) -> Self {
        Self {
            base,
            initialized: false,
        }
    }

    /// Initialize the UART
    ///
    /// # Safety
    /// - Must only be called once
    /// - UART base address must be valid
    ///
    /// SAFETY AUDIT: 2025-01-04
    /// - Base address 0x0900_0000 is guaranteed by QEMU virt memory map
    /// - Called only once during boot from kernel_main
    pub unsafe fn init(&mut self) {
        // PL011 is already initialized by QEMU, just mark as ready
        self.initialized = true;
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Move the driver to another alias of the same registers.
    #[inline]
    pub fn set_base(&mut self, base: usize) {
        self.base = base;
    }

    /// Write a single byte to the PL011 at `base`.
    ///
    /// SAFETY AUDIT: 2025-01-04
    /// - Callers pass either the physical base or an alias mapped as device
    ///   memory
    /// - Volatile access is appropriate for MMIO
    fn write_byte_at(&self, base: usize, byte: u8) {
        if !self.initialized {
            return;
        }

        // SAFETY: base is the PL011 block at an address that is currently
        // mapped (or physical with the MMU off).
        // Audited: 2025-01-04
        unsafe {
            let fr = (base + regs::FR) as *const u32;
            let dr = (base + regs::DR) as *mut u32;

            // Wait for transmit FIFO to have space
            while core::ptr::read_volatile(fr) & flags::TXFF != 0 {
                core::hint::spin_loop();
            }

            core::ptr::write_volatile(dr, byte as u32);
        }
    }

    fn write_bytes_at(&self, base: usize, bytes: &[u8]) {
        for &byte in bytes {
            if byte == b'\n' {
                self.write_byte_at(base, b'\r');
            }
            self.write_byte_at(base, byte);
        }
    }

    /// Write a string to the UART
    pub fn write_str(&self, s: &str) {
        self.write_bytes_at(self.base, s.as_bytes());
    }
}

impl Write for Uart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        Uart::write_str(self, s);
        Ok(())
    }
}

/// Global UART instance protected by spinlock
pub static UART: Mutex<Uart> = Mutex::new(Uart::new(UART_PHYS_BASE));

/// [`Console`] over the global [`UART`].
pub struct KernelConsole;

impl Console for KernelConsole {
    fn write_str(&self, s: &str) {
        UART.lock().write_str(s);
    }

    fn base(&self) -> usize {
        UART.lock().base()
    }

    fn set_base(&self, base: usize) {
        UART.lock().set_base(base);
    }

    fn probe(&self, base: usize, bytes: &[u8]) -> bool {
        let uart = UART.lock();
        if !uart.is_initialized() {
            return false;
        }
        uart.write_bytes_at(base, bytes);
        true
    }
}

/// Print macro for kernel output
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let mut uart = $crate::drivers::uart::UART.lock();
        let _ = write!(uart, $($arg)*);
    }};
}

/// Println macro for kernel output
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint!("\n")
    };
    ($($arg:tt)*) => {{
        $crate::kprint!($($arg)*);
        $crate::kprint!("\n");
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uninitialized_uart_stays_silent() {
        // Never touches MMIO until init()
        let mut uart = Uart::new(UART_PHYS_BASE);
        uart.write_str("dropped\n");
        uart.set_base(0xFFFF_8000_0900_0000);
        assert_eq!(uart.base(), 0xFFFF_8000_0900_0000);
        assert!(!uart.is_initialized());
    }
}
