//! Platform Configuration
//!
//! Fixed constants supplied to the memory subsystem. Nothing here is
//! computed at runtime: the board description is a `const` and the kernel
//! image layout comes from linker symbols.

use crate::mm::address::{PhysAddr, PhysRange, HIGH_BASE};

/// QEMU virt machine PL011 UART base address
pub const UART_PHYS_BASE: usize = 0x0900_0000;

/// Start of RAM managed by the frame allocator
pub const MEMORY_START: usize = 0x4000_0000;

/// End of RAM managed by the frame allocator (128 MiB)
pub const MEMORY_END: usize = 0x4800_0000;

/// Kernel physical load address
pub const KERNEL_PHYS_BASE: usize = 0x4008_0000;

/// Width of the virtual address space in both translation halves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VaBits {
    /// 39-bit VA (three-level walk from L1).
    Bits39,
    /// 48-bit VA (four-level walk from L0).
    Bits48,
}

impl VaBits {
    #[inline]
    pub const fn bits(self) -> u32 {
        match self {
            Self::Bits39 => 39,
            Self::Bits48 => 48,
        }
    }

    /// TnSZ field value for TCR_EL1 (64 - VA bits).
    #[inline]
    pub const fn tnsz(self) -> u64 {
        64 - self.bits() as u64
    }

    /// Base of the high alias window in the TTBR1 half.
    #[inline]
    pub const fn high_base(self) -> usize {
        match self {
            Self::Bits39 => 0xFFFF_FFC0_0000_0000,
            Self::Bits48 => HIGH_BASE,
        }
    }
}

/// Board memory description.
#[derive(Clone, Copy, Debug)]
pub struct MemoryConfig {
    /// RAM managed by the frame allocator, `[MEMORY_START, MEMORY_END)`.
    pub memory: PhysRange,
    /// PL011 MMIO base.
    pub uart: PhysAddr,
    /// Virtual address width programmed into TCR.
    pub va_bits: VaBits,
    /// Pages parked for page tables before the bootstrap starts mapping.
    pub table_reserve: usize,
}

impl MemoryConfig {
    /// QEMU `virt` with 128 MiB of RAM.
    pub const QEMU_VIRT: Self = Self {
        memory: PhysRange::new(MEMORY_START, MEMORY_END),
        uart: PhysAddr::new_unchecked(UART_PHYS_BASE),
        va_bits: VaBits::Bits48,
        table_reserve: 96,
    };

    #[inline]
    pub const fn high_base(&self) -> usize {
        self.va_bits.high_base()
    }
}

/// Physical layout of the loaded kernel image.
///
/// Built once by the boot path from linker symbols. All ranges are physical
/// and, for a well-formed linker script, page aligned.
#[derive(Clone, Copy, Debug)]
pub struct BootLayout {
    /// Whole image, from the load address to the end of the boot stack.
    pub kernel_image: PhysRange,
    pub text: PhysRange,
    pub rodata: PhysRange,
    /// `.data` and `.bss`.
    pub data: PhysRange,
    /// The boot stack the CPU is running on during the transition.
    pub stack: PhysRange,
    /// Exception vector table (2 KiB aligned).
    pub vectors: PhysAddr,
    /// Page holding the post-enable continuation routine.
    pub continuation: PhysAddr,
    /// `.rela.dyn`: the image's relative relocation records.
    pub relocations: PhysRange,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tnsz() {
        assert_eq!(VaBits::Bits48.tnsz(), 16);
        assert_eq!(VaBits::Bits39.tnsz(), 25);
    }

    #[test]
    fn test_qemu_virt_region() {
        let cfg = MemoryConfig::QEMU_VIRT;
        assert_eq!(cfg.memory.size(), 128 * 1024 * 1024);
        assert!(cfg.memory.contains(PhysAddr::new(KERNEL_PHYS_BASE)));
        assert_eq!(cfg.high_base() | UART_PHYS_BASE, 0xFFFF_8000_0900_0000);
    }
}
