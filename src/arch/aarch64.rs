//! AArch64 implementation of [`Cpu`].
//!
//! Every method is a thin wrapper around the corresponding instruction. No
//! method adds barriers on its own; sequencing belongs to the policy layer.

use core::arch::{asm, global_asm};

use super::{BarrierDomain, Cpu, SysReg};

// Execution relocation. Lives in the continuation page so that it is mapped
// at both aliases while it runs.
//
// x0 = displacement. Rewrites LR, SP, FP and every saved {FP, LR} pair in the
// frame-record chain, stopping at the terminal record (saved FP == 0) that
// boot.S plants before calling kernel_main. Returns the displacement in x0
// and `ret`s through the displaced LR, landing in the caller's high alias.
global_asm!(
    r#"
    .section .text.mmu_continuation, "ax"
    .balign 16
    .global __vmboot_relocate
__vmboot_relocate:
    orr     x30, x30, x0
    mov     x9, sp
    orr     x9, x9, x0
    mov     sp, x9
    orr     x29, x29, x0
    mov     x10, x29
1:
    ldp     x11, x12, [x10]
    cbz     x11, 2f
    orr     x11, x11, x0
    orr     x12, x12, x0
    stp     x11, x12, [x10]
    mov     x10, x11
    b       1b
2:
    dsb     sy
    isb
    ret
    "#
);

extern "C" {
    fn __vmboot_relocate(displacement: usize) -> usize;
}

/// The boot CPU.
pub struct Aarch64Cpu {
    _private: (),
}

impl Aarch64Cpu {
    /// # Safety
    /// There must be exactly one `Aarch64Cpu` for the running core, and the
    /// caller must be executing at EL1.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

macro_rules! mrs {
    ($reg:literal) => {{
        let value: u64;
        // SAFETY: reading an EL1 system register has no side effects.
        // Audited: 2025-01-04
        unsafe { asm!(concat!("mrs {}, ", $reg), out(reg) value, options(nomem, nostack, preserves_flags)) };
        value
    }};
}

macro_rules! msr {
    ($reg:literal, $value:expr) => {{
        // SAFETY: forwarded from Cpu::write.
        // Audited: 2025-01-04
        unsafe { asm!(concat!("msr ", $reg, ", {}"), in(reg) $value, options(nostack, preserves_flags)) };
    }};
}

impl Cpu for Aarch64Cpu {
    fn read(&self, reg: SysReg) -> u64 {
        match reg {
            SysReg::MairEl1 => mrs!("mair_el1"),
            SysReg::TcrEl1 => mrs!("tcr_el1"),
            SysReg::Ttbr0El1 => mrs!("ttbr0_el1"),
            SysReg::Ttbr1El1 => mrs!("ttbr1_el1"),
            SysReg::SctlrEl1 => mrs!("sctlr_el1"),
            SysReg::VbarEl1 => mrs!("vbar_el1"),
        }
    }

    unsafe fn write(&mut self, reg: SysReg, value: u64) {
        match reg {
            SysReg::MairEl1 => msr!("mair_el1", value),
            SysReg::TcrEl1 => msr!("tcr_el1", value),
            SysReg::Ttbr0El1 => msr!("ttbr0_el1", value),
            SysReg::Ttbr1El1 => msr!("ttbr1_el1", value),
            SysReg::SctlrEl1 => msr!("sctlr_el1", value),
            SysReg::VbarEl1 => msr!("vbar_el1", value),
        }
    }

    fn dsb(&self, domain: BarrierDomain) {
        // SAFETY: barriers only order memory accesses.
        // Audited: 2025-01-04
        unsafe {
            match domain {
                BarrierDomain::Sy => asm!("dsb sy", options(nostack, preserves_flags)),
                BarrierDomain::Ish => asm!("dsb ish", options(nostack, preserves_flags)),
                BarrierDomain::Nsh => asm!("dsb nsh", options(nostack, preserves_flags)),
            }
        }
    }

    fn isb(&self) {
        // SAFETY: barriers only order instruction fetch.
        // Audited: 2025-01-04
        unsafe { asm!("isb", options(nostack, preserves_flags)) };
    }

    fn clean_dcache_line(&self, addr: usize) {
        // SAFETY: a clean by VA only writes back dirty data.
        // Audited: 2025-01-04
        unsafe { asm!("dc cvac, {}", in(reg) addr, options(nostack, preserves_flags)) };
    }

    unsafe fn tlbi_vmalle1(&mut self) {
        // SAFETY: forwarded from the trait contract.
        // Audited: 2025-01-04
        unsafe { asm!("tlbi vmalle1", options(nostack, preserves_flags)) };
    }

    fn stack_pointer(&self) -> usize {
        let sp: usize;
        // SAFETY: reading SP has no side effects.
        // Audited: 2025-01-04
        unsafe { asm!("mov {}, sp", out(reg) sp, options(nomem, nostack, preserves_flags)) };
        sp
    }

    unsafe fn relocate(&mut self, displacement: usize) -> usize {
        // SAFETY: forwarded from the trait contract; the routine only touches
        // x9-x12, LR, FP, SP and the frame records it walks.
        // Audited: 2025-01-04
        unsafe { __vmboot_relocate(displacement) }
    }
}
