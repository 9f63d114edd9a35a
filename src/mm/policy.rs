//! MMU Policy Layer
//!
//! The only code that writes MAIR_EL1, TCR_EL1, TTBR0_EL1, TTBR1_EL1,
//! SCTLR_EL1 and VBAR_EL1, issues TLB invalidates, or sequences the barriers
//! around enabling translation. [`MmuPolicy`] owns the [`Cpu`]; other
//! components get `&C` at most.
//!
//! # Design
//! - These registers depend on each other at every instant (TCR's walk
//!   disables must agree with what the TTBRs point at), so they are changed
//!   in one fixed order from one place
//! - Every write is read back. A mismatch is fatal: the kernel panics and the
//!   panic handler halts, because running on with a half-applied policy
//!   corrupts memory silently
//! - TLB invalidation is core-local and skips I-cache maintenance; the
//!   bootstrap runs on a single core

use core::fmt;

use bitflags::bitflags;
use log::{debug, error, info, trace};

use super::address::PhysAddr;
use super::paging::{MemoryAttr, PageFlags};
use crate::arch::{BarrierDomain, Cpu, SysReg};
use crate::config::VaBits;

bitflags! {
    /// Single-bit TCR_EL1 controls. Multi-bit fields are built by
    /// [`tcr_encoding`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TcrFlags: u64 {
        /// Disable TTBR0 walks.
        const EPD0 = 1 << 7;
        /// TTBR1 selects the ASID.
        const A1 = 1 << 22;
        /// Disable TTBR1 walks.
        const EPD1 = 1 << 23;
        /// 16-bit ASIDs.
        const AS = 1 << 36;
        /// Ignore the top byte of TTBR0 addresses.
        const TBI0 = 1 << 37;
        /// Ignore the top byte of TTBR1 addresses.
        const TBI1 = 1 << 38;
    }
}

bitflags! {
    /// SCTLR_EL1 bits the memory subsystem cares about.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SctlrFlags: u64 {
        /// Stage 1 translation enable.
        const M = 1 << 0;
        /// Alignment check.
        const A = 1 << 1;
        /// Data cacheability.
        const C = 1 << 2;
        /// Instruction cacheability.
        const I = 1 << 12;
        /// Write permission implies execute-never.
        const WXN = 1 << 19;
    }
}

// TCR_EL1 field encodings
const TCR_T0SZ_SHIFT: u64 = 0;
const TCR_IRGN0_WBWA: u64 = 0b01 << 8;
const TCR_ORGN0_WBWA: u64 = 0b01 << 10;
const TCR_SH0_INNER: u64 = 0b11 << 12;
const TCR_TG0_4K: u64 = 0b00 << 14;
const TCR_T1SZ_SHIFT: u64 = 16;
const TCR_IRGN1_WBWA: u64 = 0b01 << 24;
const TCR_ORGN1_WBWA: u64 = 0b01 << 26;
const TCR_SH1_INNER: u64 = 0b11 << 28;
const TCR_TG1_4K: u64 = 0b10 << 30;
const TCR_IPS_40BIT: u64 = 0b010 << 32;

/// Which translation halves the hardware may walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranslationWalk {
    /// Both TTBR0 and TTBR1 are walked (bootstrap window).
    Dual,
    /// Only TTBR1 is walked (steady state).
    KernelOnly,
}

/// Errors the policy layer reports without touching any register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyError {
    /// A translation table base is not 4KB aligned.
    MisalignedTableBase { reg: SysReg, addr: PhysAddr },
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MisalignedTableBase { reg, addr } => {
                write!(f, "{} base {} is not 4KB aligned", reg, addr)
            }
        }
    }
}

/// MAIR_EL1 value with [`MemoryAttr`] slots 0-3 programmed.
pub const fn mair_encoding() -> u64 {
    let mut value = 0u64;
    let mut slot = 0;
    while slot < MemoryAttr::ALL.len() {
        value |= (MemoryAttr::ALL[slot].mair_encoding() as u64) << (slot * 8);
        slot += 1;
    }
    value
}

/// Full TCR_EL1 value for `va_bits` and `walk`.
///
/// Both halves use a 4KB granule, inner-shareable write-back walks, a 40-bit
/// IPA size, top-byte-ignore and 8-bit ASIDs. The two walk modes differ only
/// in EPD0.
pub const fn tcr_encoding(va_bits: VaBits, walk: TranslationWalk) -> u64 {
    let tnsz = va_bits.tnsz();
    let mut value = (tnsz << TCR_T0SZ_SHIFT)
        | TCR_IRGN0_WBWA
        | TCR_ORGN0_WBWA
        | TCR_SH0_INNER
        | TCR_TG0_4K
        | (tnsz << TCR_T1SZ_SHIFT)
        | TCR_IRGN1_WBWA
        | TCR_ORGN1_WBWA
        | TCR_SH1_INNER
        | TCR_TG1_4K
        | TCR_IPS_40BIT
        | TcrFlags::TBI0.bits()
        | TcrFlags::TBI1.bits();

    if let TranslationWalk::KernelOnly = walk {
        value |= TcrFlags::EPD0.bits();
    }
    value
}

/// Decode the memory type selected by a leaf descriptor.
#[inline]
pub const fn decode_attr_index(flags: PageFlags) -> MemoryAttr {
    flags.memory_attr()
}

/// Check whether a leaf descriptor maps device memory.
#[inline]
pub const fn is_device_memory(flags: PageFlags) -> bool {
    flags.memory_attr().is_device()
}

/// Sole owner of the MMU control registers.
pub struct MmuPolicy<C: Cpu> {
    cpu: C,
}

impl<C: Cpu> MmuPolicy<C> {
    pub const fn new(cpu: C) -> Self {
        Self { cpu }
    }

    /// Read-only access to the CPU.
    #[inline]
    pub fn cpu(&self) -> &C {
        &self.cpu
    }

    /// Write `value` to `reg`. No barrier.
    fn write(&mut self, reg: SysReg, value: u64) {
        trace!("{} <- {:#018x}", reg, value);
        // SAFETY: every caller below is part of an ordered policy sequence.
        // Audited: 2025-01-04
        unsafe { self.cpu.write(reg, value) };
    }

    /// Read `reg` back and halt the kernel if it does not hold `expected`
    /// under `mask`.
    fn verify(&self, reg: SysReg, expected: u64, mask: u64) {
        let actual = self.cpu.read(reg);
        if actual & mask != expected & mask {
            error!(
                "{} readback mismatch: wrote {:#018x}, read {:#018x}",
                reg, expected, actual
            );
            panic!(
                "{} readback mismatch: wrote {:#018x}, read {:#018x}",
                reg, expected, actual
            );
        }
    }

    /// Program MAIR slots 0-3 (Device-nGnRnE, Normal WB, Normal NC,
    /// Device-nGnRE). Idempotent.
    pub fn configure_mair(&mut self) {
        let value = mair_encoding();
        self.write(SysReg::MairEl1, value);
        self.cpu.isb();
        self.verify(SysReg::MairEl1, value, u64::MAX);
    }

    fn configure_tcr(&mut self, va_bits: VaBits, walk: TranslationWalk) {
        let value = tcr_encoding(va_bits, walk);
        self.write(SysReg::TcrEl1, value);
        self.cpu.isb();
        self.verify(SysReg::TcrEl1, value, u64::MAX);
        debug!("TCR_EL1 = {:#018x} ({:?}, {}-bit VA)", value, walk, va_bits.bits());
    }

    /// TCR with both halves walked.
    pub fn configure_tcr_dual(&mut self, va_bits: VaBits) {
        self.configure_tcr(va_bits, TranslationWalk::Dual);
    }

    /// TCR with TTBR0 walks disabled.
    pub fn configure_tcr_kernel_only(&mut self, va_bits: VaBits) {
        self.configure_tcr(va_bits, TranslationWalk::KernelOnly);
    }

    /// Point TTBR0 and TTBR1 at the given L0 tables.
    ///
    /// Both bases must be 4KB aligned; a misaligned base is refused before
    /// either register is written.
    pub fn set_ttbr_bases(&mut self, ttbr0: PhysAddr, ttbr1: PhysAddr) -> Result<(), PolicyError> {
        for (reg, addr) in [(SysReg::Ttbr0El1, ttbr0), (SysReg::Ttbr1El1, ttbr1)] {
            if !addr.is_aligned() {
                error!("refusing {} base {}", reg, addr);
                return Err(PolicyError::MisalignedTableBase { reg, addr });
            }
        }

        self.write(SysReg::Ttbr0El1, ttbr0.as_u64());
        self.write(SysReg::Ttbr1El1, ttbr1.as_u64());
        self.cpu.isb();
        self.verify(SysReg::Ttbr0El1, ttbr0.as_u64(), u64::MAX);
        self.verify(SysReg::Ttbr1El1, ttbr1.as_u64(), u64::MAX);
        Ok(())
    }

    /// Invalidate this core's EL1 TLB.
    ///
    /// `dsb sy`, `tlbi vmalle1`, `dsb nsh`, then `isb`. The invalidate is not
    /// broadcast and the I-cache is left alone.
    pub fn comprehensive_tlbi_sequence(&mut self) {
        self.cpu.dsb(BarrierDomain::Sy);
        // SAFETY: bracketed by the barriers on either side.
        // Audited: 2025-01-04
        unsafe { self.cpu.tlbi_vmalle1() };
        self.cpu.dsb(BarrierDomain::Nsh);
        self.cpu.isb();
    }

    /// Set SCTLR_EL1.M and nothing else.
    pub fn enable_translation(&mut self) {
        let sctlr = self.cpu.read(SysReg::SctlrEl1);
        let value = sctlr | SctlrFlags::M.bits();
        self.write(SysReg::SctlrEl1, value);
        self.cpu.isb();
        self.verify(SysReg::SctlrEl1, value, SctlrFlags::M.bits());
    }

    /// Whether stage 1 translation is currently on.
    #[inline]
    pub fn is_translation_enabled(&self) -> bool {
        SctlrFlags::from_bits_retain(self.cpu.read(SysReg::SctlrEl1)).contains(SctlrFlags::M)
    }

    fn apply(
        &mut self,
        ttbr0: PhysAddr,
        ttbr1: PhysAddr,
        va_bits: VaBits,
        walk: TranslationWalk,
    ) -> Result<(), PolicyError> {
        self.configure_mair();
        self.configure_tcr(va_bits, walk);
        self.set_ttbr_bases(ttbr0, ttbr1)?;

        // Pre-enable: table writes and register updates complete
        self.cpu.dsb(BarrierDomain::Sy);
        self.cpu.isb();

        self.comprehensive_tlbi_sequence();
        self.enable_translation();

        // Post-enable
        self.cpu.isb();
        self.cpu.dsb(BarrierDomain::Sy);
        self.cpu.isb();

        info!(
            "translation on ({:?}): TTBR0={} TTBR1={}",
            walk, ttbr0, ttbr1
        );
        Ok(())
    }

    /// The steady-state entry point: MAIR, kernel-only TCR, TTBRs,
    /// pre-enable barrier, TLB invalidate, enable, post-enable barrier.
    pub fn apply_policy_and_enable(
        &mut self,
        ttbr0: PhysAddr,
        ttbr1: PhysAddr,
        va_bits: VaBits,
    ) -> Result<(), PolicyError> {
        self.apply(ttbr0, ttbr1, va_bits, TranslationWalk::KernelOnly)
    }

    /// Same sequence as [`apply_policy_and_enable`] with both halves walked,
    /// for the bootstrap window where the identity alias must stay live.
    ///
    /// [`apply_policy_and_enable`]: MmuPolicy::apply_policy_and_enable
    pub fn apply_policy_and_enable_dual(
        &mut self,
        ttbr0: PhysAddr,
        ttbr1: PhysAddr,
        va_bits: VaBits,
    ) -> Result<(), PolicyError> {
        self.apply(ttbr0, ttbr1, va_bits, TranslationWalk::Dual)
    }

    fn set_epd(&mut self, walk: TranslationWalk) {
        let tcr = self.cpu.read(SysReg::TcrEl1);
        let value = match walk {
            TranslationWalk::Dual => tcr & !(TcrFlags::EPD0 | TcrFlags::EPD1).bits(),
            TranslationWalk::KernelOnly => (tcr | TcrFlags::EPD0.bits()) & !TcrFlags::EPD1.bits(),
        };
        self.write(SysReg::TcrEl1, value);
        self.cpu.isb();
        self.verify(SysReg::TcrEl1, value, u64::MAX);
    }

    /// Clear EPD0 and EPD1, preserving every other TCR field.
    pub fn set_epd_bootstrap_dual(&mut self) {
        self.set_epd(TranslationWalk::Dual);
    }

    /// Set EPD0 and clear EPD1, preserving every other TCR field.
    pub fn set_epd_runtime_kernel(&mut self) {
        self.set_epd(TranslationWalk::KernelOnly);
    }

    /// Point VBAR_EL1 at the vector table at `addr`.
    pub fn install_vector_base(&mut self, addr: usize) {
        self.write(SysReg::VbarEl1, addr as u64);
        self.cpu.isb();
        self.verify(SysReg::VbarEl1, addr as u64, u64::MAX);
    }

    /// Continue execution on the alias `displacement` bytes higher.
    ///
    /// # Safety
    /// See [`Cpu::relocate`].
    pub unsafe fn relocate_execution(&mut self, displacement: usize) -> usize {
        // SAFETY: forwarded from the caller.
        // Audited: 2025-01-04
        unsafe { self.cpu.relocate(displacement) }
    }
}
