//! ARM64 Exception Handling
//!
//! Decodes and reports exceptions taken while the kernel brings up virtual
//! memory. Nothing here is recoverable: the kernel runs with interrupts
//! masked and has no EL0, so every exception is either a translation
//! problem or a bug. The handler prints the syndrome and halts.
//!
//! # Exception Levels
//! - EL1: Kernel (where we run)
//! - EL2: Hypervisor (QEMU), left by boot.S before `kernel_main`
//!
//! # Vector Layout
//! boot.S installs 16 entries and passes the entry index to
//! [`handle_exception`]:
//!
//! | index | source               | kinds                   |
//! |-------|----------------------|-------------------------|
//! | 0-3   | current EL, SP_EL0   | sync, IRQ, FIQ, SError  |
//! | 4-7   | current EL, SP_ELx   | sync, IRQ, FIQ, SError  |
//! | 8-11  | lower EL, AArch64    | sync, IRQ, FIQ, SError  |
//! | 12-15 | lower EL, AArch32    | sync, IRQ, FIQ, SError  |

use core::fmt;

/// Exception context saved on the stack by boot.S
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ExceptionContext {
    /// General purpose registers x0-x30
    pub gpr: [u64; 31],
    /// Exception Link Register (return address)
    pub elr: u64,
    /// Saved Program Status Register
    pub spsr: u64,
    /// Exception Syndrome Register
    pub esr: u64,
    /// Fault Address Register
    pub far: u64,
}

/// Exception class extracted from ESR_EL1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionClass {
    Unknown = 0x00,
    SvcAarch64 = 0x15,
    InstructionAbortLowerEl = 0x20,
    InstructionAbortSameEl = 0x21,
    PcAlignment = 0x22,
    DataAbortLowerEl = 0x24,
    DataAbortSameEl = 0x25,
    SpAlignment = 0x26,
    SError = 0x2F,
    Other = 0xFF,
}

impl From<u64> for ExceptionClass {
    fn from(esr: u64) -> Self {
        let ec = ((esr >> 26) & 0x3F) as u8;
        match ec {
            0x00 => ExceptionClass::Unknown,
            0x15 => ExceptionClass::SvcAarch64,
            0x20 => ExceptionClass::InstructionAbortLowerEl,
            0x21 => ExceptionClass::InstructionAbortSameEl,
            0x22 => ExceptionClass::PcAlignment,
            0x24 => ExceptionClass::DataAbortLowerEl,
            0x25 => ExceptionClass::DataAbortSameEl,
            0x26 => ExceptionClass::SpAlignment,
            0x2F => ExceptionClass::SError,
            _ => ExceptionClass::Other,
        }
    }
}

impl ExceptionClass {
    #[inline]
    pub fn is_abort(self) -> bool {
        matches!(
            self,
            Self::InstructionAbortLowerEl
                | Self::InstructionAbortSameEl
                | Self::DataAbortLowerEl
                | Self::DataAbortSameEl
        )
    }
}

/// Fault status of an instruction or data abort (ESR ISS bits [5:0]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStatus {
    AddressSize { level: u8 },
    /// No valid descriptor at `level`: the address is not mapped.
    Translation { level: u8 },
    /// Leaf found with AF clear.
    AccessFlag { level: u8 },
    /// Leaf found, access not permitted (AP, PXN, UXN).
    Permission { level: u8 },
    Alignment,
    Other(u8),
}

impl FaultStatus {
    pub fn from_esr(esr: u64) -> Self {
        let fsc = (esr & 0x3F) as u8;
        let level = fsc & 0b11;
        match fsc >> 2 {
            0b0000 => Self::AddressSize { level },
            0b0001 => Self::Translation { level },
            0b0010 => Self::AccessFlag { level },
            0b0011 => Self::Permission { level },
            _ if fsc == 0b10_0001 => Self::Alignment,
            _ => Self::Other(fsc),
        }
    }
}

impl fmt::Display for FaultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddressSize { level } => write!(f, "address size fault, level {}", level),
            Self::Translation { level } => write!(f, "translation fault, level {}", level),
            Self::AccessFlag { level } => write!(f, "access flag fault, level {}", level),
            Self::Permission { level } => write!(f, "permission fault, level {}", level),
            Self::Alignment => write!(f, "alignment fault"),
            Self::Other(fsc) => write!(f, "fault status {:#04x}", fsc),
        }
    }
}

/// Where a vector entry was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorSource {
    CurrentElSp0,
    CurrentElSpx,
    LowerElAarch64,
    LowerElAarch32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorKind {
    Sync,
    Irq,
    Fiq,
    SError,
}

/// Split a vector table index (0-15) into source and kind.
pub const fn decode_vector(index: u64) -> (VectorSource, VectorKind) {
    let source = match (index >> 2) & 0b11 {
        0 => VectorSource::CurrentElSp0,
        1 => VectorSource::CurrentElSpx,
        2 => VectorSource::LowerElAarch64,
        _ => VectorSource::LowerElAarch32,
    };
    let kind = match index & 0b11 {
        0 => VectorKind::Sync,
        1 => VectorKind::Irq,
        2 => VectorKind::Fiq,
        _ => VectorKind::SError,
    };
    (source, kind)
}

/// Entry point from every vector in boot.S.
///
/// `ctx` points at the context boot.S saved on the current stack.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
#[no_mangle]
pub extern "C" fn handle_exception(ctx: &ExceptionContext, vector: u64) -> ! {
    use crate::kprintln;

    let (source, kind) = decode_vector(vector);
    let ec = ExceptionClass::from(ctx.esr);

    kprintln!();
    kprintln!("!!! KERNEL EXCEPTION !!!");
    kprintln!("Vector: {:?} {:?}", source, kind);
    if kind == VectorKind::Sync {
        kprintln!("Exception Class: {:?}", ec);
        if ec.is_abort() {
            kprintln!("Fault: {}", FaultStatus::from_esr(ctx.esr));
            kprintln!("FAR: 0x{:016x}", ctx.far);
        }
    }
    kprintln!("ESR: 0x{:016x}", ctx.esr);
    kprintln!("ELR: 0x{:016x}", ctx.elr);
    kprintln!("SPSR: 0x{:016x}", ctx.spsr);

    crate::arch::halt();
}
