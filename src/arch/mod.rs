//! CPU Access Layer
//!
//! The [`Cpu`] trait is the single seam between the memory subsystem and the
//! processor's system registers. On the target it is implemented with inline
//! assembly by [`aarch64::Aarch64Cpu`]; host tests substitute a recording
//! mock.
//!
//! Only the MMU policy layer owns a `Cpu` value. Everything else sees at
//! most a shared reference, which cannot write registers or invalidate the
//! TLB because those methods take `&mut self`.
//!
//! [`publish_descriptor`] is the one sequence the page-table engine issues
//! itself: a cache clean and two barriers after each descriptor write. It
//! needs only a shared reference.

use core::fmt;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub mod aarch64;

/// System registers the memory subsystem reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysReg {
    MairEl1,
    TcrEl1,
    Ttbr0El1,
    Ttbr1El1,
    SctlrEl1,
    VbarEl1,
}

impl SysReg {
    pub const ALL: [SysReg; 6] = [
        Self::MairEl1,
        Self::TcrEl1,
        Self::Ttbr0El1,
        Self::Ttbr1El1,
        Self::SctlrEl1,
        Self::VbarEl1,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::MairEl1 => "MAIR_EL1",
            Self::TcrEl1 => "TCR_EL1",
            Self::Ttbr0El1 => "TTBR0_EL1",
            Self::Ttbr1El1 => "TTBR1_EL1",
            Self::SctlrEl1 => "SCTLR_EL1",
            Self::VbarEl1 => "VBAR_EL1",
        }
    }
}

impl fmt::Display for SysReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shareability domain of a data synchronization barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierDomain {
    /// Full system.
    Sy,
    /// Inner shareable.
    Ish,
    /// Non-shareable (this core only).
    Nsh,
}

/// Privileged access to the processor.
///
/// Methods that change translation state take `&mut self`; readers and
/// barriers take `&self`.
pub trait Cpu {
    /// Read a system register.
    fn read(&self, reg: SysReg) -> u64;

    /// Write a system register. No barrier is implied.
    ///
    /// # Safety
    /// Writing translation or vector registers changes how every subsequent
    /// memory access is interpreted.
    unsafe fn write(&mut self, reg: SysReg, value: u64);

    /// Data synchronization barrier.
    fn dsb(&self, domain: BarrierDomain);

    /// Instruction synchronization barrier.
    fn isb(&self);

    /// Clean the data cache line holding `addr` to the point of coherency.
    fn clean_dcache_line(&self, addr: usize);

    /// Invalidate all stage 1 EL1 TLB entries on this core only.
    ///
    /// # Safety
    /// Must be bracketed by the barriers the caller's protocol requires.
    unsafe fn tlbi_vmalle1(&mut self);

    /// Current stack pointer.
    fn stack_pointer(&self) -> usize;

    /// Move execution onto the alias `displacement` bytes above the current
    /// one: the return address, stack pointer, frame pointer and every saved
    /// frame record in the chain are displaced. Returns the displacement that
    /// was actually applied.
    ///
    /// # Safety
    /// Code, stack and every frame in the chain must be mapped at the new
    /// alias. Raw pointers held elsewhere keep their old values.
    unsafe fn relocate(&mut self, displacement: usize) -> usize;

    /// Address at which the object at `addr` is reached once execution has
    /// moved `displacement` bytes up. Both halves map the same frames, so
    /// this is the high alias of `addr`.
    #[inline]
    fn alias_of(addr: usize, displacement: usize) -> usize
    where
        Self: Sized,
    {
        addr | displacement
    }
}

/// Make a descriptor written at `entry` visible to the table walker: clean
/// its line to the point of coherency, `dsb ish`, then `isb`.
#[inline]
pub fn publish_descriptor<C: Cpu>(cpu: &C, entry: *const u64) {
    cpu.clean_dcache_line(entry as usize);
    cpu.dsb(BarrierDomain::Ish);
    cpu.isb();
}

/// Re-derive `r` at the alias execution moved to.
///
/// # Safety
/// The object must be mapped at [`Cpu::alias_of`] of its address, and `r`
/// must not be used again.
#[inline]
pub unsafe fn follow_mut<'a, C: Cpu, T>(r: &'a mut T, displacement: usize) -> &'a mut T {
    let addr = C::alias_of(r as *mut T as usize, displacement);
    // SAFETY: same object, reached through the other alias; the caller gives
    // up the original borrow.
    // Audited: 2025-01-04
    unsafe { &mut *(addr as *mut T) }
}

/// Shared-reference form of [`follow_mut`].
///
/// # Safety
/// The object must be mapped at [`Cpu::alias_of`] of its address.
#[inline]
pub unsafe fn follow_ref<'a, C: Cpu, T>(r: &'a T, displacement: usize) -> &'a T {
    let addr = C::alias_of(r as *const T as usize, displacement);
    // SAFETY: same object, reached through the other alias.
    // Audited: 2025-01-04
    unsafe { &*(addr as *const T) }
}

/// Re-derive a string stored in the image at the alias execution moved to.
///
/// # Safety
/// The string's bytes must be mapped at [`Cpu::alias_of`] of their address.
#[inline]
pub unsafe fn follow_str<C: Cpu>(s: &'static str, displacement: usize) -> &'static str {
    if s.is_empty() {
        return s;
    }
    let addr = C::alias_of(s.as_ptr() as usize, displacement);
    // SAFETY: the same bytes through the other alias, so still UTF-8.
    // Audited: 2025-01-04
    unsafe { core::str::from_utf8_unchecked(core::slice::from_raw_parts(addr as *const u8, s.len())) }
}

/// Halt the CPU in a low-power state.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn halt() -> ! {
    loop {
        // SAFETY: WFI is always safe to execute
        // Audited: 2025-01-04
        unsafe {
            core::arch::asm!("wfi", options(nostack, nomem));
        }
    }
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub fn halt() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{aliased, CpuEvent, MockCpu};
    use std::vec::Vec;

    /// Every `unsafe` block outside the tests carries an audit line in the
    /// comment right above it.
    fn unaudited(source: &str) -> Vec<usize> {
        let code = source.split("#[cfg(test)]\nmod tests").next().unwrap_or(source);
        let lines: Vec<&str> = code.lines().collect();
        let mut missing = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            if !line.contains("unsafe {") {
                continue;
            }
            let audited = lines[..i]
                .iter()
                .rev()
                .take_while(|l| l.trim_start().starts_with("//"))
                .any(|l| l.contains("Audited:"));
            if !audited {
                missing.push(i + 1);
            }
        }
        missing
    }

    #[test]
    fn test_unsafe_blocks_are_audited() {
        assert_eq!(unaudited(include_str!("mod.rs")), Vec::<usize>::new());
        assert_eq!(unaudited(include_str!("aarch64.rs")), Vec::<usize>::new());
    }

    #[test]
    fn test_publish_descriptor_order() {
        let cpu = MockCpu::new();
        let slot = 0x4000_1008u64;
        publish_descriptor(&cpu, &slot);
        let addr = &slot as *const u64 as usize;
        assert_eq!(
            cpu.events(),
            [CpuEvent::CleanDcache(addr), CpuEvent::Dsb(BarrierDomain::Ish), CpuEvent::Isb]
        );
    }

    #[test]
    fn test_follow_goes_through_alias_of() {
        let _cpu = MockCpu::new();
        let mut value = 7u32;
        let addr = &value as *const u32 as usize;
        // SAFETY: the mock maps everything at its own address.
        let followed = unsafe { follow_mut::<MockCpu, _>(&mut value, 0xFFFF_8000_0000_0000) };
        *followed += 1;
        // SAFETY: as above; the literal lives in the test binary.
        let name = unsafe { follow_str::<MockCpu>("text", 0xFFFF_8000_0000_0000) };
        assert_eq!(name, "text");
        assert_eq!(value, 8);
        assert_eq!(aliased()[0], addr);
        assert_eq!(aliased().len(), 2);
    }
}
