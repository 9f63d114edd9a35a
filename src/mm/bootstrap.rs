//! Bootstrap Transition Orchestrator
//!
//! Moves the CPU from physical addressing to the high virtual alias without
//! losing its place:
//!
//! ```text
//! Uninitialized -> PageTablesBuilt -> DualMapped -> EnabledPhysicalVbar
//!     -> ContinuationReached -> VirtualVbarInstalled -> KernelOnly
//!
//! any failure before translation is enabled -> Bypass
//! ```
//!
//! # Design
//! - Every region the CPU touches between the enable instruction and the
//!   first access through the high alias (code, stack, vectors, the
//!   continuation page, UART) is mapped twice: identity in TTBR0 and at
//!   `pa | HIGH_BASE` in TTBR1. The CPU keeps running from the identity
//!   alias right after enable and moves to the high alias explicitly.
//! - VBAR stays physical until execution is confirmed on the high alias, so
//!   an exception right after enable still resolves through TTBR0.
//! - Only this module decides which root a region goes into; the page-table
//!   engine just writes what it is told.
//! - Failures before enable return a [`BootError`] and leave translation
//!   off. Register readback failures panic inside the policy layer.
//! - Before TTBR0 walks are switched off, everything that still holds a low
//!   address is moved: the bootstrap's own borrows, the physical window, the
//!   image's pointer slots and the audit's region names.

use core::fmt;

use log::{debug, info, warn};

use super::address::{PhysAddr, PhysRange, VirtAddr};
use super::audit::MappingAudit;
use super::frame::FrameAllocator;
use super::image::{ImageRelocations, RelocError};
use super::mapper;
use super::paging::{MappingError, PageFlags, PageTableEntry};
use super::policy::{MmuPolicy, PolicyError, SctlrFlags};
use crate::arch::{follow_mut, follow_ref, follow_str, Cpu, SysReg};
use crate::config::{BootLayout, MemoryConfig, VaBits};
use crate::console::Console;

/// Transition states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootPhase {
    Uninitialized,
    PageTablesBuilt,
    DualMapped,
    EnabledPhysicalVbar,
    ContinuationReached,
    VirtualVbarInstalled,
    /// Steady state: only TTBR1 is walked.
    KernelOnly,
    /// Terminal failure: translation stays off for good.
    Bypass,
}

impl BootPhase {
    /// The only legal successor on the success path.
    pub const fn next(self) -> Option<BootPhase> {
        match self {
            Self::Uninitialized => Some(Self::PageTablesBuilt),
            Self::PageTablesBuilt => Some(Self::DualMapped),
            Self::DualMapped => Some(Self::EnabledPhysicalVbar),
            Self::EnabledPhysicalVbar => Some(Self::ContinuationReached),
            Self::ContinuationReached => Some(Self::VirtualVbarInstalled),
            Self::VirtualVbarInstalled => Some(Self::KernelOnly),
            Self::KernelOnly | Self::Bypass => None,
        }
    }

    /// Whether SCTLR.M has been set by the time this phase is reached.
    pub const fn translation_enabled(self) -> bool {
        matches!(
            self,
            Self::EnabledPhysicalVbar
                | Self::ContinuationReached
                | Self::VirtualVbarInstalled
                | Self::KernelOnly
        )
    }

    /// Move to `to`.
    ///
    /// # Panics
    /// Panics on any transition other than [`BootPhase::next`], or on a
    /// downgrade to `Bypass` after translation was enabled.
    pub fn advance(self, to: BootPhase) -> BootPhase {
        let legal = match to {
            Self::Bypass => !self.translation_enabled() && self != Self::Bypass,
            _ => self.next() == Some(to),
        };
        assert!(legal, "illegal bootstrap transition {} -> {}", self, to);
        debug!("{} -> {}", self, to);
        to
    }
}

impl fmt::Display for BootPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::PageTablesBuilt => "page-tables-built",
            Self::DualMapped => "dual-mapped",
            Self::EnabledPhysicalVbar => "enabled-physical-vbar",
            Self::ContinuationReached => "continuation-reached",
            Self::VirtualVbarInstalled => "virtual-vbar-installed",
            Self::KernelOnly => "kernel-only",
            Self::Bypass => "bypass",
        };
        f.write_str(name)
    }
}

/// Which translation roots are live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RootState {
    /// No tables; addresses are physical.
    Identity,
    /// Both roots populated and walked.
    Dual,
    /// Only the TTBR1 root is walked.
    KernelOnly,
}

/// The two L0 tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Roots {
    pub ttbr0: PhysAddr,
    pub ttbr1: PhysAddr,
}

/// Why the transition was abandoned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootCause {
    /// The engine only builds four-level (48-bit) trees.
    UnsupportedVaBits(VaBits),
    /// No frame for an L0 table.
    RootAllocation,
    /// Mapping a region failed.
    Mapping {
        region: &'static str,
        err: MappingError,
    },
    /// The two aliases of a page do not resolve to that page.
    AliasMismatch { region: &'static str, va: VirtAddr },
    /// Code that must run across the switch is mapped execute-never.
    NotExecutable { region: &'static str },
    /// The live stack pointer is outside the dual-mapped stack.
    StackOutsideMapping { sp: usize },
    /// The policy layer refused the table bases.
    Policy(PolicyError),
    /// The image holds pointers that cannot be moved to the high alias.
    Relocation(RelocError),
}

impl fmt::Display for BootCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedVaBits(bits) => write!(f, "{}-bit VA not supported", bits.bits()),
            Self::RootAllocation => write!(f, "no frame for a root table"),
            Self::Mapping { region, err } => write!(f, "mapping '{}': {}", region, err),
            Self::AliasMismatch { region, va } => {
                write!(f, "'{}' aliases disagree at {}", region, va)
            }
            Self::NotExecutable { region } => write!(f, "'{}' is not executable", region),
            Self::StackOutsideMapping { sp } => write!(f, "sp {:#x} outside boot stack", sp),
            Self::Policy(err) => write!(f, "{}", err),
            Self::Relocation(err) => write!(f, "{}", err),
        }
    }
}

/// A transition abandoned in `phase`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootError {
    pub phase: BootPhase,
    pub cause: BootCause,
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bootstrap aborted in {}: {}", self.phase, self.cause)
    }
}

/// Outcome of a completed transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub roots: Roots,
    /// Displacement actually applied to execution and the physical window.
    pub displacement: usize,
}

/// A region mapped at both aliases.
#[derive(Clone, Copy)]
struct Region {
    name: &'static str,
    range: PhysRange,
    flags: PageFlags,
    executable: bool,
}

/// One run of the transition state machine.
pub struct Bootstrap<'a, C: Cpu> {
    config: &'a MemoryConfig,
    layout: &'a BootLayout,
    frames: &'a mut FrameAllocator,
    policy: &'a mut MmuPolicy<C>,
    audit: &'a mut MappingAudit,
    root_state: &'a mut RootState,
    phase: BootPhase,
}

impl<'a, C: Cpu> Bootstrap<'a, C> {
    pub fn new(
        config: &'a MemoryConfig,
        layout: &'a BootLayout,
        frames: &'a mut FrameAllocator,
        policy: &'a mut MmuPolicy<C>,
        audit: &'a mut MappingAudit,
        root_state: &'a mut RootState,
    ) -> Self {
        Self {
            config,
            layout,
            frames,
            policy,
            audit,
            root_state,
            phase: BootPhase::Uninitialized,
        }
    }

    #[inline]
    pub fn phase(&self) -> BootPhase {
        self.phase
    }

    fn advance(&mut self, to: BootPhase) {
        self.phase = self.phase.advance(to);
        info!("bootstrap: {}", to);
    }

    fn fail(&self, cause: BootCause) -> BootError {
        BootError {
            phase: self.phase,
            cause,
        }
    }

    /// Everything that must be reachable through both aliases.
    fn regions(&self) -> [Region; 7] {
        let layout = self.layout;
        [
            Region { name: "text", range: layout.text, flags: PageFlags::KERNEL_TEXT, executable: true },
            Region { name: "rodata", range: layout.rodata, flags: PageFlags::KERNEL_RODATA, executable: false },
            Region { name: "data", range: layout.data, flags: PageFlags::KERNEL_DATA, executable: false },
            Region { name: "stack", range: layout.stack, flags: PageFlags::KERNEL_DATA, executable: false },
            Region {
                name: "vectors",
                range: PhysRange::page_of(layout.vectors),
                flags: PageFlags::KERNEL_TEXT,
                executable: true,
            },
            Region {
                name: "continuation",
                range: PhysRange::page_of(layout.continuation),
                flags: PageFlags::KERNEL_TEXT,
                executable: true,
            },
            Region {
                name: "uart",
                range: PhysRange::page_of(self.config.uart),
                flags: PageFlags::DEVICE,
                executable: false,
            },
        ]
    }

    /// Drive the whole transition.
    ///
    /// Returns once only the TTBR1 root is walked, or with the phase in
    /// which a recoverable failure stopped it. Translation is never left
    /// enabled on the error path.
    pub fn run<K: Console>(mut self, console: &K) -> Result<Transition, BootError> {
        if self.config.va_bits != VaBits::Bits48 {
            return Err(self.fail(BootCause::UnsupportedVaBits(self.config.va_bits)));
        }

        let roots = self.build_page_tables()?;
        self.dual_map(roots)?;
        self.verify_dual_mappings(roots)?;
        self.enable(roots)?;

        // Translation is on; from here failures are fatal, not recoverable
        let displacement = self.continue_at_high_alias(console);
        // SAFETY: everything borrowed lives in the image or on the boot
        // stack, both mapped at the high alias.
        // Audited: 2025-01-04
        let mut this = unsafe { self.follow(displacement) };
        this.install_virtual_vbar();
        this.collapse(displacement);

        Ok(Transition {
            roots,
            displacement,
        })
    }

    /// Re-derive every borrow at the alias execution moved to.
    ///
    /// # Safety
    /// Everything the bootstrap borrows must be mapped at that alias.
    unsafe fn follow(self, displacement: usize) -> Self {
        // SAFETY: forwarded from the caller; each borrow is given up as it
        // is re-derived.
        // Audited: 2025-01-04
        unsafe {
            Self {
                config: follow_ref::<C, _>(self.config, displacement),
                layout: follow_ref::<C, _>(self.layout, displacement),
                frames: follow_mut::<C, _>(self.frames, displacement),
                policy: follow_mut::<C, _>(self.policy, displacement),
                audit: follow_mut::<C, _>(self.audit, displacement),
                root_state: follow_mut::<C, _>(self.root_state, displacement),
                phase: self.phase,
            }
        }
    }

    fn build_page_tables(&mut self) -> Result<Roots, BootError> {
        let parked = self.frames.reserve_pages_for_page_tables(self.config.table_reserve);
        debug!("{} frames parked for tables", parked);

        let ttbr0 = self
            .frames
            .alloc_table_page()
            .ok_or_else(|| self.fail(BootCause::RootAllocation))?;
        let ttbr1 = self
            .frames
            .alloc_table_page()
            .ok_or_else(|| self.fail(BootCause::RootAllocation))?;

        self.advance(BootPhase::PageTablesBuilt);
        info!("roots: TTBR0 {} TTBR1 {}", ttbr0, ttbr1);
        Ok(Roots { ttbr0, ttbr1 })
    }

    fn map_into(
        &mut self,
        root: PhysAddr,
        name: &'static str,
        va_start: VirtAddr,
        range: PhysRange,
        flags: PageFlags,
    ) -> Result<(), BootError> {
        let va_end = va_start.add(range.size());
        mapper::map_range(self.policy.cpu(), self.frames, root, va_start, va_end, range.start, flags)
            .map_err(|err| self.fail(BootCause::Mapping { region: name, err }))?;
        self.audit.record(name, va_start, va_end, range.start, flags);
        Ok(())
    }

    fn dual_map(&mut self, roots: Roots) -> Result<(), BootError> {
        let high = self.config.high_base();

        // Linear window over all of RAM, TTBR1 only. Mapped first so the
        // kernel regions below override its permissions.
        let ram = self.config.memory;
        self.map_into(roots.ttbr1, "ram-linear", ram.start.high_alias(high), ram, PageFlags::KERNEL_DATA)?;

        for region in self.regions() {
            let range = region.range.page_aligned();
            if range.is_empty() {
                continue;
            }
            self.map_into(roots.ttbr0, region.name, range.start.identity(), range, region.flags)?;
            self.map_into(roots.ttbr1, region.name, range.start.high_alias(high), range, region.flags)?;
        }

        *self.root_state = RootState::Dual;
        self.advance(BootPhase::DualMapped);
        Ok(())
    }

    /// Check, by walking both roots, that every dual-mapped page resolves to
    /// itself through either alias and that the switch can run.
    fn verify_dual_mappings(&mut self, roots: Roots) -> Result<(), BootError> {
        let window = self.frames.window();
        let high = self.config.high_base();
        let mut pages = 0;

        for region in self.regions() {
            for pa in region.range.page_aligned().pages() {
                let low = PageTableEntry::from_raw(mapper::get_pte(window, roots.ttbr0, pa.identity()));
                let high_va = pa.high_alias(high);
                let high_entry = PageTableEntry::from_raw(mapper::get_pte(window, roots.ttbr1, high_va));

                for entry in [low, high_entry] {
                    if !entry.is_leaf() || entry.addr() != pa {
                        warn!("'{}' alias check failed for {}: {}", region.name, pa, entry.describe());
                        return Err(self.fail(BootCause::AliasMismatch {
                            region: region.name,
                            va: high_va,
                        }));
                    }
                    if region.executable && !entry.flags().is_executable() {
                        return Err(self.fail(BootCause::NotExecutable { region: region.name }));
                    }
                }
                pages += 1;
            }
        }

        let pointers = ImageRelocations::new(self.layout.relocations)
            .validate(window, self.layout.data)
            .map_err(|err| self.fail(BootCause::Relocation(err)))?;

        let sp = self.policy.cpu().stack_pointer();
        if !self.layout.stack.contains_raw(sp) {
            return Err(self.fail(BootCause::StackOutsideMapping { sp }));
        }

        let conflicts = self.audit.conflicts();
        if conflicts > 0 {
            warn!("{} conflicting overlaps in the mapping audit", conflicts);
        }
        info!(
            "dual mapping verified: {} pages, {} image pointers, sp {:#x}",
            pages, pointers, sp
        );
        Ok(())
    }

    fn enable(&mut self, roots: Roots) -> Result<(), BootError> {
        // Physical VBAR: an exception right after enable resolves via TTBR0
        self.policy.install_vector_base(self.layout.vectors.as_usize());
        self.policy
            .apply_policy_and_enable_dual(roots.ttbr0, roots.ttbr1, self.config.va_bits)
            .map_err(|err| self.fail(BootCause::Policy(err)))?;
        self.advance(BootPhase::EnabledPhysicalVbar);
        Ok(())
    }

    fn continue_at_high_alias<K: Console>(&mut self, console: &K) -> usize {
        let high = self.config.high_base();
        // SAFETY: text, stack and the continuation page were verified at both
        // aliases, and TTBR0 keeps the identity alias live until collapse.
        // Audited: 2025-01-04
        let displacement = unsafe { self.policy.relocate_execution(high) };
        mmu_continuation(self.policy.cpu(), console, self.config.uart.as_usize() | high);
        self.advance(BootPhase::ContinuationReached);
        displacement
    }

    fn install_virtual_vbar(&mut self) {
        let vbar = self.layout.vectors.as_usize() | self.config.high_base();
        // Readback mismatch panics: exceptions would otherwise vector into
        // memory that is about to become unreachable
        self.policy.install_vector_base(vbar);
        self.advance(BootPhase::VirtualVbarInstalled);
    }

    /// Move what still points low, then stop TTBR0 walks.
    fn collapse(&mut self, displacement: usize) {
        let ram = self.frames.window().ptr::<u8>(self.config.memory.start) as usize;
        let shift = C::alias_of(ram, displacement).wrapping_sub(ram);
        // SAFETY: all of RAM is mapped in TTBR1 at its high alias.
        // Audited: 2025-01-04
        unsafe { self.frames.rebase_window(shift) };

        // SAFETY: verify_dual_mappings accepted the table, and the data
        // region is writable through the window.
        // Audited: 2025-01-04
        unsafe { ImageRelocations::new(self.layout.relocations).rebase(self.frames.window(), displacement) };

        // SAFETY: region names are literals in rodata, mapped at both aliases.
        // Audited: 2025-01-04
        self.audit.rebind_names(|name| unsafe { follow_str::<C>(name, displacement) });

        self.policy.set_epd_runtime_kernel();
        self.policy.comprehensive_tlbi_sequence();
        *self.root_state = RootState::KernelOnly;
        self.advance(BootPhase::KernelOnly);
    }
}

/// First code run after the switch that is known to be on the high alias.
///
/// Kept alone in a page-aligned section that is mapped at both aliases.
/// Runs while TTBR0 is still walked, so the low console reference is fine.
#[inline(never)]
#[link_section = ".text.mmu_continuation"]
fn mmu_continuation(cpu: &dyn Cpu, console: &dyn Console, uart_alias: usize) {
    let sctlr = SctlrFlags::from_bits_retain(cpu.read(SysReg::SctlrEl1));
    if !sctlr.contains(SctlrFlags::M) {
        panic!(
            "MMU off at continuation point (SCTLR_EL1 = {:#018x})",
            sctlr.bits()
        );
    }

    if !console.probe(uart_alias, b"[mmu] high UART alias live\n") {
        debug!("console not ready, skipping UART alias probe");
    }
    let old = console.base();
    console.set_base(uart_alias);
    info!("console moved {:#x} -> {:#x}", old, uart_alias);
}
