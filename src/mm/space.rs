//! Address Space
//!
//! The single entry point the rest of the kernel uses for memory. It owns the
//! frame allocator, the policy layer and the translation roots, runs the
//! bootstrap once, and afterwards routes every request according to the
//! recorded [`Mode`]:
//!
//! - `FullMmu`: requests go to the page-table engine, high-half addresses into
//!   the TTBR1 root. Low-half requests are refused once TTBR0 walks are off.
//! - `Bypass`: translation never came up. Frames still work; mapping requests
//!   succeed without doing anything, since every address is physical.

use core::fmt;

use log::{debug, error, info, warn};
use spin::Once;

use super::address::{PhysAddr, PhysRange, PhysWindow, VirtAddr, PAGE_SIZE};
use super::audit::MappingAudit;
use super::bootstrap::{BootError, BootPhase, Bootstrap, RootState, Roots};
use super::frame::{FrameAllocator, FrameError};
use super::mapper;
use super::paging::{MappingError, PageFlags, PageTableEntry};
use super::policy::MmuPolicy;
use crate::arch::{follow_mut, Cpu};
use crate::config::{BootLayout, MemoryConfig};
use crate::console::Console;

/// Physical addresses at or above this have no distinct high alias.
const HIGH_ALIAS_LIMIT: usize = 1 << 47;

/// Addressing mode the kernel settled in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// `init_memory_subsystem` has not run.
    Uninitialized,
    /// Translation enabled, kernel on the high alias.
    FullMmu,
    /// Translation off, physical addressing for good.
    Bypass,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => f.write_str("uninitialized"),
            Self::FullMmu => f.write_str("full MMU"),
            Self::Bypass => f.write_str("bypass"),
        }
    }
}

pub struct AddressSpace<C: Cpu> {
    config: MemoryConfig,
    layout: BootLayout,
    frames: FrameAllocator,
    policy: MmuPolicy<C>,
    audit: MappingAudit,
    roots: Option<Roots>,
    root_state: RootState,
    phase: BootPhase,
    mode: Once<Mode>,
    boot_error: Option<BootError>,
}

impl<C: Cpu> AddressSpace<C> {
    /// Create an address space over `config.memory`, reached through `window`
    /// until translation is enabled.
    pub fn new(cpu: C, config: MemoryConfig, layout: BootLayout, window: PhysWindow) -> Self {
        Self {
            config,
            layout,
            frames: FrameAllocator::new(config.memory, window),
            policy: MmuPolicy::new(cpu),
            audit: MappingAudit::new(),
            roots: None,
            root_state: RootState::Identity,
            phase: BootPhase::Uninitialized,
            mode: Once::new(),
            boot_error: None,
        }
    }

    /// Bring up physical memory management and attempt the switch to virtual
    /// addressing. Runs once; later calls return the recorded mode.
    ///
    /// On success the kernel runs on the high alias. References to the space
    /// the caller keeps must be passed through [`AddressSpace::follow`].
    ///
    /// # Panics
    /// Panics if the frame allocator cannot be initialized, or if a register
    /// readback fails after translation was enabled.
    pub fn init_memory_subsystem<K: Console>(&mut self, console: &K) -> Mode {
        if let Some(&mode) = self.mode.get() {
            debug!("memory subsystem already initialized ({})", mode);
            return mode;
        }

        if let Err(err) = self.frames.init(self.layout.kernel_image) {
            panic!("frame allocator init failed: {}", err);
        }

        let bootstrap = Bootstrap::new(
            &self.config,
            &self.layout,
            &mut self.frames,
            &mut self.policy,
            &mut self.audit,
            &mut self.root_state,
        );

        let (this, mode) = match bootstrap.run(console) {
            Ok(transition) => {
                // SAFETY: the space lives in RAM or the image, both mapped at
                // the high alias.
                // Audited: 2025-01-04
                let this = unsafe { Self::follow(self, transition.displacement) };
                this.roots = Some(transition.roots);
                this.phase = BootPhase::KernelOnly;
                info!(
                    "virtual addressing up, kernel at {:#x}",
                    this.config.high_base()
                );
                (this, Mode::FullMmu)
            }
            Err(err) => {
                error!("{}", err);
                self.enter_bypass(err);
                (self, Mode::Bypass)
            }
        };

        *this.mode.call_once(|| mode)
    }

    /// Reach `space` through the alias execution moved to.
    ///
    /// # Safety
    /// The space must be mapped at that alias, and the old reference must
    /// not be used again.
    pub unsafe fn follow(space: &mut Self, displacement: usize) -> &mut Self {
        // SAFETY: forwarded from the caller.
        // Audited: 2025-01-04
        unsafe { follow_mut::<C, _>(space, displacement) }
    }

    fn enter_bypass(&mut self, err: BootError) {
        warn!("continuing with physical addressing");
        self.phase = err.phase.advance(BootPhase::Bypass);
        self.boot_error = Some(err);
        // Tables built so far are abandoned, never walked
        self.roots = None;
        self.root_state = RootState::Identity;
        self.policy.install_vector_base(self.layout.vectors.as_usize());
    }

    /// Recorded mode.
    pub fn mode(&self) -> Mode {
        self.mode.get().copied().unwrap_or(Mode::Uninitialized)
    }

    #[inline]
    pub fn is_mmu_enabled(&self) -> bool {
        self.mode() == Mode::FullMmu
    }

    /// Whether high-half virtual addresses can be handed out.
    #[inline]
    pub fn is_virtual_addressing_available(&self) -> bool {
        self.is_mmu_enabled() && self.root_state == RootState::KernelOnly
    }

    pub fn alloc_page(&mut self) -> Option<PhysAddr> {
        self.frames.alloc_page()
    }

    pub fn free_page(&mut self, addr: PhysAddr) -> Result<(), FrameError> {
        self.frames.free_page(addr)
    }

    /// Pick the root for `[va_start, va_end)`.
    fn root_for(&self, va_start: VirtAddr, va_end: VirtAddr) -> Result<PhysAddr, MappingError> {
        let roots = self.roots.ok_or(MappingError::Uninitialized)?;
        let last = if va_end > va_start {
            VirtAddr::new_unchecked(va_end.as_usize() - 1)
        } else {
            va_start
        };

        match (va_start.is_high_half(), last.is_high_half()) {
            (true, true) => Ok(roots.ttbr1),
            (false, false) if self.root_state == RootState::KernelOnly => {
                Err(MappingError::LowHalfRetired)
            }
            (false, false) => Ok(roots.ttbr0),
            _ => Err(MappingError::InvalidRange),
        }
    }

    fn map_recorded(
        &mut self,
        name: &'static str,
        va_start: VirtAddr,
        va_end: VirtAddr,
        pa_start: PhysAddr,
        flags: PageFlags,
    ) -> Result<usize, MappingError> {
        match self.mode() {
            Mode::Uninitialized => return Err(MappingError::Uninitialized),
            Mode::Bypass => {
                debug!("bypass: not mapping {}..{}", va_start, va_end);
                return Ok(0);
            }
            Mode::FullMmu => {}
        }

        let root = self.root_for(va_start, va_end)?;
        let mapped = mapper::map_range(self.policy.cpu(), &mut self.frames, root, va_start, va_end, pa_start, flags);
        // On every exit: a leaf may have been replaced, or a failed range
        // may have linked new tables
        self.policy.comprehensive_tlbi_sequence();
        let count = mapped?;
        self.audit.record(name, va_start, va_end, pa_start, flags);
        debug!("mapped {} pages at {} -> {}", count, va_start, pa_start);
        Ok(count)
    }

    /// Map `[va_start, va_end)` onto frames starting at `pa_start`.
    ///
    /// Returns the number of pages mapped; always `Ok(0)` in bypass mode.
    pub fn map_range(
        &mut self,
        va_start: VirtAddr,
        va_end: VirtAddr,
        pa_start: PhysAddr,
        flags: PageFlags,
    ) -> Result<usize, MappingError> {
        self.map_recorded("dynamic", va_start, va_end, pa_start, flags)
    }

    /// Map `size` bytes of MMIO at `pa` to its high alias as Device-nGnRE,
    /// never executable. The range is widened to whole pages, and the last
    /// page below 128 TiB, where the high alias ends, is never mapped.
    pub fn map_device(&mut self, pa: PhysAddr, size: usize) -> Result<usize, MappingError> {
        let end = pa
            .as_usize()
            .checked_add(size.max(1))
            .filter(|&end| end <= HIGH_ALIAS_LIMIT - PAGE_SIZE)
            .ok_or(MappingError::InvalidRange)?;
        let range = PhysRange::new(pa.as_usize(), end).page_aligned();
        let high = self.config.high_base();
        self.map_recorded(
            "device",
            range.start.high_alias(high),
            range.end.high_alias(high),
            range.start,
            PageFlags::DEVICE,
        )
    }

    /// Address at which the kernel reaches the device at `pa` in the
    /// current mode.
    pub fn device_address(&self, pa: PhysAddr) -> usize {
        match self.mode() {
            Mode::FullMmu => pa.as_usize() | self.config.high_base(),
            _ => pa.as_usize(),
        }
    }

    /// Remove the mapping of the page holding `va`. No-op in bypass mode.
    pub fn unmap_page(&mut self, va: VirtAddr) -> Result<(), MappingError> {
        match self.mode() {
            Mode::Uninitialized => return Err(MappingError::Uninitialized),
            Mode::Bypass => return Ok(()),
            Mode::FullMmu => {}
        }

        let va = va.align_down();
        let root = self.root_for(va, va.add(PAGE_SIZE))?;
        let old = mapper::clear_pte(self.policy.cpu(), self.frames.window(), root, va)?;
        self.policy.comprehensive_tlbi_sequence();
        debug!("unmapped {} (was {})", va, old.describe());
        Ok(())
    }

    /// Raw leaf descriptor for `va`, or 0.
    pub fn get_pte(&self, va: VirtAddr) -> u64 {
        let Some(roots) = self.roots else {
            return 0;
        };
        let root = if va.is_high_half() { roots.ttbr1 } else { roots.ttbr0 };
        mapper::get_pte(self.frames.window(), root, va)
    }

    /// Log how `va` translates.
    pub fn describe(&self, va: VirtAddr) {
        let entry = PageTableEntry::from_raw(self.get_pte(va));
        info!("{} ({}): {}", va, self.mode(), entry.describe());
        if let Some(record) = self.audit.find(va) {
            info!("  recorded as '{}' -> {}", record.name, record.phys_for(va));
        }
    }

    #[inline]
    pub fn root_state(&self) -> RootState {
        self.root_state
    }

    /// Last state the bootstrap reached.
    #[inline]
    pub fn phase(&self) -> BootPhase {
        self.phase
    }

    #[inline]
    pub fn roots(&self) -> Option<Roots> {
        self.roots
    }

    /// Why the bootstrap fell back to bypass, if it did.
    #[inline]
    pub fn boot_error(&self) -> Option<BootError> {
        self.boot_error
    }

    #[inline]
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    #[inline]
    pub fn layout(&self) -> &BootLayout {
        &self.layout
    }

    #[inline]
    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    #[inline]
    pub fn policy(&self) -> &MmuPolicy<C> {
        &self.policy
    }

    #[inline]
    pub fn audit(&self) -> &MappingAudit {
        &self.audit
    }
}
