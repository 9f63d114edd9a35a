//! Physical and Virtual Address Types
//!
//! Type-safe wrappers for memory addresses that prevent mixing
//! physical and virtual addresses at compile time.
//!
//! # Security Properties
//! - Physical addresses cannot be dereferenced directly; every access goes
//!   through a [`PhysWindow`]
//! - Virtual addresses are kept in canonical (sign-extended) form
//! - Alignment is checked by the consumers that require it, never rounded
//!   silently

use core::fmt;

/// Page size (4 KiB)
pub const PAGE_SIZE: usize = 4096;
/// Page size mask
pub const PAGE_MASK: usize = PAGE_SIZE - 1;
/// Bits to shift for page number
pub const PAGE_SHIFT: usize = 12;

/// Number of entries per page table (512 for 4KB granule)
pub const ENTRIES_PER_TABLE: usize = 512;

/// Fixed high-virtual alias base for a 48-bit address space.
///
/// A physical address `pa` is reachable through TTBR1 at `pa | HIGH_BASE`.
pub const HIGH_BASE: usize = 0xFFFF_8000_0000_0000;

/// Lowest address translated through TTBR1 with a 48-bit VA space.
pub const HIGH_HALF_START: usize = 0xFFFF_0000_0000_0000;

/// A physical memory address.
///
/// This is a newtype wrapper that prevents accidental mixing of
/// physical and virtual addresses. Physical addresses cannot be
/// directly dereferenced - they must be mapped to virtual addresses first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    /// Create a new physical address.
    ///
    /// # Panics
    /// Panics in debug mode if the address uses more than 48 bits.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        // ARM64 with 48-bit physical addressing
        debug_assert!(addr <= 0x0000_FFFF_FFFF_FFFF);
        Self(addr)
    }

    /// Create a physical address without validation (const-compatible).
    #[inline]
    pub const fn new_unchecked(addr: usize) -> Self {
        Self(addr)
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Get the raw address as u64 (for page table entries).
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0 as u64
    }

    /// Check if the address is page-aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Align the address down to the nearest page boundary.
    #[inline]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Align the address up to the nearest page boundary.
    #[inline]
    pub const fn align_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Get the page frame number.
    #[inline]
    pub const fn page_frame_number(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Create from a page frame number.
    #[inline]
    pub const fn from_page_frame_number(pfn: usize) -> Self {
        Self(pfn << PAGE_SHIFT)
    }

    /// Add an offset to this address.
    #[inline]
    pub const fn add(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }

    /// Byte distance from `base` up to this address.
    #[inline]
    pub const fn offset_from(self, base: PhysAddr) -> usize {
        self.0 - base.0
    }

    /// The identity alias of this address (VA numerically equal to PA).
    #[inline]
    pub const fn identity(self) -> VirtAddr {
        VirtAddr::new(self.0)
    }

    /// The high alias of this address in the TTBR1 half.
    #[inline]
    pub const fn high_alias(self, high_base: usize) -> VirtAddr {
        VirtAddr::new(self.0 | high_base)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#018x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// A virtual memory address.
///
/// This is a newtype wrapper that enforces the ARM64 canonical
/// address format (sign-extended from bit 47).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    /// Create a new virtual address with canonical form validation.
    ///
    /// ARM64 requires that bits [63:48] are all copies of bit 47.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        let canonical = Self::make_canonical(addr);
        Self(canonical)
    }

    /// Create a virtual address without validation.
    #[inline]
    pub const fn new_unchecked(addr: usize) -> Self {
        Self(addr)
    }

    /// Convert an address to canonical form.
    ///
    /// If bit 47 is set, bits 48-63 must all be 1.
    /// If bit 47 is clear, bits 48-63 must all be 0.
    #[inline]
    const fn make_canonical(addr: usize) -> usize {
        // Sign-extend from bit 47
        let bit47 = (addr >> 47) & 1;
        if bit47 == 1 {
            addr | 0xFFFF_0000_0000_0000
        } else {
            addr & 0x0000_FFFF_FFFF_FFFF
        }
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Get the raw address as u64.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0 as u64
    }

    /// Check if the address is page-aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Align the address down to the nearest page boundary.
    #[inline]
    pub const fn align_down(self) -> Self {
        Self::new(self.0 & !PAGE_MASK)
    }

    /// Get the page table indices for this address.
    ///
    /// Returns (L0, L1, L2, L3) indices for 4-level paging.
    #[inline]
    pub const fn page_table_indices(self) -> (usize, usize, usize, usize) {
        let addr = self.0;
        let l0 = (addr >> 39) & 0x1FF;
        let l1 = (addr >> 30) & 0x1FF;
        let l2 = (addr >> 21) & 0x1FF;
        let l3 = (addr >> 12) & 0x1FF;
        (l0, l1, l2, l3)
    }

    /// Get the page offset (lowest 12 bits).
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Add an offset to this address.
    #[inline]
    pub const fn add(self, offset: usize) -> Self {
        Self::new(self.0.wrapping_add(offset))
    }

    /// Check if this address is translated through TTBR1.
    #[inline]
    pub const fn is_high_half(self) -> bool {
        self.0 >= HIGH_HALF_START
    }

    /// Check if this address is translated through TTBR0.
    #[inline]
    pub const fn is_low_half(self) -> bool {
        self.0 < HIGH_HALF_START
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#018x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// A half-open physical range `[start, end)`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PhysRange {
    pub start: PhysAddr,
    pub end: PhysAddr,
}

impl PhysRange {
    #[inline]
    pub const fn new(start: usize, end: usize) -> Self {
        Self {
            start: PhysAddr::new_unchecked(start),
            end: PhysAddr::new_unchecked(end),
        }
    }

    /// The single page containing `addr`.
    #[inline]
    pub const fn page_of(addr: PhysAddr) -> Self {
        let start = addr.align_down();
        Self {
            start,
            end: start.add(PAGE_SIZE),
        }
    }

    /// Widen the range outwards to page boundaries.
    #[inline]
    pub const fn page_aligned(self) -> Self {
        Self {
            start: self.start.align_down(),
            end: self.end.align_up(),
        }
    }

    #[inline]
    pub const fn size(self) -> usize {
        self.end.as_usize().saturating_sub(self.start.as_usize())
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.size() == 0
    }

    /// Number of whole pages covered, rounding a partial last page up.
    #[inline]
    pub const fn page_count(self) -> usize {
        (self.size() + PAGE_MASK) >> PAGE_SHIFT
    }

    #[inline]
    pub const fn contains(self, addr: PhysAddr) -> bool {
        addr.as_usize() >= self.start.as_usize() && addr.as_usize() < self.end.as_usize()
    }

    /// Check whether `addr` (any address space) falls numerically inside.
    #[inline]
    pub const fn contains_raw(self, addr: usize) -> bool {
        addr >= self.start.as_usize() && addr < self.end.as_usize()
    }

    /// Iterate over the page-aligned addresses of every page in the range.
    pub fn pages(self) -> impl Iterator<Item = PhysAddr> {
        (self.start.as_usize()..self.end.as_usize())
            .step_by(PAGE_SIZE)
            .map(PhysAddr::new_unchecked)
    }
}

impl fmt::Debug for PhysRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}..{:#x})", self.start.as_usize(), self.end.as_usize())
    }
}

/// The displacement through which the kernel reaches physical memory.
///
/// With the MMU off the window is the identity. Once execution has collapsed
/// onto the high alias the window is rebased so that `pa` is reached at
/// `pa + HIGH_BASE`. Host tests point the window at an ordinary buffer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PhysWindow {
    offset: usize,
}

impl PhysWindow {
    /// A window where every physical address is its own pointer.
    ///
    /// # Safety
    /// Only valid while translation is off, or while an identity mapping of
    /// every physical address touched through the window is live.
    #[inline]
    pub const unsafe fn identity() -> Self {
        Self { offset: 0 }
    }

    /// A window that reaches `pa` at `pa.wrapping_add(offset)`.
    ///
    /// # Safety
    /// Every physical address accessed through the window must be backed by
    /// readable and writable memory at the displaced address.
    #[inline]
    pub const unsafe fn with_offset(offset: usize) -> Self {
        Self { offset }
    }

    #[inline]
    pub const fn offset(self) -> usize {
        self.offset
    }

    /// Shift the window by `displacement`.
    ///
    /// # Safety
    /// Same contract as [`PhysWindow::with_offset`] for the resulting window.
    #[inline]
    pub const unsafe fn rebased(self, displacement: usize) -> Self {
        Self {
            offset: self.offset.wrapping_add(displacement),
        }
    }

    /// Pointer through which `pa` is accessed.
    #[inline]
    pub fn ptr<T>(self, pa: PhysAddr) -> *mut T {
        pa.as_usize().wrapping_add(self.offset) as *mut T
    }
}

impl fmt::Debug for PhysWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysWindow(+{:#x})", self.offset)
    }
}
