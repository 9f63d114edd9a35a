//! ARM64 Page Table Descriptors
//!
//! Implements 4-level page tables for the ARM64 VMSA (Virtual Memory System Architecture).
//!
//! # Page Table Structure (4KB granule)
//! - L0 (PGD): 512 entries, each covers 512GB
//! - L1 (PUD): 512 entries, each covers 1GB
//! - L2 (PMD): 512 entries, each covers 2MB
//! - L3 (PTE): 512 entries, each covers 4KB
//!
//! # Security Properties
//! - Table descriptors never carry leaf attributes, so the walker cannot
//!   mistake a leaf for a table or the reverse
//! - Leaf descriptors always carry the access flag
//! - Callers supply the whole leaf flag word; nothing here infers permissions

use core::fmt;
use core::ops::{Index, IndexMut};

use bitflags::bitflags;

use super::address::{PhysAddr, ENTRIES_PER_TABLE};
use super::frame::FrameError;

bitflags! {
    /// Descriptor bits for ARM64 stage 1 translation.
    ///
    /// The layout follows the ARMv8-A architecture reference manual. Multi-bit
    /// fields (attribute index, AP, SH) appear as combined constants.
    #[derive(Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u64 {
        /// Entry is valid (bit 0).
        const VALID = 1 << 0;
        /// Table at L0-L2, page at L3 (bit 1).
        const TYPE = 1 << 1;

        // AttrIndx[2:0] at bits [4:2], selects a MAIR slot
        /// MAIR index 1: Normal write-back.
        const ATTR_NORMAL = 1 << 2;
        /// MAIR index 2: Normal non-cacheable.
        const ATTR_NORMAL_NC = 2 << 2;
        /// MAIR index 3: Device-nGnRE.
        const ATTR_DEVICE_NGNRE = 3 << 2;
        /// Full AttrIndx field.
        const ATTR_MASK = 7 << 2;

        /// Non-secure (bit 5).
        const NS = 1 << 5;

        // AP[2:1] at bits [7:6]; 0b00 is EL1 read/write only
        /// AP[1]: EL0 access allowed.
        const AP_EL0 = 1 << 6;
        /// AP[2]: read-only.
        const AP_RO = 1 << 7;

        // SH[1:0] at bits [9:8]
        const SH_OUTER = 0b10 << 8;
        const SH_INNER = 0b11 << 8;

        /// Access flag (bit 10). Set on every leaf so first access never faults.
        const AF = 1 << 10;
        /// Not global (bit 11).
        const NG = 1 << 11;

        /// Contiguous hint (bit 52).
        const CONTIGUOUS = 1 << 52;
        /// Privileged execute-never (bit 53).
        const PXN = 1 << 53;
        /// Unprivileged execute-never (bit 54).
        const UXN = 1 << 54;
    }
}

impl PageFlags {
    /// Kind bits of an L3 page descriptor.
    pub const PAGE: Self = Self::VALID.union(Self::TYPE);

    /// Bits that only mean something in a leaf descriptor.
    pub const LEAF_ATTRIBUTES: Self = Self::ATTR_MASK
        .union(Self::NS)
        .union(Self::AP_EL0)
        .union(Self::AP_RO)
        .union(Self::SH_INNER)
        .union(Self::AF)
        .union(Self::NG)
        .union(Self::CONTIGUOUS)
        .union(Self::PXN)
        .union(Self::UXN);

    /// Kernel code: read-only, executable at EL1 only.
    pub const KERNEL_TEXT: Self = Self::PAGE
        .union(Self::AF)
        .union(Self::SH_INNER)
        .union(Self::ATTR_NORMAL)
        .union(Self::AP_RO)
        .union(Self::UXN);

    /// Kernel read-only data.
    pub const KERNEL_RODATA: Self = Self::PAGE
        .union(Self::AF)
        .union(Self::SH_INNER)
        .union(Self::ATTR_NORMAL)
        .union(Self::AP_RO)
        .union(Self::PXN)
        .union(Self::UXN);

    /// Kernel data, bss, stacks and page tables.
    pub const KERNEL_DATA: Self = Self::PAGE
        .union(Self::AF)
        .union(Self::SH_INNER)
        .union(Self::ATTR_NORMAL)
        .union(Self::PXN)
        .union(Self::UXN);

    /// Device memory (MMIO): Device-nGnRE, never executable.
    pub const DEVICE: Self = Self::PAGE
        .union(Self::AF)
        .union(Self::ATTR_DEVICE_NGNRE)
        .union(Self::PXN)
        .union(Self::UXN);

    /// Check whether this is a complete leaf flag word.
    #[inline]
    pub const fn is_leaf(self) -> bool {
        self.contains(Self::PAGE) && self.contains(Self::AF)
    }

    /// Memory type selected by the attribute index.
    #[inline]
    pub const fn memory_attr(self) -> MemoryAttr {
        MemoryAttr::from_index(((self.bits() >> 2) & 0x7) as u8)
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        !self.contains(Self::AP_RO)
    }

    /// Executable at EL1.
    #[inline]
    pub const fn is_executable(self) -> bool {
        !self.contains(Self::PXN)
    }
}

impl fmt::Debug for PageFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageFlags({:#018x})", self.bits())
    }
}

/// The four memory types programmed into MAIR_EL1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MemoryAttr {
    /// Index 0: strongly ordered device memory.
    DeviceNGnRnE = 0,
    /// Index 1: inner/outer write-back, read/write allocate.
    NormalWriteBack = 1,
    /// Index 2: inner/outer non-cacheable.
    NormalNonCacheable = 2,
    /// Index 3: device memory with early write acknowledgement.
    DeviceNGnRE = 3,
    /// Index 4-7: not programmed.
    Unprogrammed = 0xFF,
}

impl MemoryAttr {
    pub const ALL: [MemoryAttr; 4] = [
        Self::DeviceNGnRnE,
        Self::NormalWriteBack,
        Self::NormalNonCacheable,
        Self::DeviceNGnRE,
    ];

    #[inline]
    pub const fn from_index(index: u8) -> Self {
        match index {
            0 => Self::DeviceNGnRnE,
            1 => Self::NormalWriteBack,
            2 => Self::NormalNonCacheable,
            3 => Self::DeviceNGnRE,
            _ => Self::Unprogrammed,
        }
    }

    /// MAIR byte for this memory type.
    #[inline]
    pub const fn mair_encoding(self) -> u8 {
        match self {
            Self::DeviceNGnRnE => 0x00,
            Self::NormalWriteBack => 0xFF,
            Self::NormalNonCacheable => 0x44,
            Self::DeviceNGnRE => 0x04,
            Self::Unprogrammed => 0x00,
        }
    }

    /// AttrIndx bits for a leaf descriptor.
    #[inline]
    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits_retain(((self as u64) & 0x7) << 2)
    }

    #[inline]
    pub const fn is_device(self) -> bool {
        matches!(self, Self::DeviceNGnRnE | Self::DeviceNGnRE)
    }

    const fn short_name(self) -> &'static str {
        match self {
            Self::DeviceNGnRnE => "dev-nGnRnE",
            Self::NormalWriteBack => "normal-wb",
            Self::NormalNonCacheable => "normal-nc",
            Self::DeviceNGnRE => "dev-nGnRE",
            Self::Unprogrammed => "unprogrammed",
        }
    }
}

/// A single page table entry.
///
/// This is a 64-bit descriptor that either points to a next-level table
/// or maps a physical page to a virtual address.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// Address mask for page table entries (bits [47:12]).
    pub const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

    /// Create an invalid (empty) entry.
    #[inline]
    pub const fn invalid() -> Self {
        Self(0)
    }

    /// Wrap a raw descriptor read back from a table.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Create a table entry pointing to the next level page table.
    ///
    /// Only the kind bits and the address are set.
    #[inline]
    pub const fn table(next_table_phys: PhysAddr) -> Self {
        debug_assert!(next_table_phys.is_aligned());
        Self((next_table_phys.as_u64() & Self::ADDR_MASK) | PageFlags::PAGE.bits())
    }

    /// Create an L3 page entry mapping a physical frame.
    #[inline]
    pub const fn page(phys: PhysAddr, flags: PageFlags) -> Self {
        debug_assert!(phys.is_aligned());
        debug_assert!(flags.is_leaf());
        debug_assert!(flags.bits() & Self::ADDR_MASK == 0);
        Self((phys.as_u64() & Self::ADDR_MASK) | flags.bits())
    }

    /// Check if the entry is valid (present).
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 & PageFlags::VALID.bits() != 0
    }

    /// Check if this is a well-formed table descriptor.
    ///
    /// A valid entry with the type bit set but carrying any leaf attribute
    /// is rejected rather than followed.
    #[inline]
    pub const fn is_table(self) -> bool {
        self.0 & PageFlags::PAGE.bits() == PageFlags::PAGE.bits()
            && self.0 & PageFlags::LEAF_ATTRIBUTES.bits() == 0
    }

    /// Check if this is a leaf (page) descriptor.
    #[inline]
    pub const fn is_leaf(self) -> bool {
        self.flags().is_leaf()
    }

    /// Get the physical address from this entry.
    #[inline]
    pub const fn addr(self) -> PhysAddr {
        PhysAddr::new_unchecked((self.0 & Self::ADDR_MASK) as usize)
    }

    /// Get the flags from this entry.
    #[inline]
    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits_retain(self.0 & !Self::ADDR_MASK)
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Clear the entry (make invalid).
    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Human-readable decoding for diagnostics.
    #[inline]
    pub const fn describe(self) -> Describe {
        Describe(self)
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "PTE(addr={}, flags={:?})", self.addr(), self.flags())
        } else {
            write!(f, "PTE(invalid)")
        }
    }
}

/// Display adapter returned by [`PageTableEntry::describe`].
pub struct Describe(PageTableEntry);

impl fmt::Display for Describe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entry = self.0;
        if !entry.is_valid() {
            return write!(f, "invalid");
        }
        if entry.is_table() {
            return write!(f, "table -> {}", entry.addr());
        }

        let flags = entry.flags();
        let ap = match (flags.contains(PageFlags::AP_RO), flags.contains(PageFlags::AP_EL0)) {
            (false, false) => "RW_EL1",
            (false, true) => "RW_ALL",
            (true, false) => "RO_EL1",
            (true, true) => "RO_ALL",
        };
        let sh = if flags.contains(PageFlags::SH_INNER) {
            "inner"
        } else if flags.contains(PageFlags::SH_OUTER) {
            "outer"
        } else {
            "non"
        };
        write!(
            f,
            "page -> {} {} AP={} SH={}",
            entry.addr(),
            flags.memory_attr().short_name(),
            ap,
            sh
        )?;
        if flags.contains(PageFlags::AF) {
            write!(f, " AF")?;
        }
        if flags.contains(PageFlags::NG) {
            write!(f, " nG")?;
        }
        if flags.contains(PageFlags::PXN) {
            write!(f, " PXN")?;
        }
        if flags.contains(PageFlags::UXN) {
            write!(f, " UXN")?;
        }
        Ok(())
    }
}

/// A page table (one level of the 4-level hierarchy).
///
/// Each page table is 4KB and contains 512 entries.
/// The table must be 4KB aligned in physical memory.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Create a new empty page table (all entries invalid).
    pub const fn new() -> Self {
        const INVALID: PageTableEntry = PageTableEntry::invalid();
        Self {
            entries: [INVALID; ENTRIES_PER_TABLE],
        }
    }

    /// Iterate over all valid entries with their indices.
    pub fn iter_valid(&self) -> impl Iterator<Item = (usize, &PageTableEntry)> {
        self.entries.iter().enumerate().filter(|(_, e)| e.is_valid())
    }

    /// Install a table descriptor at `index`.
    ///
    /// # Panics
    /// Panics if the slot already holds a leaf; overwriting a leaf with a
    /// table would silently change what the walker sees below it.
    #[inline]
    pub fn set_table(&mut self, index: usize, next: PhysAddr) {
        assert!(
            !self.entries[index].is_leaf(),
            "table descriptor over leaf at index {}",
            index
        );
        self.entries[index] = PageTableEntry::table(next);
    }

    /// Install a leaf descriptor at `index`.
    #[inline]
    pub fn set_leaf(&mut self, index: usize, phys: PhysAddr, flags: PageFlags) {
        assert!(flags.is_leaf(), "leaf flags missing kind or AF: {:?}", flags);
        self.entries[index] = PageTableEntry::page(phys, flags);
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Error type for page mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingError {
    /// The virtual address is not mapped.
    NotMapped,
    /// No physical frames available for page tables.
    OutOfMemory,
    /// The address is not properly aligned.
    MisalignedAddress,
    /// `end` lies before `start`, or the range crosses translation halves.
    InvalidRange,
    /// The flag word is not a complete leaf descriptor.
    InvalidFlags,
    /// A non-table descriptor sits where the walk expected a table.
    WalkBlocked,
    /// Low-half mapping requested after TTBR0 walks were disabled.
    LowHalfRetired,
    /// The address space has not been initialized yet.
    Uninitialized,
    /// The frame allocator refused the request.
    Frame(FrameError),
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotMapped => write!(f, "virtual address not mapped"),
            Self::OutOfMemory => write!(f, "out of memory for page tables"),
            Self::MisalignedAddress => write!(f, "address not properly aligned"),
            Self::InvalidRange => write!(f, "invalid virtual range"),
            Self::InvalidFlags => write!(f, "flags are not a leaf descriptor"),
            Self::WalkBlocked => write!(f, "non-table descriptor blocks the walk"),
            Self::LowHalfRetired => write!(f, "low half no longer translated"),
            Self::Uninitialized => write!(f, "address space not initialized"),
            Self::Frame(err) => write!(f, "frame allocator: {}", err),
        }
    }
}

impl From<FrameError> for MappingError {
    fn from(err: FrameError) -> Self {
        Self::Frame(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_and_leaf_kinds_are_exclusive() {
        let table = PageTableEntry::table(PhysAddr::new(0x4010_0000));
        assert!(table.is_table());
        assert!(!table.is_leaf());

        let leaf = PageTableEntry::page(PhysAddr::new(0x4010_0000), PageFlags::KERNEL_DATA);
        assert!(leaf.is_leaf());
        assert!(!leaf.is_table());
        assert_eq!(leaf.addr().as_usize(), 0x4010_0000);
        assert_eq!(leaf.flags(), PageFlags::KERNEL_DATA);
    }

    #[test]
    fn test_attr_index_round_trip() {
        for attr in MemoryAttr::ALL {
            assert_eq!(attr.flags().memory_attr(), attr);
        }
        assert_eq!(PageFlags::DEVICE.memory_attr(), MemoryAttr::DeviceNGnRE);
        assert!(PageFlags::DEVICE.memory_attr().is_device());
        assert_eq!(PageFlags::KERNEL_TEXT.memory_attr(), MemoryAttr::NormalWriteBack);
    }

    #[test]
    fn test_kernel_permissions() {
        assert!(PageFlags::KERNEL_TEXT.is_executable());
        assert!(!PageFlags::KERNEL_TEXT.is_writable());
        assert!(!PageFlags::KERNEL_RODATA.is_executable());
        assert!(PageFlags::KERNEL_DATA.is_writable());
        assert!(!PageFlags::KERNEL_DATA.is_executable());
        assert!(!PageFlags::DEVICE.is_executable());
    }

    #[test]
    fn test_describe() {
        let leaf = PageTableEntry::page(PhysAddr::new(0x0900_0000), PageFlags::DEVICE);
        let text = leaf.describe().to_string();
        assert!(text.contains("dev-nGnRE"));
        assert!(text.contains("AP=RW_EL1"));
        assert!(text.contains("PXN"));
        assert_eq!(PageTableEntry::invalid().describe().to_string(), "invalid");
    }

    #[test]
    #[should_panic(expected = "table descriptor over leaf")]
    fn test_table_over_leaf_panics() {
        let mut table = PageTable::new();
        table.set_leaf(3, PhysAddr::new(0x4000_0000), PageFlags::KERNEL_DATA);
        table.set_table(3, PhysAddr::new(0x4000_1000));
    }
}
