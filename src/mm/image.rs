//! Kernel Image Pointers
//!
//! The kernel is linked as a position-independent executable at its load
//! address, and the linker applies every `R_AARCH64_RELATIVE` record for that
//! address. The records name each place where the image stores an absolute
//! address of itself: vtables, GOT slots, pointer tables. Once execution has
//! moved to another alias they must be applied again for that alias, or the
//! first indirect call jumps back into the low half.
//!
//! # Invariants
//! - Every record is `R_AARCH64_RELATIVE`
//! - Every slot is 8-byte aligned and lies in the data region, the only part
//!   of the image that is mapped writable

use core::fmt;
use core::mem::size_of;

use log::debug;

use super::address::{PhysAddr, PhysRange, PhysWindow};

/// `R_AARCH64_RELATIVE`: slot = load base + addend.
pub const R_AARCH64_RELATIVE: u32 = 1027;

/// One `Elf64_Rela` record from `.rela.dyn`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rela {
    pub offset: u64,
    pub info: u64,
    pub addend: i64,
}

impl Rela {
    pub const fn relative(slot: PhysAddr, target: usize) -> Self {
        Self {
            offset: slot.as_u64(),
            info: R_AARCH64_RELATIVE as u64,
            addend: target as i64,
        }
    }

    #[inline]
    pub const fn kind(&self) -> u32 {
        self.info as u32
    }

    /// Where the pointer is stored. The image runs at its link address, so
    /// the offset is physical.
    #[inline]
    pub const fn slot(&self) -> PhysAddr {
        PhysAddr::new_unchecked(self.offset as usize)
    }

    /// Address the pointer holds at the link address.
    #[inline]
    pub const fn target(&self) -> usize {
        self.addend as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocError {
    /// The table is not a whole number of records.
    MalformedTable { size: usize },
    /// A record of a kind that cannot be re-applied by adding a displacement.
    Unsupported { slot: PhysAddr, kind: u32 },
    /// The slot is misaligned or would be written through a read-only
    /// mapping.
    BadSlot { slot: PhysAddr },
}

impl fmt::Display for RelocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedTable { size } => {
                write!(f, "relocation table of {} bytes is not whole records", size)
            }
            Self::Unsupported { slot, kind } => {
                write!(f, "relocation type {} at {} not supported", kind, slot)
            }
            Self::BadSlot { slot } => write!(f, "relocation slot {} outside writable data", slot),
        }
    }
}

/// The relocation records of the running image.
#[derive(Clone, Copy, Debug)]
pub struct ImageRelocations {
    table: PhysRange,
}

impl ImageRelocations {
    pub const fn new(table: PhysRange) -> Self {
        Self { table }
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.table.size() / size_of::<Rela>()
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn records(&self, window: PhysWindow) -> &[Rela] {
        if self.is_empty() {
            return &[];
        }
        // SAFETY: the table is part of the image, reachable through the
        // window, and the linker aligns .rela.dyn to 8 bytes.
        // Audited: 2025-01-04
        unsafe { core::slice::from_raw_parts(window.ptr::<Rela>(self.table.start), self.len()) }
    }

    /// Check that every record can be re-applied. Returns the record count.
    pub fn validate(&self, window: PhysWindow, data: PhysRange) -> Result<usize, RelocError> {
        let size = self.table.size();
        if size % size_of::<Rela>() != 0 || self.table.start.as_usize() % 8 != 0 {
            return Err(RelocError::MalformedTable { size });
        }

        for rela in self.records(window) {
            let slot = rela.slot();
            if rela.kind() != R_AARCH64_RELATIVE {
                return Err(RelocError::Unsupported {
                    slot,
                    kind: rela.kind(),
                });
            }
            let end = slot.as_usize().checked_add(size_of::<u64>());
            let inside = end.map_or(false, |end| {
                data.contains(slot) && end <= data.end.as_usize()
            });
            if slot.as_usize() % 8 != 0 || !inside {
                return Err(RelocError::BadSlot { slot });
            }
        }
        Ok(self.len())
    }

    /// Re-apply every record for execution displaced by `displacement`,
    /// writing through `window`. Returns the number of slots rewritten.
    ///
    /// # Safety
    /// [`ImageRelocations::validate`] must have accepted the table, and
    /// `window` must reach the data region writable.
    pub unsafe fn rebase(&self, window: PhysWindow, displacement: usize) -> usize {
        let mut count = 0;
        for rela in self.records(window) {
            let value = (rela.target() | displacement) as u64;
            // SAFETY: validate placed the slot in the data region.
            // Audited: 2025-01-04
            unsafe { window.ptr::<u64>(rela.slot()).write(value) };
            count += 1;
        }
        debug!("{} image pointers rebased by {:#x}", count, displacement);
        count
    }
}
