//! Mapping Audit Trail
//!
//! A bounded, append-only record of every region the kernel maps. It is
//! diagnostic only: translation never consults it. The bootstrap uses it to
//! spot overlapping regions that disagree about the physical frame behind a
//! virtual page.

use log::{info, warn};

use super::address::{PhysAddr, VirtAddr};
use super::paging::PageFlags;

/// Maximum number of recorded mappings.
pub const MAX_MAPPINGS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingRecord {
    pub virt_start: VirtAddr,
    /// Exclusive.
    pub virt_end: VirtAddr,
    pub phys_start: PhysAddr,
    pub flags: PageFlags,
    pub name: &'static str,
}

impl MappingRecord {
    #[inline]
    pub fn contains(&self, va: VirtAddr) -> bool {
        va >= self.virt_start && va < self.virt_end
    }

    /// Physical address `va` resolves to under this record.
    #[inline]
    pub fn phys_for(&self, va: VirtAddr) -> PhysAddr {
        self.phys_start.add(va.as_usize() - self.virt_start.as_usize())
    }

    fn overlap(&self, other: &MappingRecord) -> Option<VirtAddr> {
        let start = self.virt_start.max(other.virt_start);
        let end = self.virt_end.min(other.virt_end);
        (start < end).then_some(start)
    }
}

pub struct MappingAudit {
    records: [Option<MappingRecord>; MAX_MAPPINGS],
    len: usize,
    dropped: usize,
}

impl MappingAudit {
    pub const fn new() -> Self {
        Self {
            records: [None; MAX_MAPPINGS],
            len: 0,
            dropped: 0,
        }
    }

    /// Append a record. Returns `false` (and counts the drop) when full.
    pub fn record(
        &mut self,
        name: &'static str,
        virt_start: VirtAddr,
        virt_end: VirtAddr,
        phys_start: PhysAddr,
        flags: PageFlags,
    ) -> bool {
        if self.len == MAX_MAPPINGS {
            self.dropped += 1;
            warn!("audit trail full, dropping '{}' at {}", name, virt_start);
            return false;
        }

        self.records[self.len] = Some(MappingRecord {
            virt_start,
            virt_end,
            phys_start,
            flags,
            name,
        });
        self.len += 1;
        true
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Records that did not fit.
    #[inline]
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = &MappingRecord> {
        self.records[..self.len].iter().flatten()
    }

    /// Most recent record covering `va`.
    pub fn find(&self, va: VirtAddr) -> Option<&MappingRecord> {
        self.records[..self.len].iter().rev().flatten().find(|r| r.contains(va))
    }

    /// Count overlapping record pairs that translate a shared page to
    /// different physical frames. Overlaps that agree on the frame (a
    /// narrower region re-mapped with tighter permissions) are fine.
    pub fn conflicts(&self) -> usize {
        let mut conflicts = 0;
        for (i, a) in self.iter().enumerate() {
            for b in self.iter().skip(i + 1) {
                let Some(va) = a.overlap(b) else {
                    continue;
                };
                if a.phys_for(va) != b.phys_for(va) {
                    warn!(
                        "'{}' and '{}' disagree at {}: {} vs {}",
                        a.name,
                        b.name,
                        va,
                        a.phys_for(va),
                        b.phys_for(va)
                    );
                    conflicts += 1;
                }
            }
        }
        conflicts
    }

    /// Replace every record's name with `f(name)`. Names point into the
    /// image, so they follow it when it changes alias.
    pub fn rebind_names(&mut self, f: impl Fn(&'static str) -> &'static str) {
        for record in self.records[..self.len].iter_mut().flatten() {
            record.name = f(record.name);
        }
    }

    pub fn log_all(&self) {
        for record in self.iter() {
            info!(
                "{:<14} [{}..{}) -> {} {:?}",
                record.name, record.virt_start, record.virt_end, record.phys_start, record.flags
            );
        }
        if self.dropped > 0 {
            warn!("{} mappings not recorded", self.dropped);
        }
    }
}

impl Default for MappingAudit {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn va(addr: usize) -> VirtAddr {
        VirtAddr::new(addr)
    }

    fn pa(addr: usize) -> PhysAddr {
        PhysAddr::new(addr)
    }

    #[test]
    fn test_bounded() {
        let mut audit = MappingAudit::new();
        for i in 0..MAX_MAPPINGS {
            let base = i * 0x1000;
            assert!(audit.record("r", va(base), va(base + 0x1000), pa(base), PageFlags::KERNEL_DATA));
        }
        assert!(!audit.record("extra", va(0), va(0x1000), pa(0), PageFlags::KERNEL_DATA));
        assert_eq!(audit.len(), MAX_MAPPINGS);
        assert_eq!(audit.dropped(), 1);
    }

    #[test]
    fn test_consistent_overlap_is_not_a_conflict() {
        let mut audit = MappingAudit::new();
        audit.record("text", va(0x4000_0000), va(0x4000_8000), pa(0x4000_0000), PageFlags::KERNEL_TEXT);
        audit.record("vectors", va(0x4000_1000), va(0x4000_2000), pa(0x4000_1000), PageFlags::KERNEL_TEXT);
        assert_eq!(audit.conflicts(), 0);
        assert_eq!(audit.find(va(0x4000_1800)).map(|r| r.name), Some("vectors"));
        assert_eq!(audit.find(va(0x4000_3000)).map(|r| r.name), Some("text"));
        assert_eq!(audit.find(va(0x5000_0000)), None);
    }

    #[test]
    fn test_inconsistent_overlap_is_a_conflict() {
        let mut audit = MappingAudit::new();
        audit.record("a", va(0x1000), va(0x3000), pa(0x8000), PageFlags::KERNEL_DATA);
        audit.record("b", va(0x2000), va(0x4000), pa(0x2000), PageFlags::KERNEL_DATA);
        audit.record("c", va(0x5000), va(0x6000), pa(0x5000), PageFlags::KERNEL_DATA);
        assert_eq!(audit.conflicts(), 1);
    }

    #[test]
    fn test_rebind_names() {
        let mut audit = MappingAudit::new();
        audit.record("text", va(0x4000_0000), va(0x4000_8000), pa(0x4000_0000), PageFlags::KERNEL_TEXT);
        audit.record("uart", va(0x0900_0000), va(0x0900_1000), pa(0x0900_0000), PageFlags::DEVICE);
        audit.rebind_names(|name| if name == "uart" { "console" } else { name });
        let names: std::vec::Vec<_> = audit.iter().map(|r| r.name).collect();
        assert_eq!(names, ["text", "console"]);
    }
}
