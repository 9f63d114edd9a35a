//! Page Table Engine
//!
//! Builds and walks the 4-level (L0-L3) translation tree for a 48-bit
//! address space with a 4KB granule. Tables are reached through the frame
//! allocator's [`PhysWindow`], so the same code runs before the MMU is on,
//! after execution has moved to the high alias, and on the host.
//!
//! # Security Properties
//! - Intermediate tables are zeroed before they are linked in
//! - Every installed descriptor is cleaned to the point of coherency and
//!   fenced before the walk continues, so the hardware walker never sees a
//!   stale entry
//! - The engine never rounds addresses and never invents permissions; the
//!   caller supplies aligned inputs and a complete leaf flag word
//! - A range either gets all of its leaves or none of them
//! - Tables are never freed once linked

use log::{trace, warn};

use super::address::{PhysAddr, PhysWindow, VirtAddr, PAGE_SIZE};
use super::frame::FrameAllocator;
use super::paging::{MappingError, PageFlags, PageTable, PageTableEntry};
use crate::arch::{self, Cpu};

/// Borrow the table stored at `pa`.
///
/// # Safety
/// `pa` must be a page-table frame handed out by the frame allocator that
/// owns `window`, and no other reference to it may be live.
#[inline]
unsafe fn table_at<'a>(window: PhysWindow, pa: PhysAddr) -> &'a mut PageTable {
    // SAFETY: forwarded; frames are page aligned so the cast is aligned.
    // Audited: 2025-01-04
    unsafe { &mut *window.ptr::<PageTable>(pa) }
}

#[inline]
fn entry_ptr(table: &PageTable, index: usize) -> *const u64 {
    &table[index] as *const PageTableEntry as *const u64
}

/// Walk from `root` to the L3 table for `va`, creating missing levels.
fn walk_or_create<C: Cpu>(
    cpu: &C,
    frames: &mut FrameAllocator,
    root: PhysAddr,
    va: VirtAddr,
) -> Result<PhysAddr, MappingError> {
    let (l0, l1, l2, _) = va.page_table_indices();
    let mut table_pa = root;

    for (level, index) in [(0, l0), (1, l1), (2, l2)] {
        let window = frames.window();
        // SAFETY: table_pa is the root or a table linked by this walk.
        // Audited: 2025-01-04
        let table = unsafe { table_at(window, table_pa) };
        let entry = table[index];

        if entry.is_table() {
            table_pa = entry.addr();
            continue;
        }
        if entry.is_valid() {
            warn!(
                "L{} entry {} for {} is not a table: {}",
                level,
                index,
                va,
                entry.describe()
            );
            return Err(MappingError::WalkBlocked);
        }

        let next = frames.alloc_table_page().ok_or(MappingError::OutOfMemory)?;
        table.set_table(index, next);
        arch::publish_descriptor(cpu, entry_ptr(table, index));
        trace!("L{}[{}] -> new table {} for {}", level, index, next, va);
        table_pa = next;
    }

    Ok(table_pa)
}

/// Return the L3 table covering `va`, allocating intermediate tables.
///
/// Returns `None` if a frame could not be allocated or a non-table entry
/// blocks the walk.
pub fn get_or_create_l3<C: Cpu>(
    cpu: &C,
    frames: &mut FrameAllocator,
    root: PhysAddr,
    va: VirtAddr,
) -> Option<PhysAddr> {
    walk_or_create(cpu, frames, root, va).ok()
}

fn check_leaf_flags(flags: PageFlags) -> Result<(), MappingError> {
    if !flags.is_leaf() || flags.bits() & PageTableEntry::ADDR_MASK != 0 {
        return Err(MappingError::InvalidFlags);
    }
    Ok(())
}

/// Write one leaf descriptor `pa | flags` for `va` into the L3 table `l3`.
pub fn map_page<C: Cpu>(
    cpu: &C,
    window: PhysWindow,
    l3: PhysAddr,
    va: VirtAddr,
    pa: PhysAddr,
    flags: PageFlags,
) -> Result<(), MappingError> {
    if !va.is_aligned() || !pa.is_aligned() || !l3.is_aligned() {
        return Err(MappingError::MisalignedAddress);
    }
    check_leaf_flags(flags)?;

    let (_, _, _, index) = va.page_table_indices();
    // SAFETY: l3 came from get_or_create_l3 over the same window.
    // Audited: 2025-01-04
    let table = unsafe { table_at(window, l3) };
    table.set_leaf(index, pa, flags);
    arch::publish_descriptor(cpu, entry_ptr(table, index));
    Ok(())
}

/// Map every page of `[va_start, va_end)` to consecutive frames from
/// `pa_start`. Returns the number of leaf descriptors written.
///
/// All L3 tables the range needs are created before the first leaf is
/// written. On error no leaf of the range has been touched; tables linked
/// along the way stay in place.
pub fn map_range<C: Cpu>(
    cpu: &C,
    frames: &mut FrameAllocator,
    root: PhysAddr,
    va_start: VirtAddr,
    va_end: VirtAddr,
    pa_start: PhysAddr,
    flags: PageFlags,
) -> Result<usize, MappingError> {
    if !va_start.is_aligned() || !va_end.is_aligned() || !pa_start.is_aligned() {
        return Err(MappingError::MisalignedAddress);
    }
    if va_end < va_start {
        return Err(MappingError::InvalidRange);
    }
    check_leaf_flags(flags)?;

    let pages = (va_end.as_usize() - va_start.as_usize()) / PAGE_SIZE;
    // A new L3 table is only needed at the start and at each 2MB boundary
    let starts_table = |page: usize| {
        let (_, _, _, index) = va_start.add(page * PAGE_SIZE).page_table_indices();
        page == 0 || index == 0
    };

    for page in (0..pages).filter(|&page| starts_table(page)) {
        walk_or_create(cpu, frames, root, va_start.add(page * PAGE_SIZE))?;
    }

    let mut l3 = root;
    for page in 0..pages {
        let offset = page * PAGE_SIZE;
        let va = va_start.add(offset);
        if starts_table(page) {
            // Only finds tables now
            l3 = walk_or_create(cpu, frames, root, va)?;
        }
        map_page(cpu, frames.window(), l3, va, pa_start.add(offset), flags)?;
    }

    trace!(
        "mapped [{}..{}) -> {} ({} pages)",
        va_start,
        va_end,
        pa_start,
        pages
    );
    Ok(pages)
}

/// Read-only walk to the raw leaf descriptor for `va`.
///
/// Returns 0 if any level is invalid. Never allocates.
pub fn get_pte(window: PhysWindow, root: PhysAddr, va: VirtAddr) -> u64 {
    let (l0, l1, l2, l3) = va.page_table_indices();
    let mut table_pa = root;

    for index in [l0, l1, l2] {
        // SAFETY: table_pa is the root or an entry validated as a table.
        // Audited: 2025-01-04
        let entry = unsafe { table_at(window, table_pa) }[index];
        if !entry.is_table() {
            return 0;
        }
        table_pa = entry.addr();
    }

    // SAFETY: as above.
    // Audited: 2025-01-04
    let leaf = unsafe { table_at(window, table_pa) }[l3];
    if leaf.is_valid() {
        leaf.as_u64()
    } else {
        0
    }
}

/// Translate `va` to the physical address it maps to.
pub fn translate(window: PhysWindow, root: PhysAddr, va: VirtAddr) -> Option<PhysAddr> {
    let leaf = PageTableEntry::from_raw(get_pte(window, root, va));
    leaf.is_leaf().then(|| leaf.addr().add(va.page_offset()))
}

/// Invalidate the leaf for `va`, returning the old descriptor.
///
/// The caller is responsible for TLB maintenance.
pub fn clear_pte<C: Cpu>(
    cpu: &C,
    window: PhysWindow,
    root: PhysAddr,
    va: VirtAddr,
) -> Result<PageTableEntry, MappingError> {
    let (l0, l1, l2, l3) = va.page_table_indices();
    let mut table_pa = root;

    for index in [l0, l1, l2] {
        // SAFETY: table_pa is the root or an entry validated as a table.
        // Audited: 2025-01-04
        let entry = unsafe { table_at(window, table_pa) }[index];
        if !entry.is_table() {
            return Err(MappingError::NotMapped);
        }
        table_pa = entry.addr();
    }

    // SAFETY: as above.
    // Audited: 2025-01-04
    let table = unsafe { table_at(window, table_pa) };
    let old = table[l3];
    if !old.is_valid() {
        return Err(MappingError::NotMapped);
    }
    table[l3].clear();
    arch::publish_descriptor(cpu, entry_ptr(table, l3));
    Ok(old)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::BarrierDomain;
    use crate::mm::address::PhysRange;
    use crate::testing::{CpuEvent, MockCpu, TestMemory};
    use std::vec::Vec;

    const BASE: usize = 0x4000_0000;

    fn setup(pages: usize) -> (TestMemory, FrameAllocator, PhysAddr) {
        let mem = TestMemory::new(BASE, pages);
        let mut frames = FrameAllocator::new(mem.range(), mem.window());
        frames.init(PhysRange::new(BASE, BASE + PAGE_SIZE)).expect("init");
        let root = frames.alloc_table_page().expect("root");
        (mem, frames, root)
    }

    fn exhaust(frames: &mut FrameAllocator) {
        while frames.alloc_table_page().is_some() {}
    }

    #[test]
    fn test_scenario_exclusive_end() {
        let (_mem, mut frames, root) = setup(32);
        let cpu = MockCpu::new();
        let flags = PageFlags::KERNEL_DATA;

        let mapped = map_range(
            &cpu,
            &mut frames,
            root,
            VirtAddr::new(0x1000),
            VirtAddr::new(0x3000),
            PhysAddr::new(0x1000),
            flags,
        )
        .expect("map_range");
        assert_eq!(mapped, 2);

        let window = frames.window();
        assert_ne!(get_pte(window, root, VirtAddr::new(0x1000)), 0);
        assert_ne!(get_pte(window, root, VirtAddr::new(0x2000)), 0);
        assert_eq!(get_pte(window, root, VirtAddr::new(0x3000)), 0);
    }

    #[test]
    fn test_map_page_round_trip() {
        let (_mem, mut frames, root) = setup(32);
        let cpu = MockCpu::new();
        let cases = [
            (0x0000_0000_4008_0000usize, 0x4008_0000usize, PageFlags::KERNEL_TEXT),
            (0xFFFF_8000_0900_0000, 0x0900_0000, PageFlags::DEVICE),
            (0x0000_7FFF_FFFF_F000, 0x1234_5000, PageFlags::KERNEL_RODATA),
            (0xFFFF_FFFF_FFFF_F000, 0x4000_0000, PageFlags::KERNEL_DATA | PageFlags::NG),
        ];

        for (va, pa, flags) in cases {
            let va = VirtAddr::new(va);
            let pa = PhysAddr::new(pa);
            let l3 = get_or_create_l3(&cpu, &mut frames, root, va).expect("l3");
            map_page(&cpu, frames.window(), l3, va, pa, flags).expect("map_page");

            let pte = PageTableEntry::from_raw(get_pte(frames.window(), root, va));
            assert_eq!(pte.addr(), pa);
            assert_eq!(pte.flags(), flags);
            assert_eq!(translate(frames.window(), root, va.add(0x123)), Some(pa.add(0x123)));
        }
    }

    // Every descriptor write is followed by clean, dsb ish, isb for that line
    #[test]
    fn test_descriptor_writes_are_published() {
        let (_mem, mut frames, root) = setup(16);
        let cpu = MockCpu::new();
        let va = VirtAddr::new(0x4000_0000);

        let l3 = get_or_create_l3(&cpu, &mut frames, root, va).expect("l3");
        map_page(&cpu, frames.window(), l3, va, PhysAddr::new(0x9000), PageFlags::KERNEL_DATA)
            .expect("map_page");

        let window = frames.window();
        let (l0, l1, l2, l3_index) = va.page_table_indices();
        let l1_table = PageTableEntry::from_raw(read_entry(window, root, l0)).addr();
        let l2_table = PageTableEntry::from_raw(read_entry(window, l1_table, l1)).addr();
        let slots = [
            slot(window, root, l0),
            slot(window, l1_table, l1),
            slot(window, l2_table, l2),
            slot(window, l3, l3_index),
        ];

        let expected: Vec<CpuEvent> = slots
            .iter()
            .flat_map(|&addr| {
                [
                    CpuEvent::CleanDcache(addr),
                    CpuEvent::Dsb(BarrierDomain::Ish),
                    CpuEvent::Isb,
                ]
            })
            .collect();
        assert_eq!(cpu.events(), expected);

        let before = cpu.events().len();
        clear_pte(&cpu, window, root, va).expect("clear");
        assert_eq!(
            cpu.events()[before..],
            [
                CpuEvent::CleanDcache(slots[3]),
                CpuEvent::Dsb(BarrierDomain::Ish),
                CpuEvent::Isb
            ]
        );
    }

    fn slot(window: PhysWindow, table: PhysAddr, index: usize) -> usize {
        window.ptr::<u64>(table) as usize + index * 8
    }

    fn read_entry(window: PhysWindow, table: PhysAddr, index: usize) -> u64 {
        // SAFETY: table is a linked table frame inside the test memory.
        unsafe { window.ptr::<u64>(table).add(index).read() }
    }

    #[test]
    fn test_map_range_counts_and_offsets() {
        let (_mem, mut frames, root) = setup(64);
        let cpu = MockCpu::new();
        // Crosses a 2MB boundary, so two L3 tables are needed
        let va_start = VirtAddr::new(0xFFFF_8000_001F_E000);
        let va_end = VirtAddr::new(0xFFFF_8000_0020_4000);
        let pa_start = PhysAddr::new(0x8000_0000);

        let mapped = map_range(&cpu, &mut frames, root, va_start, va_end, pa_start, PageFlags::KERNEL_DATA)
            .expect("map_range");
        assert_eq!(mapped, 6);

        for page in 0..6 {
            let va = va_start.add(page * PAGE_SIZE);
            assert_eq!(
                translate(frames.window(), root, va),
                Some(pa_start.add(page * PAGE_SIZE))
            );
        }
        assert_eq!(get_pte(frames.window(), root, va_end), 0);
    }

    #[test]
    fn test_empty_range_maps_nothing() {
        let (_mem, mut frames, root) = setup(8);
        let cpu = MockCpu::new();
        let va = VirtAddr::new(0x4000_0000);
        let free_before = frames.free_frames();
        assert_eq!(
            map_range(&cpu, &mut frames, root, va, va, PhysAddr::new(0x4000_0000), PageFlags::KERNEL_DATA),
            Ok(0)
        );
        assert_eq!(frames.free_frames(), free_before);
        assert!(cpu.events().is_empty());
    }

    #[test]
    fn test_rejects_misaligned_and_bad_flags() {
        let (_mem, mut frames, root) = setup(16);
        let cpu = MockCpu::new();
        assert_eq!(
            map_range(
                &cpu,
                &mut frames,
                root,
                VirtAddr::new(0x1800),
                VirtAddr::new(0x3000),
                PhysAddr::new(0x1000),
                PageFlags::KERNEL_DATA,
            ),
            Err(MappingError::MisalignedAddress)
        );
        assert_eq!(
            map_range(
                &cpu,
                &mut frames,
                root,
                VirtAddr::new(0x3000),
                VirtAddr::new(0x1000),
                PhysAddr::new(0x1000),
                PageFlags::KERNEL_DATA,
            ),
            Err(MappingError::InvalidRange)
        );

        let l3 = get_or_create_l3(&cpu, &mut frames, root, VirtAddr::new(0x1000)).expect("l3");
        // No access flag: not a leaf the engine will write
        assert_eq!(
            map_page(
                &cpu,
                frames.window(),
                l3,
                VirtAddr::new(0x1000),
                PhysAddr::new(0x1000),
                PageFlags::PAGE
            ),
            Err(MappingError::InvalidFlags)
        );
        assert_eq!(get_pte(frames.window(), root, VirtAddr::new(0x1000)), 0);
    }

    // Address bits in the flag word are refused before any table is built
    #[test]
    fn test_flags_with_address_bits_allocate_nothing() {
        let (_mem, mut frames, root) = setup(16);
        let cpu = MockCpu::new();
        let flags = PageFlags::from_bits_retain(PageFlags::KERNEL_DATA.bits() | 0x4000_0000);
        let free_before = frames.free_frames();

        assert_eq!(
            map_range(
                &cpu,
                &mut frames,
                root,
                VirtAddr::new(0xFFFF_8000_4000_0000),
                VirtAddr::new(0xFFFF_8000_4000_1000),
                PhysAddr::new(0x4000_0000),
                flags,
            ),
            Err(MappingError::InvalidFlags)
        );
        assert_eq!(frames.free_frames(), free_before);
        assert!(cpu.events().is_empty());
    }

    #[test]
    fn test_get_pte_never_allocates() {
        let (_mem, frames, root) = setup(8);
        let free_before = frames.free_frames();
        assert_eq!(get_pte(frames.window(), root, VirtAddr::new(0xFFFF_8000_4000_0000)), 0);
        assert_eq!(frames.free_frames(), free_before);
    }

    #[test]
    fn test_intermediate_tables_are_reused() {
        let (_mem, mut frames, root) = setup(16);
        let cpu = MockCpu::new();
        let a = get_or_create_l3(&cpu, &mut frames, root, VirtAddr::new(0x4000_0000)).expect("a");
        let free_after_first = frames.free_frames();
        let b = get_or_create_l3(&cpu, &mut frames, root, VirtAddr::new(0x4010_0000)).expect("b");
        assert_eq!(a, b);
        assert_eq!(frames.free_frames(), free_after_first);
    }

    #[test]
    fn test_out_of_frames() {
        // 4 frames: 1 kernel, 1 bitmap, 1 root, 1 spare
        let (_mem, mut frames, root) = setup(4);
        let cpu = MockCpu::new();
        assert_eq!(get_or_create_l3(&cpu, &mut frames, root, VirtAddr::new(0x1000)), None);
        assert_eq!(
            map_range(
                &cpu,
                &mut frames,
                root,
                VirtAddr::new(0x1000),
                VirtAddr::new(0x2000),
                PhysAddr::new(0x1000),
                PageFlags::KERNEL_DATA,
            ),
            Err(MappingError::OutOfMemory)
        );
    }

    // The first page lands in an existing L3 table, the rest need a new one
    #[test]
    fn test_failed_range_leaves_no_leaf_behind() {
        let (_mem, mut frames, root) = setup(16);
        let cpu = MockCpu::new();
        let flags = PageFlags::KERNEL_DATA;
        map_range(
            &cpu,
            &mut frames,
            root,
            VirtAddr::new(0x1000),
            VirtAddr::new(0x2000),
            PhysAddr::new(0x9000),
            flags,
        )
        .expect("map");
        exhaust(&mut frames);

        let va_start = VirtAddr::new(0x1F_F000);
        assert_eq!(
            map_range(&cpu, &mut frames, root, va_start, va_start.add(3 * PAGE_SIZE), PhysAddr::new(0xA000), flags),
            Err(MappingError::OutOfMemory)
        );
        assert_eq!(get_pte(frames.window(), root, va_start), 0);
        assert_ne!(get_pte(frames.window(), root, VirtAddr::new(0x1000)), 0);
    }

    #[test]
    fn test_clear_pte() {
        let (_mem, mut frames, root) = setup(16);
        let cpu = MockCpu::new();
        let va = VirtAddr::new(0x2000);
        map_range(&cpu, &mut frames, root, va, va.add(PAGE_SIZE), PhysAddr::new(0x9000), PageFlags::KERNEL_DATA)
            .expect("map");

        let old = clear_pte(&cpu, frames.window(), root, va).expect("clear");
        assert_eq!(old.addr().as_usize(), 0x9000);
        assert_eq!(get_pte(frames.window(), root, va), 0);
        assert_eq!(clear_pte(&cpu, frames.window(), root, va), Err(MappingError::NotMapped));
    }
}
