//! Physical Frame Allocator
//!
//! Manages physical memory pages (frames) using a bitmap allocator.
//!
//! # Design
//! - Each bit in the bitmap represents one 4KB frame of the managed region
//! - Bit = 0: frame is free
//! - Bit = 1: frame is allocated
//! - The bitmap itself lives in RAM, immediately after the kernel image, and
//!   is reached through the allocator's [`PhysWindow`]
//! - Frames from the start of the region through the end of the bitmap
//!   (firmware blob, kernel image, bitmap) are permanently reserved
//!
//! # Security Properties
//! - All allocated frames are zeroed before returning
//! - Misaligned, out-of-range, reserved and double frees are refused and
//!   logged; none of them crash the kernel
//! - A bounded pool of frames is parked for page tables before the bootstrap
//!   starts its burst of table allocations

use core::fmt;

use log::{debug, info, warn};

use super::address::{PhysAddr, PhysRange, PhysWindow, PAGE_SHIFT, PAGE_SIZE};

/// Upper bound on frames parked for page tables.
pub const TABLE_POOL_CAPACITY: usize = 128;

/// Number of alloc/free events remembered for diagnostics.
pub const RECENT_EVENTS: usize = 32;

/// Width of the sampled usage map printed by [`FrameAllocator::log_summary`].
const USAGE_MAP_WIDTH: usize = 64;

/// Error type for frame allocator operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// `init` has not run.
    NotInitialized,
    /// The kernel image does not start inside the managed region.
    KernelOutsideRegion,
    /// The bitmap would extend past the end of the managed region.
    BitmapOutOfRange,
    /// The address is not page aligned.
    Misaligned,
    /// The address is outside the managed region.
    OutOfRange,
    /// The frame holds the kernel image, the bitmap or a parked table page.
    Reserved,
    /// The frame is already free.
    DoubleFree,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "frame allocator not initialized"),
            Self::KernelOutsideRegion => write!(f, "kernel image outside managed memory"),
            Self::BitmapOutOfRange => write!(f, "bitmap does not fit in managed memory"),
            Self::Misaligned => write!(f, "address not page aligned"),
            Self::OutOfRange => write!(f, "address outside managed memory"),
            Self::Reserved => write!(f, "frame is reserved"),
            Self::DoubleFree => write!(f, "frame already free"),
        }
    }
}

/// Allocation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Successful allocations since boot (pool reservations included).
    pub total_allocations: usize,
    /// Successful frees since boot.
    pub total_frees: usize,
    /// Frames currently handed out.
    pub current: usize,
    /// High-water mark of `current`.
    pub peak: usize,
    /// Allocation requests that found no free frame.
    pub failed: usize,
}

/// Kind of a remembered allocator event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEventKind {
    Alloc,
    Free,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEvent {
    pub kind: FrameEventKind,
    pub addr: PhysAddr,
}

/// Bitmap-backed physical frame allocator over one contiguous region.
pub struct FrameAllocator {
    /// Managed region, `[MEMORY_START, MEMORY_END)`.
    region: PhysRange,
    /// How the allocator reaches physical memory.
    window: PhysWindow,
    /// Physical location of the bitmap.
    bitmap: PhysAddr,
    /// Bitmap length in bytes.
    bitmap_len: usize,
    /// Frames in the managed region.
    total_frames: usize,
    /// Frames from the region start that are never handed out.
    reserved_frames: usize,
    /// Frames from the region start that belong to the kernel image.
    kernel_frames: usize,
    /// Number of free frames remaining.
    free_count: usize,
    /// Frames parked for page tables; `pool[pool_next..pool_len]` are unused.
    pool: [PhysAddr; TABLE_POOL_CAPACITY],
    pool_len: usize,
    pool_next: usize,
    stats: FrameStats,
    recent: [Option<FrameEvent>; RECENT_EVENTS],
    recent_head: usize,
    /// Whether the allocator has been initialized.
    initialized: bool,
}

impl FrameAllocator {
    /// Create an allocator for `region`. Nothing is touched until [`init`].
    ///
    /// [`init`]: FrameAllocator::init
    pub const fn new(region: PhysRange, window: PhysWindow) -> Self {
        Self {
            region,
            window,
            bitmap: PhysAddr::new_unchecked(0),
            bitmap_len: 0,
            total_frames: 0,
            reserved_frames: 0,
            kernel_frames: 0,
            free_count: 0,
            pool: [PhysAddr::new_unchecked(0); TABLE_POOL_CAPACITY],
            pool_len: 0,
            pool_next: 0,
            stats: FrameStats {
                total_allocations: 0,
                total_frees: 0,
                current: 0,
                peak: 0,
                failed: 0,
            },
            recent: [None; RECENT_EVENTS],
            recent_head: 0,
            initialized: false,
        }
    }

    /// Initialize the frame allocator.
    ///
    /// Places the bitmap on the first page boundary after `kernel_image`,
    /// checks that it fits inside the managed region and marks every frame
    /// from the region start through the end of the bitmap as used. A second
    /// call is a no-op.
    pub fn init(&mut self, kernel_image: PhysRange) -> Result<(), FrameError> {
        if self.initialized {
            return Ok(());
        }

        if !self.region.contains(kernel_image.start) || kernel_image.end < kernel_image.start {
            return Err(FrameError::KernelOutsideRegion);
        }

        let total_frames = self.region.size() >> PAGE_SHIFT;
        let bitmap_len = total_frames.div_ceil(8);
        let bitmap = kernel_image.end.align_up();
        let bitmap_end = bitmap.add(bitmap_len).align_up();

        if bitmap_end > self.region.end {
            warn!(
                "bitmap [{:#x}..{:#x}) does not fit below {:#x}",
                bitmap.as_usize(),
                bitmap_end.as_usize(),
                self.region.end.as_usize()
            );
            return Err(FrameError::BitmapOutOfRange);
        }

        self.bitmap = bitmap;
        self.bitmap_len = bitmap_len;
        self.total_frames = total_frames;
        self.bitmap_mut().fill(0);

        // Bits past the last frame in the final byte are never free
        for frame in total_frames..bitmap_len * 8 {
            self.set_bit(frame, true);
        }

        self.kernel_frames = kernel_image.end.align_up().offset_from(self.region.start) >> PAGE_SHIFT;
        self.reserved_frames = bitmap_end.offset_from(self.region.start) >> PAGE_SHIFT;
        for frame in 0..self.reserved_frames {
            self.set_bit(frame, true);
        }
        self.free_count = total_frames - self.reserved_frames;
        self.initialized = true;

        info!(
            "managing {:?}: {} frames, {} reserved, bitmap at {} ({} bytes)",
            self.region, total_frames, self.reserved_frames, bitmap, bitmap_len
        );
        Ok(())
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[inline]
    pub fn region(&self) -> PhysRange {
        self.region
    }

    #[inline]
    pub fn window(&self) -> PhysWindow {
        self.window
    }

    /// Shift the window after the kernel moved to a different alias of RAM.
    ///
    /// # Safety
    /// The managed region and every table allocated from it must be
    /// accessible at the rebased window.
    pub unsafe fn rebase_window(&mut self, displacement: usize) {
        // SAFETY: forwarded from the caller.
        // Audited: 2025-01-04
        self.window = unsafe { self.window.rebased(displacement) };
        debug!("physical window now {:?}", self.window);
    }

    fn bitmap(&self) -> &[u8] {
        // SAFETY: init reserved [bitmap, bitmap + bitmap_len) for the bitmap
        // and the window contract makes it addressable.
        // Audited: 2025-01-04
        unsafe { core::slice::from_raw_parts(self.window.ptr::<u8>(self.bitmap), self.bitmap_len) }
    }

    fn bitmap_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in bitmap(); &mut self gives exclusive access.
        // Audited: 2025-01-04
        unsafe {
            core::slice::from_raw_parts_mut(self.window.ptr::<u8>(self.bitmap), self.bitmap_len)
        }
    }

    /// Set a bit in the bitmap.
    #[inline]
    fn set_bit(&mut self, frame: usize, allocated: bool) {
        let byte_idx = frame / 8;
        let bit_idx = frame % 8;
        let bitmap = self.bitmap_mut();

        if byte_idx >= bitmap.len() {
            return;
        }

        if allocated {
            bitmap[byte_idx] |= 1 << bit_idx;
        } else {
            bitmap[byte_idx] &= !(1 << bit_idx);
        }
    }

    /// Check if a frame is allocated.
    #[inline]
    fn is_allocated(&self, frame: usize) -> bool {
        let byte_idx = frame / 8;
        let bit_idx = frame % 8;
        let bitmap = self.bitmap();

        if byte_idx >= bitmap.len() {
            return true; // Out of range = allocated
        }

        (bitmap[byte_idx] >> bit_idx) & 1 == 1
    }

    #[inline]
    fn frame_addr(&self, frame: usize) -> PhysAddr {
        self.region.start.add(frame << PAGE_SHIFT)
    }

    /// Check whether `addr` is currently marked used.
    ///
    /// Addresses outside the managed region count as used.
    pub fn is_used(&self, addr: PhysAddr) -> bool {
        if !self.initialized || !self.region.contains(addr) {
            return true;
        }
        self.is_allocated(addr.offset_from(self.region.start) >> PAGE_SHIFT)
    }

    /// First-fit scan for a clear bit; marks it used without zeroing.
    fn claim_first_free(&mut self) -> Option<PhysAddr> {
        if !self.initialized || self.free_count == 0 {
            return None;
        }

        let len = self.bitmap_len;
        for byte_idx in 0..len {
            if self.bitmap()[byte_idx] == 0xFF {
                continue;
            }
            // Found a byte with at least one free bit
            for bit_idx in 0..8 {
                let frame = byte_idx * 8 + bit_idx;
                if frame >= self.total_frames {
                    break;
                }
                if !self.is_allocated(frame) {
                    self.set_bit(frame, true);
                    self.free_count -= 1;
                    return Some(self.frame_addr(frame));
                }
            }
        }

        None
    }

    fn zero_frame(&mut self, addr: PhysAddr) {
        // SAFETY: the frame was just claimed, so nothing else refers to it,
        // and it lies inside the managed region reachable through the window.
        // Audited: 2025-01-04
        unsafe { core::ptr::write_bytes(self.window.ptr::<u8>(addr), 0, PAGE_SIZE) };
    }

    fn note_alloc(&mut self, addr: PhysAddr) {
        self.stats.total_allocations += 1;
        self.stats.current += 1;
        self.stats.peak = self.stats.peak.max(self.stats.current);
        self.remember(FrameEventKind::Alloc, addr);
    }

    fn remember(&mut self, kind: FrameEventKind, addr: PhysAddr) {
        self.recent[self.recent_head] = Some(FrameEvent { kind, addr });
        self.recent_head = (self.recent_head + 1) % RECENT_EVENTS;
    }

    /// Allocate a single zeroed frame.
    ///
    /// Returns `None` when the region is exhausted; that is counted and
    /// logged but never fatal here.
    pub fn alloc_page(&mut self) -> Option<PhysAddr> {
        let Some(addr) = self.claim_first_free() else {
            self.stats.failed += 1;
            warn!(
                "out of physical frames ({} failed requests so far)",
                self.stats.failed
            );
            return None;
        };

        self.zero_frame(addr);
        self.note_alloc(addr);
        Some(addr)
    }

    /// Free a previously allocated frame.
    pub fn free_page(&mut self, addr: PhysAddr) -> Result<(), FrameError> {
        let result = self.check_free(addr);
        if let Err(err) = result {
            warn!("refusing to free {}: {}", addr, err);
            return Err(err);
        }

        let frame = addr.offset_from(self.region.start) >> PAGE_SHIFT;
        self.set_bit(frame, false);
        self.free_count += 1;
        self.stats.total_frees += 1;
        self.stats.current = self.stats.current.saturating_sub(1);
        self.remember(FrameEventKind::Free, addr);
        Ok(())
    }

    fn check_free(&self, addr: PhysAddr) -> Result<(), FrameError> {
        if !self.initialized {
            return Err(FrameError::NotInitialized);
        }
        if !addr.is_aligned() {
            return Err(FrameError::Misaligned);
        }
        if !self.region.contains(addr) {
            return Err(FrameError::OutOfRange);
        }

        let frame = addr.offset_from(self.region.start) >> PAGE_SHIFT;
        if frame < self.reserved_frames || self.pool[self.pool_next..self.pool_len].contains(&addr) {
            return Err(FrameError::Reserved);
        }
        if !self.is_allocated(frame) {
            return Err(FrameError::DoubleFree);
        }
        Ok(())
    }

    /// Park up to `n` free frames for page tables.
    ///
    /// The frames are marked used immediately, so later bursts of table
    /// allocation cannot lose them to other callers. Returns how many were
    /// actually parked.
    pub fn reserve_pages_for_page_tables(&mut self, n: usize) -> usize {
        let mut parked = 0;
        while parked < n && self.pool_len < TABLE_POOL_CAPACITY {
            let Some(addr) = self.claim_first_free() else {
                break;
            };
            self.note_alloc(addr);
            self.pool[self.pool_len] = addr;
            self.pool_len += 1;
            parked += 1;
        }

        if parked < n {
            warn!("parked only {} of {} page-table frames", parked, n);
        } else {
            debug!("parked {} page-table frames", parked);
        }
        parked
    }

    /// Frames still parked for page tables.
    #[inline]
    pub fn table_pool_remaining(&self) -> usize {
        self.pool_len - self.pool_next
    }

    /// Allocate a zeroed frame for a page table, preferring the parked pool.
    pub fn alloc_table_page(&mut self) -> Option<PhysAddr> {
        if self.pool_next < self.pool_len {
            let addr = self.pool[self.pool_next];
            self.pool_next += 1;
            self.zero_frame(addr);
            return Some(addr);
        }
        self.alloc_page()
    }

    /// Get the number of free frames.
    #[inline]
    pub fn free_frames(&self) -> usize {
        self.free_count
    }

    #[inline]
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    #[inline]
    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Recent alloc/free events, newest first.
    pub fn recent_events(&self) -> impl Iterator<Item = FrameEvent> + '_ {
        (1..=RECENT_EVENTS)
            .map(move |back| self.recent[(self.recent_head + RECENT_EVENTS - back) % RECENT_EVENTS])
            .map_while(|event| event)
    }

    /// Print totals and a sampled usage map.
    ///
    /// Map legend: `K` kernel image, `B` bitmap, `#` used, `.` free.
    pub fn log_summary(&self) {
        if !self.initialized {
            info!("frame allocator not initialized");
            return;
        }

        let stats = self.stats;
        info!(
            "frames: {} total, {} free, {} in use (peak {}), {} failed, {} table frames parked",
            self.total_frames,
            self.free_count,
            stats.current,
            stats.peak,
            stats.failed,
            self.table_pool_remaining()
        );

        let mut map = [b'.'; USAGE_MAP_WIDTH];
        let step = self.total_frames.div_ceil(USAGE_MAP_WIDTH).max(1);
        for (slot, cell) in map.iter_mut().enumerate() {
            let frame = slot * step;
            if frame >= self.total_frames {
                *cell = b' ';
            } else if frame < self.kernel_frames {
                *cell = b'K';
            } else if frame < self.reserved_frames {
                *cell = b'B';
            } else if self.is_allocated(frame) {
                *cell = b'#';
            }
        }
        if let Ok(map) = core::str::from_utf8(&map) {
            info!("usage [{}] ({} frames per cell)", map, step);
        }

        if let Some(last) = self.recent_events().next() {
            debug!("last event: {:?} {}", last.kind, last.addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestMemory;
    use std::vec::Vec;

    const BASE: usize = 0x4000_0000;

    /// 64 frames, with a 4-frame kernel image at the bottom.
    fn allocator(mem: &TestMemory) -> FrameAllocator {
        let mut frames = FrameAllocator::new(mem.range(), mem.window());
        frames
            .init(PhysRange::new(BASE, BASE + 4 * PAGE_SIZE))
            .expect("init");
        frames
    }

    fn snapshot(frames: &FrameAllocator) -> Vec<u8> {
        frames.bitmap().to_vec()
    }

    #[test]
    fn test_init_reserves_kernel_and_bitmap() {
        let mem = TestMemory::new(BASE, 64);
        let frames = allocator(&mem);

        // 4 kernel frames + 1 bitmap frame
        assert_eq!(frames.free_frames(), 59);
        for frame in 0..5 {
            assert!(frames.is_used(PhysAddr::new(BASE + frame * PAGE_SIZE)));
        }
        assert!(!frames.is_used(PhysAddr::new(BASE + 5 * PAGE_SIZE)));
    }

    #[test]
    fn test_init_is_idempotent() {
        let mem = TestMemory::new(BASE, 64);
        let mut frames = allocator(&mem);
        let first = frames.alloc_page().expect("alloc");
        assert_eq!(frames.init(PhysRange::new(BASE, BASE + PAGE_SIZE)), Ok(()));
        assert!(frames.is_used(first));
        assert_eq!(frames.free_frames(), 58);
    }

    #[test]
    fn test_bitmap_must_fit() {
        let mem = TestMemory::new(BASE, 8);
        let mut frames = FrameAllocator::new(mem.range(), mem.window());
        // Kernel fills the whole region, leaving no room for the bitmap
        assert_eq!(
            frames.init(PhysRange::new(BASE, BASE + 8 * PAGE_SIZE)),
            Err(FrameError::BitmapOutOfRange)
        );
        assert!(!frames.is_initialized());
        assert_eq!(frames.alloc_page(), None);
    }

    #[test]
    fn test_kernel_outside_region() {
        let mem = TestMemory::new(BASE, 8);
        let mut frames = FrameAllocator::new(mem.range(), mem.window());
        assert_eq!(
            frames.init(PhysRange::new(0x1000, 0x2000)),
            Err(FrameError::KernelOutsideRegion)
        );
    }

    #[test]
    fn test_alloc_zeroes_frame() {
        let mem = TestMemory::new(BASE, 64);
        let mut frames = allocator(&mem);
        let addr = frames.alloc_page().expect("alloc");
        mem.write_u64(addr, 0xDEAD_BEEF);
        frames.free_page(addr).expect("free");

        let again = frames.alloc_page().expect("alloc");
        assert_eq!(again, addr);
        assert_eq!(mem.read_u64(again), 0);
    }

    #[test]
    fn test_scenario_reuse_freed_middle_page() {
        let mem = TestMemory::new(BASE, 64);
        let mut frames = allocator(&mem);

        let _a = frames.alloc_page().expect("a");
        let b = frames.alloc_page().expect("b");
        let _c = frames.alloc_page().expect("c");
        frames.free_page(b).expect("free b");

        assert_eq!(frames.alloc_page(), Some(b));
    }

    #[test]
    fn test_reverse_free_restores_bitmap() {
        let mem = TestMemory::new(BASE, 64);
        let mut frames = allocator(&mem);
        let _held = frames.alloc_page().expect("held");

        for count in [1usize, 3, 8, 20] {
            let before = snapshot(&frames);
            let free_before = frames.free_frames();

            let pages: Vec<_> = (0..count).map(|_| frames.alloc_page().expect("alloc")).collect();
            for page in pages.iter().rev() {
                frames.free_page(*page).expect("free");
            }

            assert_eq!(snapshot(&frames), before, "sequence of {}", count);
            assert_eq!(frames.free_frames(), free_before);
        }
    }

    #[test]
    fn test_alloc_never_returns_used_page() {
        let mem = TestMemory::new(BASE, 64);
        let mut frames = allocator(&mem);
        let mut seen = Vec::new();

        while let Some(addr) = frames.alloc_page() {
            assert!(!seen.contains(&addr), "{} handed out twice", addr);
            assert!(addr >= PhysAddr::new(BASE + 5 * PAGE_SIZE));
            seen.push(addr);
        }
        assert_eq!(seen.len(), 59);
        assert_eq!(frames.free_frames(), 0);
        assert_eq!(frames.stats().failed, 1);

        frames.free_page(seen[10]).expect("free");
        assert_eq!(frames.alloc_page(), Some(seen[10]));
    }

    #[test]
    fn test_free_rejections() {
        let mem = TestMemory::new(BASE, 64);
        let mut frames = allocator(&mem);
        let addr = frames.alloc_page().expect("alloc");

        assert_eq!(frames.free_page(addr.add(8)), Err(FrameError::Misaligned));
        assert_eq!(
            frames.free_page(PhysAddr::new(BASE + 64 * PAGE_SIZE)),
            Err(FrameError::OutOfRange)
        );
        assert_eq!(frames.free_page(PhysAddr::new(BASE)), Err(FrameError::Reserved));
        assert_eq!(frames.free_page(addr), Ok(()));
        assert_eq!(frames.free_page(addr), Err(FrameError::DoubleFree));
        assert_eq!(frames.stats().total_frees, 1);
    }

    #[test]
    fn test_table_pool() {
        let mem = TestMemory::new(BASE, 64);
        let mut frames = allocator(&mem);

        assert_eq!(frames.reserve_pages_for_page_tables(4), 4);
        assert_eq!(frames.free_frames(), 55);
        assert_eq!(frames.table_pool_remaining(), 4);

        // Parked frames are used but cannot be freed by other callers
        let first_parked = PhysAddr::new(BASE + 5 * PAGE_SIZE);
        assert!(frames.is_used(first_parked));
        assert_eq!(frames.free_page(first_parked), Err(FrameError::Reserved));

        // Ordinary allocations skip the pool
        assert_eq!(frames.alloc_page(), Some(PhysAddr::new(BASE + 9 * PAGE_SIZE)));

        mem.write_u64(first_parked, 7);
        assert_eq!(frames.alloc_table_page(), Some(first_parked));
        assert_eq!(mem.read_u64(first_parked), 0);
        assert_eq!(frames.table_pool_remaining(), 3);
    }

    #[test]
    fn test_table_pool_falls_back_when_short() {
        let mem = TestMemory::new(BASE, 8);
        let mut frames = FrameAllocator::new(mem.range(), mem.window());
        frames.init(PhysRange::new(BASE, BASE + 4 * PAGE_SIZE)).expect("init");

        // 8 frames - 4 kernel - 1 bitmap = 3 free
        assert_eq!(frames.reserve_pages_for_page_tables(16), 3);
        for _ in 0..3 {
            assert!(frames.alloc_table_page().is_some());
        }
        assert_eq!(frames.alloc_table_page(), None);
    }

    #[test]
    fn test_recent_events_newest_first() {
        let mem = TestMemory::new(BASE, 64);
        let mut frames = allocator(&mem);
        let a = frames.alloc_page().expect("a");
        let b = frames.alloc_page().expect("b");
        frames.free_page(a).expect("free");

        let events: Vec<_> = frames.recent_events().collect();
        assert_eq!(
            events,
            [
                FrameEvent { kind: FrameEventKind::Free, addr: a },
                FrameEvent { kind: FrameEventKind::Alloc, addr: b },
                FrameEvent { kind: FrameEventKind::Alloc, addr: a },
            ]
        );
        frames.log_summary();
    }
}
