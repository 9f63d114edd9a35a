//! Host test doubles: RAM, a CPU and a console.
//!
//! `TestMemory` is a page-aligned heap buffer standing in for a physical
//! region; its [`PhysWindow`] turns physical addresses in the region into
//! pointers into the buffer. `MockCpu` records every register access and
//! barrier so tests can assert on ordering. `Machine` wires both into an
//! [`AddressSpace`] shaped like a small QEMU virt board.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::mem::size_of;
use std::cell::{Cell, RefCell};
use std::string::String;
use std::vec::Vec;

use crate::arch::{BarrierDomain, Cpu, SysReg};
use crate::config::{BootLayout, MemoryConfig, VaBits, UART_PHYS_BASE};
use crate::console::Console;
use crate::mm::address::{PhysAddr, PhysRange, PhysWindow, PAGE_SIZE};
use crate::mm::image::Rela;
use crate::mm::space::{AddressSpace, Mode};

/// Page-aligned, zeroed host buffer posing as `[base, base + pages * 4K)`.
pub struct TestMemory {
    base: usize,
    buf: *mut u8,
    layout: Layout,
}

impl TestMemory {
    pub fn new(base: usize, pages: usize) -> Self {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).expect("layout");
        // SAFETY: layout has non-zero size.
        let buf = unsafe { alloc_zeroed(layout) };
        assert!(!buf.is_null(), "test memory allocation failed");
        Self { base, buf, layout }
    }

    pub fn range(&self) -> PhysRange {
        PhysRange::new(self.base, self.base + self.layout.size())
    }

    pub fn window(&self) -> PhysWindow {
        // SAFETY: every physical address in range() lands inside buf.
        unsafe { PhysWindow::with_offset((self.buf as usize).wrapping_sub(self.base)) }
    }

    fn slot(&self, pa: PhysAddr) -> *mut u64 {
        assert!(self.range().contains(pa), "{} outside test memory", pa);
        self.window().ptr(pa)
    }

    pub fn read_u64(&self, pa: PhysAddr) -> u64 {
        // SAFETY: slot checked the address is inside the buffer.
        unsafe { self.slot(pa).read() }
    }

    pub fn write_u64(&self, pa: PhysAddr, value: u64) {
        // SAFETY: as above.
        unsafe { self.slot(pa).write(value) }
    }
}

impl Drop for TestMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in new with the same layout.
        unsafe { dealloc(self.buf, self.layout) }
    }
}

/// Something the mock CPU was asked to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuEvent {
    Write(SysReg, u64),
    Dsb(BarrierDomain),
    Isb,
    CleanDcache(usize),
    TlbiVmalle1,
    Relocate(usize),
}

/// SCTLR_EL1 RES1 bits plus caches, as firmware typically leaves it.
const SCTLR_RESET: u64 = 0x30D0_0800;

std::thread_local! {
    static ALIASED: RefCell<Vec<usize>> = RefCell::new(Vec::new());
}

/// Addresses passed to [`Cpu::alias_of`] on this thread since the last
/// `MockCpu::new`.
pub fn aliased() -> Vec<usize> {
    ALIASED.with(|aliased| aliased.borrow().clone())
}

/// Boot stack pointer used unless a test overrides it.
pub const STACK_POINTER: usize = 0x4000_F000;

pub struct MockCpu {
    regs: [u64; SysReg::ALL.len()],
    events: RefCell<Vec<CpuEvent>>,
    corrupt: Option<SysReg>,
    sp: usize,
}

impl MockCpu {
    pub fn new() -> Self {
        let mut regs = [0; SysReg::ALL.len()];
        regs[SysReg::SctlrEl1.index()] = SCTLR_RESET;
        ALIASED.with(|aliased| aliased.borrow_mut().clear());
        Self {
            regs,
            events: RefCell::new(Vec::new()),
            corrupt: None,
            sp: STACK_POINTER,
        }
    }

    /// Reads of `reg` return the complement of what was written.
    pub fn with_corrupt_readback(mut self, reg: SysReg) -> Self {
        self.corrupt = Some(reg);
        self
    }

    pub fn with_stack_pointer(mut self, sp: usize) -> Self {
        self.sp = sp;
        self
    }

    /// Stored register value, ignoring injected faults.
    pub fn reg(&self, reg: SysReg) -> u64 {
        self.regs[reg.index()]
    }

    pub fn events(&self) -> Vec<CpuEvent> {
        self.events.borrow().clone()
    }

    pub fn writes(&self) -> Vec<(SysReg, u64)> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match *event {
                CpuEvent::Write(reg, value) => Some((reg, value)),
                _ => None,
            })
            .collect()
    }

    pub fn relocations(&self) -> Vec<usize> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match *event {
                CpuEvent::Relocate(displacement) => Some(displacement),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: CpuEvent) {
        self.events.borrow_mut().push(event);
    }
}

impl Default for MockCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu for MockCpu {
    fn read(&self, reg: SysReg) -> u64 {
        let value = self.regs[reg.index()];
        if self.corrupt == Some(reg) {
            !value
        } else {
            value
        }
    }

    unsafe fn write(&mut self, reg: SysReg, value: u64) {
        self.regs[reg.index()] = value;
        self.push(CpuEvent::Write(reg, value));
    }

    fn dsb(&self, domain: BarrierDomain) {
        self.push(CpuEvent::Dsb(domain));
    }

    fn isb(&self) {
        self.push(CpuEvent::Isb);
    }

    fn clean_dcache_line(&self, addr: usize) {
        self.push(CpuEvent::CleanDcache(addr));
    }

    unsafe fn tlbi_vmalle1(&mut self) {
        self.push(CpuEvent::TlbiVmalle1);
    }

    fn stack_pointer(&self) -> usize {
        self.sp
    }

    /// Reports the full displacement as applied, like the target does.
    /// Host code keeps running where it is, which is harmless because host
    /// memory has a single alias (see `alias_of`).
    unsafe fn relocate(&mut self, displacement: usize) -> usize {
        self.push(CpuEvent::Relocate(displacement));
        displacement
    }

    /// Records the request and hands back `addr`: the host buffer is only
    /// mapped once.
    fn alias_of(addr: usize, _displacement: usize) -> usize {
        ALIASED.with(|aliased| aliased.borrow_mut().push(addr));
        addr
    }
}

/// Console that keeps everything written to it.
pub struct RecordingConsole {
    output: RefCell<String>,
    base: Cell<usize>,
    probes: RefCell<Vec<usize>>,
}

impl RecordingConsole {
    pub fn new(base: usize) -> Self {
        Self {
            output: RefCell::new(String::new()),
            base: Cell::new(base),
            probes: RefCell::new(Vec::new()),
        }
    }

    pub fn output(&self) -> String {
        self.output.borrow().clone()
    }

    /// Bases that were probed, in order.
    pub fn probes(&self) -> Vec<usize> {
        self.probes.borrow().clone()
    }
}

impl Console for RecordingConsole {
    fn write_str(&self, s: &str) {
        self.output.borrow_mut().push_str(s);
    }

    fn base(&self) -> usize {
        self.base.get()
    }

    fn set_base(&self, base: usize) {
        self.base.set(base);
    }

    fn probe(&self, base: usize, bytes: &[u8]) -> bool {
        self.probes.borrow_mut().push(base);
        self.output
            .borrow_mut()
            .push_str(&String::from_utf8_lossy(bytes));
        true
    }
}

const RAM_BASE: usize = 0x4000_0000;

/// `.rela.dyn` of the test image, at the bottom of rodata.
const RELA_TABLE: usize = RAM_BASE + 0x8000;

/// Pointers the test image stores in .data, as (slot, link-time target).
pub const IMAGE_POINTERS: [(usize, usize); 2] = [
    (RAM_BASE + 0xA000, RAM_BASE + 0x0840),
    (RAM_BASE + 0xA008, RAM_BASE + 0x8100),
];

/// Kernel image layout used by every machine: 64 KiB at the bottom of RAM.
pub fn boot_layout() -> BootLayout {
    BootLayout {
        kernel_image: PhysRange::new(RAM_BASE, RAM_BASE + 0x1_0000),
        text: PhysRange::new(RAM_BASE, RAM_BASE + 0x8000),
        rodata: PhysRange::new(RAM_BASE + 0x8000, RAM_BASE + 0xA000),
        data: PhysRange::new(RAM_BASE + 0xA000, RAM_BASE + 0xC000),
        stack: PhysRange::new(RAM_BASE + 0xC000, RAM_BASE + 0x1_0000),
        vectors: PhysAddr::new(RAM_BASE + 0x1000),
        continuation: PhysAddr::new(RAM_BASE + 0x2000),
        relocations: PhysRange::new(
            RELA_TABLE,
            RELA_TABLE + IMAGE_POINTERS.len() * size_of::<Rela>(),
        ),
    }
}

/// Write the relocation table and the pointers as the linker leaves them.
fn load_image(mem: &TestMemory, layout: &BootLayout) {
    let mut at = layout.relocations.start;
    for (slot, target) in IMAGE_POINTERS {
        let rela = Rela::relative(PhysAddr::new(slot), target);
        mem.write_u64(at, rela.offset);
        mem.write_u64(at.add(8), rela.info);
        mem.write_u64(at.add(16), rela.addend as u64);
        mem.write_u64(PhysAddr::new(slot), target as u64);
        at = at.add(size_of::<Rela>());
    }
}

/// A board with `pages` of RAM at 0x4000_0000 and the PL011 at its usual
/// address.
pub struct Machine {
    pub space: AddressSpace<MockCpu>,
    pub console: RecordingConsole,
    // Declared last: the space points into it
    mem: TestMemory,
}

impl Machine {
    /// 2 MiB of RAM, enough for the whole transition.
    pub fn new() -> Self {
        Self::build(512, MockCpu::new())
    }

    /// Too little RAM to build the tables: boots into bypass.
    pub fn small() -> Self {
        Self::build(20, MockCpu::new())
    }

    pub fn with_cpu(cpu: MockCpu) -> Self {
        Self::build(512, cpu)
    }

    fn build(pages: usize, cpu: MockCpu) -> Self {
        let mem = TestMemory::new(RAM_BASE, pages);
        let layout = boot_layout();
        load_image(&mem, &layout);
        let config = MemoryConfig {
            memory: mem.range(),
            uart: PhysAddr::new(UART_PHYS_BASE),
            va_bits: VaBits::Bits48,
            table_reserve: 16,
        };
        Self {
            space: AddressSpace::new(cpu, config, layout, mem.window()),
            console: RecordingConsole::new(UART_PHYS_BASE),
            mem,
        }
    }

    /// The RAM behind the space.
    pub fn memory(&self) -> &TestMemory {
        &self.mem
    }

    pub fn init(&mut self) -> Mode {
        self.space.init_memory_subsystem(&self.console)
    }
}
