//! vmboot - Bootstrap Virtual Memory for an ARM64 Kernel
//!
//! Boots on the QEMU virt machine, builds the kernel's translation tables,
//! enables the MMU and moves the kernel to its high-half alias.
//!
//! # Boot Sequence
//! 1. boot.S: drop to EL1, set up the stack, clear .bss
//! 2. `kernel_main`: UART, memory subsystem, then the logger
//! 3. Report the resulting mode and halt
//!
//! The logger is installed only once the kernel has settled on its final
//! alias: the `log` facade keeps the pointer it is given for good. Records
//! logged during the switch are dropped; its outcome is reported afterwards.
//!
//! # Architecture
//! - Target: AArch64 (ARM64)
//! - Hypervisor: QEMU virt machine
//! - Boot: Direct kernel boot (no bootloader)
//!
//! Built for any other target this is an empty program; the library carries
//! the host-testable code.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
use core::panic::PanicInfo;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
use vmboot::{
    arch::{aarch64::Aarch64Cpu, halt},
    config::{BootLayout, MemoryConfig},
    drivers::uart::{KernelConsole, UART},
    kprintln, logger,
    mm::{AddressSpace, Mode, PhysAddr, PhysRange, PhysWindow, VirtAddr},
};

// Include boot assembly
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
core::arch::global_asm!(include_str!("boot.S"));

/// Kernel version string
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Image layout from the symbols in linker.ld.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
fn boot_layout() -> BootLayout {
    extern "C" {
        static __kernel_start: u8;
        static __kernel_end: u8;
        static __text_start: u8;
        static __text_end: u8;
        static __rodata_start: u8;
        static __rodata_end: u8;
        static __data_start: u8;
        static __data_end: u8;
        static __stack_bottom: u8;
        static __stack_top: u8;
        static __exception_vectors: u8;
        static __mmu_continuation_start: u8;
        static __rela_start: u8;
        static __rela_end: u8;
    }

    macro_rules! sym {
        ($name:ident) => {
            // SAFETY: only the address of the linker symbol is taken.
            // Audited: 2025-01-04
            unsafe { core::ptr::addr_of!($name) as usize }
        };
    }

    BootLayout {
        kernel_image: PhysRange::new(sym!(__kernel_start), sym!(__kernel_end)),
        text: PhysRange::new(sym!(__text_start), sym!(__text_end)),
        rodata: PhysRange::new(sym!(__rodata_start), sym!(__rodata_end)),
        data: PhysRange::new(sym!(__data_start), sym!(__data_end)),
        stack: PhysRange::new(sym!(__stack_bottom), sym!(__stack_top)),
        vectors: PhysAddr::new(sym!(__exception_vectors)),
        continuation: PhysAddr::new(sym!(__mmu_continuation_start)),
        relocations: PhysRange::new(sym!(__rela_start), sym!(__rela_end)),
    }
}

/// Kernel entry point called from boot.S
///
/// Runs on the boot stack at EL1 with translation off and .bss cleared.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
#[no_mangle]
pub extern "C" fn kernel_main() -> ! {
    // SAFETY: UART address is guaranteed valid by QEMU virt memory map
    // Audited: 2025-01-04
    unsafe {
        UART.lock().init();
    }

    kprintln!();
    kprintln!("vmboot v{} - ARM64 bootstrap virtual memory", VERSION);
    kprintln!("=============================================");
    kprintln!();

    let layout = boot_layout();
    kprintln!(
        "[BOOT] image {:?}, text {:?}, stack {:?}",
        layout.kernel_image,
        layout.text,
        layout.stack
    );

    // SAFETY: this is the only CPU handle, created once at EL1, and RAM is
    // identity-addressable while translation is off.
    // Audited: 2025-01-04
    let (cpu, window) = unsafe { (Aarch64Cpu::new(), PhysWindow::identity()) };
    let config = MemoryConfig::QEMU_VIRT;
    let mut space = AddressSpace::new(cpu, config, layout, window);

    let mode = space.init_memory_subsystem(&KernelConsole);
    let space = match mode {
        // SAFETY: `space` is on the boot stack, mapped at the high alias. A
        // reference the compiler kept from before the switch still points low.
        // Audited: 2025-01-04
        Mode::FullMmu => unsafe { AddressSpace::follow(&mut space, config.high_base()) },
        _ => &mut space,
    };

    if logger::init(logger::DEFAULT_LEVEL).is_err() {
        kprintln!("[BOOT] logger already installed");
    }
    log::info!("memory subsystem up: {}", mode);
    if let Some(err) = space.boot_error() {
        log::warn!("{}", err);
    }
    space.audit().log_all();
    space.frames().log_summary();

    if space.is_virtual_addressing_available() {
        space.describe(VirtAddr::new(layout.text.start.as_usize() | config.high_base()));
        space.describe(VirtAddr::new(config.uart.as_usize() | config.high_base()));
    }

    kprintln!();
    kprintln!("[BOOT] Kernel initialization complete");
    kprintln!("[BOOT] Halting CPU...");
    halt();
}

/// Panic handler - called on unrecoverable errors
///
/// Register readback failures in the MMU policy layer end up here.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    kprintln!();
    kprintln!("!!! KERNEL PANIC !!!");
    kprintln!();

    if let Some(location) = info.location() {
        kprintln!(
            "Location: {}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        );
    }

    kprintln!("Message: {}", info.message());

    kprintln!();
    kprintln!("System halted.");

    halt();
}

#[cfg(not(target_os = "none"))]
fn main() {}
