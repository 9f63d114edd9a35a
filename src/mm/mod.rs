//! Memory management for vmboot
//!
//! Provides:
//! - Physical frame allocation (`frame`)
//! - Translation table construction and walks (`paging`, `mapper`)
//! - MMU register policy (`policy`)
//! - The switch from physical to high virtual addressing (`bootstrap`)
//! - Moving the image's own pointers to the new alias (`image`)
//! - The kernel-facing address space (`space`)
//!
//! # Safety Principles
//! - Table memory is only touched through a [`PhysWindow`]
//! - Only the policy layer writes translation registers
//! - Unsafe code is minimal and audited

pub mod address;
pub mod audit;
pub mod bootstrap;
pub mod frame;
pub mod image;
pub mod mapper;
pub mod paging;
pub mod policy;
pub mod space;

pub use address::{PhysAddr, PhysRange, PhysWindow, VirtAddr, HIGH_BASE, PAGE_SIZE};
pub use bootstrap::{BootError, BootPhase, RootState};
pub use frame::{FrameAllocator, FrameError};
pub use paging::{MappingError, PageFlags};
pub use space::{AddressSpace, Mode};
