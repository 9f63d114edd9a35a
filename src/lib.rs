//! vmboot: bootstrap virtual memory for a bare-metal ARM64 kernel
//!
//! Builds the kernel's translation tables, enables the MMU and moves the
//! running kernel from physical addresses to its high-half alias, falling
//! back to physical addressing if the tables cannot be built.
//!
//! The library is `no_std` on the target; host unit tests run it against a
//! heap buffer standing in for RAM and a recording CPU.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod arch;
pub mod config;
pub mod console;
pub mod drivers;
pub mod exception;
pub mod logger;
pub mod mm;

#[cfg(test)]
pub(crate) mod testing;
