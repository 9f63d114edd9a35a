//! Device drivers
//!
//! All drivers follow these principles:
//! - Minimal unsafe code, well-documented
//! - The MMIO base is owned by the driver and can be moved to another alias
//!   of the same device
//! - No panics on invalid input

pub mod uart;
