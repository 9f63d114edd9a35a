//! Console Collaborator
//!
//! The memory subsystem needs a character sink that works both before and
//! after virtual addressing. The console reports and switches its own MMIO
//! base; the bootstrap decides when to switch it.

/// Character output usable across the switch to virtual addressing.
pub trait Console {
    /// Write a string through the current base.
    fn write_str(&self, s: &str);

    /// Current MMIO base.
    fn base(&self) -> usize;

    /// Redirect all further output to `base`.
    fn set_base(&self, base: usize);

    /// Write `bytes` directly to a device at `base` without switching.
    ///
    /// Used to prove an alias is live before trusting it. Returns `false` if
    /// the console is not ready to transmit.
    fn probe(&self, base: usize, bytes: &[u8]) -> bool;
}
