//! Kernel Logger
//!
//! Backend for the `log` facade. Each record becomes one console line,
//! `[LEVEL component] message`, where the component is the last segment of
//! the record's target (`vmboot::mm::frame` logs as `frame`).

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::kprintln;

pub struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

/// Level used when no feature overrides it.
#[cfg(not(feature = "boot-trace"))]
pub const DEFAULT_LEVEL: LevelFilter = LevelFilter::Info;

#[cfg(feature = "boot-trace")]
pub const DEFAULT_LEVEL: LevelFilter = LevelFilter::Trace;

/// Component name for a record target.
pub fn component(target: &str) -> &str {
    target.rsplit("::").next().unwrap_or(target)
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        kprintln!(
            "[{:<5} {}] {}",
            record.level(),
            component(record.target()),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Install the kernel logger. Call once, after the UART is ready and after
/// `init_memory_subsystem`: the facade keeps the pointer it is given, and a
/// low-alias pointer stops translating once TTBR0 walks are off.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}
