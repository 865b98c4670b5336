//! Debug output and logging
//!
//! `kprint!`/`kprintln!` write straight to the console and are safe on the
//! panic path. Everything else logs through the `log` facade, backed by
//! `KernelLogger` once `init_logger` has run.

use core::fmt::{self, Write};

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::components::console::Console;
use crate::config;

/// Writer over the configured console
pub struct DebugWriter;

impl fmt::Write for DebugWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        config::console().puts(s);
        Ok(())
    }
}

/// Print macro for kernel
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => ({
        use core::fmt::Write;
        let _ = write!($crate::debug::DebugWriter, $($arg)*);
    });
}

/// Print with newline macro for kernel
#[macro_export]
macro_rules! kprintln {
    () => ($crate::kprint!("\n"));
    ($($arg:tt)*) => ({
        use core::fmt::Write;
        let _ = writeln!($crate::debug::DebugWriter, $($arg)*);
    });
}

/// `log` backend writing `[LEVEL target] message` lines
pub struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _ = write_record(&mut DebugWriter, record);
    }

    fn flush(&self) {}
}

fn write_record(out: &mut impl Write, record: &Record) -> fmt::Result {
    writeln!(
        out,
        "[{:<5} {}] {}",
        record.level(),
        record.target(),
        record.args()
    )
}

/// Install the kernel logger
///
/// The compile-time `log-*` features cap `level` further.
pub fn init_logger(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;

    #[test]
    fn test_record_format() {
        let mut out = String::new();
        write_record(
            &mut out,
            &Record::builder()
                .level(log::Level::Warn)
                .target("pios_kernel::scheduler")
                .args(format_args!("slot {} busy", 3))
                .build(),
        )
        .unwrap();
        assert_eq!(out, "[WARN  pios_kernel::scheduler] slot 3 busy\n");
    }
}
