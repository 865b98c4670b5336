//! Console component
//!
//! Polled character output for kernel diagnostics. Just enough for the
//! logger and `kprintln!`; no input, no interrupts.

use core::fmt;

/// Console trait for kernel debug output
pub trait Console: Send + Sync {
    /// Write a single byte, blocking until the hardware accepts it
    fn putc(&self, c: u8);

    /// Write a string, translating `\n` to CRLF
    fn puts(&self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.putc(b'\r');
            }
            self.putc(byte);
        }
    }
}

/// Wrapper for using Console with core::fmt::Write
pub struct ConsoleWriter<C: Console + 'static> {
    console: &'static C,
}

impl<C: Console + 'static> ConsoleWriter<C> {
    pub const fn new(console: &'static C) -> Self {
        Self { console }
    }
}

impl<C: Console + 'static> fmt::Write for ConsoleWriter<C> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.console.puts(s);
        Ok(())
    }
}

pub mod null;
pub mod pl011;
