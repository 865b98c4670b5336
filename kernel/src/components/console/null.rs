//! Null console (no output)
//!
//! For builds where the UART belongs to something else. Every call is a
//! no-op the optimiser removes.

use super::Console;

/// Null console configuration
#[derive(Clone, Copy)]
pub struct NullConfig;

/// Console that discards everything
pub struct NullConsole;

impl NullConsole {
    pub const fn new(_config: NullConfig) -> Self {
        Self
    }

    pub fn init(&self) {}
}

impl Console for NullConsole {
    #[inline(always)]
    fn putc(&self, _c: u8) {}

    #[inline(always)]
    fn puts(&self, _s: &str) {}
}
