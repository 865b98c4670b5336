//! Scheduler tick timer
//!
//! The tick comes from the BCM2835 system timer: a free-running 1MHz
//! counter (CLO/CHI) with four compare registers. Compare channel 1 is
//! wired to interrupt line 1; channels 0 and 2 belong to the GPU.
//!
//! ## Registers (offset from 0x2000_3000 physical)
//! - `CS` (0x00): match flags, write 1 to clear
//! - `CLO` (0x04): counter low 32 bits
//! - `C1` (0x10): compare value for channel 1
//!
//! The timer is one-shot: every tick handler clears the match and programs
//! the next compare value before doing anything else, so a slow tick delays
//! the next one rather than losing it.

use core::ptr::{read_volatile, write_volatile};

use crate::memory::layout::{peripheral_va, SYSTEM_TIMER_OFFSET};

/// Counter frequency of the system timer
pub const SYSTEM_TIMER_HZ: u32 = 1_000_000;

/// CS register: channel 1 match flag
const CS_M1: u32 = 1 << 1;

const CS_OFFSET: usize = 0x00;
const CLO_OFFSET: usize = 0x04;
const C1_OFFSET: usize = 0x10;

/// Periodic tick source
pub trait TickTimer {
    /// Acknowledge the pending tick
    fn clear(&mut self);

    /// Fire the next tick `ms` milliseconds from now
    fn set_interval(&mut self, ms: u32);
}

/// System timer compare channel 1
pub struct SystemTimer {
    base: usize,
}

impl SystemTimer {
    /// # Safety
    /// The peripheral block must be mapped at `PERIPHERAL_VA_START`.
    pub unsafe fn new() -> Self {
        Self::at(peripheral_va(SYSTEM_TIMER_OFFSET))
    }

    /// # Safety
    /// `base` must address the system timer register block.
    pub unsafe fn at(base: usize) -> Self {
        Self { base }
    }

    #[inline]
    fn reg(&self, offset: usize) -> *mut u32 {
        (self.base + offset) as *mut u32
    }

    /// Current counter value (microseconds, wrapping)
    pub fn counter(&self) -> u32 {
        // SAFETY: `base` addresses the register block (see `at`).
        unsafe { read_volatile(self.reg(CLO_OFFSET)) }
    }
}

impl TickTimer for SystemTimer {
    fn clear(&mut self) {
        // SAFETY: as for `counter`.
        unsafe { write_volatile(self.reg(CS_OFFSET), CS_M1) };
    }

    fn set_interval(&mut self, ms: u32) {
        let ticks = ms.saturating_mul(SYSTEM_TIMER_HZ / 1000);
        let next = self.counter().wrapping_add(ticks);
        // SAFETY: as for `counter`.
        unsafe { write_volatile(self.reg(C1_OFFSET), next) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_programs_compare_channel() {
        let mut regs = [0u32; 8];
        regs[1] = 0xFFFF_0000; // CLO near wrap
        let mut timer = unsafe { SystemTimer::at(regs.as_mut_ptr() as usize) };

        timer.set_interval(10);
        timer.clear();

        assert_eq!(regs[4], 0xFFFF_0000u32.wrapping_add(10_000));
        assert_eq!(regs[0], CS_M1);
    }
}
