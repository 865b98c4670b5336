//! Kernel configuration and component composition
//!
//! - Console selection happens at compile time through cargo features.
//! - Scheduler and process sizing is a runtime `SchedulerConfig`, checked
//!   once by `validate` before the scheduler is built.

use thiserror::Error;

use crate::arch::arm::{ProcessorMode, TranslationTableSize};
use crate::components::console::Console;
#[cfg(feature = "console-null")]
use crate::components::console::null::{NullConfig, NullConsole};
#[cfg(not(feature = "console-null"))]
use crate::components::console::pl011::{Pl011Config, Pl011Console};
#[cfg(not(feature = "console-null"))]
use crate::memory::layout::{peripheral_va, UART0_OFFSET};
use crate::memory::layout::{USER_TASKS_START, USER_TASK_STRIDE, USER_TTB0S_START};
use crate::memory::{VirtAddr, PAGE_SIZE};

/// Console component selection (compile-time)
///
/// - `console-pl011`: PL011 UART0 (default)
/// - `console-null`: no output
#[cfg(not(feature = "console-null"))]
pub static CONSOLE: Pl011Console = Pl011Console::new(Pl011Config {
    mmio_base: peripheral_va(UART0_OFFSET),
});

#[cfg(feature = "console-null")]
pub static CONSOLE: NullConsole = NullConsole::new(NullConfig);

/// Initialize the kernel console
///
/// Must be called once the peripheral block is mapped and before the
/// logger is installed.
pub fn init_console() {
    CONSOLE.init();
}

/// The global console
pub fn console() -> &'static impl Console {
    &CONSOLE
}

/// Configuration errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("scheduler capacity must be at least one task")]
    ZeroCapacity,

    #[error("tasks need at least one page")]
    ZeroPages,

    #[error("tick interval and quantum must be non-zero")]
    ZeroInterval,

    #[error("translation table class N={0} has an L1 table larger than a page")]
    TableTooLarge(u8),

    #[error("slot layout is not page aligned")]
    Misaligned,

    #[error("{pages} pages do not fit in a {stride:#x} byte slot")]
    SlotTooSmall { pages: usize, stride: u32 },

    #[error("slot {slot} lies outside the TTB0 coverage")]
    SlotOutOfCoverage { slot: usize },
}

/// Scheduler and process sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Timer tick interval
    pub tick_ms: u32,
    /// CPU time after which a running task is preempted
    pub quantum_ms: u32,
    /// Number of slots, and so of concurrently resident tasks
    pub max_tasks: usize,
    /// User pages given to each task at creation
    pub task_pages: usize,
    /// TTB0 size class of every task
    pub table_size: TranslationTableSize,
    /// Virtual base of slot 0
    pub user_tasks_start: VirtAddr,
    /// Distance between slot virtual bases
    pub user_task_stride: u32,
    /// Kernel window of slot 0's table; later slots follow at one table
    /// region each
    pub table_windows_start: VirtAddr,
    /// Mode file-backed tasks start in
    pub task_mode: ProcessorMode,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 10,
            quantum_ms: 2000,
            max_tasks: 20,
            task_pages: 8,
            table_size: TranslationTableSize::BYTES_128,
            user_tasks_start: VirtAddr::new(USER_TASKS_START),
            user_task_stride: USER_TASK_STRIDE,
            table_windows_start: VirtAddr::new(USER_TTB0S_START),
            task_mode: ProcessorMode::User,
        }
    }
}

impl SchedulerConfig {
    /// Reject layouts the address-space builder could not honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tasks == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.task_pages == 0 {
            return Err(ConfigError::ZeroPages);
        }
        if self.tick_ms == 0 || self.quantum_ms == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        if self.table_size.bytes() > PAGE_SIZE {
            return Err(ConfigError::TableTooLarge(self.table_size.n()));
        }
        if !self.user_tasks_start.is_aligned(PAGE_SIZE)
            || !self.table_windows_start.is_aligned(PAGE_SIZE)
            || self.user_task_stride as usize % PAGE_SIZE != 0
        {
            return Err(ConfigError::Misaligned);
        }

        let task_bytes = self.task_pages * PAGE_SIZE;
        if task_bytes > self.user_task_stride as usize {
            return Err(ConfigError::SlotTooSmall {
                pages: self.task_pages,
                stride: self.user_task_stride,
            });
        }

        let last = self.max_tasks - 1;
        let end = self.slot_virtual_base_raw(last) + task_bytes as u64;
        if end > self.table_size.coverage() {
            return Err(ConfigError::SlotOutOfCoverage { slot: last });
        }
        Ok(())
    }

    fn slot_virtual_base_raw(&self, slot: usize) -> u64 {
        self.user_tasks_start.as_u32() as u64 + slot as u64 * self.user_task_stride as u64
    }

    /// Virtual base of slot `slot`
    pub fn slot_virtual_base(&self, slot: usize) -> VirtAddr {
        VirtAddr::new(self.slot_virtual_base_raw(slot) as u32)
    }

    /// Kernel window of slot `slot`'s table
    pub fn slot_table_window(&self, slot: usize) -> VirtAddr {
        self.table_windows_start
            .add_pages(slot * self.table_size.region_pages())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout_is_valid() {
        let config = SchedulerConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.slot_virtual_base(0), VirtAddr::new(0x0010_0000));
        assert_eq!(config.slot_virtual_base(19), VirtAddr::new(0x0140_0000));
        assert_eq!(config.slot_table_window(1), VirtAddr::new(0xC000_9000));
    }

    #[test]
    fn test_rejects_slots_beyond_coverage() {
        let config = SchedulerConfig {
            max_tasks: 32,
            ..SchedulerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::SlotOutOfCoverage { slot: 31 }));
    }

    #[test]
    fn test_rejects_degenerate_sizes() {
        let base = SchedulerConfig::default();
        assert_eq!(
            SchedulerConfig { max_tasks: 0, ..base }.validate(),
            Err(ConfigError::ZeroCapacity)
        );
        assert_eq!(
            SchedulerConfig { task_pages: 0, ..base }.validate(),
            Err(ConfigError::ZeroPages)
        );
        assert_eq!(
            SchedulerConfig {
                table_size: TranslationTableSize::BYTES_16K,
                ..base
            }
            .validate(),
            Err(ConfigError::TableTooLarge(0))
        );
        assert_eq!(
            SchedulerConfig { task_pages: 257, ..base }.validate(),
            Err(ConfigError::SlotTooSmall {
                pages: 257,
                stride: 0x0010_0000
            })
        );
    }
}
