//! ARMv6 (ARM1176JZF-S) support for the BCM2835
//!
//! - `context`: saved register file
//! - `cpu`: IRQ masking
//! - `interrupts`: BCM2835 interrupt controller
//! - `mmu`: TTB0 switching, TLB maintenance, kernel table windows
//! - `page_table`: short-descriptor table format

pub mod context;
pub mod cpu;
pub mod interrupts;
pub mod mmu;
pub mod page_table;

pub use context::{ProcessorMode, RegisterFile};
pub use cpu::InterruptGuard;
pub use interrupts::{InterruptController, InterruptSource, Line, PendingIrq};
pub use mmu::{ArmMmu, Mmu};
pub use page_table::{MapError, SmallPageFlags, TableView, TranslationTableSize};
