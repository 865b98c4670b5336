//! Kernel memory map (BCM2835 / Raspberry Pi 1)
//!
//! ```text
//! 0x0000_0000 ┌──────────────────────────┐
//!             │ (unmapped guard)         │
//! 0x0010_0000 ├──────────────────────────┤ USER_TASKS_START / USER_VA_START
//!             │ task slot 0 (1 MiB)      │
//!             │ task slot 1 ...          │  TTB0 (N=7): first 32 MiB only
//! 0x0200_0000 ├──────────────────────────┤
//!             │ ...                      │
//! 0x8000_0000 ├──────────────────────────┤ KERNEL_VA_START (TTB1)
//!             │ linear map of RAM        │
//! 0xC000_0000 ├──────────────────────────┤ USER_TTB0S_START
//!             │ slot translation tables  │
//! 0xF200_0000 ├──────────────────────────┤ PERIPHERAL_VA_START
//!             │ BCM2835 peripherals      │
//!             └──────────────────────────┘
//! ```

/// Base of the kernel's linear mapping of physical RAM
pub const KERNEL_VA_START: u32 = 0x8000_0000;

/// First virtual page handed to a process created outside a scheduler slot
pub const USER_VA_START: u32 = 0x0010_0000;

/// Virtual base of scheduler slot 0
pub const USER_TASKS_START: u32 = 0x0010_0000;

/// Distance between consecutive slot virtual bases
pub const USER_TASK_STRIDE: u32 = 0x0010_0000;

/// Kernel window holding the translation tables of every slot
pub const USER_TTB0S_START: u32 = 0xC000_0000;

/// Kernel virtual base of the peripheral block
pub const PERIPHERAL_VA_START: u32 = 0xF200_0000;

/// Physical base of the peripheral block
pub const PERIPHERAL_PHYS_BASE: u32 = 0x2000_0000;

/// System timer registers (offset into the peripheral block)
pub const SYSTEM_TIMER_OFFSET: u32 = 0x3000;

/// ARM interrupt controller registers (offset into the peripheral block)
pub const INTERRUPT_CONTROLLER_OFFSET: u32 = 0xB200;

/// PL011 UART registers (offset into the peripheral block)
pub const UART0_OFFSET: u32 = 0x0020_1000;

/// Kernel virtual address of a peripheral register block
pub const fn peripheral_va(offset: u32) -> usize {
    (PERIPHERAL_VA_START + offset) as usize
}
