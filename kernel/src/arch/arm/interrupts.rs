//! BCM2835 ARM interrupt controller driver
//!
//! The controller sits at offset 0xB200 in the peripheral block and gates
//! 64 GPU interrupt lines (two 32-bit banks) plus the ARM-local "basic"
//! sources.
//!
//! ## Registers
//! - pending basic / pending 1 / pending 2: read-only status
//! - FIQ control: bits 0-6 select the single FIQ source, bit 7 enables it
//! - enable 1/2/basic: write 1 to unmask
//! - disable 1/2/basic: write 1 to mask
//!
//! ## Source numbering
//! Lines 0-31 live in bank 1, 32-63 in bank 2. The system timer compare
//! channel 1 is line 1; the PL011 UART is line 57.

use core::ptr::{addr_of, addr_of_mut, read_volatile, write_volatile, NonNull};

use crate::memory::layout::{peripheral_va, INTERRUPT_CONTROLLER_OFFSET};

/// Number of GPU interrupt lines
pub const MAX_IRQS: u8 = 64;

/// FIQ control: enable bit
const FIQ_ENABLE: u32 = 1 << 7;

/// FIQ control: source field
const FIQ_SOURCE_MASK: u32 = 0x7F;

/// Register block layout
#[repr(C)]
#[derive(Debug, Default)]
pub struct InterruptRegisters {
    pub irq_basic_pending: u32,
    pub irq_pending1: u32,
    pub irq_pending2: u32,
    pub fiq_control: u32,
    pub enable_irqs1: u32,
    pub enable_irqs2: u32,
    pub enable_basic_irqs: u32,
    pub disable_irqs1: u32,
    pub disable_irqs2: u32,
    pub disable_basic_irqs: u32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<InterruptRegisters>(), 0x28);

/// A validated GPU interrupt line number
///
/// Only `InterruptSource::new` builds one, so a line is always below
/// `MAX_IRQS` and never one of the named sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Line(u8);

impl Line {
    pub const fn get(self) -> u8 {
        self.0
    }
}

/// An interrupt line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptSource {
    /// System timer compare channel 1
    SystemTimer,
    /// PL011 UART
    Uart,
    /// Any other line, by number
    Other(Line),
}

impl InterruptSource {
    const SYSTEM_TIMER_LINE: u8 = 1;
    const UART_LINE: u8 = 57;

    /// Source for line `line`, or `None` if the controller has no such line
    pub const fn new(line: u8) -> Option<Self> {
        match line {
            Self::SYSTEM_TIMER_LINE => Some(Self::SystemTimer),
            Self::UART_LINE => Some(Self::Uart),
            n if n < MAX_IRQS => Some(Self::Other(Line(n))),
            _ => None,
        }
    }

    pub const fn line(self) -> u8 {
        match self {
            Self::SystemTimer => Self::SYSTEM_TIMER_LINE,
            Self::Uart => Self::UART_LINE,
            Self::Other(line) => line.get(),
        }
    }

    /// Register bank (0 or 1) and bit for this line
    const fn bank_bit(self) -> (usize, u32) {
        let line = self.line();
        ((line / 32) as usize, 1 << (line % 32))
    }
}

/// Cause of a pending IRQ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingIrq {
    /// A recognised source
    Source(InterruptSource),
    /// Nothing recognised; carries the raw bank 1 pending word
    Unknown(u32),
}

/// Interrupt controller handle
pub struct InterruptController {
    regs: NonNull<InterruptRegisters>,
}

// SAFETY: the register block is only touched with IRQs masked on a single
// core (see `scheduler::with`), and every access is volatile.
unsafe impl Send for InterruptController {}
unsafe impl Sync for InterruptController {}

impl InterruptController {
    /// Controller at its fixed kernel virtual address
    ///
    /// # Safety
    /// The peripheral block must be mapped at `PERIPHERAL_VA_START`.
    pub unsafe fn new() -> Self {
        Self::from_ptr(peripheral_va(INTERRUPT_CONTROLLER_OFFSET) as *mut InterruptRegisters)
    }

    /// Controller over an arbitrary register block
    ///
    /// # Safety
    /// `regs` must be valid for volatile reads and writes for the lifetime
    /// of the controller.
    pub unsafe fn from_ptr(regs: *mut InterruptRegisters) -> Self {
        Self {
            regs: NonNull::new_unchecked(regs),
        }
    }

    #[inline]
    fn read(&self, reg: *const u32) -> u32 {
        // SAFETY: `reg` points into the register block (see `from_ptr`).
        unsafe { read_volatile(reg) }
    }

    #[inline]
    fn write(&self, reg: *mut u32, value: u32) {
        // SAFETY: as for `read`.
        unsafe { write_volatile(reg, value) }
    }

    /// Unmask one source for IRQ delivery
    pub fn enable(&self, source: InterruptSource) {
        let regs = self.regs.as_ptr();
        let (bank, bit) = source.bank_bit();
        // SAFETY: field projections of a valid register block pointer.
        let reg = unsafe {
            if bank == 0 {
                addr_of_mut!((*regs).enable_irqs1)
            } else {
                addr_of_mut!((*regs).enable_irqs2)
            }
        };
        self.write(reg, bit);
        log::debug!("[irq] enabled {:?}", source);
    }

    /// Mask one source
    pub fn disable(&self, source: InterruptSource) {
        let regs = self.regs.as_ptr();
        let (bank, bit) = source.bank_bit();
        // SAFETY: as in `enable`.
        let reg = unsafe {
            if bank == 0 {
                addr_of_mut!((*regs).disable_irqs1)
            } else {
                addr_of_mut!((*regs).disable_irqs2)
            }
        };
        self.write(reg, bit);
        log::debug!("[irq] disabled {:?}", source);
    }

    /// Mask every GPU interrupt line
    pub fn disable_all(&self) {
        let regs = self.regs.as_ptr();
        // SAFETY: field projections of a valid register block pointer.
        unsafe {
            self.write(addr_of_mut!((*regs).disable_irqs1), 0xFFFF_FFFF);
            self.write(addr_of_mut!((*regs).disable_irqs2), 0xFFFF_FFFF);
        }
    }

    /// Resolve the pending IRQ
    ///
    /// The system timer wins over the UART whatever else is pending.
    pub fn get_pending(&self) -> PendingIrq {
        let regs = self.regs.as_ptr();
        // SAFETY: field projections of a valid register block pointer.
        let (pending1, pending2) = unsafe {
            (
                self.read(addr_of!((*regs).irq_pending1)),
                self.read(addr_of!((*regs).irq_pending2)),
            )
        };

        let (_, timer_bit) = InterruptSource::SystemTimer.bank_bit();
        let (_, uart_bit) = InterruptSource::Uart.bank_bit();

        if pending1 & timer_bit != 0 {
            PendingIrq::Source(InterruptSource::SystemTimer)
        } else if pending2 & uart_bit != 0 {
            PendingIrq::Source(InterruptSource::Uart)
        } else {
            PendingIrq::Unknown(pending1)
        }
    }

    /// Route `source` to FIQ, replacing any previous FIQ source
    pub fn enable_fiq(&self, source: InterruptSource) {
        let regs = self.regs.as_ptr();
        let value = FIQ_ENABLE | (source.line() as u32 & FIQ_SOURCE_MASK);
        // SAFETY: field projection of a valid register block pointer.
        self.write(unsafe { addr_of_mut!((*regs).fiq_control) }, value);
        log::debug!("[irq] FIQ source {:?}", source);
    }

    /// Turn FIQ delivery off
    pub fn disable_fiq(&self) {
        let regs = self.regs.as_ptr();
        // SAFETY: field projection of a valid register block pointer.
        self.write(unsafe { addr_of_mut!((*regs).fiq_control) }, 0);
    }
}

/// Global interrupt controller (initialized during boot)
static CONTROLLER: spin::Once<InterruptController> = spin::Once::new();

/// Bind the global controller to the hardware and mask everything
///
/// # Safety
/// The peripheral block must be mapped at `PERIPHERAL_VA_START`.
pub unsafe fn initialize() -> &'static InterruptController {
    CONTROLLER.call_once(|| {
        let controller = InterruptController::new();
        controller.disable_all();
        controller.disable_fiq();
        log::info!("[irq] BCM2835 interrupt controller ready");
        controller
    })
}

/// The global controller, once initialized
pub fn controller() -> Option<&'static InterruptController> {
    CONTROLLER.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;

    fn blank_registers() -> Box<InterruptRegisters> {
        Box::new(InterruptRegisters::default())
    }

    #[test]
    fn test_source_numbering() {
        assert_eq!(InterruptSource::new(1), Some(InterruptSource::SystemTimer));
        assert_eq!(InterruptSource::new(57), Some(InterruptSource::Uart));
        assert_eq!(InterruptSource::new(40).map(InterruptSource::line), Some(40));
        assert!(matches!(InterruptSource::new(40), Some(InterruptSource::Other(_))));
        assert_eq!(InterruptSource::new(64), None);
        assert_eq!(InterruptSource::new(255), None);
        assert_eq!(InterruptSource::Uart.line(), 57);
    }

    #[test]
    fn test_every_constructible_line_is_in_range() {
        for n in 0..=u8::MAX {
            if let Some(source) = InterruptSource::new(n) {
                assert!(source.line() < MAX_IRQS);
                assert_eq!(source.line(), n);
                if let InterruptSource::Other(line) = source {
                    assert_ne!(line.get(), 1);
                    assert_ne!(line.get(), 57);
                }
            } else {
                assert!(n >= MAX_IRQS);
            }
        }
    }

    #[test]
    fn test_fiq_source_field_holds_the_line() {
        let mut regs = blank_registers();
        let ptr: *mut InterruptRegisters = &mut *regs;
        let irq = unsafe { InterruptController::from_ptr(ptr) };

        let last = InterruptSource::new(MAX_IRQS - 1).unwrap();
        irq.enable_fiq(last);
        assert_eq!(unsafe { (*ptr).fiq_control }, 0x80 | 63);

        irq.enable(last);
        assert_eq!(unsafe { (*ptr).enable_irqs2 }, 1 << 31);
        assert_eq!(unsafe { (*ptr).enable_irqs1 }, 0);
    }

    #[test]
    fn test_enable_selects_bank() {
        let mut regs = blank_registers();
        let irq = unsafe { InterruptController::from_ptr(&mut *regs) };

        irq.enable(InterruptSource::SystemTimer);
        irq.enable(InterruptSource::Uart);
        irq.disable(InterruptSource::new(33).unwrap());

        assert_eq!(regs.enable_irqs1, 1 << 1);
        assert_eq!(regs.enable_irqs2, 1 << 25);
        assert_eq!(regs.disable_irqs2, 1 << 1);
        assert_eq!(regs.disable_irqs1, 0);
    }

    #[test]
    fn test_disable_all_masks_both_banks() {
        let mut regs = blank_registers();
        let irq = unsafe { InterruptController::from_ptr(&mut *regs) };
        irq.disable_all();

        assert_eq!(regs.disable_irqs1, 0xFFFF_FFFF);
        assert_eq!(regs.disable_irqs2, 0xFFFF_FFFF);
        assert_eq!(regs.disable_basic_irqs, 0);
    }

    #[test]
    fn test_timer_has_priority_over_uart() {
        let mut regs = blank_registers();
        regs.irq_pending1 = 1 << 1;
        regs.irq_pending2 = 0xFFFF_FFFF;
        let irq = unsafe { InterruptController::from_ptr(&mut *regs) };
        assert_eq!(irq.get_pending(), PendingIrq::Source(InterruptSource::SystemTimer));
    }

    #[test]
    fn test_uart_and_unknown_pending() {
        let mut regs = blank_registers();
        regs.irq_pending2 = 1 << 25;
        regs.irq_pending1 = 1 << 9;
        let ptr: *mut InterruptRegisters = &mut *regs;
        let irq = unsafe { InterruptController::from_ptr(ptr) };
        assert_eq!(irq.get_pending(), PendingIrq::Source(InterruptSource::Uart));

        unsafe { (*ptr).irq_pending2 = 0 };
        assert_eq!(irq.get_pending(), PendingIrq::Unknown(1 << 9));
    }

    #[test]
    fn test_fiq_has_single_source() {
        let mut regs = blank_registers();
        let ptr: *mut InterruptRegisters = &mut *regs;
        let irq = unsafe { InterruptController::from_ptr(ptr) };

        irq.enable_fiq(InterruptSource::Uart);
        irq.enable_fiq(InterruptSource::SystemTimer);
        assert_eq!(unsafe { (*ptr).fiq_control }, 0x80 | 1);

        irq.disable_fiq();
        assert_eq!(unsafe { (*ptr).fiq_control }, 0);
    }
}
