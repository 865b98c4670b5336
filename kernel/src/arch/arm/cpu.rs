//! CPU interrupt masking
//!
//! Scheduler and slot-table state is shared between normal and IRQ
//! context on a single core. Mutations run with IRQs masked through an
//! `InterruptGuard`, which restores the previous mask state on drop.

/// Masks IRQs for as long as it lives
pub struct InterruptGuard {
    was_enabled: bool,
}

impl InterruptGuard {
    pub fn new() -> Self {
        let was_enabled = irqs_enabled();
        // SAFETY: masking IRQs has no memory-safety effect.
        unsafe { disable_irqs() };
        Self { was_enabled }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.was_enabled {
            // SAFETY: IRQs were enabled when the guard was taken.
            unsafe { enable_irqs() };
        }
    }
}

/// Whether the CPSR I bit is clear
#[cfg(target_arch = "arm")]
pub fn irqs_enabled() -> bool {
    let cpsr: u32;
    unsafe { core::arch::asm!("mrs {}, cpsr", out(reg) cpsr, options(nomem, nostack)) };
    cpsr & (1 << 7) == 0
}

/// Mask IRQs
#[cfg(target_arch = "arm")]
pub unsafe fn disable_irqs() {
    core::arch::asm!("cpsid i", options(nomem, nostack));
}

/// Unmask IRQs
#[cfg(target_arch = "arm")]
pub unsafe fn enable_irqs() {
    core::arch::asm!("cpsie i", options(nomem, nostack));
}

/// Park the core until the next event
#[cfg(target_arch = "arm")]
pub fn wait_for_event() {
    unsafe { core::arch::asm!("wfe", options(nomem, nostack)) };
}

#[cfg(not(target_arch = "arm"))]
pub fn irqs_enabled() -> bool {
    false
}

#[cfg(not(target_arch = "arm"))]
pub unsafe fn disable_irqs() {}

#[cfg(not(target_arch = "arm"))]
pub unsafe fn enable_irqs() {}

#[cfg(not(target_arch = "arm"))]
pub fn wait_for_event() {
    core::hint::spin_loop();
}
