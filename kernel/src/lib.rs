//! PiOS kernel core
//!
//! The process and scheduling core of a bare-metal kernel for the
//! Raspberry Pi (BCM2835, ARM1176JZF-S).
//!
//! # Architecture
//!
//! The kernel is organized into the following modules:
//! - `arch`: ARMv6 register file, IRQ masking, interrupt controller, MMU
//! - `memory`: addresses, memory map, frame allocator, heap
//! - `fs`: the file access interface executables are read through
//! - `process`: address spaces, executable loading, process lifecycle
//! - `scheduler`: memory slots, ready queue, timer tick
//! - `irq`: routes pending interrupts to their handlers
//! - `boot`: bring-up of all of the above
//! - `debug`, `config`, `components`: console, logging, configuration
//!
//! Hardware access sits behind traits (`FrameAllocator`, `PhysicalMemory`,
//! `Mmu`, `FileSystem`, `TickTimer`) so the core also runs, and is tested,
//! on the host.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod arch;
pub mod boot;
pub mod components;
pub mod config;
pub mod debug;
pub mod fs;
pub mod irq;
pub mod memory;
pub mod process;
pub mod scheduler;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Panic handler: report and park the core
#[cfg(all(target_os = "none", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    // SAFETY: nothing else runs once the kernel has panicked.
    unsafe { arch::arm::cpu::disable_irqs() };
    crate::kprintln!("");
    crate::kprintln!("KERNEL PANIC: {}", info);
    loop {
        arch::arm::cpu::wait_for_event();
    }
}
