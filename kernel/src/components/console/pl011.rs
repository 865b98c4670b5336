//! PL011 UART console (UART0 on the BCM2835)
//!
//! Transmit only, polled. The firmware leaves UART0 configured at 115200
//! 8N1, so nothing is reprogrammed here.

use super::Console;
use core::ptr::{self, addr_of, addr_of_mut};

/// Flag register: transmit FIFO full
const FR_TXFF: u32 = 1 << 5;

/// PL011 UART registers (minimal subset)
#[repr(C)]
struct Pl011Regs {
    dr: u32,           // 0x00: Data register
    _rsrecr: [u32; 5], // 0x04-0x14: Status/error registers (unused)
    fr: u32,           // 0x18: Flag register
}

/// PL011 console configuration
#[derive(Clone, Copy)]
pub struct Pl011Config {
    /// Kernel virtual address of the register block
    pub mmio_base: usize,
}

/// PL011 polled console
pub struct Pl011Console {
    mmio_base: usize,
}

impl Pl011Console {
    /// The register block must be mapped before the first `putc`.
    pub const fn new(config: Pl011Config) -> Self {
        Self {
            mmio_base: config.mmio_base,
        }
    }

    /// Touch the flag register so a bad mapping faults at boot rather than
    /// on the first message
    pub fn init(&self) {
        let regs = self.mmio_base as *const Pl011Regs;
        // SAFETY: `mmio_base` addresses the mapped register block.
        let _ = unsafe { ptr::read_volatile(addr_of!((*regs).fr)) };
    }

    #[inline]
    fn tx_full(&self) -> bool {
        let regs = self.mmio_base as *const Pl011Regs;
        // SAFETY: as in `init`.
        let fr = unsafe { ptr::read_volatile(addr_of!((*regs).fr)) };
        fr & FR_TXFF != 0
    }
}

impl Console for Pl011Console {
    fn putc(&self, c: u8) {
        while self.tx_full() {
            core::hint::spin_loop();
        }
        let regs = self.mmio_base as *mut Pl011Regs;
        // SAFETY: as in `init`.
        unsafe { ptr::write_volatile(addr_of_mut!((*regs).dr), c as u32) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_putc_writes_data_register() {
        let mut regs = [0u32; 7];
        let console = Pl011Console::new(Pl011Config {
            mmio_base: regs.as_mut_ptr() as usize,
        });

        console.puts("ok\n");
        assert_eq!(regs[0], b'\n' as u32);

        console.putc(b'x');
        assert_eq!(regs[0], b'x' as u32);
    }
}
