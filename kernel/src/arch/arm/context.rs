//! ARMv6 register file
//!
//! The IRQ entry stub pushes the interrupted context onto the IRQ stack in
//! exactly this order and hands the scheduler a pointer to it. On exit the
//! stub pops the (possibly replaced) frame and returns with `movs pc, lr`,
//! restoring `spsr` into CPSR.
//!
//! Layout (17 words):
//! - r0-r12: general purpose
//! - sp, lr: banked user/system stack pointer and link register
//! - pc: return address (the IRQ stub stores the adjusted `lr_irq` here)
//! - spsr: saved program status, including the processor mode

use core::fmt;

/// CPSR mode field values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProcessorMode {
    User = 0x10,
    Fiq = 0x11,
    Irq = 0x12,
    Supervisor = 0x13,
    Abort = 0x17,
    Undefined = 0x1B,
    System = 0x1F,
}

impl ProcessorMode {
    pub const MASK: u32 = 0x1F;

    pub fn from_psr(psr: u32) -> Option<Self> {
        match psr & Self::MASK {
            0x10 => Some(Self::User),
            0x11 => Some(Self::Fiq),
            0x12 => Some(Self::Irq),
            0x13 => Some(Self::Supervisor),
            0x17 => Some(Self::Abort),
            0x1B => Some(Self::Undefined),
            0x1F => Some(Self::System),
            _ => None,
        }
    }
}

/// Saved register file of a task
///
/// DO NOT reorder fields without updating the IRQ entry stub.
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterFile {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r4: u32,
    pub r5: u32,
    pub r6: u32,
    pub r7: u32,
    pub r8: u32,
    pub r9: u32,
    pub r10: u32,
    pub r11: u32, // Frame pointer (ARM)
    pub r12: u32,
    pub sp: u32,
    pub lr: u32,
    pub pc: u32,
    pub spsr: u32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<RegisterFile>(), 17 * 4);

impl RegisterFile {
    /// Create a new register file with all registers zeroed
    pub const fn new() -> Self {
        Self {
            r0: 0, r1: 0, r2: 0, r3: 0, r4: 0, r5: 0, r6: 0, r7: 0,
            r8: 0, r9: 0, r10: 0, r11: 0, r12: 0,
            sp: 0, lr: 0, pc: 0, spsr: 0,
        }
    }

    /// Point the stack and every frame-pointer register at `top`
    ///
    /// Thumb code uses r7 as frame pointer, ARM code r11; r12 (ip) is
    /// seeded too so prologues that copy sp through ip start consistent.
    pub fn set_stack_top(&mut self, top: u32) {
        self.sp = top;
        self.r7 = top;
        self.r11 = top;
        self.r12 = top;
    }

    /// Set the mode bits of the saved status, leaving flags alone
    pub fn set_mode(&mut self, mode: ProcessorMode) {
        self.spsr = (self.spsr & !ProcessorMode::MASK) | mode as u32;
    }

    pub fn mode(&self) -> Option<ProcessorMode> {
        ProcessorMode::from_psr(self.spsr)
    }
}

impl fmt::Debug for RegisterFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "RegisterFile {{")?;
        writeln!(f, "  r0:  {:#010x}  r1:  {:#010x}  r2:  {:#010x}  r3:  {:#010x}",
                 self.r0, self.r1, self.r2, self.r3)?;
        writeln!(f, "  r4:  {:#010x}  r5:  {:#010x}  r6:  {:#010x}  r7:  {:#010x}",
                 self.r4, self.r5, self.r6, self.r7)?;
        writeln!(f, "  r8:  {:#010x}  r9:  {:#010x}  r10: {:#010x}  r11: {:#010x}",
                 self.r8, self.r9, self.r10, self.r11)?;
        writeln!(f, "  r12: {:#010x}  sp:  {:#010x}  lr:  {:#010x}  pc:  {:#010x}",
                 self.r12, self.sp, self.lr, self.pc)?;
        writeln!(f, "  spsr: {:#010x} ({:?})", self.spsr, self.mode())?;
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_top_seeds_frame_pointers() {
        let mut regs = RegisterFile::new();
        regs.set_stack_top(0x0010_8000);
        assert_eq!(regs.sp, 0x0010_8000);
        assert_eq!(regs.r7, regs.sp);
        assert_eq!(regs.r11, regs.sp);
        assert_eq!(regs.r12, regs.sp);
        assert_eq!(regs.r0, 0);
    }

    #[test]
    fn test_mode_preserves_flags() {
        let mut regs = RegisterFile::new();
        regs.spsr = 0x6000_0013; // Z|C, supervisor
        regs.set_mode(ProcessorMode::User);
        assert_eq!(regs.spsr, 0x6000_0010);
        assert_eq!(regs.mode(), Some(ProcessorMode::User));

        regs.spsr = 0x15;
        assert_eq!(regs.mode(), None);
    }
}
