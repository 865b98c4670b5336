//! Physical and virtual address types
//!
//! The ARMv6 core runs with a 32-bit address space, so both address kinds
//! wrap a `u32`. Keeping them distinct stops a kernel-window address from
//! being written into a page-table entry by accident.

use core::fmt;

/// Size of a small page / physical frame (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Number of 32-bit words in one page
pub const WORDS_PER_PAGE: usize = PAGE_SIZE / core::mem::size_of::<u32>();

/// Physical address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u32);

/// Virtual address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u32);

impl PhysAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_aligned(self, align: usize) -> bool {
        (self.0 as usize) & (align - 1) == 0
    }

    /// Address `pages` pages above this one
    #[inline]
    pub const fn add_pages(self, pages: usize) -> Self {
        Self(self.0.wrapping_add((pages * PAGE_SIZE) as u32))
    }
}

impl VirtAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_aligned(self, align: usize) -> bool {
        (self.0 as usize) & (align - 1) == 0
    }

    #[inline]
    pub const fn add_pages(self, pages: usize) -> Self {
        Self(self.0.wrapping_add((pages * PAGE_SIZE) as u32))
    }

    #[inline]
    pub const fn offset(self, bytes: u32) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#010x})", self.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#010x})", self.0)
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// One physical page frame, identified by its base address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Frame(PhysAddr);

impl Frame {
    /// Frame starting at `addr`, which must be page aligned
    pub const fn containing(addr: PhysAddr) -> Self {
        Self(PhysAddr::new(addr.as_u32() & !((PAGE_SIZE as u32) - 1)))
    }

    #[inline]
    pub const fn start_address(self) -> PhysAddr {
        self.0
    }

    /// The frame `n` frames above this one
    #[inline]
    pub const fn nth(self, n: usize) -> Self {
        Self(self.0.add_pages(n))
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({:#010x})", self.0.as_u32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_rounds_down() {
        let frame = Frame::containing(PhysAddr::new(0x0012_3456));
        assert_eq!(frame.start_address(), PhysAddr::new(0x0012_3000));
        assert_eq!(frame.nth(2).start_address(), PhysAddr::new(0x0012_5000));
    }

    #[test]
    fn test_alignment() {
        assert!(VirtAddr::new(0x8000_0000).is_aligned(PAGE_SIZE));
        assert!(!PhysAddr::new(0x1004).is_aligned(PAGE_SIZE));
        assert!(PhysAddr::new(0x1080).is_aligned(128));
    }
}
