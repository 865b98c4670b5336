//! Access to physical frames from kernel code
//!
//! Page tables and freshly allocated user pages are edited through the
//! kernel's view of physical memory. On hardware that view is the linear
//! map at `KERNEL_VA_START`; host tests substitute a RAM-backed buffer.

use crate::memory::address::{Frame, PhysAddr, PAGE_SIZE, WORDS_PER_PAGE};
use crate::memory::layout::KERNEL_VA_START;

/// Word and byte views of physical memory
///
/// Callers only pass ranges made of frames obtained from the frame
/// allocator, which manages the same memory this view covers.
pub trait PhysicalMemory {
    /// `len` words starting at the word-aligned address `base`
    fn words(&self, base: PhysAddr, len: usize) -> &[u32];

    /// Mutable `len` words starting at the word-aligned address `base`
    fn words_mut(&mut self, base: PhysAddr, len: usize) -> &mut [u32];

    /// One page as bytes
    fn page_bytes_mut(&mut self, frame: Frame) -> &mut [u8] {
        let words = self.words_mut(frame.start_address(), WORDS_PER_PAGE);
        // SAFETY: a u32 slice reinterpreted as bytes covers the same memory
        // with a weaker alignment requirement.
        unsafe { core::slice::from_raw_parts_mut(words.as_mut_ptr().cast::<u8>(), PAGE_SIZE) }
    }

    /// Zero `pages` consecutive frames starting at `first`
    fn zero_pages(&mut self, first: Frame, pages: usize) {
        self.words_mut(first.start_address(), pages * WORDS_PER_PAGE).fill(0);
    }
}

/// The kernel's linear mapping of RAM (`virt = KERNEL_VA_START + phys`)
pub struct LinearWindow {
    _private: (),
}

impl LinearWindow {
    /// # Safety
    /// The boot code must have mapped all of RAM at `KERNEL_VA_START`, and
    /// only one `LinearWindow` may hand out references at a time.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }

    #[inline]
    fn virt(base: PhysAddr) -> *mut u32 {
        (KERNEL_VA_START as usize + base.as_usize()) as *mut u32
    }
}

impl PhysicalMemory for LinearWindow {
    fn words(&self, base: PhysAddr, len: usize) -> &[u32] {
        debug_assert!(base.is_aligned(4));
        // SAFETY: the linear map covers all RAM (see `new`).
        unsafe { core::slice::from_raw_parts(Self::virt(base), len) }
    }

    fn words_mut(&mut self, base: PhysAddr, len: usize) -> &mut [u32] {
        debug_assert!(base.is_aligned(4));
        // SAFETY: the linear map covers all RAM and `&mut self` keeps this
        // the only live view.
        unsafe { core::slice::from_raw_parts_mut(Self::virt(base), len) }
    }
}
