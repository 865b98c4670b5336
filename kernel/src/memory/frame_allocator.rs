//! Physical frame allocator
//!
//! Bitmap-based allocator for 4KB page frames. One bit per frame,
//! 1 = allocated, 0 = free. Frame numbers are relative to the first region
//! added, so the bitmap only has to cover installed RAM.
//!
//! Besides single frames the allocator hands out runs of physically
//! contiguous frames, which translation tables need.

use crate::memory::address::{Frame, PhysAddr, PAGE_SIZE};

/// Maximum number of physical frames we can track
/// For 512MB RAM (Pi 1 model B): 512MB / 4KB = 128K frames = 16KB bitmap
const MAX_FRAMES: usize = 128 * 1024;

/// Snapshot of allocator usage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameUsage {
    pub total: usize,
    pub free: usize,
}

impl FrameUsage {
    pub fn used(&self) -> usize {
        self.total - self.free
    }
}

/// Source of physical frames
///
/// `None` is the "no memory" answer; it can never be mistaken for a frame.
pub trait FrameAllocator {
    /// Allocate one free frame
    fn alloc(&mut self) -> Option<Frame>;

    /// Allocate `count` physically contiguous frames, returning the first
    fn alloc_contiguous(&mut self, count: usize) -> Option<Frame>;

    /// Return a frame to the pool
    fn free(&mut self, frame: Frame);

    /// Current usage
    fn usage(&self) -> FrameUsage;
}

/// Bitmap physical frame allocator
pub struct BitmapFrameAllocator {
    /// Bitmap tracking frame allocation (1 = allocated, 0 = free)
    bitmap: [u64; MAX_FRAMES / 64],

    /// Total number of frames managed by this allocator
    total_frames: usize,

    /// Number of free frames available
    free_frames: usize,

    /// Base physical address of RAM (frame 0 corresponds to this address)
    ram_base: Option<usize>,
}

impl BitmapFrameAllocator {
    /// Create a new empty frame allocator
    ///
    /// Every frame starts out allocated; `add_region` releases usable RAM.
    pub const fn new() -> Self {
        Self {
            bitmap: [!0; MAX_FRAMES / 64],
            total_frames: 0,
            free_frames: 0,
            ram_base: None,
        }
    }

    /// Add a physical memory region to the allocator
    pub fn add_region(&mut self, start: PhysAddr, size: usize) {
        let ram_base = *self.ram_base.get_or_insert(start.as_usize());
        if start.as_usize() < ram_base {
            log::warn!("[frames] region {:#x} below RAM base {:#x} ignored", start, ram_base);
            return;
        }

        let start_frame = (start.as_usize() - ram_base) / PAGE_SIZE;
        let end_frame = (start_frame + size / PAGE_SIZE).min(MAX_FRAMES);

        for frame in start_frame..end_frame {
            if !self.is_free(frame) {
                self.mark_free(frame);
                self.free_frames += 1;
            }
        }

        self.total_frames = self.total_frames.max(end_frame);
    }

    /// Reserve a physical memory region (mark as allocated)
    ///
    /// Used for the kernel image, the boot stack and the heap.
    pub fn reserve_region(&mut self, start: PhysAddr, size: usize) {
        let Some(ram_base) = self.ram_base else {
            return;
        };
        if start.as_usize() < ram_base {
            return;
        }

        let start_frame = (start.as_usize() - ram_base) / PAGE_SIZE;
        let num_frames = size.div_ceil(PAGE_SIZE);
        let end_frame = (start_frame + num_frames).min(self.total_frames);

        for frame in start_frame..end_frame {
            if self.is_free(frame) {
                self.mark_allocated(frame);
                self.free_frames -= 1;
            }
        }
    }

    /// Get the number of free frames
    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// Get the total number of frames
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    fn frame_at(&self, index: usize) -> Frame {
        let base = self.ram_base.unwrap_or(0);
        Frame::containing(PhysAddr::new((base + index * PAGE_SIZE) as u32))
    }

    fn index_of(&self, frame: Frame) -> Option<usize> {
        let base = self.ram_base?;
        let addr = frame.start_address().as_usize();
        if addr < base {
            return None;
        }
        let index = (addr - base) / PAGE_SIZE;
        (index < self.total_frames).then_some(index)
    }

    #[inline]
    fn is_free(&self, frame: usize) -> bool {
        let chunk_idx = frame / 64;
        let bit_idx = frame % 64;
        (self.bitmap[chunk_idx] & (1u64 << bit_idx)) == 0
    }

    #[inline]
    fn mark_allocated(&mut self, frame: usize) {
        self.bitmap[frame / 64] |= 1u64 << (frame % 64);
    }

    #[inline]
    fn mark_free(&mut self, frame: usize) {
        self.bitmap[frame / 64] &= !(1u64 << (frame % 64));
    }
}

impl Default for BitmapFrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAllocator for BitmapFrameAllocator {
    fn alloc(&mut self) -> Option<Frame> {
        if self.free_frames == 0 {
            return None;
        }

        let chunks = self.total_frames.div_ceil(64);
        for chunk_idx in 0..chunks {
            let chunk = self.bitmap[chunk_idx];
            if chunk == !0 {
                continue;
            }
            let frame = chunk_idx * 64 + (!chunk).trailing_zeros() as usize;
            if frame >= self.total_frames {
                return None;
            }
            self.mark_allocated(frame);
            self.free_frames -= 1;
            return Some(self.frame_at(frame));
        }

        None
    }

    fn alloc_contiguous(&mut self, count: usize) -> Option<Frame> {
        if count == 0 || count > self.free_frames {
            return None;
        }

        // First-fit scan for a run of `count` free frames
        let mut run_start = 0;
        let mut run_len = 0;
        for frame in 0..self.total_frames {
            if self.is_free(frame) {
                if run_len == 0 {
                    run_start = frame;
                }
                run_len += 1;
                if run_len == count {
                    for f in run_start..run_start + count {
                        self.mark_allocated(f);
                    }
                    self.free_frames -= count;
                    return Some(self.frame_at(run_start));
                }
            } else {
                run_len = 0;
            }
        }

        None
    }

    fn free(&mut self, frame: Frame) {
        match self.index_of(frame) {
            Some(index) if !self.is_free(index) => {
                self.mark_free(index);
                self.free_frames += 1;
            }
            Some(_) => log::warn!("[frames] double free of {:?}", frame),
            None => log::warn!("[frames] free of unmanaged {:?}", frame),
        }
    }

    fn usage(&self) -> FrameUsage {
        FrameUsage {
            total: self.total_frames,
            free: self.free_frames,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;

    fn allocator_with_1mb() -> Box<BitmapFrameAllocator> {
        let mut allocator = Box::new(BitmapFrameAllocator::new());
        allocator.add_region(PhysAddr::new(0x100000), 1024 * 1024);
        allocator
    }

    #[test]
    fn test_frame_allocator_basic() {
        let mut allocator = allocator_with_1mb();
        assert_eq!(allocator.total_frames(), 256); // 1MB / 4KB
        assert_eq!(allocator.free_frames(), 256);

        let frame1 = allocator.alloc().unwrap();
        assert_eq!(frame1.start_address(), PhysAddr::new(0x100000));
        let frame2 = allocator.alloc().unwrap();
        assert_eq!(allocator.free_frames(), 254);
        assert_ne!(frame1, frame2);

        allocator.free(frame1);
        assert_eq!(allocator.free_frames(), 255);
        allocator.free(frame2);
        assert_eq!(allocator.usage(), FrameUsage { total: 256, free: 256 });
    }

    #[test]
    fn test_frame_allocator_reserve() {
        let mut allocator = allocator_with_1mb();
        let initial_free = allocator.free_frames();

        // Reserve first 64KB (16 pages)
        allocator.reserve_region(PhysAddr::new(0x100000), 64 * 1024);
        assert_eq!(allocator.free_frames(), initial_free - 16);
        assert_eq!(allocator.alloc().unwrap().start_address(), PhysAddr::new(0x110000));
    }

    #[test]
    fn test_contiguous_skips_fragmented_runs() {
        let mut allocator = allocator_with_1mb();
        let frames: std::vec::Vec<_> = (0..4).map(|_| allocator.alloc().unwrap()).collect();
        allocator.free(frames[1]);
        allocator.free(frames[2]);

        // The two-frame hole is too small for three frames
        let run = allocator.alloc_contiguous(3).unwrap();
        assert_eq!(run.start_address(), PhysAddr::new(0x104000));

        let hole = allocator.alloc_contiguous(2).unwrap();
        assert_eq!(hole, frames[1]);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut allocator = Box::new(BitmapFrameAllocator::new());
        allocator.add_region(PhysAddr::new(0x8000), 2 * PAGE_SIZE);
        assert!(allocator.alloc_contiguous(3).is_none());
        assert!(allocator.alloc().is_some());
        assert!(allocator.alloc().is_some());
        assert!(allocator.alloc().is_none());
        assert_eq!(allocator.usage().used(), 2);
    }

    #[test]
    fn test_double_free_is_ignored() {
        let mut allocator = allocator_with_1mb();
        let frame = allocator.alloc().unwrap();
        allocator.free(frame);
        allocator.free(frame);
        assert_eq!(allocator.free_frames(), 256);
    }
}
