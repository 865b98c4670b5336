//! Memory management subsystem
//!
//! - `address`: type-safe physical/virtual addresses and frames
//! - `layout`: the kernel memory map
//! - `frame_allocator`: physical page frame allocator
//! - `physical`: kernel access to physical frames
//! - `heap`: kernel heap allocator

pub mod address;
pub mod frame_allocator;
pub mod heap;
pub mod layout;
pub mod physical;

pub use address::{Frame, PhysAddr, VirtAddr, PAGE_SIZE, WORDS_PER_PAGE};
pub use frame_allocator::{BitmapFrameAllocator, FrameAllocator, FrameUsage};
pub use physical::{LinearWindow, PhysicalMemory};

use alloc::boxed::Box;

/// Global frame allocator (initialized during boot)
static FRAME_ALLOCATOR: spin::Once<spin::Mutex<Box<BitmapFrameAllocator>>> = spin::Once::new();

/// Initialize the physical frame pool
///
/// Everything from `ram_start` up to `kernel_end` (vectors, kernel image,
/// boot stacks, heap) is reserved.
///
/// # Safety
/// - Must be called exactly once during boot, after `heap::init`
pub unsafe fn init(kernel_end: PhysAddr, ram_start: PhysAddr, ram_size: usize) {
    log::info!(
        "[memory] RAM {:#x} - {:#x} ({}MB), kernel ends at {:#x}",
        ram_start,
        ram_start.as_usize() + ram_size,
        ram_size / (1024 * 1024),
        kernel_end
    );

    let mut allocator = Box::new(BitmapFrameAllocator::new());
    allocator.add_region(ram_start, ram_size);
    allocator.reserve_region(ram_start, kernel_end.as_usize() - ram_start.as_usize());

    let usage = allocator.usage();
    log::info!(
        "[memory] frames: {}/{} free ({}MB usable)",
        usage.free,
        usage.total,
        (usage.free * PAGE_SIZE) / (1024 * 1024)
    );

    FRAME_ALLOCATOR.call_once(|| spin::Mutex::new(allocator));
}

/// Handle on the global frame pool
///
/// Every call locks the pool for its duration, so a `GlobalFrames` can be
/// handed to code that expects a `FrameAllocator`.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalFrames;

impl FrameAllocator for GlobalFrames {
    fn alloc(&mut self) -> Option<Frame> {
        FRAME_ALLOCATOR.get().and_then(|a| a.lock().alloc())
    }

    fn alloc_contiguous(&mut self, count: usize) -> Option<Frame> {
        FRAME_ALLOCATOR.get().and_then(|a| a.lock().alloc_contiguous(count))
    }

    fn free(&mut self, frame: Frame) {
        if let Some(allocator) = FRAME_ALLOCATOR.get() {
            allocator.lock().free(frame);
        }
    }

    fn usage(&self) -> FrameUsage {
        FRAME_ALLOCATOR
            .get()
            .map(|a| a.lock().usage())
            .unwrap_or(FrameUsage { total: 0, free: 0 })
    }
}

/// Log frame and heap usage
pub fn print_usage(frames: &dyn FrameAllocator) {
    let usage = frames.usage();
    let heap = heap::usage();
    log::info!(
        "[memory] frames used {}/{}, heap used {}/{} bytes",
        usage.used(),
        usage.total,
        heap.used,
        heap.size
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_pool_reserves_kernel() {
        unsafe { init(PhysAddr::new(0x0010_0000), PhysAddr::new(0), 4 * 1024 * 1024) };

        let mut frames = GlobalFrames;
        let usage = frames.usage();
        assert_eq!(usage.total, 1024);
        assert_eq!(usage.free, 1024 - 256);

        let frame = frames.alloc().unwrap();
        assert_eq!(frame.start_address(), PhysAddr::new(0x0010_0000));
        frames.free(frame);
        assert_eq!(frames.usage().free, 1024 - 256);
    }
}
