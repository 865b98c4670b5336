//! Kernel heap allocator
//!
//! Provides `Box`, `Vec` and `String` for process descriptors, frame lists
//! and image buffers. On bare metal the global allocator is a
//! `linked_list_allocator::LockedHeap` carved from a static region; host
//! builds keep the system allocator.

#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

/// Heap size (1MB)
pub const HEAP_SIZE: usize = 1024 * 1024;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(target_os = "none")]
static mut HEAP_MEMORY: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

/// Heap usage in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapUsage {
    pub size: usize,
    pub used: usize,
}

/// Initialize the kernel heap
///
/// # Safety
/// - Must be called exactly once during boot
/// - Must be called before any heap allocation
#[cfg(target_os = "none")]
pub unsafe fn init() {
    let start = core::ptr::addr_of_mut!(HEAP_MEMORY).cast::<u8>();
    ALLOCATOR.lock().init(start, HEAP_SIZE);
    log::info!("[heap] {} KB at {:p}", HEAP_SIZE / 1024, start);
}

#[cfg(not(target_os = "none"))]
pub unsafe fn init() {}

/// Current heap usage
#[cfg(target_os = "none")]
pub fn usage() -> HeapUsage {
    let heap = ALLOCATOR.lock();
    HeapUsage {
        size: heap.size(),
        used: heap.used(),
    }
}

#[cfg(not(target_os = "none"))]
pub fn usage() -> HeapUsage {
    HeapUsage { size: 0, used: 0 }
}
