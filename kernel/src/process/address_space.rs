//! Address space builder
//!
//! A process owns two sets of frames:
//! - its table region: `TranslationTableSize::region_pages` contiguous
//!   frames holding the TTB0 L1 entries and their coarse tables
//! - its user pages: `Placement::pages` single frames mapped one after the
//!   other from `Placement::user_base`
//!
//! Both lists live on the `AddressSpace` and are the only record of what
//! must be freed.
//!
//! The builder writes table entries through `PhysicalMemory`. The kernel
//! window it maps over the table is not used for those writes; it is the
//! table's kernel virtual address recorded on the descriptor
//! (`table_window`) and stays mapped until `release`. Construction either returns a complete address space or
//! hands every frame back before failing.

use alloc::vec::Vec;

use crate::arch::arm::{SmallPageFlags, TableView, TranslationTableSize};
use crate::memory::layout::{KERNEL_VA_START, USER_VA_START};
use crate::memory::{self, Frame, PhysAddr, PhysicalMemory, VirtAddr, PAGE_SIZE, WORDS_PER_PAGE};
use crate::process::error::{ProcessError, Result};
use crate::process::image::UserPages;
use crate::process::{MemoryContext, Pid};

/// Kernel virtual address a process's table is mapped at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableWindow {
    /// The linear alias `KERNEL_VA_START + phys`
    Linear,
    /// A fixed kernel virtual address (scheduler slot windows)
    Fixed(VirtAddr),
}

/// Where and how large a new address space is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub user_base: VirtAddr,
    pub table_window: TableWindow,
    pub pages: usize,
    pub table_size: TranslationTableSize,
}

impl Placement {
    /// Start-size process at `USER_VA_START`, table edited through the
    /// linear map
    pub const fn linear(pages: usize) -> Self {
        Self {
            user_base: VirtAddr::new(USER_VA_START),
            table_window: TableWindow::Linear,
            pages,
            table_size: TranslationTableSize::BYTES_128,
        }
    }
}

/// A process's translation table and user pages
#[derive(Debug)]
pub struct AddressSpace {
    table_size: TranslationTableSize,
    table: Frame,
    table_pages: usize,
    table_va: VirtAddr,
    user_base: VirtAddr,
    user_frames: Vec<Frame>,
}

/// Frames claimed so far by an in-progress build
struct Partial {
    table: Frame,
    table_pages: usize,
    window: Option<VirtAddr>,
    user_frames: Vec<Frame>,
}

impl Partial {
    fn unwind(self, ctx: &mut MemoryContext<'_>) {
        for frame in &self.user_frames {
            ctx.frames.free(*frame);
        }
        if let Some(va) = self.window {
            ctx.mmu.unmap_kernel_window(va, self.table_pages);
        }
        for page in 0..self.table_pages {
            ctx.frames.free(self.table.nth(page));
        }
    }
}

impl AddressSpace {
    /// Build the table region and user pages for `pid`
    pub fn build(pid: Pid, placement: &Placement, ctx: &mut MemoryContext<'_>) -> Result<Self> {
        let size = placement.table_size;
        let table_pages = size.region_pages();

        // 1. contiguous table region; nothing to unwind if this fails
        let Some(table) = ctx.frames.alloc_contiguous(table_pages) else {
            log::warn!("[process] {}: no {} contiguous frames for the table", pid, table_pages);
            memory::print_usage(ctx.frames);
            return Err(ProcessError::OutOfMemory);
        };
        log::debug!("[process] {}: table at {:#x}", pid, table.start_address());

        let mut partial = Partial {
            table,
            table_pages,
            window: None,
            user_frames: Vec::new(),
        };

        // 2. all-zero entries fault
        ctx.memory.zero_pages(table, table_pages);

        // 3. kernel window over the table, recorded on the descriptor
        let table_va = match placement.table_window {
            TableWindow::Linear => VirtAddr::new(KERNEL_VA_START.wrapping_add(table.start_address().as_u32())),
            TableWindow::Fixed(va) => va,
        };
        if let Err(err) = ctx.mmu.map_kernel_window(table_va, table, table_pages) {
            log::error!("[process] {}: table window {:#x} rejected: {}", pid, table_va, err);
            partial.unwind(ctx);
            return Err(ProcessError::InvalidPlacement(err));
        }
        partial.window = Some(table_va);
        for page in 0..table_pages {
            ctx.mmu.flush_tlb(table_va.add_pages(page));
        }

        // 4. user pages, one frame at a time
        if partial.user_frames.try_reserve_exact(placement.pages).is_err() {
            log::warn!("[process] {}: no heap for the frame list", pid);
            partial.unwind(ctx);
            return Err(ProcessError::OutOfMemory);
        }
        for i in 0..placement.pages {
            let Some(frame) = ctx.frames.alloc() else {
                log::warn!(
                    "[process] {}: failed to allocate enough pages ({} of {}), out of memory?",
                    pid,
                    i,
                    placement.pages
                );
                memory::print_usage(ctx.frames);
                partial.unwind(ctx);
                return Err(ProcessError::OutOfMemory);
            };
            partial.user_frames.push(frame);
            ctx.memory.zero_pages(frame, 1);

            let va = placement.user_base.add_pages(i);
            let words = ctx.memory.words_mut(table.start_address(), table_pages * WORDS_PER_PAGE);
            let mapped = TableView::new(words, table.start_address(), size).map_page(frame, va, SmallPageFlags::USER_RW);
            if let Err(err) = mapped {
                log::error!("[process] {}: cannot map {:#x}: {}", pid, va, err);
                partial.unwind(ctx);
                return Err(ProcessError::InvalidPlacement(err));
            }

            // later pages are initialised through this mapping
            ctx.mmu.flush_tlb(va);
        }

        let Partial { user_frames, .. } = partial;
        let space = Self {
            table_size: size,
            table,
            table_pages,
            table_va,
            user_base: placement.user_base,
            user_frames,
        };

        // 5. self-identifying marker
        if let Some(first) = space.user_frames.first() {
            ctx.memory.words_mut(first.start_address(), 1)[0] = pid.as_u32();
        }

        log::debug!(
            "[process] {}: {} pages at {:#x}, frames {:?} -> {:?}",
            pid,
            space.user_frames.len(),
            space.user_base,
            space.user_frames.first(),
            space.user_frames.last()
        );
        Ok(space)
    }

    /// Return every frame to the allocator and drop the table window
    pub fn release(self, ctx: &mut MemoryContext<'_>) {
        Partial {
            table: self.table,
            table_pages: self.table_pages,
            window: Some(self.table_va),
            user_frames: self.user_frames,
        }
        .unwind(ctx);
    }

    /// Physical address `va` maps to, if any
    pub fn translate(&self, memory: &dyn PhysicalMemory, va: VirtAddr) -> Option<PhysAddr> {
        let words = memory.words(self.table.start_address(), self.table_pages * WORDS_PER_PAGE);
        TableView::new(words, self.table.start_address(), self.table_size).translate(va)
    }

    /// The user pages as a load target
    pub fn user_pages<'a>(&'a self, memory: &'a mut dyn PhysicalMemory) -> UserPages<'a> {
        UserPages::new(memory, &self.user_frames)
    }

    /// First word of the first user page
    pub fn marker(&self, memory: &dyn PhysicalMemory) -> Option<u32> {
        self.user_frames
            .first()
            .map(|frame| memory.words(frame.start_address(), 1)[0])
    }

    pub fn num_mem_pages(&self) -> usize {
        self.user_frames.len()
    }

    pub fn num_ttb0_pages(&self) -> usize {
        self.table_pages
    }

    pub fn user_frames(&self) -> &[Frame] {
        &self.user_frames
    }

    /// Frames of the table region, in order
    pub fn table_frames(&self) -> impl Iterator<Item = Frame> + '_ {
        (0..self.table_pages).map(move |page| self.table.nth(page))
    }

    /// Physical base of the table (the TTBR0 value)
    pub fn table_base(&self) -> PhysAddr {
        self.table.start_address()
    }

    /// Kernel virtual address the table is editable at
    pub fn table_window(&self) -> VirtAddr {
        self.table_va
    }

    pub fn table_size(&self) -> TranslationTableSize {
        self.table_size
    }

    pub fn user_base(&self) -> VirtAddr {
        self.user_base
    }

    /// One past the last user byte; the initial stack pointer
    pub fn stack_top(&self) -> VirtAddr {
        self.user_base.offset((self.user_frames.len() * PAGE_SIZE) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::arm::MapError;
    use crate::memory::FrameAllocator;
    use crate::testing::{FlakyFrames, Machine};
    use std::collections::BTreeSet;

    #[test]
    fn test_build_maps_start_pages() {
        let mut machine = Machine::new(256);
        let placement = Placement::linear(8);
        let space = AddressSpace::build(Pid::new(7), &placement, &mut machine.context()).unwrap();

        assert_eq!(space.num_mem_pages(), 8);
        assert_eq!(space.num_ttb0_pages(), 9);
        assert_eq!(space.stack_top(), VirtAddr::new(USER_VA_START + 8 * 0x1000));

        for (i, frame) in space.user_frames().iter().enumerate() {
            let va = VirtAddr::new(USER_VA_START).add_pages(i);
            assert_eq!(space.translate(&machine.memory, va), Some(frame.start_address()));
        }
        assert_eq!(space.translate(&machine.memory, VirtAddr::new(USER_VA_START).add_pages(8)), None);
        assert_eq!(space.marker(&machine.memory), Some(7));
    }

    #[test]
    fn test_frames_unique_and_disjoint_from_table() {
        let mut machine = Machine::new(256);
        let space = AddressSpace::build(Pid::new(1), &Placement::linear(8), &mut machine.context()).unwrap();

        let user: BTreeSet<_> = space.user_frames().iter().copied().collect();
        let table: BTreeSet<_> = space.table_frames().collect();
        assert_eq!(user.len(), 8);
        assert_eq!(table.len(), 9);
        assert!(user.is_disjoint(&table));
    }

    #[test]
    fn test_window_mapped_and_each_page_flushed() {
        let mut machine = Machine::new(256);
        let window = VirtAddr::new(0xC000_9000);
        let placement = Placement {
            table_window: TableWindow::Fixed(window),
            ..Placement::linear(3)
        };
        let space = AddressSpace::build(Pid::new(1), &placement, &mut machine.context()).unwrap();

        assert_eq!(space.table_window(), window);
        assert_eq!(machine.mmu.windows, std::vec![(window, space.table_frames().next().unwrap(), 9)]);
        for i in 0..3 {
            assert!(machine.mmu.flushed.contains(&VirtAddr::new(USER_VA_START).add_pages(i)));
        }
        assert!(machine.mmu.flushed.contains(&window));
    }

    #[test]
    fn test_window_recorded_until_release() {
        let mut machine = Machine::new(256);
        let window = VirtAddr::new(0xC001_2000);
        let placement = Placement {
            table_window: TableWindow::Fixed(window),
            ..Placement::linear(2)
        };
        let space = AddressSpace::build(Pid::new(3), &placement, &mut machine.context()).unwrap();

        // entries are written to the table frames themselves
        let first = space.user_frames()[0];
        assert_eq!(
            space.translate(&machine.memory, VirtAddr::new(USER_VA_START)),
            Some(first.start_address())
        );
        assert!(machine.mmu.unmapped.is_empty());

        space.release(&mut machine.context());
        assert_eq!(machine.mmu.unmapped, std::vec![(window, 9)]);
        assert!(machine.mmu.windows.is_empty());
    }

    #[test]
    fn test_table_exhaustion_claims_nothing() {
        let mut machine = Machine::new(8);
        let before = machine.frames.usage();
        let err = AddressSpace::build(Pid::new(1), &Placement::linear(8), &mut machine.context()).unwrap_err();
        assert_eq!(err, ProcessError::OutOfMemory);
        assert_eq!(machine.frames.usage(), before);
        assert!(machine.mmu.windows.is_empty());
    }

    #[test]
    fn test_third_page_failure_unwinds_everything() {
        let mut machine = Machine::new(256);
        let before = machine.frames.usage();

        let mut flaky = FlakyFrames::new(&mut machine.frames, 3);
        let mut ctx = MemoryContext {
            frames: &mut flaky,
            memory: &mut machine.memory,
            mmu: &mut machine.mmu,
        };
        let err = AddressSpace::build(Pid::new(1), &Placement::linear(8), &mut ctx).unwrap_err();

        assert_eq!(err, ProcessError::OutOfMemory);
        assert_eq!(flaky.single_requests(), 3);
        assert_eq!(machine.frames.usage(), before);
        assert_eq!(machine.mmu.unmapped.len(), 1);
    }

    #[test]
    fn test_placement_outside_coverage_unwinds() {
        let mut machine = Machine::new(256);
        let before = machine.frames.usage();
        let placement = Placement {
            user_base: VirtAddr::new(0x01FF_E000),
            ..Placement::linear(4)
        };

        let err = AddressSpace::build(Pid::new(1), &placement, &mut machine.context()).unwrap_err();
        assert_eq!(err, ProcessError::InvalidPlacement(MapError::OutOfRange));
        assert_eq!(machine.frames.usage(), before);
    }

    #[test]
    fn test_release_returns_all_frames() {
        let mut machine = Machine::new(256);
        let before = machine.frames.usage();
        let space = AddressSpace::build(Pid::new(1), &Placement::linear(8), &mut machine.context()).unwrap();
        assert_eq!(machine.frames.usage().used(), before.used() + 17);

        space.release(&mut machine.context());
        assert_eq!(machine.frames.usage(), before);
    }
}
