//! ARMv6 MMU control: TTB0 switching, TLB maintenance, kernel table windows
//!
//! The kernel lives in TTB1 (everything above the TTB0 coverage). Each
//! process table has a kernel virtual window: either the linear alias
//! `KERNEL_VA_START + phys`, which boot code already maps, or a per-slot
//! window in the range starting at `USER_TTB0S_START`, which this module
//! maps on demand through a set of coarse tables owned by the kernel's L1
//! table.

use crate::arch::arm::page_table::{
    MapError, SmallPageFlags, TranslationTableSize, L2_ENTRIES, L2_TABLE_SIZE, SECTION_SIZE,
};
use crate::memory::layout::KERNEL_VA_START;
use crate::memory::{Frame, PhysAddr, PhysicalMemory, VirtAddr, PAGE_SIZE};

/// Number of L1 entries in the full-size kernel (TTB1) table
const KERNEL_L1_ENTRIES: usize = 4096;

/// MMU and TLB operations the process core depends on
pub trait Mmu {
    /// Make `pages` frames starting at `first` visible to the kernel at `va`
    fn map_kernel_window(&mut self, va: VirtAddr, first: Frame, pages: usize) -> Result<(), MapError>;

    /// Drop a window installed by `map_kernel_window`
    fn unmap_kernel_window(&mut self, va: VirtAddr, pages: usize);

    /// Invalidate any TLB entry for the page containing `va`
    fn flush_tlb(&mut self, va: VirtAddr);

    /// Install `table` as TTB0 with the given size class
    fn switch_user_table(&mut self, table: PhysAddr, size: TranslationTableSize);

    /// Stop translation table walks through TTB0
    ///
    /// Afterwards no address below the TTB0 coverage translates, and the
    /// table last installed may be freed.
    fn disable_user_table(&mut self);
}

/// The MMU of the ARM1176JZF-S
pub struct ArmMmu<M: PhysicalMemory> {
    memory: M,
    window_base: VirtAddr,
    window_tables: Frame,
    window_sections: usize,
    /// TTBCR.N of the last installed user table
    ttb0_size: TranslationTableSize,
}

impl<M: PhysicalMemory> ArmMmu<M> {
    /// Set up the table window
    ///
    /// `window_tables` must be `window_sections` coarse tables worth of
    /// contiguous frames owned by the kernel. Their L1 descriptors are
    /// written into the kernel table at `kernel_l1`.
    pub fn new(
        mut memory: M,
        kernel_l1: PhysAddr,
        window_base: VirtAddr,
        window_tables: Frame,
        window_sections: usize,
    ) -> Result<Self, MapError> {
        if !window_base.is_aligned(SECTION_SIZE) {
            return Err(MapError::Misaligned);
        }
        let first_section = window_base.as_usize() / SECTION_SIZE;
        if first_section + window_sections > KERNEL_L1_ENTRIES {
            return Err(MapError::OutOfRange);
        }

        let table_words = window_sections * L2_ENTRIES;
        memory.words_mut(window_tables.start_address(), table_words).fill(0);

        let l1 = memory.words_mut(kernel_l1, KERNEL_L1_ENTRIES);
        for section in 0..window_sections {
            let l2 = window_tables.start_address().as_u32() + (section * L2_TABLE_SIZE) as u32;
            l1[first_section + section] = l2 | 0b01;
        }

        log::debug!(
            "[mmu] table window {:#x} ({} MB) backed by {:?}",
            window_base,
            window_sections,
            window_tables
        );

        Ok(Self {
            memory,
            window_base,
            window_tables,
            window_sections,
            ttb0_size: TranslationTableSize::BYTES_128,
        })
    }

    /// Word offset (from the first coarse table) of the entry for `va`
    fn window_entry(&self, va: VirtAddr) -> Option<usize> {
        let offset = va.as_usize().checked_sub(self.window_base.as_usize())?;
        let section = offset / SECTION_SIZE;
        (section < self.window_sections).then_some(section * L2_ENTRIES + (offset % SECTION_SIZE) / PAGE_SIZE)
    }

    fn is_linear_alias(va: VirtAddr, first: Frame) -> bool {
        va.as_u32() == KERNEL_VA_START.wrapping_add(first.start_address().as_u32())
    }

    fn window_words(&mut self) -> &mut [u32] {
        self.memory
            .words_mut(self.window_tables.start_address(), self.window_sections * L2_ENTRIES)
    }
}

impl<M: PhysicalMemory> Mmu for ArmMmu<M> {
    fn map_kernel_window(&mut self, va: VirtAddr, first: Frame, pages: usize) -> Result<(), MapError> {
        if !va.is_aligned(PAGE_SIZE) {
            return Err(MapError::Misaligned);
        }
        if Self::is_linear_alias(va, first) {
            return Ok(());
        }

        let start = self.window_entry(va).ok_or(MapError::OutOfRange)?;
        if pages > 0 && self.window_entry(va.add_pages(pages - 1)).is_none() {
            return Err(MapError::OutOfRange);
        }

        let flags = (SmallPageFlags::KERNEL_RW | SmallPageFlags::SMALL_PAGE).bits();
        let words = self.window_words();
        for page in 0..pages {
            words[start + page] = first.nth(page).start_address().as_u32() | flags;
        }
        Ok(())
    }

    fn unmap_kernel_window(&mut self, va: VirtAddr, pages: usize) {
        let Some(start) = self.window_entry(va) else {
            return;
        };
        let words = self.window_words();
        let end = (start + pages).min(words.len());
        words[start..end].fill(0);
        for page in 0..end - start {
            self.flush_tlb(va.add_pages(page));
        }
    }

    fn flush_tlb(&mut self, va: VirtAddr) {
        // SAFETY: TLB maintenance only affects translation caching.
        unsafe { invalidate_tlb(va) };
    }

    fn switch_user_table(&mut self, table: PhysAddr, size: TranslationTableSize) {
        log::trace!("[mmu] TTB0 <- {:#x} (N={})", table, size.n());
        // SAFETY: the table is a complete region built by the address-space
        // builder and stays allocated while its task can run.
        unsafe { set_ttb0(table, size) };
        self.ttb0_size = size;
    }

    fn disable_user_table(&mut self) {
        log::trace!("[mmu] TTB0 walks off");
        // SAFETY: only user mappings depend on TTB0; the kernel runs from TTB1.
        unsafe { disable_ttb0(self.ttb0_size) };
    }
}

/// Invalidate the unified TLB entry for one page
#[cfg(target_arch = "arm")]
pub unsafe fn invalidate_tlb(va: VirtAddr) {
    core::arch::asm!(
        "mcr p15, 0, {zero}, c7, c10, 4", // Data synchronization barrier
        "mcr p15, 0, {va}, c8, c7, 1",    // Invalidate unified TLB entry by MVA
        "mcr p15, 0, {zero}, c7, c5, 4",  // Flush prefetch buffer
        va = in(reg) va.as_u32() & !(PAGE_SIZE as u32 - 1),
        zero = in(reg) 0u32,
        options(nostack),
    );
}

/// Load TTBCR.N and TTBR0, then drop every cached translation
#[cfg(target_arch = "arm")]
pub unsafe fn set_ttb0(table: PhysAddr, size: TranslationTableSize) {
    core::arch::asm!(
        "mcr p15, 0, {zero}, c7, c10, 4",
        "mcr p15, 0, {n}, c2, c0, 2",     // TTBCR
        "mcr p15, 0, {ttb}, c2, c0, 0",   // TTBR0
        "mcr p15, 0, {zero}, c8, c7, 0",  // Invalidate entire unified TLB
        "mcr p15, 0, {zero}, c7, c5, 4",
        n = in(reg) size.n() as u32,
        ttb = in(reg) table.as_u32(),
        zero = in(reg) 0u32,
        options(nostack),
    );
}

/// TTBCR.PD0: no walks through TTB0
const TTBCR_PD0: u32 = 1 << 4;

/// Set TTBCR.PD0, keeping the split at `size`, then drop every cached
/// translation
#[cfg(target_arch = "arm")]
pub unsafe fn disable_ttb0(size: TranslationTableSize) {
    core::arch::asm!(
        "mcr p15, 0, {zero}, c7, c10, 4",
        "mcr p15, 0, {ttbcr}, c2, c0, 2", // TTBCR
        "mcr p15, 0, {zero}, c8, c7, 0",
        "mcr p15, 0, {zero}, c7, c5, 4",
        ttbcr = in(reg) size.n() as u32 | TTBCR_PD0,
        zero = in(reg) 0u32,
        options(nostack),
    );
}

#[cfg(not(target_arch = "arm"))]
pub unsafe fn disable_ttb0(_size: TranslationTableSize) {}

#[cfg(not(target_arch = "arm"))]
pub unsafe fn invalidate_tlb(_va: VirtAddr) {}

#[cfg(not(target_arch = "arm"))]
pub unsafe fn set_ttb0(_table: PhysAddr, _size: TranslationTableSize) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::layout::USER_TTB0S_START;
    use crate::testing::RamMemory;

    const KERNEL_L1: PhysAddr = PhysAddr::new(0x4000);
    const WINDOW_TABLES: PhysAddr = PhysAddr::new(0x8000);

    fn mmu() -> ArmMmu<RamMemory> {
        let memory = RamMemory::new(PhysAddr::new(0), 64);
        ArmMmu::new(
            memory,
            KERNEL_L1,
            VirtAddr::new(USER_TTB0S_START),
            Frame::containing(WINDOW_TABLES),
            2,
        )
        .unwrap()
    }

    #[test]
    fn test_window_sections_hooked_into_kernel_table() {
        let mmu = mmu();
        let l1 = mmu.memory.words(KERNEL_L1, KERNEL_L1_ENTRIES);
        let first = (USER_TTB0S_START as usize) / SECTION_SIZE;
        assert_eq!(l1[first], WINDOW_TABLES.as_u32() | 0b01);
        assert_eq!(l1[first + 1], (WINDOW_TABLES.as_u32() + 0x400) | 0b01);
        assert_eq!(l1[first + 2], 0);
    }

    #[test]
    fn test_map_and_unmap_window() {
        let mut mmu = mmu();
        let va = VirtAddr::new(USER_TTB0S_START).add_pages(9);
        let first = Frame::containing(PhysAddr::new(0x0002_0000));

        mmu.map_kernel_window(va, first, 3).unwrap();
        let words = mmu.window_words();
        assert_eq!(words[9] & !0xFFF, 0x0002_0000);
        assert_eq!(words[11] & !0xFFF, 0x0002_2000);
        assert_ne!(words[11] & SmallPageFlags::SMALL_PAGE.bits(), 0);

        mmu.unmap_kernel_window(va, 3);
        assert!(mmu.window_words()[9..12].iter().all(|&w| w == 0));
    }

    #[test]
    fn test_linear_alias_needs_no_entries() {
        let mut mmu = mmu();
        let frame = Frame::containing(PhysAddr::new(0x0003_0000));
        let alias = VirtAddr::new(KERNEL_VA_START + 0x0003_0000);
        mmu.map_kernel_window(alias, frame, 9).unwrap();
        assert!(mmu.window_words().iter().all(|&w| w == 0));

        let outside = VirtAddr::new(USER_TTB0S_START + 2 * SECTION_SIZE as u32);
        assert_eq!(mmu.map_kernel_window(outside, frame, 1), Err(MapError::OutOfRange));
    }
}
