//! ARMv6 short-descriptor translation tables
//!
//! Two levels, 4KB small pages only:
//! - L1: one word per 1MB section. A coarse descriptor (`0b01`) points at
//!   an L2 table; a zero word is a translation fault.
//! - L2 (coarse): 256 words (1KB) covering 1MB, one per 4KB small page.
//!
//! TTBCR.N shrinks the TTB0 table: with N = 7 the L1 table is 128 bytes,
//! 32 entries, covering the low 32MB; everything above goes through TTB1.
//!
//! # Table region layout
//! A process table is one run of contiguous frames: the L1 entries first,
//! rounded up to whole pages, then one coarse table per L1 entry at a
//! fixed position. An L1 entry is only written when the first page of its
//! megabyte is mapped, so untouched ranges stay faulting.

use bitflags::bitflags;
use thiserror::Error;

use crate::memory::{Frame, PhysAddr, VirtAddr, PAGE_SIZE, WORDS_PER_PAGE};

/// Bytes covered by one L1 entry
pub const SECTION_SIZE: usize = 1 << 20;

/// Words in one coarse L2 table
pub const L2_ENTRIES: usize = 256;

/// Bytes in one coarse L2 table
pub const L2_TABLE_SIZE: usize = L2_ENTRIES * 4;

/// L1 descriptor type: coarse page table
const L1_COARSE: u32 = 0b01;

/// L1 descriptor type mask
const L1_TYPE_MASK: u32 = 0b11;

/// Coarse table base address bits [31:10]
const L1_COARSE_BASE_MASK: u32 = !0x3FF;

/// Small page base address bits [31:12]
const L2_SMALL_BASE_MASK: u32 = !0xFFF;

bitflags! {
    /// Small page descriptor bits (ARMv6, subpage AP disabled)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SmallPageFlags: u32 {
        /// Execute never
        const XN         = 1 << 0;

        /// Descriptor type: small page
        const SMALL_PAGE = 1 << 1;

        const BUFFERABLE = 1 << 2;
        const CACHEABLE  = 1 << 3;

        // Access permissions AP[1:0]
        const AP0        = 1 << 4;
        const AP1        = 1 << 5;

        // Type extension TEX[2:0]
        const TEX0       = 1 << 6;
        const TEX1       = 1 << 7;
        const TEX2       = 1 << 8;

        /// Access permission extension (read-only when set)
        const APX        = 1 << 9;

        /// Shareable
        const SHARED     = 1 << 10;

        /// Not global (ASID tagged)
        const NOT_GLOBAL = 1 << 11;

        // Common combinations

        /// Kernel read/write, user no access, write-back cached
        const KERNEL_RW  = Self::BUFFERABLE.bits()
                         | Self::CACHEABLE.bits()
                         | Self::AP0.bits();

        /// Kernel and user read/write, write-back cached
        const USER_RW    = Self::BUFFERABLE.bits()
                         | Self::CACHEABLE.bits()
                         | Self::AP0.bits()
                         | Self::AP1.bits();
    }
}

/// Page table operation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("virtual address outside the table's coverage")]
    OutOfRange,

    #[error("virtual page already mapped")]
    AlreadyMapped,

    #[error("address not page aligned")]
    Misaligned,
}

/// TTB0 size class (TTBCR.N)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationTableSize {
    n: u8,
}

impl TranslationTableSize {
    /// 16KB L1 table, 4GB coverage
    pub const BYTES_16K: Self = Self { n: 0 };

    /// 128 byte L1 table, 32MB coverage
    pub const BYTES_128: Self = Self { n: 7 };

    pub const fn from_n(n: u8) -> Option<Self> {
        if n <= 7 {
            Some(Self { n })
        } else {
            None
        }
    }

    /// TTBCR.N value
    pub const fn n(self) -> u8 {
        self.n
    }

    /// Size of the L1 table in bytes
    pub const fn bytes(self) -> usize {
        (16 * 1024) >> self.n
    }

    pub const fn l1_entries(self) -> usize {
        self.bytes() / 4
    }

    /// Pages holding the L1 entries
    pub const fn l1_pages(self) -> usize {
        self.bytes().div_ceil(PAGE_SIZE)
    }

    /// Pages holding one coarse table per L1 entry
    pub const fn l2_pages(self) -> usize {
        (self.l1_entries() * L2_TABLE_SIZE).div_ceil(PAGE_SIZE)
    }

    /// Contiguous pages a whole table region occupies
    pub const fn region_pages(self) -> usize {
        self.l1_pages() + self.l2_pages()
    }

    /// Bytes of virtual address space translated through TTB0
    pub const fn coverage(self) -> u64 {
        (self.l1_entries() as u64) * SECTION_SIZE as u64
    }

    pub const fn covers(self, va: VirtAddr) -> bool {
        (va.as_u32() as u64) < self.coverage()
    }
}

/// A table region seen as words
///
/// `W` is `&[u32]` for walking and `&mut [u32]` for editing. The slice
/// covers the whole region, starting at the physical address `base`.
pub struct TableView<W> {
    words: W,
    base: PhysAddr,
    size: TranslationTableSize,
}

impl<W: AsRef<[u32]>> TableView<W> {
    pub fn new(words: W, base: PhysAddr, size: TranslationTableSize) -> Self {
        debug_assert!(words.as_ref().len() >= size.region_pages() * WORDS_PER_PAGE);
        Self { words, base, size }
    }

    /// Word index of the coarse table serving L1 entry `l1_index`
    fn l2_offset(&self, l1_index: usize) -> usize {
        self.size.l1_pages() * WORDS_PER_PAGE + l1_index * L2_ENTRIES
    }

    fn l2_phys(&self, l1_index: usize) -> u32 {
        self.base.as_u32() + (self.l2_offset(l1_index) * 4) as u32
    }

    fn indices(&self, va: VirtAddr) -> Result<(usize, usize), MapError> {
        if !va.is_aligned(PAGE_SIZE) {
            return Err(MapError::Misaligned);
        }
        let l1_index = va.as_usize() / SECTION_SIZE;
        if l1_index >= self.size.l1_entries() {
            return Err(MapError::OutOfRange);
        }
        Ok((l1_index, (va.as_usize() / PAGE_SIZE) % L2_ENTRIES))
    }

    /// Walk the table for the page containing `va`
    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        let page = VirtAddr::new(va.as_u32() & !(PAGE_SIZE as u32 - 1));
        let (l1_index, l2_index) = self.indices(page).ok()?;
        let words = self.words.as_ref();

        let l1 = words[l1_index];
        if l1 & L1_TYPE_MASK != L1_COARSE {
            return None;
        }
        let l2 = words[self.l2_offset(l1_index) + l2_index];
        if l2 & SmallPageFlags::SMALL_PAGE.bits() == 0 {
            return None;
        }
        Some(PhysAddr::new((l2 & L2_SMALL_BASE_MASK) | (va.as_u32() & (PAGE_SIZE as u32 - 1))))
    }

    /// Descriptor flags of the small page mapping `va`
    pub fn flags(&self, va: VirtAddr) -> Option<SmallPageFlags> {
        let (l1_index, l2_index) = self.indices(va).ok()?;
        let words = self.words.as_ref();
        if words[l1_index] & L1_TYPE_MASK != L1_COARSE {
            return None;
        }
        let l2 = words[self.l2_offset(l1_index) + l2_index];
        (l2 != 0).then(|| SmallPageFlags::from_bits_truncate(l2 & !L2_SMALL_BASE_MASK))
    }
}

impl<W: AsRef<[u32]> + AsMut<[u32]>> TableView<W> {
    /// Install a small-page entry mapping `va` to `frame`
    pub fn map_page(&mut self, frame: Frame, va: VirtAddr, flags: SmallPageFlags) -> Result<(), MapError> {
        let (l1_index, l2_index) = self.indices(va)?;
        let l2_phys = self.l2_phys(l1_index);
        let l2_offset = self.l2_offset(l1_index);
        let words = self.words.as_mut();

        if words[l1_index] == 0 {
            words[l1_index] = (l2_phys & L1_COARSE_BASE_MASK) | L1_COARSE;
        }

        let entry = &mut words[l2_offset + l2_index];
        if *entry != 0 {
            return Err(MapError::AlreadyMapped);
        }
        *entry = frame.start_address().as_u32() | (flags | SmallPageFlags::SMALL_PAGE).bits();
        Ok(())
    }

    /// Clear the entry for `va`, returning the frame it mapped
    pub fn unmap_page(&mut self, va: VirtAddr) -> Option<Frame> {
        let (l1_index, l2_index) = self.indices(va).ok()?;
        let l2_offset = self.l2_offset(l1_index);
        let words = self.words.as_mut();
        if words[l1_index] & L1_TYPE_MASK != L1_COARSE {
            return None;
        }
        let entry = core::mem::take(&mut words[l2_offset + l2_index]);
        (entry != 0).then(|| Frame::containing(PhysAddr::new(entry & L2_SMALL_BASE_MASK)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec;

    const BASE: PhysAddr = PhysAddr::new(0x0040_0000);

    #[test]
    fn test_128_byte_class_geometry() {
        let size = TranslationTableSize::BYTES_128;
        assert_eq!(size.bytes(), 128);
        assert_eq!(size.l1_entries(), 32);
        assert_eq!(size.l1_pages(), 1);
        assert_eq!(size.l2_pages(), 8);
        assert_eq!(size.region_pages(), 9);
        assert_eq!(size.coverage(), 32 * 1024 * 1024);
        assert!(size.covers(VirtAddr::new(0x01FF_F000)));
        assert!(!size.covers(VirtAddr::new(0x0200_0000)));

        assert_eq!(TranslationTableSize::BYTES_16K.l1_pages(), 4);
        assert!(TranslationTableSize::from_n(8).is_none());
    }

    #[test]
    fn test_map_then_translate() {
        let size = TranslationTableSize::BYTES_128;
        let mut words = vec![0u32; size.region_pages() * WORDS_PER_PAGE];
        let mut table = TableView::new(words.as_mut_slice(), BASE, size);

        let frame = Frame::containing(PhysAddr::new(0x0123_4000));
        table.map_page(frame, VirtAddr::new(0x0010_1000), SmallPageFlags::USER_RW).unwrap();

        assert_eq!(
            table.translate(VirtAddr::new(0x0010_1abc)),
            Some(PhysAddr::new(0x0123_4abc))
        );
        assert_eq!(table.translate(VirtAddr::new(0x0010_2000)), None);
        assert_eq!(table.translate(VirtAddr::new(0x0020_1000)), None);
        assert_eq!(
            table.flags(VirtAddr::new(0x0010_1000)),
            Some(SmallPageFlags::USER_RW | SmallPageFlags::SMALL_PAGE)
        );

        // L1 entry 1 points at the second coarse table, after the L1 page
        assert_eq!(words[1], (BASE.as_u32() + 0x1000 + 0x400) | L1_COARSE);
        assert_eq!(words[0], 0);
    }

    #[test]
    fn test_map_rejects_bad_addresses() {
        let size = TranslationTableSize::BYTES_128;
        let mut words = vec![0u32; size.region_pages() * WORDS_PER_PAGE];
        let mut table = TableView::new(words.as_mut_slice(), BASE, size);
        let frame = Frame::containing(PhysAddr::new(0x0100_0000));

        assert_eq!(
            table.map_page(frame, VirtAddr::new(0x0200_0000), SmallPageFlags::USER_RW),
            Err(MapError::OutOfRange)
        );
        assert_eq!(
            table.map_page(frame, VirtAddr::new(0x0010_0800), SmallPageFlags::USER_RW),
            Err(MapError::Misaligned)
        );
        table.map_page(frame, VirtAddr::new(0x0010_0000), SmallPageFlags::USER_RW).unwrap();
        assert_eq!(
            table.map_page(frame, VirtAddr::new(0x0010_0000), SmallPageFlags::USER_RW),
            Err(MapError::AlreadyMapped)
        );

        assert_eq!(table.unmap_page(VirtAddr::new(0x0010_0000)), Some(frame));
        assert_eq!(table.translate(VirtAddr::new(0x0010_0000)), None);
    }
}
