//! In-memory collaborators for host tests
//!
//! These stand in for the hardware the process core drives: RAM behind a
//! `Vec`, an MMU that records what it was asked to do, a timer, a file
//! system and a frame allocator that can be told to fail.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::arch::arm::{MapError, Mmu, TranslationTableSize};
use crate::fs::{self, FileHandle, FileSystem, IoError, OpenMode, SeekFrom};
use crate::memory::layout::USER_VA_START;
use crate::memory::{BitmapFrameAllocator, Frame, FrameAllocator, FrameUsage, PhysAddr, PhysicalMemory, VirtAddr, PAGE_SIZE, WORDS_PER_PAGE};
use crate::process::MemoryContext;
use crate::scheduler::timer::TickTimer;

/// Physical RAM backed by a word vector
pub struct RamMemory {
    base: PhysAddr,
    words: Vec<u32>,
}

impl RamMemory {
    pub fn new(base: PhysAddr, pages: usize) -> Self {
        Self {
            base,
            words: vec![0; pages * WORDS_PER_PAGE],
        }
    }

    fn index(&self, addr: PhysAddr) -> usize {
        assert!(addr.is_aligned(4), "unaligned word access at {:?}", addr);
        (addr.as_usize() - self.base.as_usize()) / 4
    }
}

impl PhysicalMemory for RamMemory {
    fn words(&self, base: PhysAddr, len: usize) -> &[u32] {
        let start = self.index(base);
        &self.words[start..start + len]
    }

    fn words_mut(&mut self, base: PhysAddr, len: usize) -> &mut [u32] {
        let start = self.index(base);
        &mut self.words[start..start + len]
    }
}

/// MMU that records every request
#[derive(Debug, Default)]
pub struct RecordingMmu {
    pub windows: Vec<(VirtAddr, Frame, usize)>,
    pub unmapped: Vec<(VirtAddr, usize)>,
    pub flushed: Vec<VirtAddr>,
    pub switches: Vec<(PhysAddr, TranslationTableSize)>,
    /// Table TTB0 currently walks, if any
    pub live_table: Option<PhysAddr>,
}

impl Mmu for RecordingMmu {
    fn map_kernel_window(&mut self, va: VirtAddr, first: Frame, pages: usize) -> Result<(), MapError> {
        self.windows.push((va, first, pages));
        Ok(())
    }

    fn unmap_kernel_window(&mut self, va: VirtAddr, pages: usize) {
        self.unmapped.push((va, pages));
        self.windows.retain(|(window, _, _)| *window != va);
    }

    fn flush_tlb(&mut self, va: VirtAddr) {
        self.flushed.push(va);
    }

    fn switch_user_table(&mut self, table: PhysAddr, size: TranslationTableSize) {
        self.switches.push((table, size));
        self.live_table = Some(table);
    }

    fn disable_user_table(&mut self) {
        self.live_table = None;
    }
}

/// Frame allocator, RAM and MMU of a small test board
pub struct Machine {
    pub frames: BitmapFrameAllocator,
    pub memory: RamMemory,
    pub mmu: RecordingMmu,
}

impl Machine {
    /// RAM base of the test board
    pub const RAM_BASE: PhysAddr = PhysAddr::new(0x0100_0000);

    /// Board with `pages` frames of RAM, all free
    pub fn new(pages: usize) -> Self {
        let mut frames = BitmapFrameAllocator::new();
        frames.add_region(Self::RAM_BASE, pages * PAGE_SIZE);
        Self {
            frames,
            memory: RamMemory::new(Self::RAM_BASE, pages),
            mmu: RecordingMmu::default(),
        }
    }

    pub fn context(&mut self) -> MemoryContext<'_> {
        MemoryContext {
            frames: &mut self.frames,
            memory: &mut self.memory,
            mmu: &mut self.mmu,
        }
    }
}

/// Frame allocator wrapper whose N-th single-frame request fails
pub struct FlakyFrames<'a> {
    inner: &'a mut dyn FrameAllocator,
    fail_at: usize,
    requests: usize,
}

impl<'a> FlakyFrames<'a> {
    pub fn new(inner: &'a mut dyn FrameAllocator, fail_at: usize) -> Self {
        Self {
            inner,
            fail_at,
            requests: 0,
        }
    }

    /// Single-frame requests seen so far
    pub fn single_requests(&self) -> usize {
        self.requests
    }
}

impl FrameAllocator for FlakyFrames<'_> {
    fn alloc(&mut self) -> Option<Frame> {
        self.requests += 1;
        if self.requests == self.fail_at {
            return None;
        }
        self.inner.alloc()
    }

    fn alloc_contiguous(&mut self, count: usize) -> Option<Frame> {
        self.inner.alloc_contiguous(count)
    }

    fn free(&mut self, frame: Frame) {
        self.inner.free(frame);
    }

    fn usage(&self) -> FrameUsage {
        self.inner.usage()
    }
}

/// Timer that records how it was programmed
#[derive(Debug, Default)]
pub struct MockTimer {
    pub clears: usize,
    pub intervals: Vec<u32>,
}

impl TickTimer for MockTimer {
    fn clear(&mut self) {
        self.clears += 1;
    }

    fn set_interval(&mut self, ms: u32) {
        self.intervals.push(ms);
    }
}

struct OpenFile {
    path: String,
    pos: u64,
}

/// Flat in-memory file system
#[derive(Default)]
pub struct MemFs {
    files: BTreeMap<String, Vec<u8>>,
    read_limits: BTreeMap<String, usize>,
    open: BTreeMap<u32, OpenFile>,
    next_handle: u32,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: &str, data: Vec<u8>) {
        self.files.insert(String::from(path), data);
    }

    /// Make reads of `path` stop after `limit` bytes
    pub fn truncate_reads(&mut self, path: &str, limit: usize) {
        self.read_limits.insert(String::from(path), limit);
    }

    /// Handles opened and not yet closed
    pub fn open_handles(&self) -> usize {
        self.open.len()
    }

    fn file(&self, handle: FileHandle) -> fs::Result<(&OpenFile, &Vec<u8>)> {
        let open = self.open.get(&handle.0).ok_or(IoError::BadHandle)?;
        let data = self.files.get(&open.path).ok_or(IoError::NotFound)?;
        Ok((open, data))
    }
}

impl FileSystem for MemFs {
    fn open(&mut self, path: &str, _mode: OpenMode) -> fs::Result<FileHandle> {
        if !self.files.contains_key(path) {
            return Err(IoError::NotFound);
        }
        self.next_handle += 1;
        self.open.insert(
            self.next_handle,
            OpenFile {
                path: String::from(path),
                pos: 0,
            },
        );
        Ok(FileHandle(self.next_handle))
    }

    fn seek(&mut self, handle: FileHandle, pos: SeekFrom) -> fs::Result<u64> {
        let (open, data) = self.file(handle)?;
        let target = match pos {
            SeekFrom::Start(off) => Some(off),
            SeekFrom::End(off) => (data.len() as u64).checked_add_signed(off),
            SeekFrom::Current(off) => open.pos.checked_add_signed(off),
        }
        .ok_or(IoError::Seek)?;

        let open = self.open.get_mut(&handle.0).ok_or(IoError::BadHandle)?;
        open.pos = target;
        Ok(target)
    }

    fn tell(&mut self, handle: FileHandle) -> fs::Result<u64> {
        Ok(self.file(handle)?.0.pos)
    }

    fn read(&mut self, handle: FileHandle, buf: &mut [u8]) -> fs::Result<usize> {
        let (open, data) = self.file(handle)?;
        let limit = self.read_limits.get(&open.path).copied().unwrap_or(data.len());
        let start = (open.pos as usize).min(limit);
        let end = (start + buf.len()).min(limit);
        buf[..end - start].copy_from_slice(&data[start..end]);

        let open = self.open.get_mut(&handle.0).ok_or(IoError::BadHandle)?;
        open.pos = end as u64;
        Ok(end - start)
    }

    fn close(&mut self, handle: FileHandle) {
        self.open.remove(&handle.0);
    }
}

/// Link address of the images built here
pub const ELF_LOAD_VADDR: u32 = USER_VA_START;

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;
const SHDR_SIZE: usize = 40;
const SYM_SIZE: usize = 16;

fn put16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn align4(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

/// Minimal ARM ELF32 executable: one `PT_LOAD` segment holding `code` at
/// `ELF_LOAD_VADDR`, entering at `entry`
pub fn tiny_elf32(code: &[u8], entry: u32) -> Vec<u8> {
    elf32_with_symbols(code, entry, &[])
}

/// As `tiny_elf32`, plus a symbol table listing `functions` as
/// (name, address, size)
pub fn elf32_with_symbols(code: &[u8], entry: u32, functions: &[(&str, u32, u32)]) -> Vec<u8> {
    let code_offset = EHDR_SIZE + PHDR_SIZE;
    let mut image = vec![0u8; code_offset];

    image[..4].copy_from_slice(b"\x7fELF");
    image[4] = 1; // ELFCLASS32
    image[5] = 1; // ELFDATA2LSB
    image[6] = 1; // EV_CURRENT
    put16(&mut image, 16, 2); // ET_EXEC
    put16(&mut image, 18, 40); // EM_ARM
    put32(&mut image, 20, 1);
    put32(&mut image, 24, entry);
    put32(&mut image, 28, EHDR_SIZE as u32);
    put32(&mut image, 36, 0x0500_0000); // EABI version 5
    put16(&mut image, 40, EHDR_SIZE as u16);
    put16(&mut image, 42, PHDR_SIZE as u16);
    put16(&mut image, 44, 1);
    put16(&mut image, 46, SHDR_SIZE as u16);

    let ph = EHDR_SIZE;
    put32(&mut image, ph, 1); // PT_LOAD
    put32(&mut image, ph + 4, code_offset as u32);
    put32(&mut image, ph + 8, ELF_LOAD_VADDR);
    put32(&mut image, ph + 12, ELF_LOAD_VADDR);
    put32(&mut image, ph + 16, code.len() as u32);
    put32(&mut image, ph + 20, code.len() as u32);
    put32(&mut image, ph + 24, 5); // R+X
    put32(&mut image, ph + 28, 4);

    image.extend_from_slice(code);
    if functions.is_empty() {
        return image;
    }

    // .strtab
    align4(&mut image);
    let strtab_offset = image.len();
    image.push(0);
    let mut name_offsets = Vec::new();
    for (name, _, _) in functions {
        name_offsets.push(image.len() - strtab_offset);
        image.extend_from_slice(name.as_bytes());
        image.push(0);
    }
    let strtab_size = image.len() - strtab_offset;

    // .symtab: null symbol, then one STT_FUNC per function
    align4(&mut image);
    let symtab_offset = image.len();
    image.extend_from_slice(&[0; SYM_SIZE]);
    for ((_, address, size), name_offset) in functions.iter().zip(&name_offsets) {
        let at = image.len();
        image.extend_from_slice(&[0; SYM_SIZE]);
        put32(&mut image, at, *name_offset as u32);
        put32(&mut image, at + 4, *address);
        put32(&mut image, at + 8, *size);
        image[at + 12] = 0x12; // STB_GLOBAL | STT_FUNC
        put16(&mut image, at + 14, 1);
    }
    let symtab_size = image.len() - symtab_offset;

    // .shstrtab
    let shstrtab_offset = image.len();
    image.extend_from_slice(b"\0.symtab\0.strtab\0.shstrtab\0");
    let shstrtab_size = image.len() - shstrtab_offset;

    // Section headers: null, .symtab, .strtab, .shstrtab
    align4(&mut image);
    let shoff = image.len();
    image.resize(shoff + 4 * SHDR_SIZE, 0);
    let sections = [
        // (name, type, offset, size, link, info, entsize)
        (1u32, 2u32, symtab_offset, symtab_size, 2u32, 1u32, SYM_SIZE as u32),
        (9, 3, strtab_offset, strtab_size, 0, 0, 0),
        (17, 3, shstrtab_offset, shstrtab_size, 0, 0, 0),
    ];
    for (i, (name, kind, offset, size, link, info, entsize)) in sections.into_iter().enumerate() {
        let sh = shoff + (i + 1) * SHDR_SIZE;
        put32(&mut image, sh, name);
        put32(&mut image, sh + 4, kind);
        put32(&mut image, sh + 16, offset as u32);
        put32(&mut image, sh + 20, size as u32);
        put32(&mut image, sh + 24, link);
        put32(&mut image, sh + 28, info);
        put32(&mut image, sh + 32, if kind == 2 { 4 } else { 1 });
        put32(&mut image, sh + 36, entsize);
    }

    put32(&mut image, 32, shoff as u32);
    put16(&mut image, 48, 4);
    put16(&mut image, 50, 3);
    image
}
