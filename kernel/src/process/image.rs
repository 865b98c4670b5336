//! Executable images: reading them from a file system and loading them
//! into a process's pages
//!
//! Images are ELF32 ARM executables. `PT_LOAD` segments are placed
//! relative to the lowest segment address, starting at the process's
//! first user page, so an image linked at `USER_VA_START` lands exactly
//! where it was linked and a position-independent one still runs.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use thiserror::Error;
use xmas_elf::header::{Class, Data, Machine};
use xmas_elf::program::Type as SegmentType;
use xmas_elf::sections::SectionData;
use xmas_elf::symbol_table::{Entry, Type as SymbolType};
use xmas_elf::ElfFile;

use crate::fs::{FileHandle, FileSystem, IoError, OpenMode, SeekFrom};
use crate::memory::{Frame, PhysicalMemory, PAGE_SIZE};
use crate::process::error::ProcessError;

/// Loader errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),

    #[error("no loadable segments")]
    NoSegments,

    #[error("malformed segment: {0}")]
    MalformedSegment(&'static str),

    #[error("segment at {vaddr:#x} ({size} bytes) does not fit the process image")]
    SegmentOutOfRange { vaddr: u32, size: u32 },
}

/// A function symbol extracted from the image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSymbol {
    pub name: String,
    pub address: u32,
    pub size: u32,
}

/// Result of a successful load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    /// Entry point as an offset from the load base
    pub entry_offset: u32,
    /// Function symbols, in symbol table order
    pub functions: Vec<FunctionSymbol>,
}

/// Memory an image is loaded into
pub trait LoadTarget {
    /// Bytes available from the load base
    fn capacity(&self) -> usize;

    /// Copy `bytes` to `offset` from the load base
    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), LoadError>;

    /// Zero `len` bytes at `offset` from the load base
    fn zero(&mut self, offset: usize, len: usize) -> Result<(), LoadError>;
}

/// Executable format loader
pub trait ExecutableLoader {
    fn load(&self, image: &[u8], target: &mut dyn LoadTarget) -> Result<LoadedImage, LoadError>;
}

/// A process's user pages seen through the kernel's physical memory view
pub struct UserPages<'a> {
    memory: &'a mut dyn PhysicalMemory,
    frames: &'a [Frame],
}

impl<'a> UserPages<'a> {
    pub fn new(memory: &'a mut dyn PhysicalMemory, frames: &'a [Frame]) -> Self {
        Self { memory, frames }
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), LoadError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.capacity() => Ok(()),
            _ => Err(LoadError::SegmentOutOfRange {
                vaddr: offset as u32,
                size: len as u32,
            }),
        }
    }

    /// Apply `f` to each (page bytes, range) chunk of `[offset, offset+len)`
    fn for_each_chunk(&mut self, offset: usize, len: usize, mut f: impl FnMut(&mut [u8], usize)) {
        let mut done = 0;
        while done < len {
            let at = offset + done;
            let page_offset = at % PAGE_SIZE;
            let chunk = (PAGE_SIZE - page_offset).min(len - done);
            let page = self.memory.page_bytes_mut(self.frames[at / PAGE_SIZE]);
            f(&mut page[page_offset..page_offset + chunk], done);
            done += chunk;
        }
    }
}

impl LoadTarget for UserPages<'_> {
    fn capacity(&self) -> usize {
        self.frames.len() * PAGE_SIZE
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), LoadError> {
        self.check(offset, bytes.len())?;
        self.for_each_chunk(offset, bytes.len(), |dst, from| {
            dst.copy_from_slice(&bytes[from..from + dst.len()]);
        });
        Ok(())
    }

    fn zero(&mut self, offset: usize, len: usize) -> Result<(), LoadError> {
        self.check(offset, len)?;
        self.for_each_chunk(offset, len, |dst, _| dst.fill(0));
        Ok(())
    }
}

/// ELF32 ARM loader
#[derive(Debug, Default, Clone, Copy)]
pub struct ElfLoader;

impl ElfLoader {
    fn validate(elf: &ElfFile<'_>) -> Result<(), LoadError> {
        if elf.header.pt1.class() != Class::ThirtyTwo {
            return Err(LoadError::InvalidHeader("not a 32-bit image"));
        }
        if elf.header.pt1.data() != Data::LittleEndian {
            return Err(LoadError::InvalidHeader("not little-endian"));
        }
        if elf.header.pt2.machine().as_machine() != Machine::Arm {
            return Err(LoadError::InvalidHeader("not an ARM image"));
        }
        Ok(())
    }

    fn functions(elf: &ElfFile<'_>) -> Vec<FunctionSymbol> {
        let mut functions = Vec::new();
        for section in elf.section_iter() {
            let Ok(SectionData::SymbolTable32(entries)) = section.get_data(elf) else {
                continue;
            };
            for entry in entries {
                if entry.get_type() != Ok(SymbolType::Func) {
                    continue;
                }
                let name = entry.get_name(elf).unwrap_or("<anon>");
                functions.push(FunctionSymbol {
                    name: name.to_string(),
                    address: entry.value() as u32,
                    size: entry.size() as u32,
                });
            }
        }
        functions
    }
}

impl ExecutableLoader for ElfLoader {
    fn load(&self, image: &[u8], target: &mut dyn LoadTarget) -> Result<LoadedImage, LoadError> {
        let elf = ElfFile::new(image).map_err(LoadError::InvalidHeader)?;
        Self::validate(&elf)?;

        let segments = || {
            elf.program_iter()
                .filter(|ph| ph.get_type() == Ok(SegmentType::Load) && ph.mem_size() > 0)
        };
        let base = segments()
            .map(|ph| ph.virtual_addr())
            .min()
            .ok_or(LoadError::NoSegments)?;

        for ph in segments() {
            let vaddr = ph.virtual_addr();
            let file_size = ph.file_size() as usize;
            let mem_size = ph.mem_size() as usize;
            if file_size > mem_size {
                return Err(LoadError::MalformedSegment("file size exceeds memory size"));
            }

            let start = ph.offset() as usize;
            let data = start
                .checked_add(file_size)
                .and_then(|end| image.get(start..end))
                .ok_or(LoadError::MalformedSegment("segment data outside the image"))?;

            let offset = (vaddr - base) as usize;
            target.write(offset, data)?;
            target.zero(offset + file_size, mem_size - file_size)?;

            log::trace!(
                "[loader] segment {:#x}: {} bytes file, {} bytes memory",
                vaddr,
                file_size,
                mem_size
            );
        }

        let entry = elf.header.pt2.entry_point();
        let entry_offset = entry
            .checked_sub(base)
            .filter(|&off| (off as usize) < target.capacity())
            .ok_or(LoadError::InvalidHeader("entry point outside the image"))?;

        let functions = Self::functions(&elf);
        if functions.is_empty() {
            log::warn!("[loader] image has no function symbols");
        }

        Ok(LoadedImage {
            entry_offset: entry_offset as u32,
            functions,
        })
    }
}

/// A whole file read into word-aligned memory
pub struct ImageBuffer {
    words: Vec<u64>,
    len: usize,
}

impl ImageBuffer {
    fn zeroed(len: usize) -> Result<Self, ProcessError> {
        let count = len.div_ceil(8);
        let mut words = Vec::new();
        words
            .try_reserve_exact(count)
            .map_err(|_| ProcessError::OutOfMemory)?;
        words.resize(count, 0);
        Ok(Self { words, len })
    }

    /// Copy of `bytes` with the alignment the ELF parser needs
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProcessError> {
        let mut buffer = Self::zeroed(bytes.len())?;
        buffer.as_bytes_mut().copy_from_slice(bytes);
        Ok(buffer)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: `words` holds at least `len` initialized bytes.
        unsafe { core::slice::from_raw_parts(self.words.as_ptr().cast::<u8>(), self.len) }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as for `as_bytes`, and `&mut self` is exclusive.
        unsafe { core::slice::from_raw_parts_mut(self.words.as_mut_ptr().cast::<u8>(), self.len) }
    }
}

/// Read `path` completely
///
/// The handle is closed on every path out of this function.
pub fn read_image(fs: &mut dyn FileSystem, path: &str) -> Result<ImageBuffer, ProcessError> {
    let handle = fs.open(path, OpenMode::Read)?;
    let result = read_open_file(fs, handle);
    fs.close(handle);

    if let Err(err) = &result {
        log::warn!("[loader] failed to read {}: {}", path, err);
    }
    result
}

fn read_open_file(fs: &mut dyn FileSystem, handle: FileHandle) -> Result<ImageBuffer, ProcessError> {
    fs.seek(handle, SeekFrom::End(0))?;
    let size = fs.tell(handle)?;
    fs.seek(handle, SeekFrom::Start(0))?;

    let len = usize::try_from(size).map_err(|_| IoError::TooLarge(size))?;
    let mut buffer = ImageBuffer::zeroed(len)?;

    let bytes = buffer.as_bytes_mut();
    let mut read = 0;
    while read < len {
        match fs.read(handle, &mut bytes[read..])? {
            0 => return Err(IoError::ShortRead { read, expected: len }.into()),
            n => read += n,
        }
    }

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PhysAddr;
    use crate::testing::{elf32_with_symbols, tiny_elf32, MemFs, RamMemory, ELF_LOAD_VADDR};
    use std::vec;
    use std::vec::Vec;

    fn user_frames() -> Vec<Frame> {
        (0..2).map(|i| Frame::containing(PhysAddr::new(0x1000 * i))).collect()
    }

    #[test]
    fn test_loads_segment_and_entry() {
        let mut memory = RamMemory::new(PhysAddr::new(0), 2);
        let frames = user_frames();
        let code = [0xE3A0_0001u32.to_le_bytes(), 0xE12F_FF1Eu32.to_le_bytes()].concat();
        let image = ImageBuffer::from_bytes(&tiny_elf32(&code, ELF_LOAD_VADDR + 4)).unwrap();

        let mut target = UserPages::new(&mut memory, &frames);
        let loaded = ElfLoader.load(image.as_bytes(), &mut target).unwrap();

        assert_eq!(loaded.entry_offset, 4);
        assert!(loaded.functions.is_empty());
        assert_eq!(memory.words(PhysAddr::new(0), 2), &[0xE3A0_0001, 0xE12F_FF1E]);
    }

    #[test]
    fn test_extracts_function_symbols() {
        let mut memory = RamMemory::new(PhysAddr::new(0), 2);
        let frames = user_frames();
        let raw = elf32_with_symbols(
            &[0u8; 16],
            ELF_LOAD_VADDR,
            &[("_start", ELF_LOAD_VADDR, 8), ("main", ELF_LOAD_VADDR + 8, 8)],
        );
        let image = ImageBuffer::from_bytes(&raw).unwrap();

        let mut target = UserPages::new(&mut memory, &frames);
        let loaded = ElfLoader.load(image.as_bytes(), &mut target).unwrap();

        assert_eq!(loaded.entry_offset, 0);
        assert_eq!(
            loaded.functions,
            vec![
                FunctionSymbol {
                    name: "_start".to_string(),
                    address: ELF_LOAD_VADDR,
                    size: 8,
                },
                FunctionSymbol {
                    name: "main".to_string(),
                    address: ELF_LOAD_VADDR + 8,
                    size: 8,
                },
            ]
        );
    }

    #[test]
    fn test_rejects_non_elf() {
        let mut memory = RamMemory::new(PhysAddr::new(0), 2);
        let frames = user_frames();
        let mut target = UserPages::new(&mut memory, &frames);
        let err = ElfLoader.load(&[0u8; 64], &mut target).unwrap_err();
        assert!(matches!(err, LoadError::InvalidHeader(_)));
        assert!(matches!(ProcessError::from(err), ProcessError::BadExecutable(_)));
    }

    #[test]
    fn test_rejects_wrong_machine() {
        let mut memory = RamMemory::new(PhysAddr::new(0), 2);
        let frames = user_frames();
        let mut raw = tiny_elf32(&[0; 8], ELF_LOAD_VADDR);
        raw[18] = 3; // EM_386
        let image = ImageBuffer::from_bytes(&raw).unwrap();

        let mut target = UserPages::new(&mut memory, &frames);
        assert_eq!(
            ElfLoader.load(image.as_bytes(), &mut target),
            Err(LoadError::InvalidHeader("not an ARM image"))
        );
    }

    #[test]
    fn test_segment_larger_than_process_fails() {
        let mut memory = RamMemory::new(PhysAddr::new(0), 2);
        let frames = user_frames();
        let code = vec![0u8; 3 * PAGE_SIZE];
        let image = ImageBuffer::from_bytes(&tiny_elf32(&code, ELF_LOAD_VADDR)).unwrap();

        let mut target = UserPages::new(&mut memory, &frames);
        let err = ElfLoader.load(image.as_bytes(), &mut target).unwrap_err();
        assert!(matches!(err, LoadError::SegmentOutOfRange { .. }));
        assert!(matches!(ProcessError::from(err), ProcessError::LoadFailure(_)));
    }

    #[test]
    fn test_write_spans_pages() {
        let mut memory = RamMemory::new(PhysAddr::new(0), 2);
        let frames = [Frame::containing(PhysAddr::new(0x1000)), Frame::containing(PhysAddr::new(0))];
        let mut target = UserPages::new(&mut memory, &frames);
        target.write(PAGE_SIZE - 2, &[1, 2, 3, 4]).unwrap();

        // Second user page is backed by physical frame 0
        assert_eq!(memory.words(PhysAddr::new(0), 1)[0], 0x0000_0403);
        assert_eq!(memory.words(PhysAddr::new(0x1ffc), 1)[0], 0x0201_0000);
    }

    #[test]
    fn test_read_image_whole_file() {
        let mut fs = MemFs::new();
        fs.insert("/bin/hello", vec![7u8; 5000]);

        let image = read_image(&mut fs, "/bin/hello").unwrap();
        assert_eq!(image.len(), 5000);
        assert!(image.as_bytes().iter().all(|&b| b == 7));
        assert_eq!(fs.open_handles(), 0);
    }

    #[test]
    fn test_read_image_missing_file() {
        let mut fs = MemFs::new();
        assert_eq!(
            read_image(&mut fs, "/bin/none").err(),
            Some(ProcessError::Io(IoError::NotFound))
        );
    }

    #[test]
    fn test_read_image_short_read_closes_handle() {
        let mut fs = MemFs::new();
        fs.insert("/bin/trunc", vec![1u8; 100]);
        fs.truncate_reads("/bin/trunc", 60);

        let err = read_image(&mut fs, "/bin/trunc").err();
        assert_eq!(
            err,
            Some(ProcessError::Io(IoError::ShortRead { read: 60, expected: 100 }))
        );
        assert_eq!(fs.open_handles(), 0);
    }
}
