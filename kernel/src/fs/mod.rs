//! File access used to fetch executable images
//!
//! The process core only reads whole files: open, size them with
//! seek/tell, read, close. Any storage backend (FAT on the SD card, an
//! initrd, the in-memory `testing::MemFs`) plugs in through `FileSystem`.

use thiserror::Error;

/// File system error types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IoError {
    #[error("file not found")]
    NotFound,

    #[error("invalid file handle")]
    BadHandle,

    #[error("seek failed")]
    Seek,

    #[error("read failed")]
    Read,

    #[error("short read: {read} of {expected} bytes")]
    ShortRead { read: usize, expected: usize },

    #[error("file too large to buffer ({0} bytes)")]
    TooLarge(u64),
}

pub type Result<T> = core::result::Result<T, IoError>;

/// File open mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
}

/// Seek origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u64),
    End(i64),
    Current(i64),
}

/// Open file handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(pub u32);

/// File system trait
pub trait FileSystem {
    /// Open `path`
    fn open(&mut self, path: &str, mode: OpenMode) -> Result<FileHandle>;

    /// Move the file position, returning the new position
    fn seek(&mut self, handle: FileHandle, pos: SeekFrom) -> Result<u64>;

    /// Current file position
    fn tell(&mut self, handle: FileHandle) -> Result<u64>;

    /// Read up to `buf.len()` bytes, returning how many were read
    fn read(&mut self, handle: FileHandle, buf: &mut [u8]) -> Result<usize>;

    /// Release the handle
    fn close(&mut self, handle: FileHandle);
}
