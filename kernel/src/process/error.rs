//! Process creation errors

use thiserror::Error;

use crate::arch::arm::MapError;
use crate::fs::IoError;
use crate::process::image::LoadError;

/// Why a process could not be created
///
/// None of these is fatal to the kernel; the partially built process has
/// already been torn down when one is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("bad executable: {0}")]
    BadExecutable(&'static str),

    #[error("load failure: {0}")]
    LoadFailure(LoadError),

    #[error("I/O failure: {0}")]
    Io(#[from] IoError),

    #[error("placement does not fit the translation table: {0}")]
    InvalidPlacement(MapError),
}

impl From<LoadError> for ProcessError {
    fn from(err: LoadError) -> Self {
        match err {
            LoadError::InvalidHeader(reason) => ProcessError::BadExecutable(reason),
            other => ProcessError::LoadFailure(other),
        }
    }
}

pub type Result<T> = core::result::Result<T, ProcessError>;
