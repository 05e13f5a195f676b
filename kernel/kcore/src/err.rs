use core::fmt;

use alloc::collections::TryReserveError;

use crate::mm::pt::{MapError, PageTableAllocError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A physical frame or heap allocation failed.
    OutOfMemory,
    /// The platform memory map reported no allocatable memory at all.
    NoUsableMemory,
    /// Every process-table slot is occupied by a live process.
    NoProcessSlots,
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

impl From<PageTableAllocError> for Error {
    fn from(_: PageTableAllocError) -> Self {
        Self::OutOfMemory
    }
}

impl From<MapError> for Error {
    fn from(err: MapError) -> Self {
        match err {
            MapError::AllocFailed => Self::OutOfMemory,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OutOfMemory => "out of memory",
            Self::NoUsableMemory => "no usable memory reported by platform",
            Self::NoProcessSlots => "out of process slots",
        };
        f.write_str(msg)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
