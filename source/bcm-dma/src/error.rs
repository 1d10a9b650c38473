//! Error types.
//!
//! Each concern has its own error type, defined next to the code that returns
//! it; this module holds the allocation and mapping errors (which are shared
//! by the real and simulated allocators) and the crate-level [`Error`], which
//! any of them converts into.
use core::fmt;
use std::io;

use crate::{
    addr::PhysicalAddress,
    channel::InvalidTransition,
    control_block::errors::InvalidTransfer,
    mem::MemHandle,
    sim::SimError,
};

/// Any error returned by this crate.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    Alloc(AllocError),
    Map(MapError),
    Transition(InvalidTransition),
    Transfer(InvalidTransfer),
    Sim(SimError),
}

/// Errors returned while allocating or releasing uncached memory.
#[derive(Debug)]
#[non_exhaustive]
pub enum AllocError {
    /// The allocator's control interface could not be opened.
    Open {
        path: &'static str,
        source: io::Error,
    },
    /// A mailbox property request could not be issued.
    Property { tag: u32, source: io::Error },
    /// The firmware did not accept a mailbox property request.
    Rejected { tag: u32, code: u32 },
    /// The firmware reported a non-zero status for a release operation.
    Status { tag: u32, status: u32 },
    /// No contiguous block of the requested size is available.
    NoMemory { size: usize },
    /// The block could not be locked to a bus address.
    Lock { handle: MemHandle },
    /// The requested size does not fit the allocator's 32-bit size field.
    TooLarge { size: usize },
    /// The locked block could not be mapped into the process.
    Map(MapError),
}

/// Errors returned while mapping physical memory into the process.
#[derive(Debug)]
#[non_exhaustive]
pub enum MapError {
    /// `/dev/mem` (or the simulated equivalent) could not be opened.
    Open {
        path: &'static str,
        source: io::Error,
    },
    /// `mmap` failed.
    Mmap {
        phys: PhysicalAddress,
        len: usize,
        source: io::Error,
    },
    /// `munmap` failed.
    Munmap { len: usize, source: io::Error },
}

// === impl Error ===

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alloc(e) => fmt::Display::fmt(e, f),
            Self::Map(e) => fmt::Display::fmt(e, f),
            Self::Transition(e) => fmt::Display::fmt(e, f),
            Self::Transfer(e) => fmt::Display::fmt(e, f),
            Self::Sim(e) => fmt::Display::fmt(e, f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Alloc(e) => std::error::Error::source(e),
            Self::Map(e) => std::error::Error::source(e),
            Self::Transition(_) | Self::Transfer(_) | Self::Sim(_) => None,
        }
    }
}

impl From<AllocError> for Error {
    fn from(e: AllocError) -> Self {
        Self::Alloc(e)
    }
}

impl From<MapError> for Error {
    fn from(e: MapError) -> Self {
        Self::Map(e)
    }
}

impl From<InvalidTransition> for Error {
    fn from(e: InvalidTransition) -> Self {
        Self::Transition(e)
    }
}

impl From<InvalidTransfer> for Error {
    fn from(e: InvalidTransfer) -> Self {
        Self::Transfer(e)
    }
}

impl From<SimError> for Error {
    fn from(e: SimError) -> Self {
        Self::Sim(e)
    }
}

// === impl AllocError ===

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open { path, .. } => write!(
                f,
                "failed to open the VideoCore mailbox at {path} (does it exist, and are we root?)"
            ),
            Self::Property { tag, .. } => {
                write!(f, "mailbox property request {tag:#07x} failed")
            }
            Self::Rejected { tag, code } => write!(
                f,
                "firmware rejected mailbox property request {tag:#07x} (response code {code:#010x})"
            ),
            Self::Status { tag, status } => write!(
                f,
                "mailbox property request {tag:#07x} returned status {status:#x}"
            ),
            Self::NoMemory { size } => write!(
                f,
                "could not allocate a contiguous block of {size} bytes of VideoCore memory"
            ),
            Self::Lock { handle } => write!(f, "could not lock VideoCore memory {handle:?}"),
            Self::TooLarge { size } => {
                write!(f, "allocation of {size} bytes exceeds the allocator's limit")
            }
            Self::Map(_) => f.write_str("could not map uncached memory into the process"),
        }
    }
}

impl std::error::Error for AllocError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open { source, .. } | Self::Property { source, .. } => Some(source),
            Self::Map(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MapError> for AllocError {
    fn from(e: MapError) -> Self {
        Self::Map(e)
    }
}

// === impl MapError ===

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open { path, .. } => {
                write!(f, "can't open {path} (you need to run this as root!)")
            }
            Self::Mmap { phys, len, .. } => write!(f, "failed to map {len} bytes at {phys}"),
            Self::Munmap { len, .. } => write!(f, "failed to unmap {len} bytes"),
        }
    }
}

impl std::error::Error for MapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open { source, .. } | Self::Mmap { source, .. } | Self::Munmap { source, .. } => {
                Some(source)
            }
        }
    }
}
