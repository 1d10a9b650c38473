//! A software model of the VideoCore allocator, the DMA controller's
//! registers and the DMA engine itself.
//!
//! None of this touches hardware, which makes it possible to run the rest of
//! the crate (and the `gpio-dma-test` tool, in `--dry-run` mode) anywhere:
//!
//! - [`SimMemory`] is a [`MemService`](crate::mem::MemService) backed by the
//!   heap. It hands out fake physical and bus addresses, and can translate bus
//!   addresses back into its memory.
//! - [`RegisterFile`] is a block of plain registers that records every write
//!   made through [`Mmio`](crate::mmio::Mmio).
//! - [`DmaRegisters`] layers the DMA channels' `CS` register semantics on top
//!   of a [`RegisterFile`].
//! - [`Engine`] interprets control blocks stored in a [`SimMemory`] the way
//!   the DMA engine would, recording the writes it makes.
use core::fmt;

use crate::addr::BusAddress;

mod engine;
mod memory;
mod registers;

pub use self::{
    engine::{BusWrite, Engine, Step, Trace},
    memory::SimMemory,
    registers::{DmaRegisters, RegisterFile, RegisterWrite},
};

/// Errors returned by the simulated DMA [`Engine`].
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum SimError {
    /// A control block address does not point into simulated memory.
    UnmappedControlBlock(BusAddress),
    /// A control block address is not 32-byte aligned.
    MisalignedControlBlock(BusAddress),
    /// A transfer reads from an address outside of simulated memory.
    UnmappedSource(BusAddress),
    /// A transfer's row length is not a whole number of words.
    UnalignedLength { block: BusAddress, len: u32 },
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnmappedControlBlock(addr) => {
                write!(f, "control block at {addr} is not in simulated memory")
            }
            Self::MisalignedControlBlock(addr) => {
                write!(f, "control block at {addr} is not 32-byte aligned")
            }
            Self::UnmappedSource(addr) => {
                write!(f, "transfer source {addr} is not in simulated memory")
            }
            Self::UnalignedLength { block, len } => write!(
                f,
                "control block at {block} has a row length of {len} bytes, which is not a whole number of words"
            ),
        }
    }
}

impl std::error::Error for SimError {}
