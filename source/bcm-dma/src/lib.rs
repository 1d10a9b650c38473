//! Userspace DMA into BCM283x peripheral registers.
//!
//! This crate drives one channel of the BCM2835-family DMA controller from a
//! Linux process, streaming prepared data into memory-mapped peripheral
//! registers (such as the GPIO set/clear registers) with no CPU involvement
//! once the channel has been started.
//!
//! Three address spaces are involved:
//!
//! - **process pointers**, which the CPU uses to fill buffers,
//! - [**bus addresses**](addr::BusAddress), which the DMA engine uses for
//!   every address it reads from a [control block](control_block), and
//! - [**physical addresses**](addr::PhysicalAddress), which `/dev/mem` uses
//!   when mapping memory into the process.
//!
//! The building blocks, from the bottom up:
//!
//! - [`mailbox::Mailbox`] talks to the VideoCore firmware to allocate, lock
//!   and release contiguous memory. It implements [`mem::MemService`].
//! - [`mem::UncachedMemBlock`] owns one such allocation, mapped into the
//!   process and zeroed, and translates pointers into it to bus addresses.
//! - [`mmio::RegisterWindow`] maps a page of peripheral registers for
//!   volatile access through the [`mmio::Mmio`] trait.
//! - [`control_block::ControlBlock`] describes one (possibly two-dimensional)
//!   transfer; [`control_block::ControlChain`] stores control blocks in
//!   uncached memory and links them.
//! - [`channel::Channel`] arms, starts and stops a DMA channel.
//! - [`stream::GpioStream`] puts it all together for GPIO output.
//!
//! The [`sim`] module contains a software model of the allocator, the DMA
//! registers and the DMA engine, which allows exercising everything above
//! without hardware.

pub mod addr;
pub mod channel;
pub mod control_block;
pub mod error;
pub mod gpio;
pub mod mailbox;
pub mod mem;
pub mod mmio;
pub mod platform;
pub mod sim;
pub mod stream;

pub use self::{
    addr::{BusAddress, PhysicalAddress},
    channel::{ActiveTransfer, Channel, ChannelState},
    control_block::{ControlBlock, ControlChain},
    error::Error,
    mem::{MemService, UncachedMemBlock},
    platform::Platform,
};

/// The size of a page, as used by the VideoCore allocator and `mmap`.
pub const PAGE_SIZE: usize = 4096;
