//! DMA [`ControlBlock`]s describe the transfers performed by a DMA channel.
//!
//! A control block is a 32-byte, 32-byte-aligned structure in memory that
//! the DMA engine reads when it is started, or when it finishes the previous
//! block. Every address in it is a [`BusAddress`].
//!
//! In two-dimensional mode (`TDMODE`), the engine performs `YLENGTH` rows of
//! `XLENGTH` bytes each; after every row it adds the (signed) source and
//! destination strides to its address counters. This is what allows writing
//! to registers that are not contiguous, such as the GPIO set and clear
//! registers, from a contiguous payload.
use core::mem;

use mycelium_bitfield::bitfield;

use self::errors::*;
use crate::{
    addr::BusAddress,
    channel::DmaSource,
    error::{AllocError, Error},
    mailbox::Mailbox,
    mem::{MemService, UncachedMemBlock},
};

/// A DMA control block, laid out the way the DMA engine reads it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C, align(32))]
pub struct ControlBlock {
    info: TransferInfo,
    source: BusAddress,
    dest: BusAddress,
    length: u32,
    stride: Stride,
    next: BusAddress,
    _reserved: [u32; 2],
}

/// A builder for constructing [`ControlBlock`]s.
#[derive(Copy, Clone, Debug)]
#[must_use = "a `ControlBlockBuilder` does nothing unless `linear()` or `two_d()` is called"]
pub struct ControlBlockBuilder<S = (), D = ()> {
    info: TransferInfo,
    next: BusAddress,
    source: S,
    dest: D,
}

/// A sequence of [`ControlBlock`]s stored in uncached memory.
///
/// The blocks are stored back to back, so that each one is visible to the
/// DMA engine as soon as it is written. Blocks are written unlinked (their
/// `next` field is whatever the written block says), and may then be linked
/// to each other with [`link`](Self::link), [`self_loop`](Self::self_loop)
/// and [`cycle`](Self::cycle).
#[derive(Debug)]
pub struct ControlChain<'svc, S: MemService + ?Sized = Mailbox> {
    mem: UncachedMemBlock<'svc, S>,
    len: usize,
}

bitfield! {
    /// The `TI` (transfer information) word of a control block.
    #[derive(PartialEq, Eq)]
    pub struct TransferInfo<u32> {
        /// Raise an interrupt when this block's transfer completes.
        pub const INTEN: bool;
        /// Two-dimensional mode.
        pub const TDMODE: bool;
        const _RESERVED_0 = 1;
        /// Wait for a write response after each write.
        pub const WAIT_RESP: bool;
        /// Increment the destination address after each write.
        pub const DEST_INC: bool;
        /// Use 128-bit destination writes.
        pub const DEST_WIDTH: bool;
        /// Gate destination writes on the peripheral's DREQ.
        pub const DEST_DREQ: bool;
        /// Don't perform destination writes.
        pub const DEST_IGNORE: bool;
        /// Increment the source address after each read.
        pub const SRC_INC: bool;
        /// Use 128-bit source reads.
        pub const SRC_WIDTH: bool;
        /// Gate source reads on the peripheral's DREQ.
        pub const SRC_DREQ: bool;
        /// Don't perform source reads; write zeros instead.
        pub const SRC_IGNORE: bool;
        /// The burst transfer length, in words.
        pub const BURST_LENGTH = 4;
        /// The peripheral whose DREQ paces the transfer.
        pub const PERMAP = 5;
        /// Dummy cycles added after each read or write.
        pub const WAITS = 5;
        /// Don't issue wide bursts.
        pub const NO_WIDE_BURSTS: bool;
    }
}

bitfield! {
    /// The `TXFR_LEN` word of a control block in two-dimensional mode.
    #[derive(PartialEq, Eq)]
    pub struct TransferLength<u32> {
        /// The length of each row, in bytes.
        pub const XLENGTH: u16;
        /// The number of rows, minus one.
        pub const YLENGTH = 14;
        const _RESERVED_0 = 2;
    }
}

bitfield! {
    /// The `STRIDE` word of a control block.
    ///
    /// Both strides are signed 16-bit byte offsets, added to the respective
    /// address after each row in two-dimensional mode.
    #[derive(PartialEq, Eq)]
    pub struct Stride<u32> {
        pub const S_STRIDE: u16;
        pub const D_STRIDE: u16;
    }
}

impl Default for ControlBlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlBlockBuilder {
    pub const fn new() -> Self {
        Self {
            info: TransferInfo::new(),
            next: BusAddress::NULL,
            source: (),
            dest: (),
        }
    }
}

impl<S, D> ControlBlockBuilder<S, D> {
    /// Sets whether the source address is incremented after each read.
    pub fn src_inc(self, inc: bool) -> Self {
        Self {
            info: self.info.with(TransferInfo::SRC_INC, inc),
            ..self
        }
    }

    /// Sets whether the destination address is incremented after each write.
    pub fn dest_inc(self, inc: bool) -> Self {
        Self {
            info: self.info.with(TransferInfo::DEST_INC, inc),
            ..self
        }
    }

    pub fn no_wide_bursts(self, no_wide_bursts: bool) -> Self {
        Self {
            info: self.info.with(TransferInfo::NO_WIDE_BURSTS, no_wide_bursts),
            ..self
        }
    }

    pub fn wait_resp(self, wait_resp: bool) -> Self {
        Self {
            info: self.info.with(TransferInfo::WAIT_RESP, wait_resp),
            ..self
        }
    }

    pub fn interrupt(self, inten: bool) -> Self {
        Self {
            info: self.info.with(TransferInfo::INTEN, inten),
            ..self
        }
    }

    /// Sets the block that the engine continues with after this one.
    ///
    /// `None` ends the transfer after this block.
    pub fn next(self, next: impl Into<Option<BusAddress>>) -> Result<Self, InvalidTransfer> {
        let next = ControlBlock::link_addr(next.into())?;
        Ok(Self { next, ..self })
    }

    pub fn source(self, source: BusAddress) -> ControlBlockBuilder<BusAddress, D> {
        ControlBlockBuilder {
            info: self.info,
            next: self.next,
            source,
            dest: self.dest,
        }
    }

    pub fn dest(self, dest: BusAddress) -> ControlBlockBuilder<S, BusAddress> {
        ControlBlockBuilder {
            info: self.info,
            next: self.next,
            source: self.source,
            dest,
        }
    }
}

impl ControlBlockBuilder<BusAddress, BusAddress> {
    /// Builds a control block copying `len` contiguous bytes.
    ///
    /// # Returns
    ///
    /// - [`Ok`]`(`[`ControlBlock`]`)` if `len` is in
    ///   `1..=`[`ControlBlock::MAX_LINEAR_LEN`].
    /// - [`Err`]`(`[`InvalidTransfer::LengthOutOfRange`]`)` otherwise.
    pub fn linear(self, len: u32) -> Result<ControlBlock, InvalidTransfer> {
        if len == 0 || len > ControlBlock::MAX_LINEAR_LEN {
            return Err(InvalidTransfer::LengthOutOfRange(len));
        }

        Ok(self.build_inner(self.info.with(TransferInfo::TDMODE, false), len, Stride::new()))
    }

    /// Builds a two-dimensional control block copying `y` rows of `x` bytes.
    ///
    /// After each row, `src_stride` is added to the source address and
    /// `dest_stride` to the destination address (on top of any increments
    /// made while copying the row).
    ///
    /// # Returns
    ///
    /// - [`Ok`]`(`[`ControlBlock`]`)` if `x` is in
    ///   `1..=`[`ControlBlock::MAX_X_LEN`] and `y` is in
    ///   `1..=`[`ControlBlock::MAX_Y_LEN`].
    /// - [`Err`]`(`[`InvalidTransfer::XLengthOutOfRange`]`)` or
    ///   [`Err`]`(`[`InvalidTransfer::YLengthOutOfRange`]`)` otherwise.
    pub fn two_d(
        self,
        x: u32,
        y: u32,
        src_stride: i16,
        dest_stride: i16,
    ) -> Result<ControlBlock, InvalidTransfer> {
        if x == 0 || x > ControlBlock::MAX_X_LEN {
            return Err(InvalidTransfer::XLengthOutOfRange(x));
        }

        if y == 0 || y > ControlBlock::MAX_Y_LEN {
            return Err(InvalidTransfer::YLengthOutOfRange(y));
        }

        let length = TransferLength::new()
            .with(TransferLength::XLENGTH, x as u16)
            .with(TransferLength::YLENGTH, y - 1);
        let stride = Stride::new()
            .with(Stride::S_STRIDE, src_stride as u16)
            .with(Stride::D_STRIDE, dest_stride as u16);
        Ok(self.build_inner(
            self.info.with(TransferInfo::TDMODE, true),
            length.bits(),
            stride,
        ))
    }

    /// This method assumes that the length has already been validated.
    #[inline]
    fn build_inner(self, info: TransferInfo, length: u32, stride: Stride) -> ControlBlock {
        ControlBlock {
            info,
            source: self.source,
            dest: self.dest,
            length,
            stride,
            next: self.next,
            _reserved: [0; 2],
        }
    }
}

// === impl ControlBlock ===

impl ControlBlock {
    /// The size of a control block in memory.
    pub const SIZE: usize = 32;

    /// The longest transfer a single non-2D control block can describe.
    pub const MAX_LINEAR_LEN: u32 = (1 << 30) - 1;

    /// The longest row of a 2D transfer.
    pub const MAX_X_LEN: u32 = u16::MAX as u32;

    /// The most rows in a 2D transfer.
    pub const MAX_Y_LEN: u32 = 1 << 14;

    /// The byte offset of the `NEXTCONBK` word.
    const NEXT_OFFSET: usize = 20;

    pub const fn builder() -> ControlBlockBuilder {
        ControlBlockBuilder::new()
    }

    #[must_use]
    pub fn info(&self) -> TransferInfo {
        self.info
    }

    #[must_use]
    pub fn source(&self) -> BusAddress {
        self.source
    }

    #[must_use]
    pub fn dest(&self) -> BusAddress {
        self.dest
    }

    #[must_use]
    pub fn is_2d(&self) -> bool {
        self.info.get(TransferInfo::TDMODE)
    }

    /// Returns the raw `TXFR_LEN` word.
    #[must_use]
    pub fn raw_length(&self) -> u32 {
        self.length
    }

    /// Returns the number of bytes per row (for a 1D block, the whole length).
    #[must_use]
    pub fn x_len(&self) -> u32 {
        if self.is_2d() {
            TransferLength::from_bits(self.length).get(TransferLength::XLENGTH) as u32
        } else {
            self.length
        }
    }

    /// Returns the number of rows (1 for a 1D block).
    #[must_use]
    pub fn y_len(&self) -> u32 {
        if self.is_2d() {
            TransferLength::from_bits(self.length).get(TransferLength::YLENGTH) + 1
        } else {
            1
        }
    }

    #[must_use]
    pub fn src_stride(&self) -> i16 {
        self.stride.get(Stride::S_STRIDE) as i16
    }

    #[must_use]
    pub fn dest_stride(&self) -> i16 {
        self.stride.get(Stride::D_STRIDE) as i16
    }

    /// Returns the block the engine continues with, or `None` if the
    /// transfer ends after this block.
    #[must_use]
    pub fn next(&self) -> Option<BusAddress> {
        (!self.next.is_null()).then_some(self.next)
    }

    pub fn set_next(&mut self, next: impl Into<Option<BusAddress>>) -> Result<(), InvalidTransfer> {
        self.next = Self::link_addr(next.into())?;
        Ok(())
    }

    /// Makes this block continue with itself, repeating its transfer until
    /// the channel is stopped. `at` is the bus address the block is stored at.
    pub fn self_loop(&mut self, at: BusAddress) -> Result<(), InvalidTransfer> {
        self.set_next(at)
    }

    fn link_addr(next: Option<BusAddress>) -> Result<BusAddress, InvalidTransfer> {
        match next {
            None => Ok(BusAddress::NULL),
            Some(addr) if addr.as_u32() as usize % mem::align_of::<Self>() != 0 => {
                Err(InvalidTransfer::MisalignedLink(addr))
            }
            Some(addr) => Ok(addr),
        }
    }
}

const _: () = assert!(mem::size_of::<ControlBlock>() == ControlBlock::SIZE);
const _: () = assert!(mem::align_of::<ControlBlock>() == ControlBlock::SIZE);

// === impl ControlChain ===

impl<'svc, S: MemService + ?Sized> ControlChain<'svc, S> {
    /// Allocates room for `len` control blocks, all zeroed (and therefore
    /// terminating).
    ///
    /// A chain must hold at least one block, so that it has a
    /// [`head`](Self::head).
    pub fn allocate(svc: &'svc S, len: usize) -> Result<Self, Error> {
        if len == 0 {
            return Err(InvalidTransfer::EmptyChain.into());
        }
        let mem = UncachedMemBlock::allocate(svc, len * ControlBlock::SIZE)?;
        tracing::debug!(len, bus = %mem.bus_address(), "allocated control block chain");
        Ok(Self { mem, len })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the bus address of block `idx`.
    #[track_caller]
    #[must_use]
    pub fn bus_address(&self, idx: usize) -> BusAddress {
        self.mem.bus_address_at(self.offset(idx))
    }

    /// Returns the bus address of the first block, where the DMA channel
    /// should start.
    #[must_use]
    pub fn head(&self) -> BusAddress {
        self.bus_address(0)
    }

    #[track_caller]
    pub fn write(&mut self, idx: usize, block: &ControlBlock) {
        let offset = self.offset(idx);
        self.mem.write(offset, *block);
    }

    #[track_caller]
    #[must_use]
    pub fn read(&self, idx: usize) -> ControlBlock {
        self.mem.read(self.offset(idx))
    }

    /// Makes block `idx` continue with itself.
    #[track_caller]
    pub fn self_loop(&mut self, idx: usize) {
        self.link(idx, idx)
    }

    /// Makes block `from` continue with block `to`.
    #[track_caller]
    pub fn link(&mut self, from: usize, to: usize) {
        let to = self.bus_address(to);
        self.set_next(from, to)
    }

    /// Makes the transfer end after block `idx`.
    #[track_caller]
    pub fn terminate(&mut self, idx: usize) {
        self.set_next(idx, BusAddress::NULL)
    }

    /// Links every block to the one after it, and the last block back to the
    /// first.
    pub fn cycle(&mut self) {
        for idx in 0..self.len {
            self.link(idx, (idx + 1) % self.len);
        }
    }

    /// Releases the memory holding the chain.
    pub fn release(self) -> Result<(), AllocError> {
        self.mem.release()
    }

    #[track_caller]
    fn set_next(&mut self, idx: usize, next: BusAddress) {
        let offset = self.offset(idx) + ControlBlock::NEXT_OFFSET;
        self.mem.write(offset, next);
    }

    #[track_caller]
    fn offset(&self, idx: usize) -> usize {
        assert!(
            idx < self.len,
            "control block index {idx} out of range for a chain of {}",
            self.len
        );
        idx * ControlBlock::SIZE
    }
}

impl<S: MemService + ?Sized> DmaSource for ControlChain<'_, S> {
    fn head(&self) -> BusAddress {
        ControlChain::head(self)
    }
}

pub mod errors {
    use core::fmt;

    use super::*;

    /// Errors returned by [`ControlBlockBuilder`] and
    /// [`ControlBlock::set_next`].
    #[derive(Clone, Debug, Eq, PartialEq)]
    pub enum InvalidTransfer {
        /// A linear transfer's length was zero or greater than
        /// [`ControlBlock::MAX_LINEAR_LEN`].
        LengthOutOfRange(u32),
        /// A 2D transfer's row length was zero or greater than
        /// [`ControlBlock::MAX_X_LEN`].
        XLengthOutOfRange(u32),
        /// A 2D transfer's row count was zero or greater than
        /// [`ControlBlock::MAX_Y_LEN`].
        YLengthOutOfRange(u32),
        /// A link to the next control block was not 32-byte aligned.
        MisalignedLink(BusAddress),
        /// A [`ControlChain`] was asked to hold no control blocks.
        EmptyChain,
    }

    impl fmt::Display for InvalidTransfer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::LengthOutOfRange(len) => write!(
                    f,
                    "transfer length {len} must be between 1 and `ControlBlock::MAX_LINEAR_LEN` ({})",
                    ControlBlock::MAX_LINEAR_LEN
                ),
                Self::XLengthOutOfRange(x) => write!(
                    f,
                    "row length {x} must be between 1 and `ControlBlock::MAX_X_LEN` ({})",
                    ControlBlock::MAX_X_LEN
                ),
                Self::YLengthOutOfRange(y) => write!(
                    f,
                    "row count {y} must be between 1 and `ControlBlock::MAX_Y_LEN` ({})",
                    ControlBlock::MAX_Y_LEN
                ),
                Self::MisalignedLink(addr) => {
                    write!(f, "next control block {addr} is not 32-byte aligned")
                }
                Self::EmptyChain => f.write_str("a control block chain needs at least one block"),
            }
        }
    }

    impl std::error::Error for InvalidTransfer {}
}
