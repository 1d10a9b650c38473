//! GPIO output registers and the payload layouts used to drive them.
//!
//! The GPIO controller sets and clears output pins through two write-only
//! registers, `GPSET0` at offset `0x1C` and `GPCLR0` at `0x28`. They are not
//! adjacent: `GPSET1` and a reserved word sit between them. A DMA transfer
//! into both therefore has to either skip the gap with a destination stride
//! (see [`SetClear`]) or write the whole gap (see [`RegisterImage`]).
use core::{fmt, mem};

use crate::{
    addr::BusAddress,
    mmio::Mmio,
    platform::{offsets, Platform},
};

/// Offset of the function select registers (`GPFSEL0`..`GPFSEL5`).
pub const FSEL_OFFSET: usize = 0x00;
/// Offset of the first output set register (`GPSET0`).
pub const SET_OFFSET: usize = 0x1C;
/// Offset of the first output clear register (`GPCLR0`).
pub const CLR_OFFSET: usize = 0x28;

/// The bus address of `GPSET0`, as seen by the DMA engine.
pub const SET_BUS: BusAddress = Platform::peripheral_bus(offsets::GPIO + SET_OFFSET as u32);
/// The bus address of `GPCLR0`, as seen by the DMA engine.
pub const CLR_BUS: BusAddress = Platform::peripheral_bus(offsets::GPIO + CLR_OFFSET as u32);

const FSEL_BITS: u32 = 3;
const FSEL_MASK: u32 = 0b111;
const FSEL_OUTPUT: u32 = 0b001;
const PINS_PER_FSEL: u8 = 10;

/// A GPIO pin in the first bank (pins 0 through 31), which is the bank
/// covered by `GPSET0` and `GPCLR0`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pin(u8);

/// The GPIO controller's registers.
pub struct Gpio<W> {
    regs: W,
}

/// One set/clear pair, written to `GPSET0` and then `GPCLR0`.
///
/// This is 8 bytes, while the registers are 12 bytes apart, so it is
/// transferred as two rows of one word each with a destination stride of 8.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct SetClear {
    pub set: u32,
    pub clr: u32,
}

/// A copy of the 16 bytes of registers from `GPSET0` through `GPCLR0`.
///
/// `set_upper` (`GPSET1`) and `reserved` are written as well; they are left
/// zero, which is a no-op for `GPSET1`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RegisterImage {
    pub set: u32,
    pub set_upper: u32,
    pub reserved: u32,
    pub clr: u32,
}

const _: () = assert!(mem::size_of::<SetClear>() == 8);
const _: () = assert!(mem::size_of::<RegisterImage>() == 16);
const _: () = assert!(SET_OFFSET + mem::size_of::<RegisterImage>() - 4 == CLR_OFFSET);

// === impl Pin ===

impl Pin {
    /// The number of pins in the first bank.
    pub const COUNT: u8 = 32;

    /// Returns pin `num`, or `None` if it isn't in the first bank.
    #[must_use]
    pub const fn new(num: u8) -> Option<Self> {
        if num < Self::COUNT {
            Some(Self(num))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn number(self) -> u8 {
        self.0
    }

    /// Returns this pin's bit in the set and clear registers.
    #[must_use]
    pub const fn mask(self) -> u32 {
        1 << self.0
    }

    fn fsel_offset(self) -> usize {
        FSEL_OFFSET + (self.0 / PINS_PER_FSEL) as usize * 4
    }

    fn fsel_shift(self) -> u32 {
        (self.0 % PINS_PER_FSEL) as u32 * FSEL_BITS
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPIO{}", self.0)
    }
}

// === impl Gpio ===

impl<W: Mmio> Gpio<W> {
    pub fn new(regs: W) -> Self {
        Self { regs }
    }

    /// Configures `pin` as an output.
    ///
    /// The pin's function is first cleared (making it an input) and then set
    /// to output, as two separate writes.
    pub fn set_output(&self, pin: Pin) {
        let offset = pin.fsel_offset();
        let shift = pin.fsel_shift();
        self.regs.modify(offset, |fsel| fsel & !(FSEL_MASK << shift));
        self.regs.modify(offset, |fsel| fsel | (FSEL_OUTPUT << shift));
        tracing::debug!(%pin, "configured GPIO as output");
    }

    /// Drives the pins in `mask` high.
    #[inline]
    pub fn set(&self, mask: u32) {
        self.regs.write(SET_OFFSET, mask);
    }

    /// Drives the pins in `mask` low.
    #[inline]
    pub fn clear(&self, mask: u32) {
        self.regs.write(CLR_OFFSET, mask);
    }

    /// Writes a prepared set/clear pair.
    #[inline]
    pub fn write_pair(&self, pair: SetClear) {
        self.set(pair.set);
        self.clear(pair.clr);
    }

    /// Applies one masked data word: bits of `word` inside `mask` that are set
    /// are driven high, and those that are clear are driven low. Nothing is
    /// written for a register with no bits to change.
    #[inline]
    pub fn write_masked(&self, word: u32, mask: u32) {
        let set = word & mask;
        let clr = !word & mask;
        if set != 0 {
            self.set(set);
        }
        if clr != 0 {
            self.clear(clr);
        }
    }
}

impl<W> fmt::Debug for Gpio<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gpio").finish_non_exhaustive()
    }
}

// === impl SetClear ===

impl SetClear {
    /// Returns a pair which sets and then clears the pins in `mask`.
    #[must_use]
    pub const fn toggle(mask: u32) -> Self {
        Self {
            set: mask,
            clr: mask,
        }
    }
}

// === impl RegisterImage ===

impl RegisterImage {
    /// Returns an image which sets and then clears the pins in `mask`.
    #[must_use]
    pub const fn toggle(mask: u32) -> Self {
        Self {
            set: mask,
            set_upper: 0,
            reserved: 0,
            clr: mask,
        }
    }
}
