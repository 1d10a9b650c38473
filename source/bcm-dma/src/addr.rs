//! Bus and physical addresses.
//!
//! The DMA engine addresses memory through the VideoCore bus. A bus address
//! is a physical address with its top two bits used as an alias selecting how
//! the access goes through the L2 cache. The CPU side (`/dev/mem`) wants the
//! plain physical address instead. Keeping the two in separate types makes it
//! impossible to hand a process pointer, or a physical address, to the DMA
//! engine by accident.
use core::{fmt, ops};

/// An address as seen by the DMA engine.
///
/// This is the only address type that may be written into a
/// [`ControlBlock`](crate::ControlBlock) or the channel's control block
/// address register.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct BusAddress(u32);

/// A physical address, suitable for mapping with `/dev/mem`.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysicalAddress(u32);

/// Clears the cache alias bits of a bus address, yielding the physical
/// address of the same memory.
///
/// This is idempotent: physical addresses have no alias bits set.
#[inline]
#[must_use]
pub const fn bus_to_physical(bus: BusAddress) -> PhysicalAddress {
    PhysicalAddress(bus.0 & !BusAddress::ALIAS_MASK)
}

// === impl BusAddress ===

impl BusAddress {
    /// The two high bits of a bus address select the cache alias.
    pub const ALIAS_MASK: u32 = 0xC000_0000;

    /// The bus address at which the peripherals appear to the DMA engine,
    /// regardless of where the ARM sees them.
    pub const PERIPHERALS: Self = Self(0x7E00_0000);

    /// The terminating "no address" value.
    pub const NULL: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the physical address for this bus address.
    #[inline]
    #[must_use]
    pub const fn to_physical(self) -> PhysicalAddress {
        bus_to_physical(self)
    }

    /// Offsets this address by a signed number of bytes, wrapping like the
    /// DMA engine's address counters do.
    #[inline]
    #[must_use]
    pub const fn wrapping_offset(self, delta: i32) -> Self {
        Self(self.0.wrapping_add_signed(delta))
    }
}

impl ops::Add<u32> for BusAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u32) -> Self {
        Self(self.0 + rhs)
    }
}

impl ops::Sub for BusAddress {
    type Output = u32;
    #[inline]
    fn sub(self, rhs: Self) -> u32 {
        self.0 - rhs.0
    }
}

impl fmt::Debug for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BusAddress({:#010x})", self.0)
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bus={:#010x}", self.0)
    }
}

// === impl PhysicalAddress ===

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl ops::Add<u32> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u32) -> Self {
        Self(self.0 + rhs)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalAddress({:#010x})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phys={:#010x}", self.0)
    }
}
