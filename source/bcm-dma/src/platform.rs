//! Per-board peripheral base addresses and allocation flags.
use core::{fmt, str::FromStr};

use crate::{
    addr::{BusAddress, PhysicalAddress},
    mailbox::{CacheMode, MemFlags},
};

/// A supported Raspberry Pi board family.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Platform {
    /// Raspberry Pi 1 and Zero (BCM2835).
    Pi1,
    /// Raspberry Pi 2 and 3 (BCM2836, BCM2837).
    Pi2,
}

/// The physical offsets of the peripheral blocks we use, relative to the
/// peripheral base.
pub mod offsets {
    /// The DMA controller, channels 0-14.
    pub const DMA: u32 = 0x0000_7000;
    /// The GPIO register block.
    pub const GPIO: u32 = 0x0020_0000;
}

impl Platform {
    /// The platform selected at build time.
    ///
    /// This is [`Platform::Pi1`] if only the `pi1` feature is enabled, and
    /// [`Platform::Pi2`] otherwise. `pi2` wins if both are enabled.
    #[cfg(all(feature = "pi1", not(feature = "pi2")))]
    pub const DEFAULT: Self = Self::Pi1;
    /// The platform selected at build time.
    ///
    /// This is [`Platform::Pi1`] if only the `pi1` feature is enabled, and
    /// [`Platform::Pi2`] otherwise. `pi2` wins if both are enabled.
    #[cfg(any(feature = "pi2", not(feature = "pi1")))]
    pub const DEFAULT: Self = Self::Pi2;

    pub const ALL: [Self; 2] = [Self::Pi1, Self::Pi2];

    /// Returns the physical address at which the ARM sees the peripherals.
    #[must_use]
    pub const fn peripheral_base(self) -> PhysicalAddress {
        match self {
            Self::Pi1 => PhysicalAddress::new(0x2000_0000),
            Self::Pi2 => PhysicalAddress::new(0x3F00_0000),
        }
    }

    /// Returns the flags to allocate DMA memory with on this platform.
    ///
    /// The BCM2835's L1 cache is not a concern for the VideoCore, so direct
    /// (uncached) allocations suffice there. Later chips need allocations
    /// that also bypass the ARM's L1.
    #[must_use]
    pub fn mem_flags(self) -> MemFlags {
        let caching = match self {
            Self::Pi1 => CacheMode::Direct,
            Self::Pi2 => CacheMode::L1Nonallocating,
        };
        MemFlags::new().with(MemFlags::CACHING, caching)
    }

    /// Returns the physical address of the peripheral block at `offset`.
    #[must_use]
    pub const fn peripheral(self, offset: u32) -> PhysicalAddress {
        PhysicalAddress::new(self.peripheral_base().as_u32() + offset)
    }

    /// Returns the bus address of the peripheral block at `offset`.
    ///
    /// Peripherals appear at the same bus address on every board.
    #[must_use]
    pub const fn peripheral_bus(offset: u32) -> BusAddress {
        BusAddress::new(BusAddress::PERIPHERALS.as_u32() + offset)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Pi1 => "pi1",
            Self::Pi2 => "pi2",
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returned by [`Platform::from_str`] for an unknown board name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownPlatform(String);

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "pi1" | "bcm2835" | "zero" => Ok(Self::Pi1),
            "2" | "3" | "pi2" | "pi3" | "bcm2836" | "bcm2837" => Ok(Self::Pi2),
            _ => Err(UnknownPlatform(s.to_owned())),
        }
    }
}

impl fmt::Display for UnknownPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown platform {:?} (expected one of: pi1, pi2)", self.0)
    }
}

impl std::error::Error for UnknownPlatform {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_follows_features() {
        let expected = if cfg!(feature = "pi1") && !cfg!(feature = "pi2") {
            Platform::Pi1
        } else {
            Platform::Pi2
        };
        assert_eq!(Platform::DEFAULT, expected);
    }

    #[test]
    fn mem_flags_match_the_firmware_values() {
        assert_eq!(Platform::Pi1.mem_flags().bits(), 0x4);
        assert_eq!(Platform::Pi2.mem_flags().bits(), 0xC);
    }

    #[test]
    fn peripheral_addresses() {
        assert_eq!(
            Platform::Pi2.peripheral(offsets::GPIO),
            PhysicalAddress::new(0x3F20_0000)
        );
        assert_eq!(
            Platform::Pi1.peripheral(offsets::DMA),
            PhysicalAddress::new(0x2000_7000)
        );
        assert_eq!(
            Platform::peripheral_bus(offsets::GPIO),
            BusAddress::new(0x7E20_0000)
        );
    }

    #[test]
    fn parses_board_names() {
        assert_eq!("pi1".parse(), Ok(Platform::Pi1));
        assert_eq!("Pi3".parse(), Ok(Platform::Pi2));
        assert!("pi5".parse::<Platform>().is_err());
        for platform in Platform::ALL {
            assert_eq!(platform.to_string().parse(), Ok(platform));
        }
    }
}
