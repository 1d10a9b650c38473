//! The VideoCore mailbox property interface.
//!
//! The firmware running on the VideoCore owns a pool of physically
//! contiguous memory which it hands out through "property" requests sent over
//! the mailbox. Linux exposes the mailbox as the `/dev/vcio` character device,
//! which accepts property buffers through a single `ioctl`.
//!
//! A property buffer looks like this (all fields are `u32`s):
//!
//! ```text
//! +------------+--------------+-----+----------+-------------+---------+-----+
//! | total size | request code | tag | buf size | request len | values… | end |
//! +------------+--------------+-----+----------+-------------+---------+-----+
//! ```
//!
//! The firmware overwrites the request code with `0x8000_0000` on success and
//! writes its response over the values.
use core::mem;
use std::{
    fs::{File, OpenOptions},
    io,
    os::fd::AsRawFd,
    ptr::NonNull,
    sync::OnceLock,
};

use mycelium_bitfield::{bitfield, enum_from_bits};

use crate::{
    addr::{BusAddress, PhysicalAddress},
    error::{AllocError, MapError},
    mem::{MemHandle, MemService},
    mmio,
    platform::Platform,
};

/// A connection to the VideoCore mailbox.
#[derive(Debug)]
pub struct Mailbox {
    file: File,
    flags: MemFlags,
}

enum_from_bits! {
    /// How an allocation is seen through the caches.
    #[derive(Debug, Eq, PartialEq)]
    #[cfg_attr(test, derive(proptest_derive::Arbitrary))]
    pub enum CacheMode<u8> {
        /// Normal allocating alias. Don't use from the ARM.
        Normal = 0b00,
        /// `0xC` alias: uncached.
        Direct = 0b01,
        /// `0x8` alias: non-allocating in L2 but coherent.
        Coherent = 0b10,
        /// Allocating in L2, but bypassing the ARM's L1.
        L1Nonallocating = 0b11,
    }
}

bitfield! {
    /// Flags passed to the firmware's memory allocation request.
    #[derive(PartialEq, Eq)]
    pub struct MemFlags<u32> {
        /// The block may be discarded while it is not locked.
        pub const DISCARDABLE: bool;
        const _RESERVED_0 = 1;
        pub const CACHING: CacheMode;
        /// Initialise the block to all zeros.
        pub const ZERO: bool;
        /// Don't initialise (the default is to initialise to all ones).
        pub const NO_INIT: bool;
        /// Likely to be locked for long periods of time.
        pub const HINT_PERMALOCK: bool;
    }
}

/// Mailbox property tags.
pub mod tags {
    pub const ALLOCATE_MEMORY: u32 = 0x0003_000C;
    pub const LOCK_MEMORY: u32 = 0x0003_000D;
    pub const UNLOCK_MEMORY: u32 = 0x0003_000E;
    pub const RELEASE_MEMORY: u32 = 0x0003_000F;
}

/// `_IOWR(100, 0, char *)`
const IOCTL_MBOX_PROPERTY: u32 =
    (3 << 30) | ((mem::size_of::<*mut u8>() as u32) << 16) | (100 << 8);

const REQUEST: u32 = 0x0000_0000;
const RESPONSE_SUCCESS: u32 = 0x8000_0000;
const END_TAG: u32 = 0;

/// The longest value list any of our property requests carries.
const MAX_ARGS: usize = 8;

static MAILBOX: OnceLock<Mailbox> = OnceLock::new();

impl Mailbox {
    pub const PATH: &'static str = "/dev/vcio";

    /// Opens a new connection to the mailbox, allocating memory with the
    /// flags appropriate for `platform`.
    ///
    /// Most callers will want [`Mailbox::global`] instead.
    pub fn open(platform: Platform) -> Result<Self, AllocError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(Self::PATH)
            .map_err(|source| AllocError::Open {
                path: Self::PATH,
                source,
            })?;
        let flags = platform.mem_flags();
        tracing::debug!(path = Self::PATH, %platform, flags = ?flags, "opened mailbox");
        Ok(Self { file, flags })
    }

    /// Returns the process-wide mailbox connection for
    /// [`Platform::DEFAULT`], opening it on first use.
    pub fn global() -> Result<&'static Self, AllocError> {
        Self::init_global(Platform::DEFAULT)
    }

    /// Returns the process-wide mailbox connection, opening it for `platform`
    /// if it has not been opened yet.
    ///
    /// If the connection already exists, `platform` is ignored.
    pub fn init_global(platform: Platform) -> Result<&'static Self, AllocError> {
        if let Some(mailbox) = MAILBOX.get() {
            return Ok(mailbox);
        }

        let mailbox = Self::open(platform)?;
        Ok(MAILBOX.get_or_init(|| mailbox))
    }

    /// Sends a single property request with the given `tag` and values,
    /// returning the first word of the response.
    pub fn property(&self, tag: u32, args: &[u32]) -> Result<u32, AllocError> {
        assert!(
            args.len() <= MAX_ARGS,
            "property requests carry at most {MAX_ARGS} values"
        );
        let mut buf = [0u32; 6 + MAX_ARGS];
        let value_len = (args.len().max(1) * mem::size_of::<u32>()) as u32;
        buf[1] = REQUEST;
        buf[2] = tag;
        buf[3] = value_len;
        buf[4] = value_len;
        buf[5..5 + args.len()].copy_from_slice(args);
        let end = 5 + args.len().max(1);
        buf[end] = END_TAG;
        buf[0] = ((end + 1) * mem::size_of::<u32>()) as u32;

        let ret = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                IOCTL_MBOX_PROPERTY as _,
                buf.as_mut_ptr(),
            )
        };
        if ret < 0 {
            return Err(AllocError::Property {
                tag,
                source: io::Error::last_os_error(),
            });
        }

        if buf[1] != RESPONSE_SUCCESS {
            return Err(AllocError::Rejected { tag, code: buf[1] });
        }

        tracing::trace!(tag = ?format_args!("{tag:#07x}"), ?args, response = buf[5], "mailbox property");
        Ok(buf[5])
    }

    fn release_op(&self, tag: u32, handle: MemHandle) -> Result<(), AllocError> {
        match self.property(tag, &[handle.as_u32()])? {
            0 => Ok(()),
            status => Err(AllocError::Status { tag, status }),
        }
    }
}

impl MemService for Mailbox {
    fn mem_flags(&self) -> MemFlags {
        self.flags
    }

    fn mem_alloc(&self, size: u32, align: u32, flags: MemFlags) -> Result<MemHandle, AllocError> {
        self.property(tags::ALLOCATE_MEMORY, &[size, align, flags.bits()])
            .map(MemHandle::new)
    }

    fn mem_lock(&self, handle: MemHandle) -> Result<BusAddress, AllocError> {
        self.property(tags::LOCK_MEMORY, &[handle.as_u32()])
            .map(BusAddress::new)
    }

    fn mem_unlock(&self, handle: MemHandle) -> Result<(), AllocError> {
        self.release_op(tags::UNLOCK_MEMORY, handle)
    }

    fn mem_free(&self, handle: MemHandle) -> Result<(), AllocError> {
        self.release_op(tags::RELEASE_MEMORY, handle)
    }

    unsafe fn map(&self, phys: PhysicalAddress, len: usize) -> Result<NonNull<u8>, MapError> {
        mmio::map_physical(phys, len)
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> Result<(), MapError> {
        mmio::unmap_physical(ptr, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::{prop_assert_eq, proptest};

    #[test]
    fn mem_flags_are_valid() {
        MemFlags::assert_valid();
    }

    #[test]
    fn ioctl_request_number() {
        let expected = if mem::size_of::<*mut u8>() == 8 {
            0xC008_6400
        } else {
            0xC004_6400
        };
        assert_eq!(IOCTL_MBOX_PROPERTY, expected);
    }

    proptest! {
        #[test]
        fn pack_mem_flags(
            discardable: bool,
            caching: CacheMode,
            zero: bool,
            no_init: bool,
            permalock: bool,
        ) {
            let manual = (discardable as u32)
                | ((caching as u32) << 2)
                | ((zero as u32) << 4)
                | ((no_init as u32) << 5)
                | ((permalock as u32) << 6);
            let flags = MemFlags::new()
                .with(MemFlags::DISCARDABLE, discardable)
                .with(MemFlags::CACHING, caching)
                .with(MemFlags::ZERO, zero)
                .with(MemFlags::NO_INIT, no_init)
                .with(MemFlags::HINT_PERMALOCK, permalock);
            prop_assert_eq!(
                manual,
                flags.bits(),
                "\n{:032b} (expected), vs:\n{}",
                manual,
                flags
            );
        }
    }
}
