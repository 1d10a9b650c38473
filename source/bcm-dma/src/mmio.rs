//! Memory-mapped peripheral registers.
//!
//! Peripheral registers are reached by mapping their physical address range
//! out of `/dev/mem`. Every access goes through [`Mmio`], which only offers
//! volatile 32-bit reads and writes at byte offsets into a register window.
//! Code that drives registers is generic over [`Mmio`], so that it can be
//! pointed at the simulated registers in [`crate::sim`] instead.
use std::{
    fs::OpenOptions,
    io,
    os::{fd::AsRawFd, unix::fs::OpenOptionsExt},
    ptr::NonNull,
};

use crate::{addr::PhysicalAddress, error::MapError, PAGE_SIZE};

/// Volatile access to a block of 32-bit registers.
pub trait Mmio {
    /// Reads the register at byte `offset`.
    fn read(&self, offset: usize) -> u32;

    /// Writes `value` to the register at byte `offset`.
    fn write(&self, offset: usize, value: u32);

    /// Reads the register at `offset`, applies `f`, and writes the result
    /// back.
    fn modify(&self, offset: usize, f: impl FnOnce(u32) -> u32) {
        let value = self.read(offset);
        self.write(offset, f(value));
    }
}

/// A range of peripheral registers mapped into this process.
#[derive(Debug)]
pub struct RegisterWindow {
    base: NonNull<u32>,
    len: usize,
    phys: PhysicalAddress,
}

// Volatile register accesses may be made from any thread.
unsafe impl Send for RegisterWindow {}
unsafe impl Sync for RegisterWindow {}

const DEV_MEM: &str = "/dev/mem";

/// Maps `len` bytes of physical memory starting at `phys` into the process.
///
/// `phys` need not be page-aligned; the returned pointer points at `phys`
/// itself.
///
/// # Safety
///
/// The caller is responsible for what it does with the mapped memory, and
/// must eventually unmap it with [`unmap_physical`], passing the same `len`.
pub unsafe fn map_physical(phys: PhysicalAddress, len: usize) -> Result<NonNull<u8>, MapError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_SYNC)
        .open(DEV_MEM)
        .map_err(|source| MapError::Open {
            path: DEV_MEM,
            source,
        })?;

    let page_offset = phys.as_u32() as usize % PAGE_SIZE;
    let page_base = phys.as_u32() as usize - page_offset;
    let map_len = len + page_offset;
    let ptr = libc::mmap(
        core::ptr::null_mut(),
        map_len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED,
        file.as_raw_fd(),
        page_base as libc::off_t,
    );
    // the mapping outlives the file descriptor; `file` is closed here.
    drop(file);

    if ptr == libc::MAP_FAILED {
        return Err(MapError::Mmap {
            phys,
            len,
            source: io::Error::last_os_error(),
        });
    }

    tracing::trace!(%phys, len, ?ptr, "mapped physical memory");
    match NonNull::new(ptr.cast::<u8>().add(page_offset)) {
        Some(ptr) => Ok(ptr),
        None => Err(MapError::Mmap {
            phys,
            len,
            source: io::Error::from(io::ErrorKind::AddrNotAvailable),
        }),
    }
}

/// Unmaps memory previously mapped by [`map_physical`].
///
/// # Safety
///
/// `ptr` and `len` must be exactly what was passed to and returned by
/// [`map_physical`], and nothing may access the memory afterwards.
pub unsafe fn unmap_physical(ptr: NonNull<u8>, len: usize) -> Result<(), MapError> {
    let page_offset = ptr.as_ptr() as usize % PAGE_SIZE;
    let base = ptr.as_ptr().sub(page_offset);
    if libc::munmap(base.cast(), len + page_offset) != 0 {
        return Err(MapError::Munmap {
            len,
            source: io::Error::last_os_error(),
        });
    }
    tracing::trace!(?ptr, len, "unmapped physical memory");
    Ok(())
}

// === impl RegisterWindow ===

impl RegisterWindow {
    /// Maps `len` bytes of registers starting at `phys`.
    pub fn map(phys: PhysicalAddress, len: usize) -> Result<Self, MapError> {
        assert_eq!(
            phys.as_u32() % 4,
            0,
            "register windows must be 32-bit aligned"
        );
        let base = unsafe { map_physical(phys, len)? };
        tracing::debug!(%phys, len, "mapped register window");
        Ok(Self {
            base: base.cast(),
            len,
            phys,
        })
    }

    /// Maps one page of registers at `phys`.
    pub fn map_page(phys: PhysicalAddress) -> Result<Self, MapError> {
        Self::map(phys, PAGE_SIZE)
    }

    #[must_use]
    pub fn physical_address(&self) -> PhysicalAddress {
        self.phys
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn register(&self, offset: usize) -> *mut u32 {
        assert!(
            offset % 4 == 0 && offset + 4 <= self.len,
            "register offset {offset:#x} is outside of the {len:#x}-byte window at {phys}",
            len = self.len,
            phys = self.phys,
        );
        unsafe { self.base.as_ptr().add(offset / 4) }
    }
}

impl Mmio for RegisterWindow {
    #[inline]
    fn read(&self, offset: usize) -> u32 {
        unsafe { self.register(offset).read_volatile() }
    }

    #[inline]
    fn write(&self, offset: usize, value: u32) {
        unsafe { self.register(offset).write_volatile(value) }
    }
}

impl Drop for RegisterWindow {
    fn drop(&mut self) {
        if let Err(error) = unsafe { unmap_physical(self.base.cast(), self.len) } {
            tracing::warn!(%error, phys = %self.phys, "failed to unmap register window");
        }
    }
}

impl<M: Mmio + ?Sized> Mmio for &M {
    #[inline]
    fn read(&self, offset: usize) -> u32 {
        M::read(self, offset)
    }

    #[inline]
    fn write(&self, offset: usize, value: u32) {
        M::write(self, offset, value)
    }
}
