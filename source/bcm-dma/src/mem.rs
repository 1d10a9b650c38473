//! Uncached, physically contiguous memory for DMA.
//!
//! The DMA engine reads control blocks and source data straight out of
//! physical memory, bypassing the ARM's caches. Memory shared with it must
//! therefore be contiguous, locked in place, and mapped into the process
//! without caching, so that every CPU write is immediately visible to the
//! engine. [`UncachedMemBlock`] owns one such allocation.
use core::{
    fmt,
    mem::{self, ManuallyDrop},
    ptr::NonNull,
};

use crate::{
    addr::{BusAddress, PhysicalAddress},
    error::{AllocError, MapError},
    mailbox::{Mailbox, MemFlags},
    PAGE_SIZE,
};

/// An allocator of locked, uncached memory.
///
/// This is implemented by [`Mailbox`], which asks the VideoCore firmware, and
/// by [`SimMemory`](crate::sim::SimMemory), which uses the heap.
pub trait MemService {
    /// The flags to allocate memory with.
    fn mem_flags(&self) -> MemFlags;

    /// Allocates `size` bytes aligned to `align`.
    ///
    /// A returned handle of zero means no memory was available.
    fn mem_alloc(&self, size: u32, align: u32, flags: MemFlags) -> Result<MemHandle, AllocError>;

    /// Locks an allocation in place, returning its bus address.
    ///
    /// A returned address of zero means the allocation could not be locked.
    fn mem_lock(&self, handle: MemHandle) -> Result<BusAddress, AllocError>;

    fn mem_unlock(&self, handle: MemHandle) -> Result<(), AllocError>;

    fn mem_free(&self, handle: MemHandle) -> Result<(), AllocError>;

    /// Maps `len` bytes of locked memory at `phys` into the process.
    ///
    /// # Safety
    ///
    /// `phys` must be the physical address of a locked allocation of at least
    /// `len` bytes.
    unsafe fn map(&self, phys: PhysicalAddress, len: usize) -> Result<NonNull<u8>, MapError>;

    /// Unmaps memory mapped by [`MemService::map`].
    ///
    /// # Safety
    ///
    /// `ptr` and `len` must come from a previous call to [`MemService::map`],
    /// and the memory may not be accessed afterwards.
    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> Result<(), MapError>;
}

/// An allocator's opaque handle to a block of memory.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct MemHandle(u32);

/// A page-aligned, zero-initialized block of uncached memory, locked in
/// place and mapped into this process.
///
/// The block is returned to its [`MemService`] by [`release`], or when it is
/// dropped.
///
/// [`release`]: UncachedMemBlock::release
pub struct UncachedMemBlock<'svc, S: MemService + ?Sized = Mailbox> {
    ptr: NonNull<u8>,
    bus: BusAddress,
    handle: MemHandle,
    size: usize,
    svc: &'svc S,
}

// The block exclusively owns its mapping.
unsafe impl<S: MemService + Sync + ?Sized> Send for UncachedMemBlock<'_, S> {}
unsafe impl<S: MemService + Sync + ?Sized> Sync for UncachedMemBlock<'_, S> {}

// === impl MemHandle ===

impl MemHandle {
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for MemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemHandle({:#x})", self.0)
    }
}

// === impl UncachedMemBlock ===

impl<'svc, S: MemService + ?Sized> UncachedMemBlock<'svc, S> {
    /// Allocates at least `size` bytes from `svc`.
    ///
    /// The size is rounded up to a whole number of pages (so that even a
    /// zero-byte request gets one page). The returned block is zeroed.
    pub fn allocate(svc: &'svc S, size: usize) -> Result<Self, AllocError> {
        let size = size.max(1).next_multiple_of(PAGE_SIZE);
        let raw_size = u32::try_from(size).map_err(|_| AllocError::TooLarge { size })?;

        let handle = svc.mem_alloc(raw_size, PAGE_SIZE as u32, svc.mem_flags())?;
        if handle.is_null() {
            return Err(AllocError::NoMemory { size });
        }

        let bus = match svc.mem_lock(handle) {
            Ok(bus) if !bus.is_null() => bus,
            res => {
                if let Err(error) = svc.mem_free(handle) {
                    tracing::warn!(%error, ?handle, "failed to free memory after a lock failure");
                }
                res?;
                return Err(AllocError::Lock { handle });
            }
        };

        let ptr = match unsafe { svc.map(bus.to_physical(), size) } {
            Ok(ptr) => ptr,
            Err(error) => {
                if let Err(error) = svc.mem_unlock(handle) {
                    tracing::warn!(%error, ?handle, "failed to unlock memory after a map failure");
                }
                if let Err(error) = svc.mem_free(handle) {
                    tracing::warn!(%error, ?handle, "failed to free memory after a map failure");
                }
                return Err(error.into());
            }
        };

        unsafe { ptr.as_ptr().write_bytes(0, size) };

        tracing::info!(size, ?ptr, %bus, phys = %bus.to_physical(), "allocated uncached memory");
        Ok(Self {
            ptr,
            bus,
            handle,
            size,
            svc,
        })
    }

    /// Unmaps, unlocks and frees the block, in that order.
    ///
    /// All three steps are attempted even if an earlier one fails; the first
    /// error is returned.
    pub fn release(self) -> Result<(), AllocError> {
        let this = ManuallyDrop::new(self);
        this.release_inner()
    }

    fn release_inner(&self) -> Result<(), AllocError> {
        let unmapped = unsafe { self.svc.unmap(self.ptr, self.size) }.map_err(AllocError::from);
        let unlocked = self.svc.mem_unlock(self.handle);
        let freed = self.svc.mem_free(self.handle);
        tracing::debug!(size = self.size, bus = %self.bus, "released uncached memory");
        unmapped.and(unlocked).and(freed)
    }

    /// Returns the bus address of the start of the block.
    #[inline]
    #[must_use]
    pub fn bus_address(&self) -> BusAddress {
        self.bus
    }

    /// Returns the bus address of the byte at `offset` into the block.
    ///
    /// # Panics
    ///
    /// If `offset` is not inside the block.
    #[inline]
    #[must_use]
    pub fn bus_address_at(&self, offset: usize) -> BusAddress {
        assert!(
            offset < self.size,
            "offset {offset:#x} is outside of a {:#x}-byte block",
            self.size
        );
        self.bus + offset as u32
    }

    /// Returns the size of the block in bytes. This is always a non-zero
    /// multiple of [`PAGE_SIZE`].
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn handle(&self) -> MemHandle {
        self.handle
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Translates a pointer into this block into the bus address the DMA
    /// engine must use for it.
    ///
    /// # Panics
    ///
    /// If `ptr` does not point into this block.
    #[track_caller]
    #[must_use]
    pub fn to_bus_address<T>(&self, ptr: *const T) -> BusAddress {
        match self.try_to_bus_address(ptr) {
            Some(bus) => bus,
            None => panic!(
                "pointer {ptr:p} is outside of the {:#x}-byte block at {:p}",
                self.size, self.ptr
            ),
        }
    }

    /// Translates a pointer into this block into a bus address, returning
    /// `None` if it points outside the block.
    #[must_use]
    pub fn try_to_bus_address<T>(&self, ptr: *const T) -> Option<BusAddress> {
        let offset = (ptr as usize).checked_sub(self.ptr.as_ptr() as usize)?;
        (offset < self.size).then(|| self.bus + offset as u32)
    }

    /// Writes `value` at byte `offset` into the block.
    ///
    /// # Panics
    ///
    /// If the value does not fit in the block at `offset`, or `offset` is not
    /// suitably aligned for `T`.
    #[track_caller]
    pub fn write<T: Copy>(&mut self, offset: usize, value: T) {
        let ptr = self.typed_ptr::<T>(offset);
        unsafe { ptr.write_volatile(value) }
    }

    /// Reads a `T` from byte `offset` into the block.
    ///
    /// # Panics
    ///
    /// If a `T` at `offset` would not fit in the block, or `offset` is not
    /// suitably aligned for `T`.
    #[track_caller]
    #[must_use]
    pub fn read<T: Copy>(&self, offset: usize) -> T {
        let ptr = self.typed_ptr::<T>(offset);
        unsafe { ptr.read_volatile() }
    }

    /// Writes each value of `values` consecutively, starting at byte
    /// `offset`.
    #[track_caller]
    pub fn write_slice<T: Copy>(&mut self, offset: usize, values: &[T]) {
        for (i, value) in values.iter().enumerate() {
            self.write(offset + i * mem::size_of::<T>(), *value);
        }
    }

    #[track_caller]
    fn typed_ptr<T>(&self, offset: usize) -> *mut T {
        let end = offset.checked_add(mem::size_of::<T>());
        assert!(
            matches!(end, Some(end) if end <= self.size),
            "a {}-byte value at offset {offset:#x} doesn't fit in a {:#x}-byte block",
            mem::size_of::<T>(),
            self.size,
        );
        assert_eq!(
            offset % mem::align_of::<T>(),
            0,
            "offset {offset:#x} is misaligned for a value aligned to {}",
            mem::align_of::<T>(),
        );
        unsafe { self.ptr.as_ptr().add(offset).cast() }
    }
}

impl<S: MemService + ?Sized> Drop for UncachedMemBlock<'_, S> {
    fn drop(&mut self) {
        if let Err(error) = self.release_inner() {
            tracing::warn!(%error, bus = %self.bus, "failed to release uncached memory");
        }
    }
}

impl<S: MemService + ?Sized> fmt::Debug for UncachedMemBlock<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UncachedMemBlock")
            .field("ptr", &self.ptr)
            .field("bus", &self.bus)
            .field("handle", &self.handle)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mailbox::tags, sim::SimMemory};
    use proptest::{prop_assert, prop_assert_eq, proptest};
    use std::{cell::RefCell, io};

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    enum Call {
        Alloc,
        Lock,
        Unlock,
        Free,
        Map,
        Unmap,
    }

    /// Records every call made to a [`SimMemory`], optionally failing some.
    #[derive(Default)]
    struct Recording {
        mem: SimMemory,
        calls: RefCell<Vec<Call>>,
        fail_map: bool,
        fail_unlock: bool,
    }

    impl Recording {
        fn take_calls(&self) -> Vec<Call> {
            self.calls.take()
        }

        fn record(&self, call: Call) {
            self.calls.borrow_mut().push(call);
        }
    }

    impl MemService for Recording {
        fn mem_flags(&self) -> MemFlags {
            self.mem.mem_flags()
        }

        fn mem_alloc(&self, size: u32, align: u32, flags: MemFlags) -> Result<MemHandle, AllocError> {
            self.record(Call::Alloc);
            self.mem.mem_alloc(size, align, flags)
        }

        fn mem_lock(&self, handle: MemHandle) -> Result<BusAddress, AllocError> {
            self.record(Call::Lock);
            self.mem.mem_lock(handle)
        }

        fn mem_unlock(&self, handle: MemHandle) -> Result<(), AllocError> {
            self.record(Call::Unlock);
            if self.fail_unlock {
                return Err(AllocError::Status {
                    tag: tags::UNLOCK_MEMORY,
                    status: 1,
                });
            }
            self.mem.mem_unlock(handle)
        }

        fn mem_free(&self, handle: MemHandle) -> Result<(), AllocError> {
            self.record(Call::Free);
            self.mem.mem_free(handle)
        }

        unsafe fn map(&self, phys: PhysicalAddress, len: usize) -> Result<NonNull<u8>, MapError> {
            self.record(Call::Map);
            if self.fail_map {
                return Err(MapError::Mmap {
                    phys,
                    len,
                    source: io::Error::from(io::ErrorKind::PermissionDenied),
                });
            }
            self.mem.map(phys, len)
        }

        unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> Result<(), MapError> {
            self.record(Call::Unmap);
            self.mem.unmap(ptr, len)
        }
    }

    #[test]
    fn release_unmaps_unlocks_and_frees_in_order() {
        let svc = Recording::default();
        let block = UncachedMemBlock::allocate(&svc, 8).unwrap();
        assert_eq!(svc.take_calls(), [Call::Alloc, Call::Lock, Call::Map]);

        block.release().unwrap();
        assert_eq!(svc.take_calls(), [Call::Unmap, Call::Unlock, Call::Free]);
        assert_eq!(svc.mem.live_allocations(), 0);
    }

    #[test]
    fn drop_unmaps_unlocks_and_frees_in_order() {
        let svc = Recording::default();
        drop(UncachedMemBlock::allocate(&svc, 8).unwrap());
        assert_eq!(
            svc.take_calls(),
            [
                Call::Alloc,
                Call::Lock,
                Call::Map,
                Call::Unmap,
                Call::Unlock,
                Call::Free
            ]
        );
        assert_eq!(svc.mem.live_allocations(), 0);
    }

    #[test]
    fn release_attempts_every_step() {
        let svc = Recording {
            fail_unlock: true,
            ..Recording::default()
        };
        let block = UncachedMemBlock::allocate(&svc, 8).unwrap();
        svc.take_calls();

        let err = block.release().unwrap_err();
        assert!(
            matches!(err, AllocError::Status { tag: tags::UNLOCK_MEMORY, .. }),
            "{err:?}"
        );
        assert_eq!(svc.take_calls(), [Call::Unmap, Call::Unlock, Call::Free]);
        assert_eq!(svc.mem.live_allocations(), 0);
    }

    #[test]
    fn map_failure_unlocks_and_frees() {
        let svc = Recording {
            fail_map: true,
            fail_unlock: true,
            ..Recording::default()
        };
        let err = UncachedMemBlock::allocate(&svc, 8).unwrap_err();
        // the map error is returned, even though cleanup failed too.
        assert!(matches!(err, AllocError::Map(MapError::Mmap { .. })), "{err:?}");
        assert_eq!(
            svc.take_calls(),
            [Call::Alloc, Call::Lock, Call::Map, Call::Unlock, Call::Free]
        );
        assert_eq!(svc.mem.live_allocations(), 0);
    }

    #[test]
    fn zero_size_rounds_up_to_a_page() {
        let mem = SimMemory::new();
        let block = UncachedMemBlock::allocate(&mem, 0).unwrap();
        assert_eq!(block.size(), PAGE_SIZE);
    }

    #[test]
    fn release_returns_memory() {
        let mem = SimMemory::new();
        let block = UncachedMemBlock::allocate(&mem, 100).unwrap();
        assert_eq!(mem.live_allocations(), 1);
        block.release().unwrap();
        assert_eq!(mem.live_allocations(), 0);
    }

    #[test]
    fn drop_releases() {
        let mem = SimMemory::new();
        {
            let _block = UncachedMemBlock::allocate(&mem, PAGE_SIZE + 1).unwrap();
            assert_eq!(mem.live_allocations(), 1);
        }
        assert_eq!(mem.live_allocations(), 0);
    }

    #[test]
    fn exhausted_allocator() {
        let mem = SimMemory::with_capacity(PAGE_SIZE);
        let _first = UncachedMemBlock::allocate(&mem, 1).unwrap();
        let err = UncachedMemBlock::allocate(&mem, 1).unwrap_err();
        assert!(matches!(err, AllocError::NoMemory { size: PAGE_SIZE }), "{err:?}");
    }

    #[test]
    #[should_panic]
    fn translating_a_foreign_pointer_panics() {
        let mem = SimMemory::new();
        let block = UncachedMemBlock::allocate(&mem, 8).unwrap();
        let elsewhere = 0u32;
        let _ = block.to_bus_address(&elsewhere);
    }

    #[test]
    fn typed_access() {
        let mem = SimMemory::new();
        let mut block = UncachedMemBlock::allocate(&mem, 64).unwrap();
        block.write(8, 0xDEAD_BEEFu32);
        block.write_slice(16, &[1u32, 2, 3]);
        assert_eq!(block.read::<u32>(8), 0xDEAD_BEEF);
        assert_eq!(block.read::<u32>(20), 2);
        assert_eq!(block.read::<u32>(0), 0);
    }

    proptest! {
        #[test]
        fn allocation_is_page_rounded_and_zeroed(size in 1usize..4 * PAGE_SIZE) {
            let mem = SimMemory::new();
            let block = UncachedMemBlock::allocate(&mem, size).unwrap();
            prop_assert!(block.size() >= size);
            prop_assert_eq!(block.size() % PAGE_SIZE, 0);
            let bytes = unsafe { core::slice::from_raw_parts(block.as_ptr(), block.size()) };
            prop_assert!(bytes.iter().all(|&b| b == 0));
        }

        #[test]
        fn translation_preserves_offsets(size in 1usize..4 * PAGE_SIZE, offset: usize) {
            let mem = SimMemory::new();
            let block = UncachedMemBlock::allocate(&mem, size).unwrap();
            let offset = offset % block.size();
            let ptr = unsafe { block.as_ptr().add(offset) };
            let bus = block.to_bus_address(ptr);
            prop_assert_eq!((bus - block.bus_address()) as usize, offset);
            prop_assert_eq!(block.bus_address_at(offset), bus);
        }
    }
}
