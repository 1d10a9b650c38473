use core::{fmt, ptr::NonNull};
use std::{
    alloc::{self, Layout},
    io,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{
    addr::{BusAddress, PhysicalAddress},
    error::{AllocError, MapError},
    mailbox::{tags, CacheMode, MemFlags},
    mem::{MemHandle, MemService},
    platform::Platform,
};

/// A [`MemService`] backed by the heap.
///
/// Allocations are given fake physical addresses between
/// [`SimMemory::PHYS_BASE`] and [`SimMemory::PHYS_LIMIT`], reusing the
/// ranges of freed allocations, and bus addresses in the alias selected by
/// the allocation's [`CacheMode`], just like the VideoCore allocator would.
pub struct SimMemory {
    flags: MemFlags,
    capacity: usize,
    state: Mutex<State>,
}

struct State {
    next_handle: u32,
    used: usize,
    blocks: Vec<Block>,
}

struct Block {
    handle: MemHandle,
    ptr: NonNull<u8>,
    layout: Layout,
    phys: PhysicalAddress,
    locked: bool,
}

// All access to the blocks goes through the mutex.
unsafe impl Send for SimMemory {}
unsafe impl Sync for SimMemory {}

impl SimMemory {
    /// The fake physical address of the first allocation.
    pub const PHYS_BASE: u32 = 0x0010_0000;

    /// The end of the fake physical address space. Physical addresses above
    /// this would overlap the bus alias bits.
    pub const PHYS_LIMIT: u32 = 0x4000_0000;

    /// The default capacity of a `SimMemory`.
    pub const DEFAULT_CAPACITY: usize = 64 * 1024 * 1024;

    /// Returns a new simulated allocator with [`Self::DEFAULT_CAPACITY`]
    /// bytes, using the flags for [`Platform::DEFAULT`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Returns a new simulated allocator which fails allocations once
    /// `capacity` bytes are in use.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::for_platform(Platform::DEFAULT, capacity)
    }

    #[must_use]
    pub fn for_platform(platform: Platform, capacity: usize) -> Self {
        Self {
            flags: platform.mem_flags(),
            capacity,
            state: Mutex::new(State {
                next_handle: 1,
                used: 0,
                blocks: Vec::new(),
            }),
        }
    }

    /// Returns the number of allocations that have not been freed.
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.state().blocks.len()
    }

    /// Returns a pointer to the `len` bytes of locked memory at the bus
    /// address `bus`, or `None` if they are not all inside one locked
    /// allocation.
    #[must_use]
    pub fn translate(&self, bus: BusAddress, len: usize) -> Option<NonNull<u8>> {
        let phys = bus.to_physical().as_u32() as usize;
        let state = self.state();
        let block = state
            .blocks
            .iter()
            .find(|block| block.locked && block.contains(phys, len))?;
        let offset = phys - block.phys.as_u32() as usize;
        NonNull::new(unsafe { block.ptr.as_ptr().add(offset) })
    }

    /// Reads the word at the bus address `bus`.
    #[must_use]
    pub fn read_word(&self, bus: BusAddress) -> Option<u32> {
        let ptr = self.translate(bus, 4)?;
        if ptr.as_ptr() as usize % 4 != 0 {
            return None;
        }
        Some(unsafe { ptr.cast::<u32>().as_ptr().read_volatile() })
    }

    /// Writes the word at the bus address `bus`, returning `false` if it is
    /// not in simulated memory.
    pub fn write_word(&self, bus: BusAddress, value: u32) -> bool {
        match self.translate(bus, 4) {
            Some(ptr) if ptr.as_ptr() as usize % 4 == 0 => {
                unsafe { ptr.cast::<u32>().as_ptr().write_volatile(value) };
                true
            }
            _ => false,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bus_alias(flags: MemFlags) -> u32 {
        match flags.get(MemFlags::CACHING) {
            CacheMode::Normal => 0x0000_0000,
            CacheMode::L1Nonallocating => 0x4000_0000,
            CacheMode::Coherent => 0x8000_0000,
            CacheMode::Direct => 0xC000_0000,
        }
    }
}

impl Default for SimMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemService for SimMemory {
    fn mem_flags(&self) -> MemFlags {
        self.flags
    }

    fn mem_alloc(&self, size: u32, align: u32, _flags: MemFlags) -> Result<MemHandle, AllocError> {
        let mut state = self.state();
        let size = size as usize;
        if size == 0 || state.used.saturating_add(size) > self.capacity {
            return Ok(MemHandle::new(0));
        }
        let Some(phys) = state.place(size, align as usize) else {
            return Ok(MemHandle::new(0));
        };

        let Ok(layout) = Layout::from_size_align(size, align as usize) else {
            return Err(AllocError::Rejected {
                tag: tags::ALLOCATE_MEMORY,
                code: 0x8000_0001,
            });
        };
        let Some(ptr) = NonNull::new(unsafe { alloc::alloc(layout) }) else {
            return Ok(MemHandle::new(0));
        };
        // the firmware initializes allocations to all ones.
        unsafe { ptr.as_ptr().write_bytes(0xFF, size) };

        let handle = MemHandle::new(state.next_handle);
        state.next_handle = state.next_handle.checked_add(1).unwrap_or(1);
        state.used += size;
        state.blocks.push(Block {
            handle,
            ptr,
            layout,
            phys,
            locked: false,
        });
        tracing::trace!(?handle, size, %phys, "sim: allocated");
        Ok(handle)
    }

    fn mem_lock(&self, handle: MemHandle) -> Result<BusAddress, AllocError> {
        let mut state = self.state();
        let Some(block) = state.blocks.iter_mut().find(|b| b.handle == handle) else {
            return Ok(BusAddress::NULL);
        };
        block.locked = true;
        Ok(BusAddress::new(block.phys.as_u32() | Self::bus_alias(self.flags)))
    }

    fn mem_unlock(&self, handle: MemHandle) -> Result<(), AllocError> {
        let mut state = self.state();
        match state.blocks.iter_mut().find(|b| b.handle == handle) {
            Some(block) => {
                block.locked = false;
                Ok(())
            }
            None => Err(AllocError::Status {
                tag: tags::UNLOCK_MEMORY,
                status: 1,
            }),
        }
    }

    fn mem_free(&self, handle: MemHandle) -> Result<(), AllocError> {
        let mut state = self.state();
        let Some(idx) = state.blocks.iter().position(|b| b.handle == handle) else {
            return Err(AllocError::Status {
                tag: tags::RELEASE_MEMORY,
                status: 1,
            });
        };
        let block = state.blocks.swap_remove(idx);
        state.used -= block.layout.size();
        unsafe { alloc::dealloc(block.ptr.as_ptr(), block.layout) };
        tracing::trace!(?handle, "sim: freed");
        Ok(())
    }

    unsafe fn map(&self, phys: PhysicalAddress, len: usize) -> Result<NonNull<u8>, MapError> {
        let addr = phys.as_u32() as usize;
        let state = self.state();
        let Some(block) = state.blocks.iter().find(|block| block.contains(addr, len)) else {
            return Err(MapError::Mmap {
                phys,
                len,
                source: io::Error::from(io::ErrorKind::InvalidInput),
            });
        };
        let offset = addr - block.phys.as_u32() as usize;
        Ok(NonNull::new_unchecked(block.ptr.as_ptr().add(offset)))
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> Result<(), MapError> {
        let addr = ptr.as_ptr() as usize;
        let state = self.state();
        let mapped = state.blocks.iter().any(|block| {
            let base = block.ptr.as_ptr() as usize;
            addr >= base && addr + len <= base + block.layout.size()
        });
        if mapped {
            Ok(())
        } else {
            Err(MapError::Munmap {
                len,
                source: io::Error::from(io::ErrorKind::InvalidInput),
            })
        }
    }
}

impl Drop for SimMemory {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for block in state.blocks.drain(..) {
            unsafe { alloc::dealloc(block.ptr.as_ptr(), block.layout) };
        }
    }
}

impl fmt::Debug for SimMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("SimMemory")
            .field("flags", &self.flags)
            .field("capacity", &self.capacity)
            .field("used", &state.used)
            .field("live_allocations", &state.blocks.len())
            .finish()
    }
}

impl State {
    /// Finds the lowest free physical range of `size` bytes aligned to
    /// `align`.
    fn place(&self, size: usize, align: usize) -> Option<PhysicalAddress> {
        let mut taken: Vec<_> = self
            .blocks
            .iter()
            .map(|block| {
                let start = block.phys.as_u32() as usize;
                (start, start + block.layout.size())
            })
            .collect();
        taken.sort_unstable();

        let mut start = SimMemory::PHYS_BASE as usize;
        for (used_start, used_end) in taken {
            if start + size <= used_start {
                break;
            }
            start = start.max(used_end.next_multiple_of(align.max(1)));
        }
        if start + size > SimMemory::PHYS_LIMIT as usize {
            return None;
        }
        Some(PhysicalAddress::new(start as u32))
    }
}

impl Block {
    fn contains(&self, phys: usize, len: usize) -> bool {
        let start = self.phys.as_u32() as usize;
        phys >= start && phys + len <= start + self.layout.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::UncachedMemBlock;

    #[test]
    fn bus_addresses_use_the_platform_alias() {
        let pi1 = SimMemory::for_platform(Platform::Pi1, SimMemory::DEFAULT_CAPACITY);
        let block = UncachedMemBlock::allocate(&pi1, 1).unwrap();
        assert_eq!(block.bus_address(), BusAddress::new(0xC010_0000));

        let pi2 = SimMemory::for_platform(Platform::Pi2, SimMemory::DEFAULT_CAPACITY);
        let block = UncachedMemBlock::allocate(&pi2, 1).unwrap();
        assert_eq!(block.bus_address(), BusAddress::new(0x4010_0000));
        assert_eq!(
            block.bus_address().to_physical(),
            PhysicalAddress::new(SimMemory::PHYS_BASE)
        );
    }

    #[test]
    fn translate_round_trips_through_the_bus() {
        let mem = SimMemory::new();
        let mut block = UncachedMemBlock::allocate(&mem, 64).unwrap();
        block.write(12, 0x1234_5678u32);
        let bus = block.bus_address_at(12);
        assert_eq!(mem.read_word(bus), Some(0x1234_5678));
        assert!(mem.write_word(bus, 7));
        assert_eq!(block.read::<u32>(12), 7);
        assert_eq!(mem.read_word(BusAddress::new(0x7E20_001C)), None);
    }

    #[test]
    fn freed_physical_ranges_are_reused() {
        let mem = SimMemory::new();
        let first = UncachedMemBlock::allocate(&mem, 4096).unwrap();
        let second = UncachedMemBlock::allocate(&mem, 4096).unwrap();
        let third = UncachedMemBlock::allocate(&mem, 4096).unwrap();
        let gap = second.bus_address();
        second.release().unwrap();

        // a block that fits in the gap goes there, a bigger one goes after.
        let bigger = UncachedMemBlock::allocate(&mem, 8192).unwrap();
        assert_eq!(bigger.bus_address(), third.bus_address() + 4096);
        let reused = UncachedMemBlock::allocate(&mem, 4096).unwrap();
        assert_eq!(reused.bus_address(), gap);
        assert_ne!(reused.bus_address(), first.bus_address());

        // many allocations over time don't run out of addresses.
        drop((first, third, bigger, reused));
        for _ in 0..300 {
            let block = UncachedMemBlock::allocate(&mem, 4 * 1024 * 1024).unwrap();
            assert_eq!(
                block.bus_address().to_physical(),
                PhysicalAddress::new(SimMemory::PHYS_BASE)
            );
        }
    }

    #[test]
    fn physical_addresses_stay_below_the_alias_bits() {
        let mem = SimMemory::with_capacity(usize::MAX);
        let handle = mem
            .mem_alloc(SimMemory::PHYS_LIMIT, 4096, mem.mem_flags())
            .unwrap();
        assert!(handle.is_null());
        assert_eq!(mem.live_allocations(), 0);
    }

    #[test]
    fn released_memory_is_not_translated() {
        let mem = SimMemory::new();
        let block = UncachedMemBlock::allocate(&mem, 64).unwrap();
        let bus = block.bus_address();
        block.release().unwrap();
        assert_eq!(mem.translate(bus, 4), None);
    }

    #[test]
    fn double_free_is_reported() {
        let mem = SimMemory::new();
        let handle = mem.mem_alloc(4096, 4096, mem.mem_flags()).unwrap();
        mem.mem_free(handle).unwrap();
        assert!(matches!(
            mem.mem_free(handle),
            Err(AllocError::Status { .. })
        ));
    }
}
