use std::sync::{
    atomic::{AtomicU32, Ordering},
    Mutex, MutexGuard, PoisonError,
};

use crate::{
    addr::BusAddress,
    channel::{regs, ChannelStatus, CHANNEL_COUNT},
    mmio::Mmio,
    PAGE_SIZE,
};

/// A block of simulated registers which records every write made through
/// [`Mmio`].
#[derive(Debug)]
pub struct RegisterFile {
    regs: Box<[AtomicU32]>,
    log: Mutex<Vec<RegisterWrite>>,
}

/// A single write recorded by a [`RegisterFile`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RegisterWrite {
    pub offset: usize,
    pub value: u32,
}

/// The registers of a simulated DMA controller.
///
/// Writes to a channel's `CS` register behave the way they do on hardware:
///
/// - setting `RESET` clears the channel's `CS` and `CONBLK_AD` registers,
/// - `ABORT` is self-clearing,
/// - `END` and `INT` are cleared by writing 1 to them, and are otherwise only
///   set by the hardware (see [`DmaRegisters::raise`]),
/// - the remaining status flags are read-only.
///
/// Every write is recorded as written, before these rules are applied.
#[derive(Debug)]
pub struct DmaRegisters {
    file: RegisterFile,
}

// === impl RegisterFile ===

impl RegisterFile {
    /// Returns a zeroed register file covering `len` bytes.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            regs: (0..len / 4).map(|_| AtomicU32::new(0)).collect(),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Returns the value of the register at `offset`.
    #[must_use]
    pub fn get(&self, offset: usize) -> u32 {
        self.reg(offset).load(Ordering::Acquire)
    }

    /// Sets the register at `offset` without recording a write, the way
    /// hardware changes its own registers.
    pub fn set(&self, offset: usize, value: u32) {
        self.reg(offset).store(value, Ordering::Release)
    }

    /// Returns every write recorded so far, oldest first.
    #[must_use]
    pub fn writes(&self) -> Vec<RegisterWrite> {
        self.log().clone()
    }

    /// Returns every write recorded so far, and clears the record.
    pub fn take_writes(&self) -> Vec<RegisterWrite> {
        std::mem::take(&mut *self.log())
    }

    fn record(&self, offset: usize, value: u32) {
        self.log().push(RegisterWrite { offset, value });
    }

    fn log(&self) -> MutexGuard<'_, Vec<RegisterWrite>> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[track_caller]
    fn reg(&self, offset: usize) -> &AtomicU32 {
        assert_eq!(offset % 4, 0, "register offset {offset:#x} is not aligned");
        match self.regs.get(offset / 4) {
            Some(reg) => reg,
            None => panic!(
                "register offset {offset:#x} is outside of a {:#x}-byte register file",
                self.regs.len() * 4
            ),
        }
    }
}

impl Mmio for RegisterFile {
    fn read(&self, offset: usize) -> u32 {
        self.get(offset)
    }

    fn write(&self, offset: usize, value: u32) {
        self.record(offset, value);
        self.set(offset, value);
    }
}

// === impl DmaRegisters ===

impl DmaRegisters {
    /// Returns the registers of an idle DMA controller.
    #[must_use]
    pub fn new() -> Self {
        Self {
            file: RegisterFile::new(PAGE_SIZE),
        }
    }

    /// Returns channel `idx`'s `CS` register.
    #[must_use]
    pub fn status(&self, idx: u8) -> ChannelStatus {
        ChannelStatus::from_bits(self.file.get(Self::offset(idx, regs::CS)))
    }

    /// Returns channel `idx`'s `CONBLK_AD` register.
    #[must_use]
    pub fn control_block(&self, idx: u8) -> BusAddress {
        BusAddress::new(self.file.get(Self::offset(idx, regs::CONBLK_AD)))
    }

    /// Returns the control block channel `idx` is processing, if it is
    /// active.
    #[must_use]
    pub fn active_control_block(&self, idx: u8) -> Option<BusAddress> {
        self.status(idx)
            .get(ChannelStatus::ACTIVE)
            .then(|| self.control_block(idx))
    }

    /// Sets status flags on channel `idx` the way the hardware would, such as
    /// `END` when a transfer completes.
    pub fn raise(&self, idx: u8, flags: ChannelStatus) {
        let offset = Self::offset(idx, regs::CS);
        self.file.set(offset, self.file.get(offset) | flags.bits());
    }

    /// Returns every write recorded so far, oldest first.
    #[must_use]
    pub fn writes(&self) -> Vec<RegisterWrite> {
        self.file.writes()
    }

    /// Returns every write recorded so far, and clears the record.
    pub fn take_writes(&self) -> Vec<RegisterWrite> {
        self.file.take_writes()
    }

    fn offset(idx: u8, reg: usize) -> usize {
        assert!(idx < CHANNEL_COUNT, "no such DMA channel {idx}");
        idx as usize * regs::CHANNEL_STRIDE + reg
    }

    fn write_cs(&self, offset: usize, value: u32) {
        let written = ChannelStatus::from_bits(value);
        if written.get(ChannelStatus::RESET) {
            self.file.set(offset, 0);
            self.file.set(offset - regs::CS + regs::CONBLK_AD, 0);
            return;
        }

        let current = ChannelStatus::from_bits(self.file.get(offset));
        let end = current.get(ChannelStatus::END) && !written.get(ChannelStatus::END);
        let int = current.get(ChannelStatus::INT) && !written.get(ChannelStatus::INT);
        let next = ChannelStatus::new()
            .with(ChannelStatus::ACTIVE, written.get(ChannelStatus::ACTIVE))
            .with(ChannelStatus::END, end)
            .with(ChannelStatus::INT, int)
            .with(ChannelStatus::DREQ, current.get(ChannelStatus::DREQ))
            .with(ChannelStatus::PAUSED, current.get(ChannelStatus::PAUSED))
            .with(
                ChannelStatus::DREQ_STOPS_DMA,
                current.get(ChannelStatus::DREQ_STOPS_DMA),
            )
            .with(
                ChannelStatus::WAITING_FOR_OUTSTANDING_WRITES,
                current.get(ChannelStatus::WAITING_FOR_OUTSTANDING_WRITES),
            )
            .with(ChannelStatus::ERROR, current.get(ChannelStatus::ERROR))
            .with(ChannelStatus::PRIORITY, written.get(ChannelStatus::PRIORITY))
            .with(
                ChannelStatus::PANIC_PRIORITY,
                written.get(ChannelStatus::PANIC_PRIORITY),
            )
            .with(
                ChannelStatus::WAIT_FOR_OUTSTANDING_WRITES,
                written.get(ChannelStatus::WAIT_FOR_OUTSTANDING_WRITES),
            )
            .with(ChannelStatus::DISDEBUG, written.get(ChannelStatus::DISDEBUG));
        self.file.set(offset, next.bits());
    }
}

impl Default for DmaRegisters {
    fn default() -> Self {
        Self::new()
    }
}

impl Mmio for DmaRegisters {
    fn read(&self, offset: usize) -> u32 {
        self.file.get(offset)
    }

    fn write(&self, offset: usize, value: u32) {
        self.file.record(offset, value);
        if offset % regs::CHANNEL_STRIDE == regs::CS {
            self.write_cs(offset, value);
        } else {
            self.file.set(offset, value);
        }
    }
}
