//! Control of a single BCM283x DMA channel.
#![warn(missing_docs)]
use core::{
    fmt,
    mem::ManuallyDrop,
    ptr,
    sync::atomic::{fence, Ordering},
    time::Duration,
};

use mycelium_bitfield::bitfield;

use crate::{addr::BusAddress, mmio::Mmio};

/// A DMA channel.
///
/// A `Channel` drives the registers of one of the DMA controller's channels
/// through an [`Mmio`] window covering the whole controller. It tracks the
/// channel's [`ChannelState`], and refuses operations that are not valid in
/// the current state (without touching the hardware).
///
/// Channels are normally used through [`Channel::launch`], which arms and
/// starts the channel and returns an [`ActiveTransfer`] guard that stops it
/// again. A `Channel` that is dropped while running is stopped as well.
pub struct Channel<W: Mmio> {
    regs: W,
    idx: u8,
    state: ChannelState,
}

/// The software-visible lifecycle of a [`Channel`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// The channel has been reset and has no control block installed.
    Idle,
    /// A control block has been installed, but the channel is not active.
    Armed,
    /// The channel is active; the DMA engine is processing control blocks.
    Running,
    /// The channel is being aborted and reset.
    Stopping,
}

/// Returned when a [`Channel`] operation is attempted in a state that does not
/// allow it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InvalidTransition {
    op: &'static str,
    state: ChannelState,
}

/// Something the DMA engine can be pointed at.
pub trait DmaSource {
    /// Returns the bus address of the first control block to process.
    fn head(&self) -> BusAddress;
}

/// A running transfer on a [`Channel`].
///
/// The transfer owns whatever holds its control blocks and source data, so
/// that they cannot be released while the DMA engine may still read them.
/// [`ActiveTransfer::stop`] stops the channel and hands the source back.
/// Dropping the guard stops the channel and then drops the source. A guard
/// passed to [`mem::forget`](core::mem::forget) leaks the source along with
/// it, so the memory the engine is reading is never freed.
///
/// The source cannot be released while it is launched:
///
/// ```compile_fail
/// use bcm_dma::{channel::Channel, sim::{DmaRegisters, SimMemory}, stream::GpioStream};
///
/// let mem = SimMemory::new();
/// let dma = DmaRegisters::new();
/// let mut channel = Channel::new(&dma, 5);
/// let stream = GpioStream::set_clear_pair(&mem, 1 << 14).unwrap();
/// let transfer = channel.launch(stream).unwrap();
/// // the stream now belongs to the transfer
/// stream.release().unwrap();
/// # drop(transfer);
/// ```
#[must_use = "dropping an `ActiveTransfer` immediately stops the channel"]
pub struct ActiveTransfer<'chan, W: Mmio, S> {
    channel: &'chan mut Channel<W>,
    src: S,
}

bitfield! {
    /// A DMA channel's `CS` (control and status) register.
    #[derive(PartialEq, Eq)]
    pub struct ChannelStatus<u32> {
        /// The channel is active. Writing 1 starts it; writing 0 pauses it.
        pub const ACTIVE: bool;
        /// The last control block has completed. Write 1 to clear.
        pub const END: bool;
        /// An interrupt is pending. Write 1 to clear.
        pub const INT: bool;
        /// The state of the selected peripheral's DREQ.
        pub const DREQ: bool;
        /// The channel is paused.
        pub const PAUSED: bool;
        /// The channel is paused by its DREQ.
        pub const DREQ_STOPS_DMA: bool;
        /// The channel is waiting for its last write to be acknowledged.
        pub const WAITING_FOR_OUTSTANDING_WRITES: bool;
        const _RESERVED_0 = 1;
        /// The channel has encountered an error (see its `DEBUG` register).
        pub const ERROR: bool;
        const _RESERVED_1 = 7;
        /// The AXI priority of normal transfers.
        pub const PRIORITY = 4;
        /// The AXI priority of panicking transfers.
        pub const PANIC_PRIORITY = 4;
        const _RESERVED_2 = 4;
        /// Wait for outstanding writes before ending the transfer.
        pub const WAIT_FOR_OUTSTANDING_WRITES: bool;
        /// Keep running when the debug pause signal is asserted.
        pub const DISDEBUG: bool;
        /// Abort the current control block and continue with the next.
        /// Self-clearing.
        pub const ABORT: bool;
        /// Reset the channel. Self-clearing.
        pub const RESET: bool;
    }
}

/// Channel register offsets, relative to the channel's register block.
pub mod regs {
    /// Control and status.
    pub const CS: usize = 0x00;
    /// The bus address of the current control block.
    pub const CONBLK_AD: usize = 0x04;
    /// Debug error flags. Write 1s to clear.
    pub const DEBUG: usize = 0x20;

    /// The spacing between channel register blocks.
    pub const CHANNEL_STRIDE: usize = 0x100;
}

/// The number of channels this crate will drive (0 through 14).
///
/// Channel 15 lives in a separate register block and is not supported.
pub const CHANNEL_COUNT: u8 = 15;

/// The priority used for both normal and panicking transfers.
const PRIORITY: u32 = 7;

/// All of the `DEBUG` register's error flags.
const DEBUG_CLEAR_ERRORS: u32 = 0b111;

/// How long an abort is given to take effect before the channel is reset.
const ABORT_SETTLE: Duration = Duration::from_micros(100);

// === impl Channel ===

impl<W: Mmio> Channel<W> {
    /// The number of channels this crate will drive.
    pub const COUNT: u8 = CHANNEL_COUNT;

    /// Takes control of channel `idx` of the DMA controller mapped by `regs`,
    /// resetting it.
    ///
    /// # Panics
    ///
    /// If `idx` is not less than [`Channel::COUNT`].
    pub fn new(regs: W, idx: u8) -> Self {
        assert!(
            idx < Self::COUNT,
            "the DMA controller only has {} supported channels, but channel {idx} was requested",
            Self::COUNT,
        );
        let this = Self {
            regs,
            idx,
            state: ChannelState::Idle,
        };
        this.write_cs(ChannelStatus::new().with(ChannelStatus::RESET, true));
        tracing::debug!(channel = idx, "reset DMA channel");
        this
    }

    /// Returns the channel index of this channel, from 0 to 14.
    #[inline]
    #[must_use]
    pub fn index(&self) -> u8 {
        self.idx
    }

    /// Returns the channel's current [`ChannelState`].
    #[inline]
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Reads the channel's `CS` register.
    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        ChannelStatus::from_bits(self.regs.read(self.offset(regs::CS)))
    }

    /// Reads the bus address of the control block the channel is on.
    #[must_use]
    pub fn control_block(&self) -> BusAddress {
        BusAddress::new(self.regs.read(self.offset(regs::CONBLK_AD)))
    }

    /// Installs the control block at `cb` without starting the channel.
    ///
    /// This clears the `END` flag and any debug errors, writes the control
    /// block address, and sets the channel's priorities. It is only valid
    /// while the channel is [`Idle`](ChannelState::Idle).
    ///
    /// # Safety
    ///
    /// Once the channel is started, the DMA engine reads the control block at
    /// `cb`, and everything it points to, until the channel is stopped. The
    /// caller must keep that memory allocated and valid until [`stop`]
    /// returns, or until the `Channel` is dropped. [`Channel::launch`] is a
    /// safe alternative which takes ownership of the memory instead.
    ///
    /// [`stop`]: Channel::stop
    pub unsafe fn arm(&mut self, cb: BusAddress) -> Result<(), InvalidTransition> {
        self.expect_state("arm", ChannelState::Idle)?;

        fence(Ordering::SeqCst);
        self.modify_cs(|cs| cs.with(ChannelStatus::END, true));
        self.regs.write(self.offset(regs::DEBUG), DEBUG_CLEAR_ERRORS);
        self.regs.write(self.offset(regs::CONBLK_AD), cb.as_u32());
        self.write_cs(
            ChannelStatus::new()
                .with(ChannelStatus::PRIORITY, PRIORITY)
                .with(ChannelStatus::PANIC_PRIORITY, PRIORITY)
                .with(ChannelStatus::DISDEBUG, true),
        );
        fence(Ordering::SeqCst);

        self.state = ChannelState::Armed;
        tracing::debug!(channel = self.idx, %cb, "armed DMA channel");
        Ok(())
    }

    /// Starts processing the installed control block.
    ///
    /// This is only valid while the channel is [`Armed`](ChannelState::Armed).
    ///
    /// # Safety
    ///
    /// The control blocks installed by [`arm`](Channel::arm) must still be
    /// valid, and must stay valid until the channel is stopped.
    pub unsafe fn start(&mut self) -> Result<(), InvalidTransition> {
        self.expect_state("start", ChannelState::Armed)?;

        fence(Ordering::SeqCst);
        self.modify_cs(|cs| cs.with(ChannelStatus::ACTIVE, true));
        fence(Ordering::SeqCst);

        self.state = ChannelState::Running;
        tracing::info!(channel = self.idx, "started DMA channel");
        Ok(())
    }

    /// Aborts the running transfer and resets the channel, returning it to
    /// [`Idle`](ChannelState::Idle).
    ///
    /// This is only valid while the channel is
    /// [`Running`](ChannelState::Running). Once begun, it always runs to
    /// completion.
    pub fn stop(&mut self) -> Result<(), InvalidTransition> {
        self.expect_state("stop", ChannelState::Running)?;
        self.state = ChannelState::Stopping;

        fence(Ordering::SeqCst);
        self.modify_cs(|cs| cs.with(ChannelStatus::ABORT, true));
        std::thread::sleep(ABORT_SETTLE);
        self.modify_cs(|cs| cs.with(ChannelStatus::ACTIVE, false));
        self.modify_cs(|cs| cs.with(ChannelStatus::RESET, true));
        fence(Ordering::SeqCst);

        self.state = ChannelState::Idle;
        tracing::info!(channel = self.idx, "stopped DMA channel");
        Ok(())
    }

    /// Arms the channel with `src`'s first control block and starts it.
    ///
    /// The returned [`ActiveTransfer`] borrows this channel and owns `src`
    /// until the transfer is stopped. If the channel is not
    /// [`Idle`](ChannelState::Idle), nothing is written and `src` is dropped.
    pub fn launch<S: DmaSource>(
        &mut self,
        src: S,
    ) -> Result<ActiveTransfer<'_, W, S>, InvalidTransition> {
        self.expect_state("launch", ChannelState::Idle)?;
        // Safety: `src` is owned by the returned guard, which stops the
        // channel before giving it up.
        unsafe {
            self.arm(src.head())?;
            self.start()?;
        }
        Ok(ActiveTransfer { channel: self, src })
    }

    /// Stops the channel if it is running, logging (rather than returning) a
    /// failure.
    fn halt(&mut self) {
        if self.state != ChannelState::Running {
            return;
        }
        if let Err(error) = self.stop() {
            tracing::warn!(%error, channel = self.idx, "failed to stop DMA channel");
        }
    }

    #[inline]
    fn offset(&self, reg: usize) -> usize {
        self.idx as usize * regs::CHANNEL_STRIDE + reg
    }

    fn expect_state(&self, op: &'static str, state: ChannelState) -> Result<(), InvalidTransition> {
        if self.state != state {
            return Err(InvalidTransition {
                op,
                state: self.state,
            });
        }
        Ok(())
    }

    fn write_cs(&self, cs: ChannelStatus) {
        self.regs.write(self.offset(regs::CS), cs.bits());
    }

    fn modify_cs(&self, f: impl FnOnce(ChannelStatus) -> ChannelStatus) {
        let cs = self.status();
        self.write_cs(f(cs));
    }
}

impl<W: Mmio> Drop for Channel<W> {
    fn drop(&mut self) {
        self.halt();
    }
}

impl<W: Mmio> fmt::Debug for Channel<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("idx", &self.idx)
            .field("state", &self.state)
            .finish()
    }
}

// === impl ActiveTransfer ===

impl<W: Mmio, S> ActiveTransfer<'_, W, S> {
    /// Returns the channel running this transfer.
    #[must_use]
    pub fn channel(&self) -> &Channel<W> {
        self.channel
    }

    /// Returns the source the DMA engine is reading from.
    #[must_use]
    pub fn source(&self) -> &S {
        &self.src
    }

    /// Stops the transfer, returning the channel to
    /// [`Idle`](ChannelState::Idle), and hands back the source, which may
    /// then be released.
    pub fn stop(self) -> S {
        let mut this = ManuallyDrop::new(self);
        this.channel.halt();
        // Safety: `this` is never dropped, so `src` is moved out exactly once.
        unsafe { ptr::read(&this.src) }
    }
}

impl<W: Mmio, S> Drop for ActiveTransfer<'_, W, S> {
    fn drop(&mut self) {
        // `src` is dropped after this returns, once the channel is stopped.
        self.channel.halt();
    }
}

impl<W: Mmio, S: fmt::Debug> fmt::Debug for ActiveTransfer<'_, W, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveTransfer")
            .field("channel", &self.channel)
            .field("src", &self.src)
            .finish()
    }
}

// === impl ChannelState ===

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Armed => "armed",
            Self::Running => "running",
            Self::Stopping => "stopping",
        })
    }
}

// === impl InvalidTransition ===

impl InvalidTransition {
    /// Returns the name of the rejected operation.
    #[must_use]
    pub fn op(&self) -> &'static str {
        self.op
    }

    /// Returns the state the channel was in when the operation was rejected.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.state
    }
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { op, state } = self;
        write!(f, "cannot {op} a DMA channel that is {state}")
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{DmaRegisters, RegisterWrite};

    const CB: BusAddress = BusAddress::new(0xC010_0000);

    fn cs(offset: usize, value: ChannelStatus) -> RegisterWrite {
        RegisterWrite {
            offset: 5 * regs::CHANNEL_STRIDE + offset,
            value: value.bits(),
        }
    }

    #[test]
    fn status_is_valid() {
        ChannelStatus::assert_valid();
    }

    #[test]
    fn status_layout() {
        let cs = ChannelStatus::new()
            .with(ChannelStatus::PRIORITY, 7)
            .with(ChannelStatus::PANIC_PRIORITY, 7)
            .with(ChannelStatus::DISDEBUG, true);
        assert_eq!(cs.bits(), 0x2077_0000);
        assert_eq!(
            ChannelStatus::new().with(ChannelStatus::RESET, true).bits(),
            1 << 31
        );
        assert_eq!(
            ChannelStatus::new().with(ChannelStatus::ERROR, true).bits(),
            1 << 8
        );
    }

    #[test]
    fn start_without_arm_is_rejected() {
        let dma = DmaRegisters::new();
        let mut channel = Channel::new(&dma, 5);
        let before = dma.writes().len();

        let err = unsafe { channel.start() }.unwrap_err();
        assert_eq!(err.op(), "start");
        assert_eq!(err.state(), ChannelState::Idle);
        assert_eq!(channel.stop().unwrap_err().state(), ChannelState::Idle);
        assert_eq!(dma.writes().len(), before, "rejected ops must not write");
    }

    #[test]
    fn arm_twice_is_rejected() {
        let dma = DmaRegisters::new();
        let mut channel = Channel::new(&dma, 5);
        unsafe { channel.arm(CB) }.unwrap();
        let before = dma.writes().len();
        let err = unsafe { channel.arm(CB) }.unwrap_err();
        assert_eq!(err.to_string(), "cannot arm a DMA channel that is armed");
        assert_eq!(dma.writes().len(), before);
    }

    #[test]
    fn lifecycle_returns_to_idle() {
        let dma = DmaRegisters::new();
        let mut channel = Channel::new(&dma, 5);

        for _ in 0..2 {
            unsafe { channel.arm(CB) }.unwrap();
            assert_eq!(channel.state(), ChannelState::Armed);
            assert_eq!(dma.control_block(5), CB);
            assert!(!dma.status(5).get(ChannelStatus::ACTIVE));

            unsafe { channel.start() }.unwrap();
            assert_eq!(channel.state(), ChannelState::Running);
            assert!(dma.status(5).get(ChannelStatus::ACTIVE));

            channel.stop().unwrap();
            assert_eq!(channel.state(), ChannelState::Idle);
            assert!(!dma.status(5).get(ChannelStatus::ACTIVE));
        }
    }

    #[test]
    fn register_write_order() {
        let dma = DmaRegisters::new();
        let mut channel = Channel::new(&dma, 5);
        unsafe {
            channel.arm(CB).unwrap();
            channel.start().unwrap();
        }
        channel.stop().unwrap();

        let armed = ChannelStatus::new()
            .with(ChannelStatus::PRIORITY, 7)
            .with(ChannelStatus::PANIC_PRIORITY, 7)
            .with(ChannelStatus::DISDEBUG, true);
        let running = armed.with(ChannelStatus::ACTIVE, true);
        assert_eq!(
            dma.writes(),
            vec![
                // new
                cs(regs::CS, ChannelStatus::new().with(ChannelStatus::RESET, true)),
                // arm
                cs(regs::CS, ChannelStatus::new().with(ChannelStatus::END, true)),
                RegisterWrite {
                    offset: 5 * regs::CHANNEL_STRIDE + regs::DEBUG,
                    value: DEBUG_CLEAR_ERRORS,
                },
                RegisterWrite {
                    offset: 5 * regs::CHANNEL_STRIDE + regs::CONBLK_AD,
                    value: CB.as_u32(),
                },
                cs(regs::CS, armed),
                // start
                cs(regs::CS, running),
                // stop
                cs(regs::CS, running.with(ChannelStatus::ABORT, true)),
                cs(regs::CS, armed),
                cs(regs::CS, armed.with(ChannelStatus::RESET, true)),
            ]
        );
    }

    #[derive(Debug, PartialEq)]
    struct Head(BusAddress);

    impl DmaSource for Head {
        fn head(&self) -> BusAddress {
            self.0
        }
    }

    #[test]
    fn dropping_a_transfer_stops_the_channel() {
        let dma = DmaRegisters::new();
        let mut channel = Channel::new(&dma, 3);
        {
            let xfer = channel.launch(Head(CB)).unwrap();
            assert_eq!(xfer.channel().state(), ChannelState::Running);
            assert_eq!(xfer.source(), &Head(CB));
            assert!(dma.status(3).get(ChannelStatus::ACTIVE));
        }
        assert_eq!(channel.state(), ChannelState::Idle);
        assert!(!dma.status(3).get(ChannelStatus::ACTIVE));

        let xfer = channel.launch(Head(CB)).unwrap();
        assert_eq!(xfer.stop(), Head(CB));
        assert_eq!(channel.state(), ChannelState::Idle);
    }

    #[test]
    fn launch_requires_an_idle_channel() {
        let dma = DmaRegisters::new();
        let mut channel = Channel::new(&dma, 3);
        unsafe { channel.arm(CB) }.unwrap();
        let before = dma.writes().len();

        let err = channel.launch(Head(CB)).unwrap_err();
        assert_eq!(err.op(), "launch");
        assert_eq!(err.state(), ChannelState::Armed);
        assert_eq!(dma.writes().len(), before);
    }

    #[test]
    fn dropping_a_running_channel_stops_it() {
        let dma = DmaRegisters::new();
        {
            let mut channel = Channel::new(&dma, 2);
            unsafe {
                channel.arm(CB).unwrap();
                channel.start().unwrap();
            }
            assert!(dma.status(2).get(ChannelStatus::ACTIVE));
        }
        assert!(!dma.status(2).get(ChannelStatus::ACTIVE));
        assert_eq!(dma.active_control_block(2), None);
    }

    #[test]
    #[should_panic]
    fn channel_15_is_unsupported() {
        let dma = DmaRegisters::new();
        let _ = Channel::new(&dma, 15);
    }
}
