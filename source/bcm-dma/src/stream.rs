//! Continuous DMA streams into the GPIO set/clear registers.
//!
//! A [`GpioStream`] owns a payload in uncached memory and a single control
//! block which copies the payload into `GPSET0`/`GPCLR0` and then loops back
//! to itself. Once a channel has been launched with it, the DMA engine keeps
//! toggling the pins until the channel is stopped.
use core::{fmt, mem};

use crate::{
    addr::BusAddress,
    channel::DmaSource,
    control_block::{errors::InvalidTransfer, ControlBlock, ControlChain},
    error::{AllocError, Error},
    gpio::{RegisterImage, SetClear, CLR_OFFSET, SET_BUS, SET_OFFSET},
    mailbox::Mailbox,
    mem::{MemService, UncachedMemBlock},
};

/// A self-looping DMA transfer into the GPIO set/clear registers.
pub struct GpioStream<'svc, S: MemService + ?Sized = Mailbox> {
    payload: UncachedMemBlock<'svc, S>,
    chain: ControlChain<'svc, S>,
    layout: Layout,
    samples: usize,
}

/// How a [`GpioStream`]'s payload is laid out.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Layout {
    /// One [`SetClear`] pair, transferred as two one-word rows with a
    /// destination stride skipping the gap between the registers.
    SetClearPair,
    /// A sequence of [`RegisterImage`]s, each covering every register from
    /// `GPSET0` to `GPCLR0`, with a negative destination stride rewinding to
    /// `GPSET0` after each one.
    RegisterImage,
}

/// The distance from the end of the first word to `GPCLR0`.
const SET_CLEAR_GAP: i16 = (CLR_OFFSET - SET_OFFSET - 4) as i16;

const IMAGE_LEN: u32 = mem::size_of::<RegisterImage>() as u32;

// === impl GpioStream ===

impl<'svc, S: MemService + ?Sized> GpioStream<'svc, S> {
    /// Prepares a stream which writes `mask` to `GPSET0` and then to
    /// `GPCLR0`, forever.
    ///
    /// The control block copies one [`SetClear`] pair as two rows of four
    /// bytes. The source stride is zero, since the pair is contiguous; the
    /// destination stride of 8 bytes skips from the end of `GPSET0` to
    /// `GPCLR0`.
    pub fn set_clear_pair(svc: &'svc S, mask: u32) -> Result<Self, Error> {
        let mut payload = UncachedMemBlock::allocate(svc, mem::size_of::<SetClear>())?;
        payload.write(0, SetClear::toggle(mask));

        let cb = ControlBlock::builder()
            .src_inc(true)
            .dest_inc(true)
            .no_wide_bursts(true)
            .source(payload.bus_address())
            .dest(SET_BUS)
            .two_d(4, 2, 0, SET_CLEAR_GAP)?;

        Self::looping(svc, payload, cb, Layout::SetClearPair, 1)
    }

    /// Prepares a stream which writes `samples` copies of the register image
    /// for `mask` (setting, then clearing, the pins) per pass, forever.
    ///
    /// The control block copies one 16-byte image per row, for `samples`
    /// rows. The source keeps advancing through the images, while the
    /// destination stride of -16 rewinds to `GPSET0` after every row, so the
    /// destination is back where it started at the end of each pass.
    pub fn register_image(svc: &'svc S, mask: u32, samples: usize) -> Result<Self, Error> {
        // checked before allocating anything.
        let rows = u32::try_from(samples).unwrap_or(u32::MAX);
        if rows == 0 || rows > ControlBlock::MAX_Y_LEN {
            return Err(InvalidTransfer::YLengthOutOfRange(rows).into());
        }

        let mut payload =
            UncachedMemBlock::allocate(svc, samples * mem::size_of::<RegisterImage>())?;
        for idx in 0..samples {
            payload.write(
                idx * mem::size_of::<RegisterImage>(),
                RegisterImage::toggle(mask),
            );
        }

        let cb = ControlBlock::builder()
            .src_inc(true)
            .dest_inc(true)
            .no_wide_bursts(true)
            .source(payload.bus_address())
            .dest(SET_BUS)
            .two_d(IMAGE_LEN, rows, 0, -(IMAGE_LEN as i16))?;

        Self::looping(svc, payload, cb, Layout::RegisterImage, samples)
    }

    fn looping(
        svc: &'svc S,
        payload: UncachedMemBlock<'svc, S>,
        cb: ControlBlock,
        layout: Layout,
        samples: usize,
    ) -> Result<Self, Error> {
        let mut chain = ControlChain::allocate(svc, 1)?;
        chain.write(0, &cb);
        chain.self_loop(0);
        tracing::debug!(
            ?layout,
            samples,
            payload = %payload.bus_address(),
            cb = %chain.head(),
            "prepared GPIO stream"
        );
        Ok(Self {
            payload,
            chain,
            layout,
            samples,
        })
    }

    /// Returns the bus address of the stream's control block.
    #[must_use]
    pub fn head(&self) -> BusAddress {
        self.chain.head()
    }

    /// Returns a copy of the stream's control block.
    #[must_use]
    pub fn control_block(&self) -> ControlBlock {
        self.chain.read(0)
    }

    #[must_use]
    pub fn payload(&self) -> &UncachedMemBlock<'svc, S> {
        &self.payload
    }

    #[must_use]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Returns the number of set/clear operations per pass.
    #[must_use]
    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Returns the number of bytes written to the GPIO registers per pass.
    #[must_use]
    pub fn bytes_per_pass(&self) -> usize {
        match self.layout {
            Layout::SetClearPair => mem::size_of::<SetClear>(),
            Layout::RegisterImage => self.samples * mem::size_of::<RegisterImage>(),
        }
    }

    /// Releases the control block and the payload.
    pub fn release(self) -> Result<(), AllocError> {
        let chain = self.chain.release();
        let payload = self.payload.release();
        chain.and(payload)
    }
}

impl<S: MemService + ?Sized> DmaSource for GpioStream<'_, S> {
    fn head(&self) -> BusAddress {
        GpioStream::head(self)
    }
}

impl<S: MemService + ?Sized> fmt::Debug for GpioStream<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpioStream")
            .field("layout", &self.layout)
            .field("samples", &self.samples)
            .field("payload", &self.payload)
            .field("head", &self.head())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{Channel, ChannelState},
        gpio::CLR_BUS,
        sim::{BusWrite, DmaRegisters, Engine, SimMemory},
    };

    const MASK: u32 = 1 << 14;

    #[test]
    fn set_clear_pair_writes_both_registers_each_pass() {
        let mem = SimMemory::new();
        let stream = GpioStream::set_clear_pair(&mem, MASK).unwrap();

        let cb = stream.control_block();
        assert!(cb.is_2d());
        assert_eq!((cb.x_len(), cb.y_len()), (4, 2));
        assert_eq!((cb.src_stride(), cb.dest_stride()), (0, 8));
        assert_eq!(cb.next(), Some(stream.head()));

        let trace = Engine::new(&mem).run(stream.head(), 3).unwrap();
        assert_eq!(trace.next, Some(stream.head()));
        for step in &trace.steps {
            assert_eq!(
                step.writes,
                vec![
                    BusWrite {
                        addr: SET_BUS,
                        value: MASK
                    },
                    BusWrite {
                        addr: CLR_BUS,
                        value: MASK
                    },
                ]
            );
            assert_eq!(step.next, Some(stream.head()));
        }
        stream.release().unwrap();
        assert_eq!(mem.live_allocations(), 0);
    }

    #[test]
    fn register_image_rewinds_after_every_sample() {
        const SAMPLES: usize = 5;
        let mem = SimMemory::new();
        let stream = GpioStream::register_image(&mem, MASK, SAMPLES).unwrap();

        let cb = stream.control_block();
        assert_eq!((cb.x_len(), cb.y_len()), (16, SAMPLES as u32));
        assert_eq!((cb.src_stride(), cb.dest_stride()), (0, -16));
        assert_eq!(stream.bytes_per_pass(), SAMPLES * 16);

        let engine = Engine::new(&mem);
        for _ in 0..2 {
            let step = engine.step(stream.head()).unwrap();
            assert_eq!(step.writes.len(), SAMPLES * 4);
            for sample in step.writes.chunks(4) {
                let addrs: Vec<_> = sample.iter().map(|w| w.addr).collect();
                let values: Vec<_> = sample.iter().map(|w| w.value).collect();
                assert_eq!(
                    addrs,
                    vec![SET_BUS, SET_BUS + 4, SET_BUS + 8, CLR_BUS]
                );
                assert_eq!(values, vec![MASK, 0, 0, MASK]);
            }
            assert_eq!(step.dest_end, SET_BUS);
            assert_eq!(
                step.src_end,
                stream.payload().bus_address() + (SAMPLES * 16) as u32
            );
            assert_eq!(step.next, Some(stream.head()));
        }
    }

    #[test]
    fn register_image_sample_limits() {
        let mem = SimMemory::new();
        assert!(matches!(
            GpioStream::register_image(&mem, MASK, 0),
            Err(Error::Transfer(InvalidTransfer::YLengthOutOfRange(0)))
        ));
        assert!(matches!(
            GpioStream::register_image(&mem, MASK, 16385),
            Err(Error::Transfer(InvalidTransfer::YLengthOutOfRange(16385)))
        ));
        assert_eq!(mem.live_allocations(), 0);

        let stream = GpioStream::register_image(&mem, MASK, 16384).unwrap();
        assert_eq!(stream.control_block().y_len(), 16384);
    }

    #[test]
    fn launch_on_channel_5() {
        let mem = SimMemory::new();
        let dma = DmaRegisters::new();
        let stream = GpioStream::set_clear_pair(&mem, MASK).unwrap();
        let mut channel = Channel::new(&dma, 5);

        let transfer = channel.launch(stream).unwrap();
        assert_eq!(transfer.channel().state(), ChannelState::Running);
        let head = dma.active_control_block(5).unwrap();
        assert_eq!(head, transfer.source().head());

        let trace = Engine::new(&mem).run(head, 2).unwrap();
        let writes: Vec<_> = trace.writes().map(|w| w.addr).collect();
        assert_eq!(writes, vec![SET_BUS, CLR_BUS, SET_BUS, CLR_BUS]);

        let stream = transfer.stop();
        assert_eq!(channel.state(), ChannelState::Idle);
        assert_eq!(dma.active_control_block(5), None);
        stream.release().unwrap();
        assert_eq!(mem.live_allocations(), 0);
    }

    #[test]
    fn dropped_transfer_stops_before_freeing() {
        let mem = SimMemory::new();
        let dma = DmaRegisters::new();
        let mut channel = Channel::new(&dma, 5);
        let stream = GpioStream::set_clear_pair(&mem, MASK).unwrap();
        assert_eq!(mem.live_allocations(), 2);

        drop(channel.launch(stream).unwrap());
        assert_eq!(dma.active_control_block(5), None);
        assert_eq!(mem.live_allocations(), 0);
    }

    #[test]
    fn forgotten_transfer_leaks_its_memory() {
        let mem = SimMemory::new();
        let dma = DmaRegisters::new();
        let mut channel = Channel::new(&dma, 5);
        let stream = GpioStream::set_clear_pair(&mem, MASK).unwrap();
        let head = stream.head();

        core::mem::forget(channel.launch(stream).unwrap());

        // the engine can still read everything it was pointed at.
        assert_eq!(dma.active_control_block(5), Some(head));
        assert_eq!(mem.live_allocations(), 2);
        let step = Engine::new(&mem).step(head).unwrap();
        assert_eq!(step.next, Some(head));

        drop(channel);
        assert_eq!(dma.active_control_block(5), None);
    }
}
