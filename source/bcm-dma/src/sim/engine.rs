use core::mem;

use super::{SimError, SimMemory};
use crate::{
    addr::BusAddress,
    control_block::{ControlBlock, TransferInfo},
};

/// A simulated DMA engine.
///
/// The engine reads control blocks out of a [`SimMemory`] and performs their
/// transfers one 32-bit word at a time. Reads must come from simulated
/// memory. Writes to simulated memory are performed; every write, including
/// writes to addresses outside of simulated memory (such as peripheral
/// registers), is recorded as a [`BusWrite`].
#[derive(Debug)]
pub struct Engine<'mem> {
    mem: &'mem SimMemory,
}

/// A word written by the [`Engine`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BusWrite {
    pub addr: BusAddress,
    pub value: u32,
}

/// The result of processing a single control block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Step {
    /// The bus address of the control block.
    pub block: BusAddress,
    /// The writes made, in order.
    pub writes: Vec<BusWrite>,
    /// The source address counter after the transfer.
    pub src_end: BusAddress,
    /// The destination address counter after the transfer.
    pub dest_end: BusAddress,
    /// The block the engine continues with, if any.
    pub next: Option<BusAddress>,
}

/// The result of following a chain of control blocks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Trace {
    /// Each control block processed, in order.
    pub steps: Vec<Step>,
    /// The block the engine would continue with, if it wasn't stopped.
    pub next: Option<BusAddress>,
}

impl<'mem> Engine<'mem> {
    #[must_use]
    pub fn new(mem: &'mem SimMemory) -> Self {
        Self { mem }
    }

    /// Reads the control block at `addr`.
    pub fn control_block(&self, addr: BusAddress) -> Result<ControlBlock, SimError> {
        if addr.as_u32() as usize % mem::align_of::<ControlBlock>() != 0 {
            return Err(SimError::MisalignedControlBlock(addr));
        }
        let ptr = self
            .mem
            .translate(addr, ControlBlock::SIZE)
            .ok_or(SimError::UnmappedControlBlock(addr))?;
        Ok(unsafe { ptr.cast::<ControlBlock>().as_ptr().read_volatile() })
    }

    /// Processes the control block at `addr`.
    pub fn step(&self, addr: BusAddress) -> Result<Step, SimError> {
        let cb = self.control_block(addr)?;
        let info = cb.info();
        let x_len = cb.x_len();
        if x_len % 4 != 0 {
            return Err(SimError::UnalignedLength {
                block: addr,
                len: x_len,
            });
        }

        let src_inc = info.get(TransferInfo::SRC_INC);
        let dest_inc = info.get(TransferInfo::DEST_INC);
        let src_ignore = info.get(TransferInfo::SRC_IGNORE);
        let dest_ignore = info.get(TransferInfo::DEST_IGNORE);

        let mut src = cb.source();
        let mut dest = cb.dest();
        let mut writes = Vec::with_capacity((x_len / 4 * cb.y_len()) as usize);
        for _ in 0..cb.y_len() {
            for _ in 0..x_len / 4 {
                let value = if src_ignore {
                    0
                } else {
                    self.mem
                        .read_word(src)
                        .ok_or(SimError::UnmappedSource(src))?
                };
                if !dest_ignore {
                    self.mem.write_word(dest, value);
                    writes.push(BusWrite { addr: dest, value });
                }
                if src_inc {
                    src = src.wrapping_offset(4);
                }
                if dest_inc {
                    dest = dest.wrapping_offset(4);
                }
            }

            if cb.is_2d() {
                src = src.wrapping_offset(cb.src_stride().into());
                dest = dest.wrapping_offset(cb.dest_stride().into());
            }
        }

        tracing::trace!(block = %addr, writes = writes.len(), next = ?cb.next(), "sim: processed control block");
        Ok(Step {
            block: addr,
            writes,
            src_end: src,
            dest_end: dest,
            next: cb.next(),
        })
    }

    /// Follows the chain of control blocks starting at `head`, processing at
    /// most `max_blocks` of them.
    ///
    /// Self-looping and cyclic chains never end on their own, so `max_blocks`
    /// bounds how many passes are simulated.
    pub fn run(&self, head: BusAddress, max_blocks: usize) -> Result<Trace, SimError> {
        let mut trace = Trace {
            steps: Vec::new(),
            next: Some(head),
        };
        while trace.steps.len() < max_blocks {
            let Some(addr) = trace.next else {
                break;
            };
            let step = self.step(addr)?;
            trace.next = step.next;
            trace.steps.push(step);
        }
        Ok(trace)
    }
}

impl Trace {
    /// Returns every write made, in order.
    pub fn writes(&self) -> impl Iterator<Item = &BusWrite> + '_ {
        self.steps.iter().flat_map(|step| step.writes.iter())
    }

    /// Returns `true` if the chain ended on its own.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.next.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{control_block::ControlChain, mem::UncachedMemBlock};

    #[test]
    fn linear_copy_between_blocks() {
        let mem = SimMemory::new();
        let mut src = UncachedMemBlock::allocate(&mem, 16).unwrap();
        let dest = UncachedMemBlock::allocate(&mem, 16).unwrap();
        src.write_slice(0, &[1u32, 2, 3, 4]);

        let mut chain = ControlChain::allocate(&mem, 1).unwrap();
        let cb = ControlBlock::builder()
            .src_inc(true)
            .dest_inc(true)
            .source(src.bus_address())
            .dest(dest.bus_address())
            .linear(16)
            .unwrap();
        chain.write(0, &cb);

        let trace = Engine::new(&mem).run(chain.head(), 8).unwrap();
        assert!(trace.is_finished());
        assert_eq!(trace.steps.len(), 1);
        assert_eq!(trace.writes().count(), 4);
        assert_eq!(dest.read::<[u32; 4]>(0), [1, 2, 3, 4]);
    }

    #[test]
    fn unmapped_source() {
        let mem = SimMemory::new();
        let mut chain = ControlChain::allocate(&mem, 1).unwrap();
        let src = BusAddress::new(0x7E20_0034);
        let cb = ControlBlock::builder()
            .source(src)
            .dest(BusAddress::new(0x7E20_001C))
            .linear(4)
            .unwrap();
        chain.write(0, &cb);
        assert_eq!(
            Engine::new(&mem).step(chain.head()),
            Err(SimError::UnmappedSource(src))
        );
    }

    #[test]
    fn misaligned_and_unmapped_blocks() {
        let mem = SimMemory::new();
        let engine = Engine::new(&mem);
        let addr = BusAddress::new(0xC010_0004);
        assert_eq!(
            engine.step(addr),
            Err(SimError::MisalignedControlBlock(addr))
        );
        let addr = BusAddress::new(0xC800_0000);
        assert_eq!(engine.step(addr), Err(SimError::UnmappedControlBlock(addr)));
    }

    #[test]
    fn cycles_are_bounded() {
        let mem = SimMemory::new();
        let src = UncachedMemBlock::allocate(&mem, 4).unwrap();
        let mut chain = ControlChain::allocate(&mem, 3).unwrap();
        let cb = ControlBlock::builder()
            .source(src.bus_address())
            .dest(BusAddress::new(0x7E20_001C))
            .linear(4)
            .unwrap();
        for i in 0..3 {
            chain.write(i, &cb);
        }
        chain.cycle();

        let trace = Engine::new(&mem).run(chain.head(), 7).unwrap();
        assert!(!trace.is_finished());
        let blocks: Vec<_> = trace.steps.iter().map(|step| step.block).collect();
        let expected: Vec<_> = (0..7).map(|i| chain.bus_address(i % 3)).collect();
        assert_eq!(blocks, expected);
        assert_eq!(trace.next, Some(chain.bus_address(1)));
    }
}
