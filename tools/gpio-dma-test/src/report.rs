use core::fmt;
use std::collections::BTreeMap;

use bcm_dma::{
    gpio::{CLR_OFFSET, SET_OFFSET},
    platform::offsets,
    sim::{BusWrite, RegisterWrite},
    BusAddress, Platform,
};
use owo_colors::{OwoColorize, Stream};

use crate::modes::Mode;

/// The GPIO register writes made during a `--dry-run`.
#[derive(Debug)]
pub(crate) struct Report {
    mode: Mode,
    passes: u32,
    setup: Vec<BusWrite>,
    writes: Vec<BusWrite>,
    next: Option<BusAddress>,
}

/// At most this many writes are listed individually.
const LISTED: usize = 16;

const GPIO_BUS: BusAddress = Platform::peripheral_bus(offsets::GPIO);

impl Report {
    pub(crate) fn new(mode: Mode, passes: u32) -> Self {
        Self {
            mode,
            passes,
            setup: Vec::new(),
            writes: Vec::new(),
            next: None,
        }
    }

    /// Records writes made by the CPU to a simulated GPIO register block.
    pub(crate) fn record_registers(&mut self, writes: impl IntoIterator<Item = RegisterWrite>) {
        for RegisterWrite { offset, value } in writes {
            let write = BusWrite {
                addr: GPIO_BUS + offset as u32,
                value,
            };
            if offset < SET_OFFSET {
                self.setup.push(write);
            } else {
                self.writes.push(write);
            }
        }
    }

    /// Records writes made by the simulated DMA engine, and where it would
    /// have continued.
    pub(crate) fn record_bus(
        &mut self,
        writes: impl IntoIterator<Item = BusWrite>,
        next: Option<BusAddress>,
    ) {
        self.writes.extend(writes);
        self.next = next;
    }

    /// Returns the writes made while configuring the pin.
    pub(crate) fn setup_writes(&self) -> impl Iterator<Item = &BusWrite> + '_ {
        self.setup.iter()
    }

    /// Returns the writes made by the test itself.
    pub(crate) fn gpio_writes(&self) -> impl Iterator<Item = &BusWrite> + '_ {
        self.writes.iter()
    }

    /// Returns `true` if the DMA transfer was still going when the
    /// simulation stopped.
    pub(crate) fn loops(&self) -> bool {
        self.next.is_some()
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            mode,
            passes,
            ref setup,
            ref writes,
            next,
        } = *self;

        writeln!(f, "{mode}")?;
        writeln!(f, "simulated {passes} pass(es)")?;

        writeln!(f, "{}", "pin setup:".if_supports_color(Stream::Stdout, |s| s.bold()))?;
        for write in setup {
            writeln!(f, "  {}", Line(write))?;
        }

        writeln!(
            f,
            "{} ({} total)",
            "writes:".if_supports_color(Stream::Stdout, |s| s.bold()),
            writes.len()
        )?;
        for write in writes.iter().take(LISTED) {
            writeln!(f, "  {}", Line(write))?;
        }
        if writes.len() > LISTED {
            writeln!(f, "  ... and {} more", writes.len() - LISTED)?;
        }

        let mut totals = BTreeMap::new();
        for write in writes {
            *totals.entry(write.addr).or_insert(0usize) += 1;
        }
        writeln!(
            f,
            "{}",
            "writes per register:".if_supports_color(Stream::Stdout, |s| s.bold())
        )?;
        for (addr, count) in totals {
            writeln!(f, "  {:<8} {count}", RegisterName(addr))?;
        }

        match next {
            Some(next) => write!(
                f,
                "the DMA engine would continue with the control block at {}",
                next.if_supports_color(Stream::Stdout, |s| s.bright_yellow())
            ),
            None => f.write_str("no transfer left running"),
        }
    }
}

struct Line<'a>(&'a BusWrite);

impl fmt::Display for Line<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let BusWrite { addr, value } = *self.0;
        let value = format!("{value:#010x}");
        write!(
            f,
            "{:<8} {addr} <- {}",
            RegisterName(addr),
            value.if_supports_color(Stream::Stdout, |v| v.bright_green())
        )
    }
}

struct RegisterName(BusAddress);

impl fmt::Display for RegisterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0.as_u32().checked_sub(GPIO_BUS.as_u32()) {
            Some(offset @ 0x00..=0x14) => return f.pad(&format!("GPFSEL{}", offset / 4)),
            Some(offset) if offset as usize == SET_OFFSET => "GPSET0",
            Some(offset) if offset as usize == SET_OFFSET + 4 => "GPSET1",
            Some(offset) if offset as usize == SET_OFFSET + 8 => "reserved",
            Some(offset) if offset as usize == CLR_OFFSET => "GPCLR0",
            Some(offset) if offset as usize == CLR_OFFSET + 4 => "GPCLR1",
            _ => "?",
        };
        f.pad(name)
    }
}
