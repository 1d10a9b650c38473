use core::{fmt, str::FromStr};
use std::time::Instant;

use bcm_dma::{
    gpio::{Gpio, Pin, SetClear},
    mailbox::Mailbox,
    mmio::{Mmio, RegisterWindow},
    platform::offsets,
    sim::{DmaRegisters, Engine, RegisterFile, SimMemory},
    stream::{GpioStream, Layout},
    Channel, MemService, Platform, PAGE_SIZE,
};
use miette::{Context, IntoDiagnostic};

use crate::{report::Report, stop::StopSignal};

/// Which test to run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Mode {
    /// The CPU writes to the GPIO registers itself.
    Cpu(CpuTest),
    /// The DMA engine loops over a [`GpioStream`] with the given layout.
    Dma(Layout),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum CpuTest {
    /// Set and clear the pin in a tight loop.
    Direct,
    /// Read data words from memory and write the pin's bit of each to the set
    /// or clear register.
    Masked,
    /// Read prepared set/clear pairs from memory.
    SetClear,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct InvalidMode(String);

/// Shown after `--help`.
pub(crate) const MODES_HELP: &str = "\
Test modes:
  == Baseline tests, using the CPU directly ==
  1 - CPU: write to the GPIO registers directly in a tight loop
  2 - CPU: read words from memory, write the masked bits to GPIO set/clear
  3 - CPU: read prepared set/clear pairs from memory, write them to GPIO
  == DMA tests, using DMA to pump data to the GPIO registers ==
  4 - DMA: one control block per set/clear pair
  5 - DMA: a sequence of set/clear register images in one control block, with a negative destination stride";

/// Settings shared by every mode.
#[derive(Clone, Debug, clap::Args)]
pub(crate) struct Settings {
    /// The board to run on.
    ///
    /// `pi1` (also `zero`) for the BCM2835, `pi2` (also `pi3`) for the BCM2836
    /// and BCM2837.
    #[arg(long, env = "GPIO_DMA_PLATFORM", default_value_t = Platform::DEFAULT)]
    pub(crate) platform: Platform,

    /// The GPIO pin to toggle, in the first bank.
    #[arg(long, default_value_t = 14, value_parser = clap::value_parser!(u8).range(0..32))]
    pub(crate) pin: u8,

    /// The DMA channel to use in modes 4 and 5.
    #[arg(
        long,
        env = "GPIO_DMA_CHANNEL",
        default_value_t = 5,
        value_parser = clap::value_parser!(u8).range(0..15),
    )]
    pub(crate) channel: u8,

    /// The number of samples to prepare in memory, for modes 2, 3 and 5.
    #[arg(long, default_value_t = 256, value_parser = clap::value_parser!(u32).range(1..=16384))]
    pub(crate) samples: u32,

    /// The number of passes to simulate with `--dry-run`.
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u32).range(1..))]
    pub(crate) passes: u32,
}

// === impl Mode ===

impl Mode {
    pub(crate) const ALL: [Self; 5] = [
        Self::Cpu(CpuTest::Direct),
        Self::Cpu(CpuTest::Masked),
        Self::Cpu(CpuTest::SetClear),
        Self::Dma(Layout::SetClearPair),
        Self::Dma(Layout::RegisterImage),
    ];

    pub(crate) fn number(self) -> u8 {
        match self {
            Self::Cpu(CpuTest::Direct) => 1,
            Self::Cpu(CpuTest::Masked) => 2,
            Self::Cpu(CpuTest::SetClear) => 3,
            Self::Dma(Layout::SetClearPair) => 4,
            Self::Dma(Layout::RegisterImage) => 5,
        }
    }

    pub(crate) fn description(self) -> &'static str {
        match self {
            Self::Cpu(CpuTest::Direct) => "CPU: writing to GPIO directly in a tight loop",
            Self::Cpu(CpuTest::Masked) => {
                "CPU: reading words from memory, writing them masked to GPIO set/clear"
            }
            Self::Cpu(CpuTest::SetClear) => {
                "CPU: reading prepared set/clear pairs from memory, writing them to GPIO"
            }
            Self::Dma(Layout::SetClearPair) => "DMA: single control block per set/clear pair",
            Self::Dma(Layout::RegisterImage) => {
                "DMA: sequence of set/clear register images in one control block, with a negative destination stride"
            }
        }
    }

    /// Runs the test on hardware until the operator stops it.
    pub(crate) fn run(self, settings: &Settings) -> miette::Result<()> {
        let Settings { platform, .. } = *settings;
        let pin = settings.pin()?;
        tracing::debug!(%platform, %pin, "running mode {self}");

        let gpio_regs = RegisterWindow::map_page(platform.peripheral(offsets::GPIO))
            .into_diagnostic()
            .context("failed to map the GPIO registers (are we root?)")?;
        let gpio = Gpio::new(gpio_regs);
        gpio.set_output(pin);

        let mut stop = StopSignal::spawn()
            .into_diagnostic()
            .context("failed to start reading stdin")?;

        println!("{self}\n== Press <RETURN> to exit.");
        match self {
            Self::Cpu(test) => {
                let started = Instant::now();
                let passes = test.run(&gpio, pin.mask(), settings.samples(), || {
                    !stop.requested()
                });
                let elapsed = started.elapsed();
                let samples = passes * settings.samples() as u64;
                tracing::info!(passes, samples, ?elapsed, "stopped");
                println!(
                    "{samples} samples in {elapsed:.2?} ({:.0} samples/s)",
                    samples as f64 / elapsed.as_secs_f64()
                );
            }
            Self::Dma(layout) => {
                let mbox = Mailbox::init_global(platform)
                    .into_diagnostic()
                    .context("failed to open the VideoCore mailbox")?;
                let stream = prepare(layout, mbox, pin, settings.samples())?;

                let dma_regs = RegisterWindow::map_page(platform.peripheral(offsets::DMA))
                    .into_diagnostic()
                    .context("failed to map the DMA controller's registers")?;
                let mut channel = Channel::new(dma_regs, settings.channel);
                let transfer = channel
                    .launch(stream)
                    .into_diagnostic()
                    .context("failed to start the DMA channel")?;

                // the DMA engine is on its own from here on.
                stop.wait();

                transfer
                    .stop()
                    .release()
                    .into_diagnostic()
                    .context("failed to release DMA memory")?;
            }
        }
        Ok(())
    }

    /// Runs the test against simulated hardware for `settings.passes`
    /// passes, and returns every write made to the GPIO registers.
    pub(crate) fn dry_run(self, settings: &Settings) -> miette::Result<Report> {
        let Settings {
            platform, passes, ..
        } = *settings;
        let pin = settings.pin()?;
        tracing::debug!(%platform, %pin, passes, "simulating mode {self}");

        let gpio_regs = RegisterFile::new(PAGE_SIZE);
        let gpio = Gpio::new(&gpio_regs);
        gpio.set_output(pin);

        let mut report = Report::new(self, passes);
        report.record_registers(gpio_regs.take_writes());
        match self {
            Self::Cpu(test) => {
                let mut remaining = passes;
                test.run(&gpio, pin.mask(), settings.samples(), || {
                    let more = remaining > 0;
                    remaining = remaining.saturating_sub(1);
                    more
                });
                report.record_registers(gpio_regs.take_writes());
            }
            Self::Dma(layout) => {
                let mem = SimMemory::for_platform(platform, SimMemory::DEFAULT_CAPACITY);
                let dma = DmaRegisters::new();
                let stream = prepare(layout, &mem, pin, settings.samples())?;

                let mut channel = Channel::new(&dma, settings.channel);
                let transfer = channel.launch(stream).into_diagnostic()?;
                let head = dma
                    .active_control_block(settings.channel)
                    .ok_or_else(|| {
                        miette::miette!("DMA channel {} did not start", settings.channel)
                    })?;
                let trace = Engine::new(&mem)
                    .run(head, passes as usize)
                    .into_diagnostic()
                    .context("simulated DMA transfer failed")?;
                report.record_bus(trace.writes().copied(), trace.next);

                transfer.stop().release().into_diagnostic()?;
            }
        }
        Ok(report)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}) {}", self.number(), self.description())
    }
}

impl FromStr for Mode {
    type Err = InvalidMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let num = s.trim().parse::<u8>().map_err(|_| InvalidMode(s.to_owned()))?;
        Self::ALL
            .into_iter()
            .find(|mode| mode.number() == num)
            .ok_or_else(|| InvalidMode(s.to_owned()))
    }
}

// === impl CpuTest ===

impl CpuTest {
    /// Runs passes of `samples` writes each, for as long as `keep_going`
    /// returns `true`, and returns the number of passes made.
    fn run<W: Mmio>(
        self,
        gpio: &Gpio<W>,
        mask: u32,
        samples: usize,
        mut keep_going: impl FnMut() -> bool,
    ) -> u64 {
        let words: Vec<u32> = match self {
            Self::Masked => (0..samples)
                .map(|i| if i % 2 == 0 { mask } else { 0 })
                .collect(),
            _ => Vec::new(),
        };
        let pairs = match self {
            Self::SetClear => vec![SetClear::toggle(mask); samples],
            _ => Vec::new(),
        };

        let mut passes = 0;
        while keep_going() {
            match self {
                Self::Direct => {
                    for _ in 0..samples {
                        gpio.set(mask);
                        gpio.clear(mask);
                    }
                }
                Self::Masked => {
                    for &word in &words {
                        gpio.write_masked(word, mask);
                    }
                }
                Self::SetClear => {
                    for &pair in &pairs {
                        gpio.write_pair(pair);
                    }
                }
            }
            passes += 1;
        }
        passes
    }
}

// === impl Settings ===

impl Settings {
    fn pin(&self) -> miette::Result<Pin> {
        Pin::new(self.pin)
            .ok_or_else(|| miette::miette!("GPIO{} is not in the first bank", self.pin))
    }

    fn samples(&self) -> usize {
        self.samples as usize
    }
}

// === impl InvalidMode ===

impl fmt::Display for InvalidMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` is not a test mode; expected a number from 1 to 5", self.0)
    }
}

impl std::error::Error for InvalidMode {}

fn prepare<S: MemService + ?Sized>(
    layout: Layout,
    svc: &S,
    pin: Pin,
    samples: usize,
) -> miette::Result<GpioStream<'_, S>> {
    let stream = match layout {
        Layout::SetClearPair => GpioStream::set_clear_pair(svc, pin.mask()),
        Layout::RegisterImage => GpioStream::register_image(svc, pin.mask(), samples),
    };
    stream
        .into_diagnostic()
        .context("failed to prepare the DMA payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bcm_dma::{gpio::SET_BUS, sim::RegisterWrite};

    #[test]
    fn modes_round_trip_through_their_numbers() {
        for mode in Mode::ALL {
            assert_eq!(mode.number().to_string().parse::<Mode>(), Ok(mode));
        }
        assert!("0".parse::<Mode>().is_err());
        assert!("6".parse::<Mode>().is_err());
        assert!("five".parse::<Mode>().is_err());
    }

    #[test]
    fn masked_test_alternates_set_and_clear() {
        let regs = RegisterFile::new(PAGE_SIZE);
        let gpio = Gpio::new(&regs);
        let mut passes = 0;
        let made = CpuTest::Masked.run(&gpio, 1 << 14, 4, || {
            passes += 1;
            passes <= 1
        });
        assert_eq!(made, 1);
        let offsets: Vec<_> = regs.take_writes().iter().map(|w| w.offset).collect();
        assert_eq!(offsets, vec![0x1C, 0x28, 0x1C, 0x28]);
    }

    #[test]
    fn set_clear_test_writes_pairs() {
        let regs = RegisterFile::new(PAGE_SIZE);
        let gpio = Gpio::new(&regs);
        let mut passes = 0;
        CpuTest::SetClear.run(&gpio, 0b100, 2, || {
            passes += 1;
            passes <= 2
        });
        assert_eq!(
            regs.take_writes(),
            [0x1C, 0x28]
                .repeat(4)
                .into_iter()
                .map(|offset| RegisterWrite { offset, value: 0b100 })
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn dry_run_dma_modes() {
        let settings = Settings {
            platform: Platform::Pi2,
            pin: 14,
            channel: 5,
            samples: 3,
            passes: 2,
        };

        let report = Mode::Dma(Layout::SetClearPair).dry_run(&settings).unwrap();
        assert_eq!(report.gpio_writes().count(), 4);
        assert!(report.loops());

        let report = Mode::Dma(Layout::RegisterImage).dry_run(&settings).unwrap();
        assert_eq!(report.gpio_writes().count(), 2 * 3 * 4);
        assert_eq!(report.gpio_writes().next().map(|w| w.addr), Some(SET_BUS));
        assert!(report.loops());
    }

    #[test]
    fn dry_run_cpu_modes() {
        let settings = Settings {
            platform: Platform::Pi1,
            pin: 4,
            channel: 5,
            samples: 8,
            passes: 3,
        };
        let report = Mode::Cpu(CpuTest::Direct).dry_run(&settings).unwrap();
        // two writes to configure the pin, then 3 passes of 8 toggles.
        assert_eq!(report.setup_writes().count(), 2);
        assert_eq!(report.gpio_writes().count(), 3 * 8 * 2);
        assert!(!report.loops());
    }
}
