use clap::Parser;
use tracing::level_filters::LevelFilter;

mod modes;
mod report;
mod stop;

use self::modes::{Mode, Settings, MODES_HELP};

/// Toggles a GPIO pin as fast as possible using the CPU or the DMA engine,
/// to compare how fast each can write to the GPIO registers.
///
/// Each mode runs until <RETURN> is pressed. The DMA modes keep the DMA
/// engine running if the process is killed instead, so prefer <RETURN>.
#[derive(Debug, Parser)]
#[command(author, version, about, after_help = MODES_HELP)]
struct Args {
    /// Which test to run, from 1 to 5 (see below).
    mode: Mode,

    #[clap(flatten)]
    settings: Settings,

    /// Run the test against a simulated GPIO block and DMA engine, and print
    /// the writes it makes, instead of touching hardware.
    #[arg(long)]
    dry_run: bool,

    /// a comma-separated list of `tracing` targets and levels to enable.
    ///
    /// for example, `info,bcm_dma=debug,bcm_dma::sim=trace` will enable:
    ///
    /// - the `INFO` level globally (regardless of module path),
    /// - the `DEBUG` level for all modules in the `bcm_dma` crate,
    /// - and the `TRACE` level for the simulator.
    ///
    /// see <https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/targets/struct.Targets.html#filtering-with-targets>
    /// for more details on this syntax.
    #[arg(
        short,
        long = "trace",
        env = "GPIO_DMA_TRACE",
        default_value_t = tracing_subscriber::filter::Targets::new().with_default(LevelFilter::INFO),
    )]
    trace_filter: tracing_subscriber::filter::Targets,
}

fn main() -> miette::Result<()> {
    use tracing_subscriber::prelude::*;

    let Args {
        mode,
        settings,
        dry_run,
        trace_filter,
    } = Args::parse();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_writer(std::io::stderr),
        )
        .with(trace_filter)
        .init();

    if dry_run {
        let report = mode.dry_run(&settings)?;
        println!("{report}");
        return Ok(());
    }

    mode.run(&settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bcm_dma::{stream::Layout, Platform};
    use clap::{error::ErrorKind, CommandFactory};

    fn parse(args: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("gpio-dma-test").chain(args.iter().copied()))
    }

    #[test]
    fn command_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn defaults() {
        let args = parse(&["5"]).unwrap();
        assert_eq!(args.mode, Mode::Dma(Layout::RegisterImage));
        assert_eq!(args.settings.pin, 14);
        assert_eq!(args.settings.channel, 5);
        assert_eq!(args.settings.samples, 256);
        assert_eq!(args.settings.passes, 2);
        assert!(!args.dry_run);
    }

    #[test]
    fn overrides() {
        let args = parse(&[
            "4",
            "--platform",
            "pi1",
            "--pin",
            "18",
            "--channel",
            "14",
            "--dry-run",
        ])
        .unwrap();
        assert_eq!(args.mode, Mode::Dma(Layout::SetClearPair));
        assert_eq!(args.settings.platform, Platform::Pi1);
        assert_eq!(args.settings.pin, 18);
        assert_eq!(args.settings.channel, 14);
        assert!(args.dry_run);
    }

    #[test]
    fn missing_mode() {
        let err = parse(&[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn invalid_modes() {
        for mode in ["0", "6", "42", "five"] {
            let err = parse(&[mode]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ValueValidation, "mode {mode:?}");
        }
    }

    #[test]
    fn out_of_range_settings() {
        for args in [
            &["1", "--pin", "32"][..],
            &["4", "--channel", "15"][..],
            &["5", "--samples", "0"][..],
            &["5", "--samples", "16385"][..],
            &["5", "--platform", "pi5"][..],
        ] {
            let err = parse(args).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ValueValidation, "args {args:?}");
        }
    }

    #[test]
    fn help_lists_every_mode() {
        let help = Args::command().render_long_help().to_string();
        for mode in Mode::ALL {
            assert!(
                help.contains(&format!("{} - ", mode.number())),
                "mode {mode} missing from help"
            );
        }
    }
}
