// SPDX-License-Identifier: AGPL-3.0-only

//! `fpga-filter` — command-line front end for the ADM-XRC2 image filter.
//!
//! ```text
//! USAGE:
//!   fpga-filter -i <bitstream> run [--image-size middle] [--colored]
//!   fpga-filter -i <bitstream> selftest     Loopback and trigger check
//!   fpga-filter -i <bitstream> info         Card and bank table
//!   fpga-filter -i <bitstream> bench        DMA throughput
//! ```
//!
//! `--simulate` runs everything against the simulated card.

mod pipeline;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use filter_driver::{
    run_trigger_protocol, Admxrc2Card, BackendSelection, BringUpConfig, CardDriver, Communicator,
    Converter, ImageSize, Interpolation, PointerRelay, ProtocolTiming, SimulatedCard,
};
use pipeline::{LoopOptions, Source};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fpga-filter", about = "ADM-XRC2 image filter accelerator", version)]
struct Cli {
    #[command(flatten)]
    card: CardArgs,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Args)]
struct CardArgs {
    /// Bitstream to configure the FPGA with.
    #[arg(short = 'i', long = "bitstream", alias = "filename", env = "FILTER_BITSTREAM")]
    bitstream: PathBuf,

    /// Local (circuit) clock in MHz, 24.0 to 66.0.
    #[arg(long, default_value_t = 40.0, env = "FILTER_FREQUENCY")]
    frequency: f64,

    /// Memory clock in MHz.
    #[arg(long, default_value_t = 66.67, env = "FILTER_MEMORY_CLOCK")]
    memory_clock: f64,

    /// Banks that must lock and train after the memory reset.
    #[arg(long, default_value_t = filter_driver::DEFAULT_MEMORY_BANKS)]
    memory_banks: u32,

    /// Card backend (admxrc2, simulated).
    #[arg(long, default_value = "admxrc2", env = "FILTER_BACKEND")]
    backend: BackendSelection,

    /// Shorthand for `--backend simulated`.
    #[arg(long)]
    simulate: bool,

    /// Vendor driver library to load instead of the default.
    #[arg(long, env = "ADMXRC2_LIBRARY")]
    library: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Filter frames until the input ends or `q` is typed.
    Run(RunArgs),
    /// Loop back 32 words through bank 0, then trigger three 32-byte passes.
    Selftest,
    /// Print card information and the bank table.
    Info,
    /// Measure paged DMA throughput on bank 0.
    Bench {
        /// Bytes per transfer.
        #[arg(long, default_value_t = 4 << 20)]
        bytes: usize,
        /// Write/read round trips.
        #[arg(long, default_value_t = 10)]
        iterations: u32,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Plane geometry: small, middle, large or WIDTHxHEIGHT.
    #[arg(long, default_value = "middle")]
    image_size: ImageSize,

    /// Filter every color channel instead of luma only.
    #[arg(long)]
    colored: bool,

    /// Resampling used when the capture size differs.
    #[arg(long, value_enum, default_value_t = InterpolationArg::Linear)]
    interpolation: InterpolationArg,

    /// Save the converted capture next to each filtered frame.
    #[arg(long)]
    with_captured: bool,

    /// Raw interleaved frames to read; a generated pattern otherwise.
    #[arg(long)]
    input: Option<PathBuf>,

    /// Geometry of the raw input frames (defaults to --image-size).
    #[arg(long)]
    input_size: Option<ImageSize>,

    /// Channels per input pixel.
    #[arg(long, default_value_t = 3)]
    channels: usize,

    /// Stop after this many frames.
    #[arg(long)]
    frames: Option<u64>,

    /// Save every filtered frame, not only on `p`.
    #[arg(long)]
    save: bool,

    /// Directory for saved frames.
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Finish polls before a frame is skipped.
    #[arg(long, default_value_t = filter_driver::trigger::DEFAULT_POLL_LIMIT)]
    poll_limit: u32,
}

#[derive(Clone, Copy, ValueEnum)]
enum InterpolationArg {
    Nearest,
    Linear,
}

impl From<InterpolationArg> for Interpolation {
    fn from(arg: InterpolationArg) -> Self {
        match arg {
            InterpolationArg::Nearest => Self::Nearest,
            InterpolationArg::Linear => Self::Linear,
        }
    }
}

impl RunArgs {
    fn converter(&self) -> Converter {
        let size = self.image_size;
        let interpolation = self.interpolation.into();
        match (self.colored, self.channels) {
            (false, _) => Converter::Grayscale { size, interpolation },
            (true, 1) => Converter::ColorExpand { size, interpolation },
            (true, _) => Converter::Resize { size, interpolation },
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let backend = if cli.card.simulate {
        BackendSelection::Simulated
    } else {
        cli.card.backend
    };

    match backend {
        BackendSelection::Simulated => dispatch(SimulatedCard::default(), &cli),
        BackendSelection::Admxrc2 => {
            let card = match &cli.card.library {
                Some(path) => Admxrc2Card::load_from(path)?,
                None => Admxrc2Card::load()?,
            };
            dispatch(card, &cli)
        }
    }
}

fn dispatch<D: CardDriver>(driver: D, cli: &Cli) -> Result<()> {
    let buffer_size = match &cli.command {
        Cmd::Run(args) => args.image_size.area(),
        Cmd::Selftest | Cmd::Info => SELFTEST_WORDS * 4,
        Cmd::Bench { bytes, .. } => *bytes,
    };

    let config = BringUpConfig::new(cli.card.frequency, &cli.card.bitstream, buffer_size)
        .with_memory_clock(cli.card.memory_clock)
        .with_memory_banks(cli.card.memory_banks);

    info!("Configuring {}", cli.card.bitstream.display());
    let mut com = Communicator::open(driver, &config).context("bring-up failed")?;
    info!("Configured ({:?} backend)", com.backend_type());

    match &cli.command {
        Cmd::Run(args) => cmd_run(&mut com, args),
        Cmd::Selftest => cmd_selftest(&mut com),
        Cmd::Info => {
            cmd_info(&com);
            Ok(())
        }
        Cmd::Bench { bytes, iterations } => cmd_bench(&mut com, *bytes, *iterations),
    }
}

fn cmd_run<D: CardDriver>(com: &mut Communicator<D>, args: &RunArgs) -> Result<()> {
    let input_size = args.input_size.unwrap_or(args.image_size);
    let mut source = Source::open(args.input.as_deref(), input_size, args.channels)?;

    let options = LoopOptions {
        converter: args.converter(),
        timing: ProtocolTiming::default().with_poll_limit(args.poll_limit),
        frames: args.frames,
        save_all: args.save,
        with_captured: args.with_captured,
        output_dir: args.output_dir.clone(),
    };

    let relay = Arc::new(PointerRelay::new());
    let console = pipeline::spawn_console(Arc::clone(&relay));

    let stats = pipeline::run_loop(com, &mut source, &options, &relay, Some(&console))?;
    println!(
        "{} frames, {} skipped, {} saved",
        stats.frames, stats.skipped, stats.saved
    );
    Ok(())
}

const SELFTEST_WORDS: usize = 32;

fn cmd_selftest<D: CardDriver>(com: &mut Communicator<D>) -> Result<()> {
    let src: Vec<u32> = (0..SELFTEST_WORDS as u32).collect();
    println!("src: {src:?}");

    com.write(0, 0, bytemuck::cast_slice(&src))?;
    let mut dst = vec![0u32; SELFTEST_WORDS];
    com.read(0, 0, bytemuck::cast_slice_mut(&mut dst))?;
    println!("dst: {dst:?}");

    if dst != src {
        bail!("bank 0 loopback mismatch");
    }
    println!("Loopback        : ok");

    let input: &[u8] = bytemuck::cast_slice(&src);
    let size = SELFTEST_WORDS;
    for pass in 1..=3 {
        let mut output = vec![0u8; size];
        match run_trigger_protocol(com, input, &mut output, size, filter_driver::trigger::DEFAULT_POLL_LIMIT) {
            Ok(polls) => println!("Pass {pass}          : {polls} polls, out {output:?}"),
            Err(e) if e.is_per_frame() => warn!("Pass {pass} failed: {e}"),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn cmd_info<D: CardDriver>(com: &Communicator<D>) {
    let card = com.card_info();
    println!("Backend      : {:?}", com.backend_type());
    println!("Board type   : {:#x}", card.board_type);
    println!("FPGA type    : {:#x}", card.fpga_type);
    println!("Serial       : {}", card.serial);
    println!("RAM banks    : {} (fitted mask {:#06b})", card.ram_banks, card.banks_fitted);
    println!("Local clock  : {:.3} MHz", com.local_clock_hz() / 1e6);
    if let Some(hz) = com.memory_clock_hz() {
        println!("Memory clock : {:.3} MHz", hz / 1e6);
    }
    println!("DMA mode     : {:#x}", com.dma_mode());
    println!();

    for (bank, info) in com.bank_table().fitted() {
        println!(
            "  bank {bank}  type {:#06x}  {:>2}-bit  {:>6} KiB",
            info.kind,
            info.width,
            info.size_bytes() / 1024
        );
    }
}

#[allow(clippy::cast_precision_loss)]
fn cmd_bench<D: CardDriver>(com: &mut Communicator<D>, bytes: usize, iterations: u32) -> Result<()> {
    let data: Vec<u8> = (0..bytes).map(|i| (i % 251) as u8).collect();
    let mut back = vec![0u8; bytes];
    let mut write_secs = 0.0;
    let mut read_secs = 0.0;

    for _ in 0..iterations {
        let t0 = Instant::now();
        com.write(0, 0, &data)?;
        write_secs += t0.elapsed().as_secs_f64();

        let t0 = Instant::now();
        com.read(0, 0, &mut back)?;
        read_secs += t0.elapsed().as_secs_f64();

        if back != data {
            bail!("bank 0 read back differs from what was written");
        }
    }

    let total_mb = bytes as f64 * f64::from(iterations) / 1e6;
    let rate = |secs: f64| if secs > 0.0 { total_mb / secs } else { 0.0 };
    println!("Transfer     : {bytes} bytes × {iterations}");
    println!("host→card    : {:.1} MB/s", rate(write_secs));
    println!("card→host    : {:.1} MB/s", rate(read_secs));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_reference_options() {
        let cli = Cli::try_parse_from([
            "fpga-filter",
            "-i",
            "filter.bit",
            "--simulate",
            "run",
            "--image-size",
            "small",
            "--colored",
            "--interpolation",
            "nearest",
        ])
        .unwrap();

        assert!(cli.card.simulate);
        assert!((cli.card.frequency - 40.0).abs() < f64::EPSILON);
        let Cmd::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.image_size, ImageSize::SMALL);
        assert_eq!(
            args.converter(),
            Converter::Resize {
                size: ImageSize::SMALL,
                interpolation: Interpolation::Nearest
            }
        );
    }

    #[test]
    fn bad_image_size_is_rejected() {
        let parsed = Cli::try_parse_from(["fpga-filter", "-i", "f.bit", "run", "--image-size", "huge"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn selftest_passes_on_simulated_card() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"bitstream").unwrap();
        let config = BringUpConfig::new(40.0, file.path(), SELFTEST_WORDS * 4)
            .with_timing(filter_driver::BringUpTiming::immediate());
        let mut com = Communicator::open(SimulatedCard::default(), &config).unwrap();

        cmd_selftest(&mut com).unwrap();
        cmd_bench(&mut com, SELFTEST_WORDS * 4, 2).unwrap();
    }
}
