#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::fs;
use std::io::{BufWriter, Cursor};
use std::path::PathBuf;

use anyhow::{bail, Context};
use indicatif::{ProgressBar, ProgressStyle};

use zigate_uart_loader::protocol::ZIGATE_BINARY_VERSION;
use zigate_uart_loader::{FlashSession, LazyFile, Options, Programmer, Progress};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// File to save the existing flash contents to
    #[structopt(long, default_value = "/tmp/old_flash.bin")]
    dump: PathBuf,

    /// Firmware image to write
    #[structopt(long, default_value = "/tmp/new_flash.bin")]
    image: PathBuf,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

/// Progress bar for flash reads and writes
struct Bar(Option<ProgressBar>);

impl Progress for Bar {
    fn start(&mut self, label: &str, total: u64) {
        let pb = ProgressBar::new(total);
        pb.set_style(ProgressStyle::default_bar()
            .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .progress_chars("=>-"));
        pb.set_message(label);
        self.0 = Some(pb);
    }

    fn set_length(&mut self, total: u64) {
        if let Some(pb) = &self.0 {
            pb.set_length(total);
        }
    }

    fn set_position(&mut self, position: u64) {
        if let Some(pb) = &self.0 {
            pb.set_position(position);
        }
    }

    fn finish(&mut self) {
        if let Some(pb) = self.0.take() {
            pb.finish();
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let Args { port, dump, image, options, .. } = args;

    // Check the image before touching the device
    let image_data = fs::read(&image)
        .with_context(|| format!("reading image {}", image.display()))?;
    if !image_data.starts_with(&ZIGATE_BINARY_VERSION) {
        bail!("{} is not a valid image for ZiGate", image.display());
    }
    info!("Loaded {} ({})", image.display(), bytefmt::format(image_data.len() as u64));

    // Not created until the flash dump starts, a failed connect keeps the old dump
    let mut out = BufWriter::new(LazyFile::new(&dump));

    info!("Connecting to serial port");

    let mut p = Programmer::linux(&port, options)
        .with_context(|| format!("connecting to serial port {}", port))?;

    let mut session = FlashSession::new(&mut p);
    let report = session.run(&mut out, &mut Cursor::new(&image_data), &mut Bar(None))
        .with_context(|| format!("{} failed", session.state()))?;
    drop(session);

    info!("Saved {} of existing flash to {}", bytefmt::format(report.dumped as u64), dump.display());
    info!("Wrote {} from {}", bytefmt::format(report.written as u64), image.display());

    println!("Chip ID: 0x{:08x}", report.chip_id);
    println!("MAC address: {}", report.mac.as_deref().unwrap_or("unknown"));
    println!("Flash complete!");

    Ok(())
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Err(e) = run(o) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
