mod monitoring;

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use amlboot::image::AmlImage;
use amlboot::{dispatcher, Error, Event, Options, WipeMode};
use clap::{Parser, ValueEnum};

#[derive(Parser, Debug)]
#[command(
  author = "amlboot contributors",
  version = "0.1.0",
  about = "cli for flashing Amlogic SoC devices over USB recovery mode",
  long_about = None
)]
struct Args {
  /// Path to the composite image (`aml_upgrade_package.img`) to flash.
  #[arg(long)]
  img: PathBuf,
  /// Reboot the device after a successful flash.
  #[arg(long, action)]
  reset: bool,
  /// Skip the Optimus erase-bootloader step.
  #[arg(long, action)]
  no_erase_bootloader: bool,
  /// Wipe mode passed to `disk_initial`.
  #[arg(long, value_enum, default_value_t = Wipe::No)]
  wipe: Wipe,
  /// Path to a 64-byte password file for locked boards.
  #[arg(long)]
  password: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Wipe {
  No,
  Normal,
  All,
}

impl From<Wipe> for WipeMode {
  fn from(wipe: Wipe) -> Self {
    match wipe {
      Wipe::No => WipeMode::No,
      Wipe::Normal => WipeMode::Normal,
      Wipe::All => WipeMode::All,
    }
  }
}

fn main() -> ExitCode {
  monitoring::init_logger();

  let args = Args::parse();
  match run(args) {
    Ok(()) => {
      tracing::info!("done!");
      ExitCode::SUCCESS
    }
    Err(err) => {
      tracing::error!("flash failed: {}", err);
      ExitCode::FAILURE
    }
  }
}

fn run(args: Args) -> amlboot::Result<()> {
  let image = AmlImage::open(&args.img)?;

  let password = args
    .password
    .map(|path| -> amlboot::Result<Vec<u8>> {
      let bytes = fs::read(&path)?;
      if bytes.len() != 64 {
        return Err(Error::InvalidOperation(format!(
          "password file {} must be exactly 64 bytes, got {}",
          path.display(),
          bytes.len()
        )));
      }
      Ok(bytes)
    })
    .transpose()?;

  let options = Options { reset: args.reset, erase_bootloader: !args.no_erase_bootloader, wipe: args.wipe.into(), password };

  let callback: amlboot::Callback = Arc::new(|event: Event| match event {
    Event::FindingDevice => tracing::info!("looking for device..."),
    Event::Connected => tracing::info!("device connected"),
    Event::EngineSelected(engine) => tracing::info!(%engine, "engine selected"),
    Event::Stage(stage) => tracing::info!(stage, "entering stage"),
    Event::ItemStarted { main_type, sub_type } => tracing::info!(main_type, sub_type, "burning item"),
    Event::Progress(progress) => tracing::debug!(written = progress.written, total = progress.total, "progress"),
    Event::ItemDone { main_type, sub_type } => tracing::info!(main_type, sub_type, "item done"),
    Event::Resetting => tracing::info!("device resetting, waiting for re-enumeration"),
    Event::Complete => tracing::info!("flash complete"),
  });

  dispatcher::flash(image, options, Some(callback))
}
