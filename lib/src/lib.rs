//! # amlboot
//!
//! A Rust library for flashing Amlogic SoC-based devices over USB while they
//! sit in the vendor's recovery/boot mode.
//!
//! The library parses a vendor composite image (`aml_upgrade_package.img`)
//! and drives the device through one of two incompatible USB protocols:
//!
//! - **ADNL**: text commands with 4-byte-prefixed replies, spoken by newer
//!   SoCs (USB VID:PID `1b8e:c004`).
//! - **Optimus**: typed USB control requests plus a TPL/bulk command
//!   channel, spoken by older SoCs (USB VID:PID `1b8e:c003`).
//!
//! Callers do not pick an engine themselves: [`dispatcher::flash`] inspects
//! the composite image for the `aml/usb_flow` sentinel item and selects the
//! matching engine.
//!
//! ## Usage
//!
//! ```no_run
//! use amlboot::{dispatcher, image::AmlImage, Options, WipeMode};
//! use std::sync::Arc;
//!
//! let image = AmlImage::open("aml_upgrade_package.img").unwrap();
//! let callback = Arc::new(|event: amlboot::Event| {
//!     tracing::info!("{:?}", event);
//! });
//!
//! let options = Options {
//!     reset: true,
//!     erase_bootloader: true,
//!     wipe: WipeMode::Normal,
//!     password: None,
//! };
//!
//! dispatcher::flash(image, options, Some(callback)).unwrap();
//! ```

pub mod adnl;
pub mod cmd;
pub mod dispatcher;
pub mod image;
pub mod optimus;
pub mod platform;
pub mod socid;
pub mod transport;

use std::sync::Arc;

/// Callback type for receiving burn events.
pub type Callback = Arc<dyn Fn(Event) + Send + Sync>;

/// Events emitted while a flash is in progress.
#[derive(Debug, Clone)]
pub enum Event {
  /// Looking for a device at the expected VID/PID.
  FindingDevice,
  /// A device was found and opened.
  Connected,
  /// The engine that was selected for this image.
  EngineSelected(dispatcher::Engine),
  /// A protocol stage has started (ADNL: ROM/BL2/TPL; Optimus: burn step name).
  Stage(String),
  /// A partition or media item has started burning.
  ItemStarted { main_type: String, sub_type: String },
  /// Progress within the current item transfer.
  Progress(TransferProgress),
  /// A partition or media item finished and was verified (if applicable).
  ItemDone { main_type: String, sub_type: String },
  /// The device is being reset and will re-enumerate.
  Resetting,
  /// The whole flash completed successfully.
  Complete,
}

/// Byte-level progress within a single item transfer.
#[derive(Debug, Clone, Copy)]
pub struct TransferProgress {
  pub written: u64,
  pub total: u64,
}

/// Wipe mode passed to `disk_initial` / ADNL `oem disk_initial`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WipeMode {
  No,
  Normal,
  All,
}

impl WipeMode {
  pub fn code(self) -> u8 {
    match self {
      WipeMode::No => 0,
      WipeMode::Normal => 1,
      WipeMode::All => 3,
    }
  }
}

/// Run-time options for a flash, independent of the engine chosen.
#[derive(Debug, Clone)]
pub struct Options {
  /// Reboot the device after a successful flash.
  pub reset: bool,
  /// Run the Optimus erase-bootloader step (ignored by ADNL).
  pub erase_bootloader: bool,
  /// Wipe mode passed to `disk_initial`.
  pub wipe: WipeMode,
  /// 64-byte password for locked boards, read from `--password <path>`.
  pub password: Option<Vec<u8>>,
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur while parsing an image or driving a device.
#[derive(thiserror::Error, Debug)]
pub enum Error {
  /// Error from the USB subsystem.
  #[error("USB error: {0}")]
  UsbError(#[from] rusb::Error),

  /// I/O related error.
  #[error("IO error: {0}")]
  IoError(#[from] std::io::Error),

  /// Error converting slices to fixed-size arrays.
  #[error("slice conversion error: {0}")]
  Bytes(#[from] std::array::TryFromSliceError),

  /// UTF-8 conversion error.
  #[error("UTF8 conversion error: {0}")]
  Utf8Error(#[from] std::string::FromUtf8Error),

  /// Unexpected reply prefix or malformed structured reply.
  #[error("protocol error: {0}")]
  Protocol(String),

  /// A transferred block or partition failed its checksum/verify check.
  #[error("checksum mismatch: expected {expected:#x}, got {actual:#x}")]
  ChecksumMismatch { expected: u32, actual: u32 },

  /// `verify` was rejected by the device.
  #[error("device rejected verify for {0}")]
  VerifyFailed(String),

  /// A `verify` poll loop never resolved within its overall timeout.
  #[error("timed out waiting for verify of {0}")]
  VerifyTimeout(String),

  /// A bulk command's `Continue:*` poll loop never resolved.
  #[error("timed out waiting for command: {0}")]
  CommandTimeout(String),

  /// The composite image's header failed invariant I1 (magic/version).
  #[error("invalid composite image: {0}")]
  InvalidImage(String),

  /// An item descriptor named a `file_type` outside {0x00, 0xFE}.
  #[error("unknown file_type: {0:#x}")]
  UnknownFileType(u32),

  /// No item matched the requested (main_type, sub_type) pair.
  #[error("item not found: {main_type}/{sub_type}")]
  ItemNotFound { main_type: String, sub_type: String },

  /// The platform descriptor was missing a required key.
  #[error("missing required platform key: {0}")]
  MissingPlatformKey(&'static str),

  /// The device reported `need_password` with no password supplied.
  #[error("device is locked with a password; supply --password")]
  PasswordRequired,

  /// The device rejected the supplied password.
  #[error("password rejected by device")]
  PasswordRejected,

  /// The device was not found at the expected VID/PID.
  #[error("device not found")]
  NotFound,

  /// The device enumerated in an unexpected mode/stage for the requested operation.
  #[error("device in wrong mode: {0}")]
  WrongMode(String),

  /// A generic invalid-operation condition (bad argument, precondition violated).
  #[error("invalid operation: {0}")]
  InvalidOperation(String),
}

pub(crate) const VENDOR_ID: u16 = 0x1b8e;
pub(crate) const PRODUCT_ID_OPTIMUS: u16 = 0xc003;
pub(crate) const PRODUCT_ID_ADNL: u16 = 0xc004;
