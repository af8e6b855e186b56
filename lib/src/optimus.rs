//! Optimus protocol engine: typed USB control requests (`1b8e:c003`),
//! burning IPL -> SPL -> TPL through an ordered list of burn steps.
//!
//! Grounded on `optimus.py`'s `BurnStep*` class hierarchy and its
//! `get_burn_steps`/`do_burn`/`do_optimus_burn` driver, restructured as an
//! enum dispatch in the teacher's `flash.rs` `Flasher::flash` style: a
//! `match` over step variants with `tracing` around each, instead of a
//! `Vec<Box<dyn BurnStep>>`.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::thread::sleep;
use std::time::{Duration, Instant};

use crate::cmd;
use crate::image::{AmlImage, AmlImageItem, FileType};
use crate::platform::{ControlReg, Platform};
use crate::socid::{SocId, STAGE_MINOR_IPL, STAGE_MINOR_SPL, STAGE_MINOR_TPL};
use crate::transport::{RusbTransport, UsbTransport};
use crate::{Callback, Error, Event, Options, Result, TransferProgress, PRODUCT_ID_OPTIMUS, VENDOR_ID};

const DEFAULT_BULK_TIMEOUT: Duration = Duration::from_millis(3000);
const DISK_INITIAL_TIMEOUT: Duration = Duration::from_millis(60_000);
const VERIFY_MEDIA_TIMEOUT: Duration = Duration::from_millis(150_000);
const BULK_CONTINUE_POLL: Duration = Duration::from_secs(3);
const DEVICE_STAMP: u32 = 0x7856_efab;
const PARAM_MAGIC: u32 = 0x3412_cdab;

const CONTROL0_REG_DEFAULT: u32 = 0xc110419c;
const CONTROL1_REG_DEFAULT: u32 = 0xc1104174;
const CONTROL0_VAL_DEFAULT: u32 = 0xb1;
const CONTROL1_VAL_DEFAULT: u32 = 0x5183;

const DEVICE_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Cross-step state, equivalent to `optimus.py`'s `SharedData`.
#[derive(Debug, Default)]
struct SharedData {
  secure: bool,
}

/// The four bootloader image slots Optimus looks for under `USB/*`.
#[derive(Default)]
struct BootloaderImages {
  ddr: Option<AmlImageItem>,
  ddr_enc: Option<AmlImageItem>,
  uboot: Option<AmlImageItem>,
  uboot_enc: Option<AmlImageItem>,
}

impl BootloaderImages {
  fn get_mut(&mut self, part: &str) -> Option<&mut AmlImageItem> {
    match part {
      "DDR" => self.ddr.as_mut(),
      "DDR_ENC" => self.ddr_enc.as_mut(),
      "UBOOT" => self.uboot.as_mut(),
      "UBOOT_ENC" => self.uboot_enc.as_mut(),
      _ => None,
    }
  }
}

/// Everything a burn run needs out of the composite image, gathered once
/// up front (`optimus.py`'s `get_burn_steps` item scan).
struct BurnContext {
  bootloader: BootloaderImages,
  partition_order: Vec<(String, String)>,
  partitions: HashMap<(String, String), AmlImageItem>,
  verify: HashMap<String, AmlImageItem>,
  platform: Platform,
  shared: SharedData,
}

impl BurnContext {
  fn gather(image: &AmlImage) -> Result<Self> {
    let mut bootloader = BootloaderImages::default();
    let mut partition_order = Vec::new();
    let mut partitions = HashMap::new();
    let mut verify = HashMap::new();
    let mut platform = None;

    for item in image.items(None, None, None) {
      let main = item.main_type().to_string();
      let sub = item.sub_type().to_string();
      match (main.as_str(), sub.as_str()) {
        ("USB", "DDR") => bootloader.ddr = Some(item),
        ("USB", "DDR_ENC") => bootloader.ddr_enc = Some(item),
        ("USB", "UBOOT") => bootloader.uboot = Some(item),
        ("USB", "UBOOT_ENC") => bootloader.uboot_enc = Some(item),
        ("PARTITION", _) | ("dtb", _) => {
          partition_order.push((main.clone(), sub.clone()));
          partitions.insert((main, sub), item);
        }
        ("VERIFY", _) => {
          verify.insert(sub, item);
        }
        ("conf", "platform") => {
          let mut item = item;
          let mut text = String::new();
          item.read_to_string(&mut text)?;
          platform = Some(Platform::parse(&text)?);
        }
        _ => {}
      }
    }

    let platform = platform.ok_or_else(|| Error::Protocol("platform descriptor (conf/platform) not found in image".into()))?;

    Ok(Self { bootloader, partition_order, partitions, verify, platform, shared: SharedData::default() })
  }
}

/// One stage in the Optimus pipeline. Mirrors `optimus.py`'s `BurnStep*`
/// classes; each corresponds to one `do(dev) -> should_reopen` call.
#[derive(Debug, Clone)]
enum BurnStep {
  CheckPassword,
  EraseBootloader,
  BoardIsSecure,
  DownloadSpl,
  DownloadUboot,
  Bulk { cmd: String, timeout: Duration },
  DownloadMedia { main_type: String, sub_type: String },
}

impl BurnStep {
  fn title(&self) -> String {
    match self {
      BurnStep::CheckPassword => "Password check".into(),
      BurnStep::EraseBootloader => "Erase Bootloader".into(),
      BurnStep::BoardIsSecure => "SecureBoot check".into(),
      BurnStep::DownloadSpl => "Download SPL".into(),
      BurnStep::DownloadUboot => "Download UBOOT".into(),
      BurnStep::Bulk { cmd, .. } => format!("Command {cmd}"),
      BurnStep::DownloadMedia { main_type, sub_type } => format!("Download {main_type}.{sub_type}"),
    }
  }
}

/// Builds the ordered burn-step list, matching `optimus.py`'s
/// `get_burn_steps`: password/secure/SPL/UBOOT bring-up, optional
/// erase-bootloader prepended, one `DownloadMedia` per partition/dtb item
/// (skipping `dtb/meson1_ENC`), then `save_setting`/`burn_complete`.
fn build_burn_steps(options: &Options, partition_order: &[(String, String)]) -> Vec<BurnStep> {
  let mut steps = vec![
    BurnStep::CheckPassword,
    BurnStep::BoardIsSecure,
    BurnStep::DownloadSpl,
    BurnStep::DownloadUboot,
    BurnStep::Bulk { cmd: "    low_power".into(), timeout: DEFAULT_BULK_TIMEOUT },
    BurnStep::Bulk { cmd: format!("disk_initial {}", options.wipe.code()), timeout: DISK_INITIAL_TIMEOUT },
  ];

  if options.erase_bootloader {
    steps.insert(0, BurnStep::EraseBootloader);
    steps.insert(0, BurnStep::CheckPassword);
  }

  for (main_type, sub_type) in partition_order {
    if main_type == "dtb" && sub_type == "meson1_ENC" {
      continue;
    }
    steps.push(BurnStep::DownloadMedia { main_type: main_type.clone(), sub_type: sub_type.clone() });
  }

  let reset_choice = if options.reset { 1 } else { 3 };
  steps.push(BurnStep::Bulk { cmd: "save_setting".into(), timeout: DEFAULT_BULK_TIMEOUT });
  steps.push(BurnStep::Bulk { cmd: format!("burn_complete {reset_choice}"), timeout: DEFAULT_BULK_TIMEOUT });

  steps
}

/// Runs the full Optimus burn pipeline against `image`, reporting progress
/// through `callback`. Equivalent to `optimus.py`'s `do_optimus_burn` plus
/// `do_burn`'s reopen-on-`true` device-handle loop.
#[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
pub fn burn(image: &AmlImage, options: &Options, callback: Option<Callback>) -> Result<()> {
  let emit = |event: Event| {
    if let Some(cb) = &callback {
      cb(event);
    }
  };

  let mut ctx = BurnContext::gather(image)?;
  let steps = build_burn_steps(options, &ctx.partition_order);

  let mut transport: Option<RusbTransport> = None;
  let mut reopen = true;

  for step in &steps {
    if reopen {
      emit(Event::FindingDevice);
      transport = Some(RusbTransport::open(VENDOR_ID, PRODUCT_ID_OPTIMUS)?);
      emit(Event::Connected);
    }
    let dev = transport.as_ref().expect("device handle must exist after reopen");

    tracing::info!(step = %step.title(), "---- start ----");
    emit(Event::Stage(step.title()));

    reopen = run_step(dev, step, &mut ctx, options, &callback)?;
    tracing::info!(step = %step.title(), "---- done ----");

    sleep(Duration::from_millis(200));
  }

  emit(Event::Complete);
  Ok(())
}

fn run_step(
  dev: &dyn UsbTransport,
  step: &BurnStep,
  ctx: &mut BurnContext,
  options: &Options,
  callback: &Option<Callback>,
) -> Result<bool> {
  match step {
    BurnStep::CheckPassword => check_password(dev, options),
    BurnStep::EraseBootloader => erase_bootloader(dev),
    BurnStep::BoardIsSecure => board_is_secure(dev, &ctx.platform, &mut ctx.shared),
    BurnStep::DownloadSpl => download_spl(dev, &ctx.platform, &mut ctx.bootloader, &ctx.shared),
    BurnStep::DownloadUboot => download_uboot(dev, &ctx.platform, &mut ctx.bootloader, &ctx.shared),
    BurnStep::Bulk { cmd, timeout } => {
      check_bulk_cmd(dev, cmd, *timeout)?;
      Ok(false)
    }
    BurnStep::DownloadMedia { main_type, sub_type } => {
      download_media(dev, ctx, main_type, sub_type, callback)?;
      Ok(false)
    }
  }
}

/// Polls a `BULKCMD`'s status every [`BULK_CONTINUE_POLL`] while it reports
/// `Continue:34`, then requires a trimmed `success` status. Implements the
/// base spec's "bulk command status protocol".
fn check_bulk_cmd(transport: &dyn UsbTransport, command: &str, timeout: Duration) -> Result<()> {
  cmd::bulk_cmd_issue(transport, command)?;

  let start = Instant::now();
  let status = loop {
    let response = cmd::bulk_cmd_poll(transport)?;
    if !response.starts_with("Continue:34") {
      break response;
    }
    sleep(BULK_CONTINUE_POLL);
    if start.elapsed() > timeout {
      return Err(Error::CommandTimeout(command.to_string()));
    }
  };

  if status != "success" {
    return Err(Error::Protocol(format!("command {command:?} status failed: {status:?}")));
  }
  Ok(())
}

fn check_tpl_cmd(transport: &dyn UsbTransport, command: &str) -> Result<()> {
  cmd::tpl_command(transport, 1, command.as_bytes())?;
  let status = cmd::tpl_stat_text(transport, 0)?;
  if status != "success" {
    return Err(Error::Protocol(format!("tpl command {command:?} status failed: {status:?}")));
  }
  Ok(())
}

/// Polls for the device's presence at `VENDOR_ID:PRODUCT_ID_OPTIMUS`.
/// `for_connect=true` waits until it appears (bounded by
/// [`DEVICE_WAIT_TIMEOUT`]); `false` waits until it disappears, with no
/// timeout, matching `optimus.py`'s `BurnStepBase._wait_device`.
fn wait_for_device(for_connect: bool, timeout: Duration) -> Result<()> {
  let start = Instant::now();
  loop {
    let present = RusbTransport::probe(VENDOR_ID, PRODUCT_ID_OPTIMUS);
    if present == for_connect {
      return Ok(());
    }
    if for_connect && start.elapsed() >= timeout {
      return Err(Error::CommandTimeout("detect device connect timeout".into()));
    }
    sleep(Duration::from_millis(500));
  }
}

fn check_password(transport: &dyn UsbTransport, options: &Options) -> Result<bool> {
  let socid = SocId::parse(&cmd::identify(transport)?)?;
  tracing::info!(%socid, "identify");

  if socid.stage_minor() != 0 || socid.major() == 0 {
    tracing::info!("identify 6-byte fields not supported by this firmware, skipping password check");
    return Ok(false);
  }

  if !socid.need_password() || socid.password_ok() {
    tracing::info!("board is not locked");
    return Ok(false);
  }

  let password = options.password.as_ref().ok_or(Error::PasswordRequired)?;
  if password.len() != 64 {
    return Err(Error::InvalidOperation("password must be exactly 64 bytes".into()));
  }

  tracing::info!("unlocking usb interface");
  cmd::send_password(transport, password)?;
  sleep(Duration::from_secs(2));

  let socid = SocId::parse(&cmd::identify(transport)?)?;
  if !socid.password_ok() {
    return Err(Error::PasswordRejected);
  }
  tracing::info!("password ok");
  Ok(false)
}

fn erase_bootloader(transport: &dyn UsbTransport) -> Result<bool> {
  let socid = SocId::parse(&cmd::identify(transport)?)?;
  tracing::info!(%socid, "firmware version");

  if socid.stage_minor() == STAGE_MINOR_IPL {
    return Ok(false);
  }
  if socid.stage_minor() != STAGE_MINOR_TPL {
    return Err(Error::WrongMode(format!("invalid power state: {socid}")));
  }

  // Needed to avoid losing 4 bytes of command after reset.
  check_tpl_cmd(transport, "    echo 1234")?;
  check_bulk_cmd(transport, "    low_power", DEFAULT_BULK_TIMEOUT)?;

  if check_bulk_cmd(transport, "bootloader_is_old", DEFAULT_BULK_TIMEOUT).is_err() {
    tracing::info!("bootloader is new");
    return Ok(false);
  }

  tracing::info!("bootloader is old, erasing");
  check_bulk_cmd(transport, "erase_bootloader", DEFAULT_BULK_TIMEOUT)?;
  let _ = check_bulk_cmd(transport, "reset", DEFAULT_BULK_TIMEOUT);

  tracing::info!("waiting for device to reconnect after reset");
  wait_for_device(false, DEVICE_WAIT_TIMEOUT)?;
  wait_for_device(true, DEVICE_WAIT_TIMEOUT)?;
  tracing::info!("device is connected");
  Ok(true)
}

fn board_is_secure(transport: &dyn UsbTransport, platform: &Platform, shared: &mut SharedData) -> Result<bool> {
  let socid = SocId::parse(&cmd::identify(transport)?)?;
  tracing::info!(%socid, "identify");

  let (reg, val) = match socid.stage_minor() {
    STAGE_MINOR_IPL => read_encrypt_for_ipl(transport, platform)?,
    STAGE_MINOR_TPL => read_encrypt_for_tpl(transport, platform)?,
    _ => (0, 0),
  };

  let secure_bit = val & 0x10;
  tracing::info!(reg = format!("{reg:x}"), val = format!("{val:x}"), secure_bit, "read encrypt register");
  shared.secure = secure_bit != 0;
  Ok(false)
}

fn read_encrypt_for_ipl(transport: &dyn UsbTransport, platform: &Platform) -> Result<(u32, u32)> {
  let mut encrypt_reg = platform.encrypt_reg;
  if encrypt_reg == 0xffff_ffff {
    return Err(Error::Protocol("invalid encrypt register".into()));
  }

  if encrypt_reg == 0 {
    // Only the leading u32 of this 512-byte page is meaningful; the rest
    // is read and discarded, matching `_read_encrypt_for_ipl`.
    let data = cmd::read_large_memory(transport, 0xd904_0004, 0x200, 64)?;
    let chip_id = u32::from_le_bytes(data[..4].try_into()?);
    if chip_id == platform.enc_chip_id1 {
      encrypt_reg = platform.encrypt_reg1;
    } else if chip_id == platform.enc_chip_id2 {
      encrypt_reg = platform.encrypt_reg2;
    }
  }

  let data = cmd::read_simple_memory(transport, encrypt_reg, 4)?;
  Ok((encrypt_reg, u32::from_le_bytes(data[..4].try_into()?)))
}

fn read_encrypt_for_tpl(transport: &dyn UsbTransport, platform: &Platform) -> Result<(u32, u32)> {
  let encrypt_reg = platform.encrypt_reg;
  check_bulk_cmd(transport, &format!("upload mem {encrypt_reg:#x} normal 0x4"), DEFAULT_BULK_TIMEOUT)?;
  let mut buf = [0u8; 4];
  transport.bulk_in(&mut buf)?;
  Ok((encrypt_reg, u32::from_le_bytes(buf)))
}

fn download_spl(
  transport: &dyn UsbTransport,
  platform: &Platform,
  bootloader: &mut BootloaderImages,
  shared: &SharedData,
) -> Result<bool> {
  let socid = SocId::parse(&cmd::identify(transport)?)?;
  match socid.stage_minor() {
    STAGE_MINOR_IPL => {}
    STAGE_MINOR_TPL | STAGE_MINOR_SPL => return Ok(false),
    _ => return Err(Error::WrongMode(format!("unexpected stage: {socid}"))),
  }

  if platform.platform != 0x0811 {
    return Err(Error::InvalidOperation(format!("platform {:#x} is not supported for SPL download", platform.platform)));
  }
  let params_buf = pack_params(&[0x3412_cdab, 0x200, 0xc0df, 0, 0, 0]);

  let part = if shared.secure { "DDR_ENC" } else { "DDR" };
  {
    let img = bootloader
      .get_mut(part)
      .ok_or_else(|| Error::ItemNotFound { main_type: "USB".into(), sub_type: part.into() })?;
    write_regs(transport, platform)?;
    download_file(transport, img, platform.ddr_load, platform.ddr_size as u64)?;
  }
  write_para(transport, platform.bl2_para_addr, &params_buf)?;
  run_in_address(transport, platform.ddr_run)?;

  sleep(Duration::from_secs(8));

  let socid = SocId::parse(&cmd::identify(transport)?)?;
  match socid.stage_minor() {
    STAGE_MINOR_IPL => tracing::info!("CheckFileRunState succeeded"),
    STAGE_MINOR_SPL if socid.stage_major() == 1 => {}
    STAGE_MINOR_SPL if socid.stage_major() == 0 => {
      if platform.bl2_para_addr != 0 {
        run_in_address(transport, platform.bl2_para_addr)?;
      }
    }
    _ => return Err(Error::WrongMode(format!("unexpected stage: {socid}"))),
  }

  check_para(transport, platform.bl2_para_addr, DEVICE_STAMP)?;
  Ok(false)
}

fn download_uboot(
  transport: &dyn UsbTransport,
  platform: &Platform,
  bootloader: &mut BootloaderImages,
  shared: &SharedData,
) -> Result<bool> {
  let part = if shared.secure { "UBOOT_ENC" } else { "UBOOT" };
  let ddr_part = if shared.secure { "DDR_ENC" } else { "DDR" };

  let socid = SocId::parse(&cmd::identify(transport)?)?;
  if socid.stage_minor() == STAGE_MINOR_TPL {
    tracing::info!("no need to download UBOOT");
    return Ok(false);
  }
  if socid.stage_minor() != 0 && !(socid.stage_major() != 0 && socid.stage_minor() == STAGE_MINOR_SPL) {
    return Err(Error::InvalidOperation(format!("unexpected stage for UBOOT download: {socid}")));
  }

  {
    let img = bootloader
      .get_mut(part)
      .ok_or_else(|| Error::ItemNotFound { main_type: "USB".into(), sub_type: part.into() })?;
    download_file(transport, img, platform.uboot_load, 0)?;
  }
  sleep(Duration::from_millis(200));

  let socid = SocId::parse(&cmd::identify(transport)?)?;
  if socid.stage_minor() == STAGE_MINOR_IPL {
    let ddr_img = bootloader
      .get_mut(ddr_part)
      .ok_or_else(|| Error::ItemNotFound { main_type: "USB".into(), sub_type: ddr_part.into() })?;
    download_file(transport, ddr_img, platform.ddr_load, platform.ddr_size as u64)?;
  }

  if platform.bl2_para_addr != 0 {
    update_ddr(transport, platform, bootloader, part, ddr_part)?;
    let uboot_size = bootloader.get_mut(part).map(|img| img.size()).unwrap_or(0) as u32;
    let params_buf = pack_params(&[PARAM_MAGIC, 0x200, 0xc0e1, 0, 0, 0, 1, platform.uboot_load, uboot_size]);
    write_para(transport, platform.bl2_para_addr, &params_buf)?;
  }

  let socid = SocId::parse(&cmd::identify(transport)?)?;
  run_uboot(transport, platform, &socid)?;

  wait_for_device(false, DEVICE_WAIT_TIMEOUT)?;
  wait_for_device(true, DEVICE_WAIT_TIMEOUT)?;
  sleep(Duration::from_secs(5));

  Ok(true)
}

/// Shared run-address selection between `DownloadUboot.do`/`_update_ddr`:
/// IPL runs at `UbootRun`, SPL with `stage_major==0` jumps to the BL2
/// parameter block address, anything else is a no-op.
fn run_uboot(transport: &dyn UsbTransport, platform: &Platform, socid: &SocId) -> Result<()> {
  if socid.stage_minor() == STAGE_MINOR_IPL {
    run_in_address(transport, platform.uboot_run)
  } else if socid.stage_minor() == STAGE_MINOR_SPL && socid.stage_major() == 0 {
    run_in_address(transport, platform.bl2_para_addr)
  } else {
    Ok(())
  }
}

fn update_ddr(
  transport: &dyn UsbTransport,
  platform: &Platform,
  bootloader: &mut BootloaderImages,
  part: &str,
  ddr_part: &str,
) -> Result<()> {
  let (checksum, size) = {
    let img = bootloader
      .get_mut(part)
      .ok_or_else(|| Error::ItemNotFound { main_type: "USB".into(), sub_type: part.into() })?;
    img.seek(SeekFrom::Start(0))?;
    let mut data = Vec::new();
    img.read_to_end(&mut data)?;
    img.seek(SeekFrom::Start(0))?;
    (cmd::amlc_checksum(&data), data.len() as u32)
  };

  let mut params_buf = pack_params(&[PARAM_MAGIC, 0x200, 0xc0e0, 0, 0, 1, platform.uboot_load, size, checksum]);
  params_buf.resize(100, 0);
  write_para(transport, platform.bl2_para_addr, &params_buf)?;

  let socid = SocId::parse(&cmd::identify(transport)?)?;
  run_uboot(transport, platform, &socid)?;
  sleep(Duration::from_secs(5));

  check_para(transport, platform.bl2_para_addr, DEVICE_STAMP)?;

  let socid = SocId::parse(&cmd::identify(transport)?)?;
  if socid.stage_minor() == STAGE_MINOR_IPL {
    let ddr_img = bootloader
      .get_mut(ddr_part)
      .ok_or_else(|| Error::ItemNotFound { main_type: "USB".into(), sub_type: ddr_part.into() })?;
    ddr_img.seek(SeekFrom::Start(0))?;
    download_file(transport, ddr_img, platform.ddr_load, platform.ddr_size as u64)?;
  }
  Ok(())
}

fn write_regs(transport: &dyn UsbTransport, platform: &Platform) -> Result<()> {
  write_reg_with_default(transport, platform.control0, CONTROL0_REG_DEFAULT, CONTROL0_VAL_DEFAULT)?;
  sleep(Duration::from_millis(500));
  write_reg_with_default(transport, platform.control1, CONTROL1_REG_DEFAULT, CONTROL1_VAL_DEFAULT)?;
  sleep(Duration::from_millis(500));
  Ok(())
}

fn write_reg_with_default(transport: &dyn UsbTransport, ctrl: ControlReg, reg_default: u32, val_default: u32) -> Result<()> {
  let (reg, val) = if ctrl.reg == 0 { (reg_default, val_default) } else { (ctrl.reg, ctrl.val) };
  tracing::info!(reg = format!("{reg:08x}"), val = format!("{val:08x}"), "control write pll reg");
  cmd::write_simple_memory(transport, reg, &val.to_le_bytes())
}

/// Downloads at most `size` bytes (the whole item when `size` is 0 or
/// exceeds the item's length) from `img` to `address` in 4 KiB blocks.
fn download_file(transport: &dyn UsbTransport, img: &mut AmlImageItem, address: u32, size: u64) -> Result<()> {
  const BLOCK_LENGTH: usize = 0x1000;
  img.seek(SeekFrom::Start(0))?;
  let total = if size == 0 || size > img.size() { img.size() } else { size };

  tracing::info!(sub_type = img.sub_type(), total, address = format!("{address:x}"), "download file");

  let mut written: u64 = 0;
  let mut addr = address;
  let mut buf = vec![0u8; BLOCK_LENGTH];
  while written < total {
    let read = img.read(&mut buf)?;
    if read == 0 {
      break;
    }
    cmd::write_large_memory(transport, addr, &buf[..read], read, false)?;
    written += BLOCK_LENGTH as u64;
    addr += BLOCK_LENGTH as u32;
  }

  if written < total {
    return Err(Error::Protocol(format!("download_file: wrote {written} of {total} bytes")));
  }
  Ok(())
}

fn run_in_address(transport: &dyn UsbTransport, address: u32) -> Result<()> {
  let socid = SocId::parse(&cmd::identify(transport)?)?;
  let keep_power = (socid.major(), socid.minor(), socid.stage_major(), socid.stage_minor()) >= (0, 9, 0, 0);
  tracing::info!(address = format!("{address:x}"), keep_power, "run at address");
  cmd::run(transport, address, keep_power)
}

fn check_para(transport: &dyn UsbTransport, bl2_para_addr: u32, magic: u32) -> Result<Vec<u8>> {
  let data = cmd::read_large_memory(transport, bl2_para_addr, 0x200, 64)?;
  let para_magic = u32::from_le_bytes(data[..4].try_into()?);
  if para_magic != magic {
    return Err(Error::ChecksumMismatch { expected: magic, actual: para_magic });
  }
  Ok(data)
}

fn write_para(transport: &dyn UsbTransport, bl2_para_addr: u32, params: &[u8]) -> Result<()> {
  cmd::write_large_memory(transport, bl2_para_addr, params, params.len(), false)
}

fn pack_params(words: &[u32]) -> Vec<u8> {
  words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn download_media(
  transport: &dyn UsbTransport,
  ctx: &mut BurnContext,
  main_type: &str,
  sub_type: &str,
  callback: &Option<Callback>,
) -> Result<()> {
  let mut effective_sub = sub_type.to_string();
  if main_type == "dtb" && sub_type == "meson1" && ctx.shared.secure {
    let enc_key = (main_type.to_string(), format!("{sub_type}_ENC"));
    if ctx.partitions.get(&enc_key).map(|img| img.size()).unwrap_or(0) != 0 {
      effective_sub = format!("{sub_type}_ENC");
    }
  }

  let key = (main_type.to_string(), effective_sub.clone());
  let (file_type, size) = {
    let img = ctx
      .partitions
      .get(&key)
      .ok_or_else(|| Error::ItemNotFound { main_type: main_type.into(), sub_type: effective_sub.clone() })?;
    (img.file_type(), img.size())
  };

  let media_type = if main_type == "dtb" { "mem" } else { "store" };
  let part_name = if main_type == "dtb" { "dtb" } else { effective_sub.as_str() };

  check_tpl_cmd(transport, &format!("download {media_type} {part_name} {} {size}", file_type.as_str()))?;

  if let Some(cb) = callback {
    cb(Event::ItemStarted { main_type: main_type.to_string(), sub_type: effective_sub.clone() });
  }

  const MEDIA_BLOCK: usize = 0x10000;
  let mut seq: u8 = 0;
  let mut written: u64 = 0;
  let mut buf = vec![0u8; MEDIA_BLOCK];
  tracing::info!(main_type, sub_type = %effective_sub, size, "downloading media");
  loop {
    let read = {
      let img = ctx.partitions.get_mut(&key).expect("item verified present above");
      img.read(&mut buf)?
    };
    if read == 0 {
      break;
    }
    try_write_media(transport, &buf[..read], seq)?;
    seq = seq.wrapping_add(1);
    written += read as u64;
    if let Some(cb) = callback {
      cb(Event::Progress(TransferProgress { written, total: size }));
    }
  }
  tracing::info!(main_type, sub_type = %effective_sub, "transfer complete");

  check_bulk_cmd(transport, "download get_status", DEFAULT_BULK_TIMEOUT)?;

  let is_verify = ctx.partitions.get(&key).map(|img| img.is_verify()).unwrap_or(false);
  if is_verify {
    verify_media(transport, ctx, &effective_sub)?;
  }

  if let Some(cb) = callback {
    cb(Event::ItemDone { main_type: main_type.to_string(), sub_type: effective_sub });
  }
  Ok(())
}

/// Writes one media block, retrying up to 3 times if the device's ACK
/// isn't `OK!!` within the `Continue:32` poll window.
fn try_write_media(transport: &dyn UsbTransport, data: &[u8], _seq: u8) -> Result<()> {
  const RESEND_LIMIT: u32 = 3;
  const ACK_LEN: usize = 0x200;
  const ACK_OVERALL_TIMEOUT: Duration = Duration::from_secs(10);

  let mut retries = 0;
  loop {
    transport.bulk_out(data)?;

    let start = Instant::now();
    let ack = loop {
      let mut buf = vec![0u8; ACK_LEN];
      let read = transport.bulk_in(&mut buf)?;
      let reply = String::from_utf8_lossy(&buf[..read]).to_string();
      if !reply.starts_with("Continue:32") {
        break reply;
      }
      if start.elapsed() > ACK_OVERALL_TIMEOUT {
        return Err(Error::CommandTimeout("media write ack".into()));
      }
      sleep(Duration::from_secs(3));
    };

    if ack.starts_with("OK!!") {
      return Ok(());
    }

    retries += 1;
    if retries > RESEND_LIMIT {
      return Err(Error::Protocol("media write failed after retries".into()));
    }
    sleep(Duration::from_millis(200));
  }
}

fn verify_media(transport: &dyn UsbTransport, ctx: &mut BurnContext, part: &str) -> Result<()> {
  let verify_item = ctx
    .verify
    .get_mut(part)
    .ok_or_else(|| Error::ItemNotFound { main_type: "VERIFY".into(), sub_type: part.into() })?;
  verify_item.seek(SeekFrom::Start(0))?;
  let mut args = String::new();
  verify_item.read_to_string(&mut args)?;
  let args = args.trim();

  tracing::info!(part, "verifying image");
  check_bulk_cmd(transport, &format!("verify {args}"), VERIFY_MEDIA_TIMEOUT)?;
  tracing::info!(part, "verify success");
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::{ControlRequest, MockStep, MockTransport};
  use crate::WipeMode;

  fn opts(erase_bootloader: bool, reset: bool) -> Options {
    Options { reset, erase_bootloader, wipe: WipeMode::Normal, password: None }
  }

  #[test]
  fn build_burn_steps_includes_erase_when_requested() {
    let steps = build_burn_steps(&opts(true, false), &[]);
    assert!(matches!(steps[0], BurnStep::CheckPassword));
    assert!(matches!(steps[1], BurnStep::EraseBootloader));
  }

  #[test]
  fn build_burn_steps_omits_erase_by_default() {
    let steps = build_burn_steps(&opts(false, false), &[]);
    assert!(matches!(steps[0], BurnStep::CheckPassword));
    assert!(matches!(steps[1], BurnStep::BoardIsSecure));
  }

  #[test]
  fn build_burn_steps_skips_meson1_enc_partition() {
    let partitions = vec![
      ("dtb".to_string(), "meson1".to_string()),
      ("dtb".to_string(), "meson1_ENC".to_string()),
      ("PARTITION".to_string(), "system".to_string()),
    ];
    let steps = build_burn_steps(&opts(false, false), &partitions);
    let media_steps: Vec<&str> = steps
      .iter()
      .filter_map(|s| match s {
        BurnStep::DownloadMedia { sub_type, .. } => Some(sub_type.as_str()),
        _ => None,
      })
      .collect();
    assert_eq!(media_steps, vec!["meson1", "system"]);
  }

  #[test]
  fn build_burn_steps_encodes_reset_choice() {
    let steps = build_burn_steps(&opts(false, true), &[]);
    let last = steps.last().unwrap();
    assert!(matches!(last, BurnStep::Bulk { cmd, .. } if cmd == "burn_complete 1"));

    let steps = build_burn_steps(&opts(false, false), &[]);
    let last = steps.last().unwrap();
    assert!(matches!(last, BurnStep::Bulk { cmd, .. } if cmd == "burn_complete 3"));
  }

  #[test]
  fn check_bulk_cmd_retries_on_continue_then_succeeds() {
    let transport = MockTransport::new(vec![
      MockStep::ControlOut {
        expect: ControlRequest { request_type: 0x40, request: cmd::REQ_BULKCMD, value: 0, index: 0 },
        expect_data: b"disk_initial 1\0".to_vec(),
      },
      MockStep::BulkIn { reply: b"Continue:34\0\0\0\0\0".to_vec() },
      MockStep::BulkIn { reply: b"success\0\0\0\0\0\0\0\0\0".to_vec() },
    ]);
    check_bulk_cmd(&transport, "disk_initial 1", Duration::from_secs(10)).unwrap();
    assert!(transport.is_exhausted());
  }

  #[test]
  fn check_bulk_cmd_errors_on_failed_status() {
    let transport = MockTransport::new(vec![
      MockStep::ControlOut {
        expect: ControlRequest { request_type: 0x40, request: cmd::REQ_BULKCMD, value: 0, index: 0 },
        expect_data: b"bootloader_is_old\0".to_vec(),
      },
      MockStep::BulkIn { reply: b"fail\0\0\0\0\0\0\0\0\0\0\0\0".to_vec() },
    ]);
    let err = check_bulk_cmd(&transport, "bootloader_is_old", Duration::from_secs(10)).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
  }

  #[test]
  fn try_write_media_retries_until_ok() {
    let transport = MockTransport::new(vec![
      MockStep::BulkOut { expect_data: vec![1, 2, 3, 4] },
      MockStep::BulkIn { reply: b"Continue:32\0".to_vec() },
      MockStep::BulkIn { reply: b"OK!!".to_vec() },
    ]);
    try_write_media(&transport, &[1, 2, 3, 4], 0).unwrap();
    assert!(transport.is_exhausted());
  }
}
