//! ADNL protocol engine: text commands over bulk endpoints, spoken by newer
//! Amlogic SoCs (USB `1b8e:c004`). Burning proceeds through three stages —
//! ROM (sends BL2), BL2/SPL (CBW-driven TPL upload), and TPL/U-Boot
//! (partition burning) — with the device re-enumerating between each.

use std::io::{Read, Seek, SeekFrom};
use std::thread::sleep;
use std::time::Duration;

use crate::image::{AmlImage, AmlImageItem};
use crate::transport::{RusbTransport, UsbTransport};
use crate::{Callback, Error, Event, Options, Result, PRODUCT_ID_ADNL, VENDOR_ID};

const USB_BULK_SIZE: usize = 16384;
const USB_READ_LEN: usize = 512;
const VERIFY_TIMEOUT: Duration = Duration::from_millis(150_000);

const BOOTROM_BURNSTEPS_0: u32 = 0xC0040000;
const BOOTROM_BURNSTEPS_1: u32 = 0xC0040001;
const BOOTROM_BURNSTEPS_2: u32 = 0xC0040002;
const BOOTROM_BURNSTEPS_3: u32 = 0xC0040003;

const TPL_BURNSTEPS_0: u32 = 0xC0041030;
const TPL_BURNSTEPS_1: u32 = 0xC0041031;
const TPL_BURNSTEPS_2: u32 = 0xC0041032;

pub const ADNL_ROM_STAGE: u8 = 0;
pub const ADNL_TPL_STAGE: u8 = 16;

const REPLY_OKAY: &str = "OKAY";
const REPLY_DATA: &str = "DATA";
const REPLY_INFO: &str = "INFO";

/// Device-issued request for the next chunk of TPL image data, sent while
/// U-Boot (running from BL2) is still fetching itself over USB.
#[derive(Debug, Clone, Copy)]
pub struct Cbw {
  pub seq: u32,
  pub size: u32,
  pub offset: u32,
  pub need_checksum: bool,
  pub done: bool,
}

impl Cbw {
  fn parse(msg: &[u8]) -> Result<Self> {
    if msg.len() < 22 {
      return Err(Error::Protocol(format!("CBW reply too short: {} bytes", msg.len())));
    }
    let magic = std::str::from_utf8(&msg[4..8]).map_err(|_| Error::Protocol("CBW magic is not UTF-8".into()))?;
    if magic != "AMLC" {
      return Err(Error::Protocol(format!("unexpected CBW magic {:?}", magic)));
    }
    Ok(Cbw {
      seq: u32::from_le_bytes(msg[8..12].try_into()?),
      size: u32::from_le_bytes(msg[12..16].try_into()?),
      offset: u32::from_le_bytes(msg[16..20].try_into()?),
      need_checksum: msg[20] == 0,
      done: msg[21] != 0,
    })
  }
}

/// The checksum ADNL uses to verify partition data chunks as they're sent.
/// A plain little-endian `u32` sum over 4-byte groups, masked to 32 bits.
/// Distinct from [`crate::cmd::amlc_checksum`]'s tail handling: it is only
/// ever applied to whole blocks the device itself asked for.
pub fn adnl_checksum(buf: &[u8]) -> u32 {
  let mut sum: u64 = 0;
  for chunk in buf.chunks(4) {
    let mut word = [0u8; 4];
    word[..chunk.len()].copy_from_slice(chunk);
    sum += u32::from_le_bytes(word) as u64;
  }
  (sum & 0xffff_ffff) as u32
}

fn reply_prefix(msg: &[u8]) -> Result<String> {
  if msg.len() < 4 {
    return Err(Error::Protocol(format!("reply too short: {} bytes", msg.len())));
  }
  Ok(String::from_utf8_lossy(&msg[..4]).to_string())
}

fn send_raw(transport: &dyn UsbTransport, data: &[u8]) -> Result<Vec<u8>> {
  transport.bulk_out(data)?;
  let mut buf = vec![0u8; USB_READ_LEN];
  let read = transport.bulk_in(&mut buf)?;
  buf.truncate(read);
  Ok(buf)
}

/// Sends a command (text or raw binary) and checks the 4-byte reply prefix
/// against `expected`.
fn send_cmd(transport: &dyn UsbTransport, cmd: &[u8], expected: &str) -> Result<Vec<u8>> {
  let msg = send_raw(transport, cmd)?;
  let prefix = reply_prefix(&msg)?;
  if prefix != expected {
    return Err(Error::Protocol(format!(
      "unexpected reply to {:?}: {}",
      String::from_utf8_lossy(cmd),
      prefix
    )));
  }
  Ok(msg)
}

/// `getvar:identify`: returns the boot stage byte (offset 7 of the reply).
fn send_cmd_identify(transport: &dyn UsbTransport) -> Result<u8> {
  let msg = send_raw(transport, b"getvar:identify")?;
  let prefix = reply_prefix(&msg)?;
  if prefix != REPLY_OKAY {
    return Err(Error::Protocol(format!("unexpected reply to \"identify\": {}", prefix)));
  }
  if msg.len() < 8 || msg[4] != 0x5 {
    return Err(Error::Protocol("unexpected data in reply to \"identify\"".into()));
  }
  Ok(msg[7])
}

/// `setvar:burnsteps <value>`: a two-part command, value sent as a raw
/// little-endian `u32` following the initial `DATA` handshake.
fn send_burnsteps(transport: &dyn UsbTransport, burnstep: u32) -> Result<()> {
  send_cmd(transport, b"setvar:burnsteps", REPLY_DATA)?;
  let msg = send_raw(transport, &burnstep.to_le_bytes())?;
  let prefix = reply_prefix(&msg)?;
  if prefix != REPLY_OKAY {
    return Err(Error::Protocol(format!("unexpected reply to burnsteps: {}", prefix)));
  }
  Ok(())
}

/// ROM stage: the device's boot ROM replies to a handful of harmless
/// `getvar` probes (kept to match the vendor sequence), then expects BL2
/// over `download:`/raw-bulk, and finally a `boot` to jump into it.
pub fn run_bootrom_stage(transport: &dyn UsbTransport, image: &AmlImage) -> Result<()> {
  let mut item = image.item_get("USB", "DDR")?;

  send_cmd(transport, b"getvar:serialno", REPLY_OKAY)?;
  send_cmd(transport, b"getvar:getchipinfo-1", REPLY_OKAY)?;
  send_cmd(transport, b"getvar:getchipinfo-0", REPLY_OKAY)?;
  send_cmd(transport, b"getvar:getchipinfo-1", REPLY_OKAY)?;
  send_cmd(transport, b"getvar:getchipinfo-2", REPLY_OKAY)?;
  send_cmd(transport, b"getvar:getchipinfo-3", REPLY_OKAY)?;
  send_burnsteps(transport, BOOTROM_BURNSTEPS_0)?;
  send_cmd(transport, b"getvar:getchipinfo-1", REPLY_OKAY)?;
  send_burnsteps(transport, BOOTROM_BURNSTEPS_1)?;

  send_cmd(transport, b"getvar:downloadsize", REPLY_OKAY)?;
  send_cmd(transport, b"download:00010000", REPLY_DATA)?;

  let mut bl2 = Vec::with_capacity(item.size() as usize);
  item.read_to_end(&mut bl2)?;
  tracing::info!("sending SPL image...");
  send_cmd(transport, &bl2, REPLY_OKAY)?;

  send_burnsteps(transport, BOOTROM_BURNSTEPS_2)?;
  send_cmd(transport, b"boot", REPLY_OKAY)?;
  Ok(())
}

/// BL2/SPL stage: U-Boot, running from BL2, repeatedly issues a CBW asking
/// for the next chunk of its own TPL image until `done` is set.
pub fn run_bl2_stage(transport: &dyn UsbTransport, image: &AmlImage) -> Result<()> {
  send_cmd_identify(transport)?;
  send_burnsteps(transport, BOOTROM_BURNSTEPS_3)?;

  let mut item = image.item_get("USB", "UBOOT")?;

  loop {
    transport.bulk_out(b"getvar:cbw")?;
    let mut buf = vec![0u8; USB_READ_LEN];
    let read = transport.bulk_in(&mut buf)?;
    buf.truncate(read);
    let cbw = Cbw::parse(&buf)?;

    if cbw.done {
      tracing::info!("TPL sending is done");
      break;
    }

    item.seek(SeekFrom::Start(cbw.offset as u64))?;
    let mut remaining = cbw.size as usize;
    let mut chunk_buf = vec![0u8; remaining];
    item.read_exact(&mut chunk_buf)?;

    let mut offset = 0;
    let mut running_sum: u32 = 0;
    while remaining > 0 {
      let to_send = remaining.min(USB_BULK_SIZE);
      send_cmd(transport, format!("download:{:08x}", to_send).as_bytes(), REPLY_DATA)?;

      let slice = &chunk_buf[offset..offset + to_send];
      let msg = send_raw(transport, slice)?;
      if reply_prefix(&msg)? != REPLY_OKAY {
        return Err(Error::Protocol("unexpected reply to data tx".into()));
      }

      running_sum = running_sum.wrapping_add(adnl_checksum(slice));
      remaining -= to_send;
      offset += to_send;
    }

    send_cmd(transport, b"setvar:checksum", REPLY_DATA)?;
    let msg = send_raw(transport, &running_sum.to_le_bytes())?;
    if reply_prefix(&msg)? != REPLY_OKAY {
      return Err(Error::Protocol("CRC error during tx".into()));
    }
  }

  Ok(())
}

fn tpl_send_burnsteps(transport: &dyn UsbTransport, value: u32) -> Result<()> {
  send_cmd(transport, format!("oem setvar burnsteps {:#x}", value).as_bytes(), REPLY_OKAY)?;
  Ok(())
}

/// Burns one `PARTITION` item, polling `mwrite:verify=addsum` until the
/// device has consumed the whole image, then waits for its SHA-1 verify.
pub fn tpl_burn_partition(transport: &dyn UsbTransport, part_item: &mut AmlImageItem, image: &AmlImage) -> Result<()> {
  let part_name = part_item.sub_type().to_string();
  tracing::info!(partition = %part_name, "burning partition");

  let oem_cmd = format!("oem mwrite {:#x} normal store {}", part_item.size(), part_name);
  send_cmd(transport, oem_cmd.as_bytes(), REPLY_OKAY)?;

  loop {
    let msg = send_raw(transport, b"mwrite:verify=addsum")?;
    let text = String::from_utf8_lossy(&msg).to_string();

    if text.starts_with(REPLY_OKAY) {
      tracing::info!("burning is done");
      break;
    }

    if !text.starts_with("DATAOUT") {
      return Err(Error::Protocol(format!("unexpected reply to \"mwrite:verify=addsum\": {}", text)));
    }

    let rest = &text[7..];
    let (size_hex, offs_hex) =
      rest.split_once(':').ok_or_else(|| Error::Protocol(format!("malformed DATAOUT reply: {}", text)))?;
    let size = u32::from_str_radix(size_hex.trim_end_matches('\0'), 16)
      .map_err(|_| Error::Protocol(format!("bad size in DATAOUT reply: {}", text)))?;
    let offs = u32::from_str_radix(offs_hex.trim_end_matches('\0'), 16)
      .map_err(|_| Error::Protocol(format!("bad offset in DATAOUT reply: {}", text)))?;

    part_item.seek(SeekFrom::Start(offs as u64))?;
    let mut buf = vec![0u8; size as usize];
    part_item.read_exact(&mut buf)?;
    let checksum = adnl_checksum(&buf);

    let mut sent = 0;
    let mut remaining = size as usize;
    while remaining > 0 {
      let to_send = remaining.min(USB_BULK_SIZE);
      transport.bulk_out(&buf[sent..sent + to_send])?;
      sent += to_send;
      remaining -= to_send;
    }

    let msg = send_raw(transport, &checksum.to_le_bytes())?;
    if reply_prefix(&msg)? != REPLY_OKAY {
      return Err(Error::Protocol("CRC error during tx".into()));
    }
  }

  let mut verify_item = image.item_get("VERIFY", &part_name)?;
  let mut sha1_text = String::new();
  verify_item.read_to_string(&mut sha1_text)?;
  let verify_cmd = format!("oem verify {}", sha1_text.trim());
  transport.bulk_out(verify_cmd.as_bytes())?;

  let verify_start = std::time::Instant::now();
  loop {
    let mut buf = vec![0u8; USB_READ_LEN];
    let read = transport.bulk_in(&mut buf)?;
    buf.truncate(read);
    let prefix = reply_prefix(&buf)?;
    if prefix == REPLY_OKAY {
      break;
    }
    if prefix == REPLY_INFO {
      if verify_start.elapsed() > VERIFY_TIMEOUT {
        return Err(Error::VerifyTimeout(part_name));
      }
      sleep(Duration::from_secs(1));
      continue;
    }
    return Err(Error::VerifyFailed(part_name));
  }

  tracing::info!(partition = %part_name, "verified ok");
  Ok(())
}

/// TPL/U-Boot stage: disk init, then burn every `PARTITION` item in the
/// image, then optionally reboot.
pub fn run_tpl_stage(transport: &dyn UsbTransport, image: &AmlImage, options: &Options) -> Result<()> {
  send_cmd_identify(transport)?;

  tpl_send_burnsteps(transport, TPL_BURNSTEPS_0)?;
  tpl_send_burnsteps(transport, TPL_BURNSTEPS_1)?;
  send_cmd(transport, format!("oem disk_initial {}", options.wipe.code()).as_bytes(), REPLY_OKAY)?;
  tpl_send_burnsteps(transport, TPL_BURNSTEPS_2)?;

  for mut item in image.items(Some("PARTITION"), None, None) {
    tpl_burn_partition(transport, &mut item, image)?;
  }

  if options.reset {
    tracing::info!("rebooting device");
    send_cmd(transport, b"reboot", REPLY_OKAY)?;
  }

  Ok(())
}

/// Drives a whole ADNL burn end to end: identify, reset to ROM stage if
/// necessary, then ROM -> BL2 -> TPL, reconnecting between each stage since
/// the device re-enumerates at every transition.
#[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
pub fn burn(image: &AmlImage, options: &Options, callback: Option<Callback>) -> Result<()> {
  let emit = |event: Event| {
    if let Some(cb) = &callback {
      cb(event);
    }
  };

  emit(Event::FindingDevice);
  let transport = RusbTransport::open(VENDOR_ID, PRODUCT_ID_ADNL)?;
  emit(Event::Connected);

  let stage = send_cmd_identify(&transport)?;
  if stage == ADNL_TPL_STAGE {
    send_cmd(&transport, b"reboot-romusb", REPLY_OKAY)?;
    let last_addr = transport.device_address();
    drop(transport);
    emit(Event::Resetting);
    wait_for_device(Some(last_addr))?;
  } else if stage != ADNL_ROM_STAGE {
    return Err(Error::WrongMode(format!("unknown ADNL stage {}", stage)));
  }

  let transport = RusbTransport::open(VENDOR_ID, PRODUCT_ID_ADNL)?;
  emit(Event::Stage("ROM".into()));
  run_bootrom_stage(&transport, image)?;

  emit(Event::Stage("BL2".into()));
  run_bl2_stage(&transport, image)?;
  let last_addr = transport.device_address();
  drop(transport);

  emit(Event::Resetting);
  wait_for_device(Some(last_addr))?;

  let transport = RusbTransport::open(VENDOR_ID, PRODUCT_ID_ADNL)?;
  emit(Event::Stage("TPL".into()));
  run_tpl_stage(&transport, image, options)?;

  emit(Event::Complete);
  Ok(())
}

/// Waits for a device to appear at `VENDOR_ID`/`PRODUCT_ID_ADNL` with a bus
/// address different from `last_addr`, matching the original's
/// `wait_for_device(last_dev_addr)`. A device that never actually
/// re-enumerates (same address throughout) must not be accepted.
fn wait_for_device(last_addr: Option<u8>) -> Result<()> {
  for _ in 0..30 {
    if let Some(addr) = RusbTransport::probe_address(VENDOR_ID, PRODUCT_ID_ADNL) {
      if Some(addr) != last_addr {
        return Ok(());
      }
    }
    sleep(Duration::from_secs(1));
  }
  Err(Error::NotFound)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::{MockStep, MockTransport};

  fn okay_reply() -> Vec<u8> {
    b"OKAY".to_vec()
  }

  #[test]
  fn cbw_parses_done_flag() {
    let mut msg = vec![0u8; 22];
    msg[4..8].copy_from_slice(b"AMLC");
    msg[8..12].copy_from_slice(&7u32.to_le_bytes());
    msg[12..16].copy_from_slice(&1024u32.to_le_bytes());
    msg[16..20].copy_from_slice(&2048u32.to_le_bytes());
    msg[20] = 0;
    msg[21] = 1;

    let cbw = Cbw::parse(&msg).unwrap();
    assert_eq!(cbw.seq, 7);
    assert_eq!(cbw.size, 1024);
    assert_eq!(cbw.offset, 2048);
    assert!(cbw.need_checksum);
    assert!(cbw.done);
  }

  #[test]
  fn cbw_rejects_wrong_magic() {
    let mut msg = vec![0u8; 22];
    msg[4..8].copy_from_slice(b"XXXX");
    assert!(Cbw::parse(&msg).is_err());
  }

  #[test]
  fn adnl_checksum_sums_le_words() {
    let buf = [0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00];
    assert_eq!(adnl_checksum(&buf), 3);
  }

  #[test]
  fn adnl_checksum_zero_pads_short_tail() {
    let buf = [0xFF, 0x00];
    assert_eq!(adnl_checksum(&buf), 0xFF);
  }

  #[test]
  fn send_burnsteps_round_trips_through_mock() {
    let transport = MockTransport::new(vec![
      MockStep::BulkOut { expect_data: b"setvar:burnsteps".to_vec() },
      MockStep::BulkIn { reply: b"DATA".to_vec() },
      MockStep::BulkOut { expect_data: BOOTROM_BURNSTEPS_0.to_le_bytes().to_vec() },
      MockStep::BulkIn { reply: okay_reply() },
    ]);
    send_burnsteps(&transport, BOOTROM_BURNSTEPS_0).unwrap();
    assert!(transport.is_exhausted());
  }

  #[test]
  fn send_cmd_identify_extracts_stage_byte() {
    let mut reply = vec![0u8; 8];
    reply[0..4].copy_from_slice(b"OKAY");
    reply[4] = 0x5;
    reply[7] = ADNL_TPL_STAGE;

    let transport = MockTransport::new(vec![
      MockStep::BulkOut { expect_data: b"getvar:identify".to_vec() },
      MockStep::BulkIn { reply },
    ]);
    let stage = send_cmd_identify(&transport).unwrap();
    assert_eq!(stage, ADNL_TPL_STAGE);
  }

  #[test]
  fn send_cmd_rejects_unexpected_prefix() {
    let transport = MockTransport::new(vec![
      MockStep::BulkOut { expect_data: b"boot".to_vec() },
      MockStep::BulkIn { reply: b"FAIL".to_vec() },
    ]);
    let err = send_cmd(&transport, b"boot", REPLY_OKAY).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
  }
}
