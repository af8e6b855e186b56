//! Low-level Amlogic USB command primitives, shared by the ADNL and Optimus
//! engines. Each function is a thin, typed wrapper around one `bRequest`
//! code plus whatever bulk follow-up it requires.

use std::thread::sleep;
use std::time::Duration;

use crate::transport::UsbTransport;
use crate::{Error, Result};

pub const REQ_WRITE_MEM: u8 = 0x01;
pub const REQ_READ_MEM: u8 = 0x02;
pub const REQ_MODIFY_MEM: u8 = 0x04;
pub const REQ_RUN_IN_ADDR: u8 = 0x05;
pub const REQ_WR_LARGE_MEM: u8 = 0x11;
pub const REQ_RD_LARGE_MEM: u8 = 0x12;
pub const REQ_IDENTIFY_HOST: u8 = 0x20;
pub const REQ_TPL_CMD: u8 = 0x30;
pub const REQ_TPL_STAT: u8 = 0x31;
pub const REQ_BULKCMD: u8 = 0x34;
pub const REQ_PASSWORD: u8 = 0x35;
pub const REQ_NOP: u8 = 0x36;
pub const REQ_GET_AMLC: u8 = 0x50;
pub const REQ_WRITE_AMLC: u8 = 0x60;

pub const FLAG_KEEP_POWER_ON: u32 = 0x10;

pub const AMLC_AMLS_BLOCK_LENGTH: usize = 0x200;
pub const AMLC_MAX_BLOCK_LENGTH: usize = 0x4000;
pub const AMLC_MAX_TRANSFER_LENGTH: usize = 65536;

/// The device accepts at most this many blocks in a single `WR_LARGE_MEM`
/// (or `RD_LARGE_MEM`) control transaction; longer transfers are split into
/// several such transactions.
pub const MAX_LARGE_BLOCK_COUNT: usize = 65535;

const ACK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Writes at most 64 bytes to `address` via `WRITE_MEM`.
#[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
pub fn write_simple_memory(transport: &dyn UsbTransport, address: u32, data: &[u8]) -> Result<()> {
  if data.len() > 64 {
    return Err(Error::InvalidOperation("write_simple_memory: maximum size is 64 bytes".into()));
  }
  let value = (address >> 16) as u16;
  let index = (address & 0xffff) as u16;
  transport.control_out(REQ_WRITE_MEM, value, index, data)?;
  Ok(())
}

/// Writes an arbitrary-length buffer in 64-byte `WRITE_MEM` chunks.
#[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
pub fn write_memory(transport: &dyn UsbTransport, address: u32, data: &[u8]) -> Result<()> {
  let mut offset = 0;
  while offset < data.len() {
    let chunk = (data.len() - offset).min(64);
    write_simple_memory(transport, address + offset as u32, &data[offset..offset + chunk])?;
    offset += chunk;
  }
  Ok(())
}

/// Reads at most 64 bytes from `address` via `READ_MEM`.
#[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
pub fn read_simple_memory(transport: &dyn UsbTransport, address: u32, length: usize) -> Result<Vec<u8>> {
  if length == 0 {
    return Ok(Vec::new());
  }
  if length > 64 {
    return Err(Error::InvalidOperation("read_simple_memory: maximum size is 64 bytes".into()));
  }
  let value = (address >> 16) as u16;
  let index = (address & 0xffff) as u16;
  let mut buf = vec![0u8; length];
  let read = transport.control_in(REQ_READ_MEM, value, index, &mut buf)?;
  if read != length {
    return Err(Error::Protocol(format!("read_simple_memory: expected {} bytes, got {}", length, read)));
  }
  Ok(buf)
}

/// Reads an arbitrary-length buffer in 64-byte `READ_MEM` chunks.
#[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
pub fn read_memory(transport: &dyn UsbTransport, address: u32, length: usize) -> Result<Vec<u8>> {
  let mut data = vec![0u8; length];
  let mut offset = 0;
  while offset < length {
    let chunk = (length - offset).min(64);
    let part = read_simple_memory(transport, address + offset as u32, chunk)?;
    data[offset..offset + chunk].copy_from_slice(&part);
    offset += chunk;
  }
  Ok(data)
}

/// A single word at `address`, read via [`read_simple_memory`].
pub fn read_reg(transport: &dyn UsbTransport, address: u32) -> Result<u32> {
  let bytes = read_simple_memory(transport, address, 4)?;
  Ok(u32::from_le_bytes(bytes.as_slice().try_into()?))
}

/// `MODIFY_MEM` opcodes, matching the reference implementation's
/// `modifyMemory` helper family.
#[derive(Debug, Clone, Copy)]
pub enum ModifyOp {
  Write = 0,
  MaskAnd = 1,
  MaskOr = 2,
  MaskNand = 3,
  WriteBits = 4,
  Copy = 5,
  CopyMaskAnd = 6,
  Memcpy = 7,
}

/// `MODIFY_MEM`: `(address1, data, mask, address2)` interpreted per `opcode`.
pub fn modify_memory(
  transport: &dyn UsbTransport,
  opcode: ModifyOp,
  address1: u32,
  data: u32,
  mask: u32,
  address2: u32,
) -> Result<()> {
  let mut control_data = Vec::with_capacity(16);
  control_data.extend_from_slice(&address1.to_le_bytes());
  control_data.extend_from_slice(&data.to_le_bytes());
  control_data.extend_from_slice(&mask.to_le_bytes());
  control_data.extend_from_slice(&address2.to_le_bytes());
  transport.control_out(REQ_MODIFY_MEM, opcode as u16, 0, &control_data)?;
  Ok(())
}

pub fn write_reg(transport: &dyn UsbTransport, address: u32, value: u32) -> Result<()> {
  modify_memory(transport, ModifyOp::Write, address, value, 0, 0)
}

pub fn mask_reg_and(transport: &dyn UsbTransport, address: u32, mask: u32) -> Result<()> {
  modify_memory(transport, ModifyOp::MaskAnd, address, 0, mask, 0)
}

pub fn mask_reg_or(transport: &dyn UsbTransport, address: u32, mask: u32) -> Result<()> {
  modify_memory(transport, ModifyOp::MaskOr, address, 0, mask, 0)
}

/// `RUN_IN_ADDR`: jump execution to `address`, optionally keeping USB power.
#[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
pub fn run(transport: &dyn UsbTransport, address: u32, keep_power: bool) -> Result<()> {
  let data = if keep_power { address | FLAG_KEEP_POWER_ON } else { address };
  let value = (address >> 16) as u16;
  let index = (address & 0xffff) as u16;
  transport.control_out(REQ_RUN_IN_ADDR, value, index, &data.to_le_bytes())?;
  Ok(())
}

/// `IDENTIFY_HOST`: the raw 8-byte SoC identity reply.
#[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
pub fn identify(transport: &dyn UsbTransport) -> Result<[u8; 8]> {
  let mut buf = [0u8; 8];
  let read = transport.control_in(REQ_IDENTIFY_HOST, 0, 0, &mut buf)?;
  if read != 8 {
    return Err(Error::Protocol(format!("identify: expected 8 bytes, got {}", read)));
  }
  Ok(buf)
}

/// `WR_LARGE_MEM` for a single transaction (at most [`MAX_LARGE_BLOCK_COUNT`]
/// blocks); callers needing more must split via [`write_large_memory`].
fn write_large_memory_once(
  transport: &dyn UsbTransport,
  address: u32,
  data: &[u8],
  block_length: usize,
  append_zeros: bool,
) -> Result<()> {
  let mut data_vec = data.to_vec();
  if append_zeros {
    let remainder = data_vec.len() % block_length;
    if remainder != 0 {
      data_vec.extend(std::iter::repeat_n(0u8, block_length - remainder));
    }
  } else if data_vec.len() % block_length != 0 {
    return Err(Error::InvalidOperation("write_large_memory: data must be a multiple of block_length".into()));
  }

  let block_count = data_vec.len() / block_length;
  if block_count > MAX_LARGE_BLOCK_COUNT {
    return Err(Error::InvalidOperation(format!(
      "write_large_memory_once: {} blocks exceeds the {} cap",
      block_count, MAX_LARGE_BLOCK_COUNT
    )));
  }

  let mut control_data = Vec::with_capacity(16);
  control_data.extend_from_slice(&address.to_le_bytes());
  control_data.extend_from_slice(&(data_vec.len() as u32).to_le_bytes());
  control_data.extend_from_slice(&0u32.to_le_bytes());
  control_data.extend_from_slice(&0u32.to_le_bytes());

  transport.control_out(REQ_WR_LARGE_MEM, block_length as u16, block_count as u16, &control_data)?;

  for chunk in data_vec.chunks(block_length) {
    transport.bulk_out(chunk)?;
  }
  Ok(())
}

/// Writes data of any length to `address` using `block_length`-sized
/// blocks, splitting into multiple `WR_LARGE_MEM` transactions whenever the
/// block count would exceed [`MAX_LARGE_BLOCK_COUNT`].
#[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
pub fn write_large_memory(
  transport: &dyn UsbTransport,
  address: u32,
  data: &[u8],
  block_length: usize,
  append_zeros: bool,
) -> Result<()> {
  let max_bytes_per_transfer = MAX_LARGE_BLOCK_COUNT * block_length;
  let mut offset = 0;
  while offset < data.len() {
    let write_length = (data.len() - offset).min(max_bytes_per_transfer);
    write_large_memory_once(
      transport,
      address + offset as u32,
      &data[offset..offset + write_length],
      block_length,
      append_zeros,
    )?;
    offset += write_length;
  }
  Ok(())
}

/// `RD_LARGE_MEM` for a single transaction (at most [`MAX_LARGE_BLOCK_COUNT`]
/// blocks); callers needing more must split via [`read_large_memory`].
fn read_large_memory_once(transport: &dyn UsbTransport, address: u32, length: usize, block_length: usize) -> Result<Vec<u8>> {
  if length % block_length != 0 {
    return Err(Error::InvalidOperation("read_large_memory: length must be a multiple of block_length".into()));
  }
  let block_count = length / block_length;
  if block_count > MAX_LARGE_BLOCK_COUNT {
    return Err(Error::InvalidOperation(format!(
      "read_large_memory_once: {} blocks exceeds the {} cap",
      block_count, MAX_LARGE_BLOCK_COUNT
    )));
  }

  let mut control_data = Vec::with_capacity(16);
  control_data.extend_from_slice(&address.to_le_bytes());
  control_data.extend_from_slice(&(length as u32).to_le_bytes());
  control_data.extend_from_slice(&0u32.to_le_bytes());
  control_data.extend_from_slice(&0u32.to_le_bytes());

  transport.control_out(REQ_RD_LARGE_MEM, block_length as u16, block_count as u16, &control_data)?;

  let mut data = vec![0u8; length];
  for chunk in data.chunks_mut(block_length) {
    transport.bulk_in(chunk)?;
  }
  Ok(data)
}

/// Reads `length` bytes from `address` in `block_length`-sized blocks,
/// splitting into multiple `RD_LARGE_MEM` transactions past
/// [`MAX_LARGE_BLOCK_COUNT`] blocks.
#[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
pub fn read_large_memory(transport: &dyn UsbTransport, address: u32, length: usize, block_length: usize) -> Result<Vec<u8>> {
  let max_bytes_per_transfer = MAX_LARGE_BLOCK_COUNT * block_length;
  let mut data = Vec::with_capacity(length);
  let mut offset = 0;
  while offset < length {
    let read_length = (length - offset).min(max_bytes_per_transfer);
    data.extend(read_large_memory_once(transport, address + offset as u32, read_length, block_length)?);
    offset += read_length;
  }
  Ok(data)
}

/// `TPL_CMD`: send a sub-coded command to the TPL (U-Boot) command channel.
pub fn tpl_command(transport: &dyn UsbTransport, subcode: u16, command: &[u8]) -> Result<()> {
  transport.control_out(REQ_TPL_CMD, 0, subcode, command)?;
  Ok(())
}

/// `TPL_STAT`: poll the status of the last `TPL_CMD`.
pub fn tpl_stat(transport: &dyn UsbTransport, subcode: u16) -> Result<[u8; 8]> {
  let mut buf = [0u8; 8];
  transport.control_in(REQ_TPL_STAT, 0, subcode, &mut buf)?;
  Ok(buf)
}

/// [`tpl_stat`], trimmed of trailing NUL padding and decoded as text.
pub fn tpl_stat_text(transport: &dyn UsbTransport, subcode: u16) -> Result<String> {
  let buf = tpl_stat(transport, subcode)?;
  let end = buf.iter().rposition(|&b| b != 0).map(|pos| pos + 1).unwrap_or(0);
  Ok(String::from_utf8(buf[..end].to_vec())?)
}

/// `PASSWORD`: unlock a board that reported `need_password`. The device
/// expects exactly 64 bytes.
#[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
pub fn send_password(transport: &dyn UsbTransport, password: &[u8]) -> Result<()> {
  if password.len() != 64 {
    return Err(Error::InvalidOperation("send_password: password must be exactly 64 bytes".into()));
  }
  transport.control_out(REQ_PASSWORD, 0, 0, password)?;
  Ok(())
}

/// `NOP`, used only to probe liveness.
pub fn nop(transport: &dyn UsbTransport) -> Result<()> {
  transport.control_out(REQ_NOP, 0, 0, &[])?;
  Ok(())
}

/// `BULKCMD`: issues a U-Boot shell command without waiting for its status,
/// matching the reference driver's `bulkCmd(cmd, read_status=False)`.
/// Optimus's burn steps poll the status separately via [`bulk_cmd_poll`]
/// since a command may run for seconds before reporting completion.
#[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
pub fn bulk_cmd_issue(transport: &dyn UsbTransport, command: &str) -> Result<()> {
  let mut payload = command.as_bytes().to_vec();
  payload.push(0x00);
  transport.control_out(REQ_BULKCMD, 0, 0, &payload)?;
  Ok(())
}

/// Reads one status frame for the last [`bulk_cmd_issue`], trimmed of
/// trailing NUL padding.
pub fn bulk_cmd_poll(transport: &dyn UsbTransport) -> Result<String> {
  let mut buf = vec![0u8; 512];
  let read = transport.bulk_in(&mut buf)?;
  if read == 0 {
    return Err(Error::Protocol("bulk_cmd_poll: empty response".into()));
  }
  let slice = &buf[..read];
  let start = slice.iter().position(|&b| b != 0).unwrap_or(0);
  let end = slice.iter().rposition(|&b| b != 0).map(|pos| pos + 1).unwrap_or(0);
  Ok(String::from_utf8(slice[start..end].to_vec())?)
}

/// Issues a `BULKCMD` and returns its trimmed text reply, for commands that
/// complete synchronously with no `Continue:*` status phase.
pub fn bulk_cmd(transport: &dyn UsbTransport, command: &str) -> Result<String> {
  bulk_cmd_issue(transport, command)?;
  bulk_cmd_poll(transport)
}

/// `GET_AMLC`: poll for the next BL2 boot data request, returning
/// `(length, offset)` into the TPL image the device wants next.
#[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
pub fn get_boot_amlc(transport: &dyn UsbTransport) -> Result<(u32, u32)> {
  transport.control_out(REQ_GET_AMLC, AMLC_AMLS_BLOCK_LENGTH as u16, 0, &[])?;

  let mut buf = vec![0u8; AMLC_AMLS_BLOCK_LENGTH];
  let read = transport.bulk_in(&mut buf)?;
  if read < 16 {
    return Err(Error::Protocol("get_boot_amlc: short read".into()));
  }
  let tag = String::from_utf8(buf[0..4].to_vec())?;
  if tag != "AMLC" {
    return Err(Error::Protocol(format!("get_boot_amlc: unexpected tag {:?}", tag)));
  }
  let length = u32::from_le_bytes(buf[8..12].try_into()?);
  let offset = u32::from_le_bytes(buf[12..16].try_into()?);

  let mut ack = [0u8; 16];
  ack[..4].copy_from_slice(b"OKAY");
  transport.bulk_out(&ack)?;

  Ok((length, offset))
}

/// `WRITE_AMLC`: write one block of BL2 payload data (or the final `AMLS`
/// block) at `offset` within the TPL image.
#[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
pub fn write_amlc_data(transport: &dyn UsbTransport, offset: u32, data: &[u8]) -> Result<()> {
  if data.is_empty() {
    transport.control_out(REQ_WRITE_AMLC, (offset / AMLC_AMLS_BLOCK_LENGTH as u32) as u16, 0, &[])?;
  } else {
    transport.control_out(
      REQ_WRITE_AMLC,
      (offset / AMLC_AMLS_BLOCK_LENGTH as u32) as u16,
      (data.len() - 1) as u16,
      &[],
    )?;

    for chunk in data.chunks(AMLC_MAX_BLOCK_LENGTH) {
      transport.bulk_out(chunk)?;
      sleep(Duration::from_millis(10));
    }
  }

  let mut ack_buf = [0u8; 16];
  let read = transport.bulk_in(&mut ack_buf)?;
  if read < 4 {
    return Err(Error::Protocol("write_amlc_data: no acknowledgment received".into()));
  }
  let ack = String::from_utf8(ack_buf[0..4].to_vec())?;
  if ack != "OKAY" {
    return Err(Error::Protocol(format!("write_amlc_data: unexpected ack {:?}", ack)));
  }
  Ok(())
}

/// Writes `data` as a sequence of `WRITE_AMLC` blocks (splitting at
/// [`AMLC_MAX_TRANSFER_LENGTH`]), then appends the trailing `AMLS` checksum
/// block at `amlc_offset`.
#[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
pub fn write_amlc_data_packet(transport: &dyn UsbTransport, seq: u8, amlc_offset: u32, data: &[u8]) -> Result<()> {
  let mut offset = 0;
  while offset < data.len() {
    let write_length = (data.len() - offset).min(AMLC_MAX_TRANSFER_LENGTH);
    write_amlc_data(transport, offset as u32, &data[offset..offset + write_length])?;
    sleep(ACK_TIMEOUT / 20);
    offset += write_length;
  }

  let checksum = amlc_checksum(data);

  let mut header = [0u8; 16];
  header[0..4].copy_from_slice(b"AMLS");
  header[4] = seq;
  header[8..12].copy_from_slice(&checksum.to_le_bytes());

  let copy_len = data.len().saturating_sub(16).min(AMLC_AMLS_BLOCK_LENGTH - 16);
  let mut amls = vec![0u8; 16 + copy_len];
  amls[0..16].copy_from_slice(&header);
  amls[16..16 + copy_len].copy_from_slice(&data[16..16 + copy_len]);

  write_amlc_data(transport, amlc_offset, &amls)
}

/// Checksum used by both the `AMLS` trailer and ADNL's partition verify
/// step: a little-endian `u32` sum over 4-byte groups, with the tail
/// (1-3 remaining bytes) folded in at reduced width. Accumulates mod 2^32.
pub fn amlc_checksum(data: &[u8]) -> u32 {
  let mut checksum: u64 = 0;
  let mut offset = 0;
  while offset < data.len() {
    let remaining = data.len() - offset;
    let val: u32 = if remaining >= 4 {
      let v = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap());
      offset += 4;
      v
    } else if remaining >= 3 {
      let mut temp = [0u8; 4];
      temp[..remaining].copy_from_slice(&data[offset..]);
      offset += 3;
      u32::from_le_bytes(temp) & 0xffffff
    } else if remaining >= 2 {
      let v = u16::from_le_bytes(data[offset..offset + 2].try_into().unwrap()) as u32;
      offset += 2;
      v
    } else {
      let v = data[offset] as u32;
      offset += 1;
      v
    };
    checksum = (checksum + val as u64) % (u32::MAX as u64 + 1);
  }
  checksum as u32
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::{ControlRequest, MockStep, MockTransport};

  #[test]
  fn checksum_matches_documented_example() {
    let data = [0xAB, 0xCD, 0xEF, 0x12, 0x34];
    assert_eq!(amlc_checksum(&data), 0x12EFCDAB + 0x34);
  }

  #[test]
  fn checksum_empty_is_zero() {
    assert_eq!(amlc_checksum(&[]), 0);
  }

  #[test]
  fn write_simple_memory_rejects_oversized_payload() {
    let transport = MockTransport::new(vec![]);
    let err = write_simple_memory(&transport, 0, &[0u8; 65]).unwrap_err();
    assert!(matches!(err, Error::InvalidOperation(_)));
  }

  #[test]
  fn write_simple_memory_sends_expected_control_out() {
    let transport = MockTransport::new(vec![MockStep::ControlOut {
      expect: ControlRequest { request_type: 0x40, request: REQ_WRITE_MEM, value: 0x0001, index: 0x0000 },
      expect_data: vec![1, 2, 3, 4],
    }]);
    write_simple_memory(&transport, 0x0001_0000, &[1, 2, 3, 4]).unwrap();
    assert!(transport.is_exhausted());
  }

  #[test]
  fn identify_parses_eight_byte_reply() {
    let transport = MockTransport::new(vec![MockStep::ControlIn {
      expect: ControlRequest { request_type: 0xC0, request: REQ_IDENTIFY_HOST, value: 0, index: 0 },
      reply: vec![2, 1, 0, 16, 0, 0, 0, 0],
    }]);
    let reply = identify(&transport).unwrap();
    assert_eq!(reply, [2, 1, 0, 16, 0, 0, 0, 0]);
  }

  #[test]
  fn write_large_memory_splits_at_block_cap() {
    let block_length = 4usize;
    let block_count = MAX_LARGE_BLOCK_COUNT + 10;
    let data = vec![0xAAu8; block_count * block_length];

    let mut steps = Vec::new();
    // first transaction: MAX_LARGE_BLOCK_COUNT blocks
    steps.push(MockStep::ControlOut {
      expect: ControlRequest {
        request_type: 0x40,
        request: REQ_WR_LARGE_MEM,
        value: block_length as u16,
        index: MAX_LARGE_BLOCK_COUNT as u16,
      },
      expect_data: {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&((MAX_LARGE_BLOCK_COUNT * block_length) as u32).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf
      },
    });
    for _ in 0..MAX_LARGE_BLOCK_COUNT {
      steps.push(MockStep::BulkOut { expect_data: vec![0xAA; block_length] });
    }
    // second transaction: remaining 10 blocks
    steps.push(MockStep::ControlOut {
      expect: ControlRequest { request_type: 0x40, request: REQ_WR_LARGE_MEM, value: block_length as u16, index: 10 },
      expect_data: {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_LARGE_BLOCK_COUNT * block_length) as u32).to_le_bytes());
        buf.extend_from_slice(&((10 * block_length) as u32).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf
      },
    });
    for _ in 0..10 {
      steps.push(MockStep::BulkOut { expect_data: vec![0xAA; block_length] });
    }

    let transport = MockTransport::new(steps);
    write_large_memory(&transport, 0, &data, block_length, false).unwrap();
    assert!(transport.is_exhausted());
  }

  #[test]
  fn read_large_memory_round_trips_a_single_block() {
    let transport = MockTransport::new(vec![
      MockStep::ControlOut {
        expect: ControlRequest { request_type: 0x40, request: REQ_RD_LARGE_MEM, value: 4, index: 2 },
        expect_data: {
          let mut buf = Vec::new();
          buf.extend_from_slice(&0x1000u32.to_le_bytes());
          buf.extend_from_slice(&8u32.to_le_bytes());
          buf.extend_from_slice(&0u32.to_le_bytes());
          buf.extend_from_slice(&0u32.to_le_bytes());
          buf
        },
      },
      MockStep::BulkIn { reply: vec![1, 2, 3, 4] },
      MockStep::BulkIn { reply: vec![5, 6, 7, 8] },
    ]);
    let data = read_large_memory(&transport, 0x1000, 8, 4).unwrap();
    assert_eq!(data, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    assert!(transport.is_exhausted());
  }

  #[test]
  fn bulk_cmd_issue_then_poll_reports_status() {
    let transport = MockTransport::new(vec![
      MockStep::ControlOut {
        expect: ControlRequest { request_type: 0x40, request: REQ_BULKCMD, value: 0, index: 0 },
        expect_data: b"low_power\0".to_vec(),
      },
      MockStep::BulkIn { reply: b"success\0\0\0\0\0\0\0\0\0".to_vec() },
    ]);
    bulk_cmd_issue(&transport, "low_power").unwrap();
    assert_eq!(bulk_cmd_poll(&transport).unwrap(), "success");
    assert!(transport.is_exhausted());
  }
}
