//! Parser for the `conf:platform` text descriptor carried inside the
//! composite image (`Key:value` / `Key=value` lines). Optimus's burn steps
//! (SPL/Uboot download addresses, secure-boot control registers) are all
//! read from here.

use crate::{Error, Result};

/// One `Control0=`/`Control1=` pair: a register address and the value to
/// write there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlReg {
  pub reg: u32,
  pub val: u32,
}

/// Decoded platform descriptor. Field names mirror the descriptor's keys
/// with the trailing separator stripped and converted to snake_case.
#[derive(Debug, Clone)]
pub struct Platform {
  pub platform: u32,
  pub ddr_load: u32,
  pub ddr_run: u32,
  pub uboot_load: u32,
  pub uboot_run: u32,
  pub bin_para: u32,
  pub uboot_down: u32,
  pub uboot_decomp: u32,
  pub uboot_enc_down: u32,
  pub uboot_enc_run: u32,
  pub uboot: u32,
  pub encrypt_reg: u32,
  pub bl2_para_addr: u32,
  pub control0: ControlReg,
  pub control1: ControlReg,
  pub encrypt_reg0: u32,
  pub encrypt_reg1: u32,
  pub encrypt_reg2: u32,
  pub need_password: u32,
  pub ddr_size: u32,
  pub enc_chip_id1: u32,
  pub enc_chip_id2: u32,
}

enum Value {
  Int(u32),
  Control(ControlReg),
}

struct ParserSpec {
  pattern: &'static str,
  required: bool,
  default: &'static str,
  kind: Kind,
}

#[derive(Clone, Copy)]
enum Kind {
  Int,
  Control,
}

fn parse_int_auto(text: &str) -> Result<u32> {
  let text = text.trim();
  let (text, radix) = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
    (hex, 16)
  } else {
    (text, 10)
  };
  u32::from_str_radix(text, radix).map_err(|_| Error::Protocol(format!("invalid integer in platform descriptor: {:?}", text)))
}

fn parse_value(kind: Kind, pattern: &str, line: &str) -> Result<Value> {
  let rest = &line[pattern.len()..];
  match kind {
    Kind::Int => Ok(Value::Int(parse_int_auto(rest)?)),
    Kind::Control => {
      let (reg, val) = rest
        .split_once(':')
        .ok_or_else(|| Error::Protocol(format!("malformed control register entry: {:?}", line)))?;
      Ok(Value::Control(ControlReg { reg: parse_int_auto(reg)?, val: parse_int_auto(val)? }))
    }
  }
}

const PARSERS: &[ParserSpec] = &[
  ParserSpec { pattern: "Platform:", required: true, default: "0", kind: Kind::Int },
  ParserSpec { pattern: "DDRLoad:", required: true, default: "0", kind: Kind::Int },
  ParserSpec { pattern: "DDRRun:", required: true, default: "0", kind: Kind::Int },
  ParserSpec { pattern: "UbootLoad:", required: false, default: "0", kind: Kind::Int },
  ParserSpec { pattern: "UbootRun:", required: false, default: "0", kind: Kind::Int },
  ParserSpec { pattern: "BinPara:", required: false, default: "0", kind: Kind::Int },
  ParserSpec { pattern: "Uboot_down:", required: false, default: "0", kind: Kind::Int },
  ParserSpec { pattern: "Uboot_decomp:", required: false, default: "0", kind: Kind::Int },
  ParserSpec { pattern: "Uboot_enc_down:", required: false, default: "0", kind: Kind::Int },
  ParserSpec { pattern: "Uboot_enc_run:", required: false, default: "0", kind: Kind::Int },
  ParserSpec { pattern: "Uboot:", required: false, default: "0", kind: Kind::Int },
  ParserSpec { pattern: "Encrypt_reg:", required: false, default: "0", kind: Kind::Int },
  ParserSpec { pattern: "bl2ParaAddr=", required: false, default: "0", kind: Kind::Int },
  ParserSpec { pattern: "Control0=", required: true, default: "0:0", kind: Kind::Control },
  ParserSpec { pattern: "Control1=", required: true, default: "0:0", kind: Kind::Control },
  ParserSpec { pattern: "Encrypt_reg0=", required: false, default: "0", kind: Kind::Int },
  ParserSpec { pattern: "Encrypt_reg1=", required: false, default: "0", kind: Kind::Int },
  ParserSpec { pattern: "Encrypt_reg2=", required: false, default: "0", kind: Kind::Int },
  ParserSpec { pattern: "needPassword=", required: false, default: "0", kind: Kind::Int },
  ParserSpec { pattern: "DDRSize:", required: false, default: "0", kind: Kind::Int },
  ParserSpec { pattern: "enc_chip_id1:", required: false, default: "0", kind: Kind::Int },
  ParserSpec { pattern: "enc_chip_id2:", required: false, default: "0", kind: Kind::Int },
];

impl Platform {
  /// Parses the descriptor text. Each line is matched, consume-on-match,
  /// against the ordered parser list above; unmatched parsers fall back to
  /// their default (if optional) or raise [`Error::MissingPlatformKey`] (if
  /// required). Unknown lines are logged and ignored, never rejected.
  pub fn parse(data: &str) -> Result<Self> {
    let mut remaining: Vec<&ParserSpec> = PARSERS.iter().collect();
    let mut values: Vec<Option<Value>> = (0..PARSERS.len()).map(|_| None).collect();

    for raw_line in data.lines() {
      let line = raw_line.trim();
      if line.is_empty() {
        continue;
      }

      let matched_index = remaining.iter().position(|spec| line.starts_with(spec.pattern));
      match matched_index {
        Some(idx) => {
          let spec = remaining.remove(idx);
          let global_idx = PARSERS.iter().position(|p| std::ptr::eq(p, spec)).unwrap();
          values[global_idx] = Some(parse_value(spec.kind, spec.pattern, line)?);
        }
        None => {
          tracing::warn!(%line, "platform descriptor line not recognized, ignoring");
        }
      }
    }

    for spec in &remaining {
      let global_idx = PARSERS.iter().position(|p| std::ptr::eq(*p, *spec)).unwrap();
      if spec.required {
        return Err(Error::MissingPlatformKey(spec.pattern));
      }
      let default_line = format!("{}{}", spec.pattern, spec.default);
      values[global_idx] = Some(parse_value(spec.kind, spec.pattern, &default_line)?);
    }

    let int_at = |i: usize| -> u32 {
      match values[i].take().unwrap() {
        Value::Int(v) => v,
        Value::Control(_) => unreachable!("parser spec kind mismatch"),
      }
    };
    let control_at = |i: usize| -> ControlReg {
      match values[i].take().unwrap() {
        Value::Control(c) => c,
        Value::Int(_) => unreachable!("parser spec kind mismatch"),
      }
    };

    Ok(Platform {
      platform: int_at(0),
      ddr_load: int_at(1),
      ddr_run: int_at(2),
      uboot_load: int_at(3),
      uboot_run: int_at(4),
      bin_para: int_at(5),
      uboot_down: int_at(6),
      uboot_decomp: int_at(7),
      uboot_enc_down: int_at(8),
      uboot_enc_run: int_at(9),
      uboot: int_at(10),
      encrypt_reg: int_at(11),
      bl2_para_addr: int_at(12),
      control0: control_at(13),
      control1: control_at(14),
      encrypt_reg0: int_at(15),
      encrypt_reg1: int_at(16),
      encrypt_reg2: int_at(17),
      need_password: int_at(18),
      ddr_size: int_at(19),
      enc_chip_id1: int_at(20),
      enc_chip_id2: int_at(21),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const SAMPLE: &str = "\
Platform:0x01
DDRLoad:0x20000000
DDRRun:0x20000000
UbootLoad:0x21000000
UbootRun:0x21000000
Control0=0x10:0x1
Control1=0x14:0x0
needPassword=1
";

  #[test]
  fn parses_required_and_optional_fields() {
    let platform = Platform::parse(SAMPLE).unwrap();
    assert_eq!(platform.platform, 1);
    assert_eq!(platform.ddr_load, 0x2000_0000);
    assert_eq!(platform.uboot_load, 0x2100_0000);
    assert_eq!(platform.control0, ControlReg { reg: 0x10, val: 1 });
    assert_eq!(platform.control1, ControlReg { reg: 0x14, val: 0 });
    assert_eq!(platform.need_password, 1);
    assert_eq!(platform.bin_para, 0);
  }

  #[test]
  fn missing_required_key_is_an_error() {
    let data = "DDRLoad:0x1\nDDRRun:0x1\nControl0=0x1:0x1\nControl1=0x1:0x1\n";
    let err = Platform::parse(data).unwrap_err();
    assert!(matches!(err, Error::MissingPlatformKey("Platform:")));
  }

  #[test]
  fn unknown_lines_are_ignored_not_rejected() {
    let mut data = SAMPLE.to_string();
    data.push_str("SomeFutureKey:123\n");
    assert!(Platform::parse(&data).is_ok());
  }

  #[test]
  fn accepts_decimal_values() {
    let data = "Platform:1\nDDRLoad:10\nDDRRun:10\nControl0=1:1\nControl1=1:1\n";
    let platform = Platform::parse(data).unwrap();
    assert_eq!(platform.ddr_load, 10);
  }
}
