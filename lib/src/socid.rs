//! Decodes the 8-byte SoC identity reply returned by `IDENTIFY_HOST`
//! (`REQ_IDENTIFY_HOST` / Optimus `SocId`).

use crate::Result;

/// IPL/SPL/TPL stage markers, read from byte 3 of the identify reply.
pub const STAGE_MINOR_IPL: u8 = 0;
pub const STAGE_MINOR_SPL: u8 = 8;
pub const STAGE_MINOR_TPL: u8 = 16;

/// Named boot stage derived from `(stage_major, stage_minor)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  Ipl,
  Spl,
  Tpl,
  Unknown,
}

/// Decoded SoC identity: chip version plus current boot stage and password
/// state, as reported by `IDENTIFY_HOST`.
#[derive(Debug, Clone, Copy)]
pub struct SocId {
  raw: [u8; 8],
}

impl SocId {
  /// Parses the fixed 8-byte identify reply.
  pub fn parse(raw: &[u8]) -> Result<Self> {
    if raw.len() < 8 {
      return Err(crate::Error::Protocol(format!("identify reply too short: {} bytes", raw.len())));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&raw[..8]);
    Ok(Self { raw: buf })
  }

  pub fn major(&self) -> u8 {
    self.raw[0]
  }

  pub fn minor(&self) -> u8 {
    self.raw[1]
  }

  pub fn stage_major(&self) -> u8 {
    self.raw[2]
  }

  pub fn stage_minor(&self) -> u8 {
    self.raw[3]
  }

  pub fn need_password(&self) -> bool {
    self.raw[4] != 0
  }

  pub fn password_ok(&self) -> bool {
    self.raw[5] != 0
  }

  /// Named stage this identity reports, `Unknown` for anything other than
  /// `stage_major == 0` with a recognized `stage_minor`.
  pub fn stage(&self) -> Stage {
    match (self.stage_major(), self.stage_minor()) {
      (0, STAGE_MINOR_IPL) => Stage::Ipl,
      (0, STAGE_MINOR_SPL) => Stage::Spl,
      (0, STAGE_MINOR_TPL) => Stage::Tpl,
      _ => Stage::Unknown,
    }
  }
}

impl std::fmt::Display for SocId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self.stage() {
      Stage::Ipl => "IPL",
      Stage::Spl => "SPL",
      Stage::Tpl => "TPL",
      Stage::Unknown => "UNKNOWN",
    };
    write!(
      f,
      "{}-{}-{}-{}-{}-{} ({})",
      self.major(),
      self.minor(),
      self.stage_major(),
      self.stage_minor(),
      self.raw[4],
      self.raw[5],
      name
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn decodes_tpl_stage() {
    let id = SocId::parse(&[0x02, 0x01, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00]).unwrap();
    assert_eq!(id.major(), 2);
    assert_eq!(id.minor(), 1);
    assert_eq!(id.stage(), Stage::Tpl);
    assert!(!id.need_password());
    assert!(!id.password_ok());
  }

  #[test]
  fn decodes_locked_spl_stage() {
    let id = SocId::parse(&[0x02, 0x01, 0x00, 0x08, 0x01, 0x00, 0x00, 0x00]).unwrap();
    assert_eq!(id.stage(), Stage::Spl);
    assert!(id.need_password());
    assert!(!id.password_ok());
  }

  #[test]
  fn rejects_short_reply() {
    assert!(SocId::parse(&[0x01, 0x02]).is_err());
  }

  #[test]
  fn unknown_stage_major_is_unknown() {
    let id = SocId::parse(&[0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]).unwrap();
    assert_eq!(id.stage(), Stage::Unknown);
  }
}
