//! Top-level engine selection.
//!
//! Callers never pick ADNL or Optimus themselves: [`flash`] opens the
//! composite image, probes for the `aml/usb_flow` sentinel item, and routes
//! to the matching protocol engine.

use crate::image::AmlImage;
use crate::{adnl, optimus, Callback, Event, Options, Result};

/// Which protocol engine a given image was routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
  Adnl,
  Optimus,
}

impl std::fmt::Display for Engine {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Engine::Adnl => write!(f, "ADNL"),
      Engine::Optimus => write!(f, "Optimus"),
    }
  }
}

/// Selects and runs the engine matching `image`. Presence of `aml/usb_flow`
/// selects ADNL; otherwise Optimus.
pub fn flash(image: AmlImage, options: Options, callback: Option<Callback>) -> Result<()> {
  let engine = if image.has_item("aml", "usb_flow") { Engine::Adnl } else { Engine::Optimus };
  tracing::info!(%engine, "engine selected");
  if let Some(cb) = &callback {
    cb(Event::EngineSelected(engine));
  }

  match engine {
    Engine::Adnl => adnl::burn(&image, &options, callback),
    Engine::Optimus => optimus::burn(&image, &options, callback),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs::File;
  use std::io::Write;

  const MAGIC: u32 = 0x27B5_1956;
  const HEAD_SIZE: usize = 4 + 4 + 4 + 8 + 4 + 4 + 36;

  fn write_test_image(path: &std::path::Path, items: &[(&str, &str, &[u8])]) {
    let type_len = 256usize;
    let item_size = 4 + 4 + 8 + 8 + 8 + type_len * 2 + 4 + 2 + 2 + 24;
    let mut buf = Vec::new();
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&2u32.to_le_bytes());
    buf.extend_from_slice(&MAGIC.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes());
    buf.extend_from_slice(&4u32.to_le_bytes());
    buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
    buf.extend_from_slice(&[0u8; 36]);

    let header_and_items_len = HEAD_SIZE + items.len() * item_size;
    let mut payload = Vec::new();
    for (i, (main, sub, data)) in items.iter().enumerate() {
      let offset_in_img = (header_and_items_len + payload.len()) as u64;
      buf.extend_from_slice(&(i as u32).to_le_bytes());
      buf.extend_from_slice(&0u32.to_le_bytes());
      buf.extend_from_slice(&0u64.to_le_bytes());
      buf.extend_from_slice(&offset_in_img.to_le_bytes());
      buf.extend_from_slice(&(data.len() as u64).to_le_bytes());

      let mut main_buf = vec![0u8; type_len];
      main_buf[..main.len()].copy_from_slice(main.as_bytes());
      buf.extend_from_slice(&main_buf);

      let mut sub_buf = vec![0u8; type_len];
      sub_buf[..sub.len()].copy_from_slice(sub.as_bytes());
      buf.extend_from_slice(&sub_buf);

      buf.extend_from_slice(&0u32.to_le_bytes());
      buf.extend_from_slice(&0u16.to_le_bytes());
      buf.extend_from_slice(&0u16.to_le_bytes());
      buf.extend_from_slice(&[0u8; 24]);

      payload.extend_from_slice(data);
    }
    buf.extend_from_slice(&payload);

    let mut f = File::create(path).unwrap();
    f.write_all(&buf).unwrap();
  }

  #[test]
  fn selects_adnl_when_sentinel_present() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("img.bin");
    write_test_image(&path, &[("aml", "usb_flow", b"adnl")]);
    let image = AmlImage::open(&path).unwrap();
    assert!(image.has_item("aml", "usb_flow"));
  }

  #[test]
  fn selects_optimus_without_sentinel() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("img.bin");
    write_test_image(&path, &[("USB", "DDR", b"ddr")]);
    let image = AmlImage::open(&path).unwrap();
    assert!(!image.has_item("aml", "usb_flow"));
  }
}
