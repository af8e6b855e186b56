//! Composite image container (`aml_upgrade_package.img`) parser.
//!
//! The container is a fixed header followed by a flat array of item
//! descriptors (v1: 32-byte type strings, v2: 256-byte type strings), each
//! describing a byte range within the same file. Items are read through a
//! shared file handle via [`AmlImageItem`], which behaves like a seekable,
//! bounded view onto that range.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::{Error, Result};

const MAGIC: u32 = 0x27B51956;
const HEAD_SIZE: usize = 4 + 4 + 4 + 8 + 4 + 4 + 36;
const ITEM_V1_SIZE: usize = 4 + 4 + 8 + 8 + 8 + 32 + 32 + 4 + 2 + 2 + 24;
const ITEM_V2_SIZE: usize = 4 + 4 + 8 + 8 + 8 + 256 + 256 + 4 + 2 + 2 + 24;

/// How an item's bytes are laid out on the target media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
  Normal,
  Sparse,
}

impl FileType {
  fn from_raw(raw: u32) -> Result<Self> {
    match raw {
      0x00 => Ok(FileType::Normal),
      0xfe => Ok(FileType::Sparse),
      other => Err(Error::UnknownFileType(other)),
    }
  }

  /// The string form the wire protocol expects in a `download` command.
  pub fn as_str(self) -> &'static str {
    match self {
      FileType::Normal => "normal",
      FileType::Sparse => "sparse",
    }
  }
}

#[derive(Debug, Clone)]
struct ItemDescriptor {
  offset_in_img: u64,
  size: u64,
  main_type: String,
  sub_type: String,
  file_type: FileType,
  verify: bool,
}

/// A parsed composite image: its header plus the list of items it carries.
pub struct AmlImage {
  file: Arc<Mutex<File>>,
  version: u32,
  items: Vec<ItemDescriptor>,
}

impl AmlImage {
  /// Opens `path`, validates the header (invariant: magic must be
  /// `0x27B51956` and version must be 1 or 2), and reads every item
  /// descriptor that follows it.
  pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
    let path = path.as_ref();
    tracing::debug!(path = %path.display(), "opening composite image");
    let mut file = File::open(path)?;

    let mut head_buf = [0u8; HEAD_SIZE];
    file.read_exact(&mut head_buf)?;

    let version = u32::from_le_bytes(head_buf[4..8].try_into()?);
    let magic = u32::from_le_bytes(head_buf[8..12].try_into()?);
    let item_num = u32::from_le_bytes(head_buf[20..24].try_into()?);

    if magic != MAGIC {
      return Err(Error::InvalidImage(format!("magic mismatch: expected {:#x}, got {:#x}", MAGIC, magic)));
    }
    if version != 1 && version != 2 {
      return Err(Error::InvalidImage(format!("unsupported item descriptor version {}", version)));
    }

    let item_size = if version == 1 { ITEM_V1_SIZE } else { ITEM_V2_SIZE };
    let type_len = if version == 1 { 32 } else { 256 };

    let mut items = Vec::with_capacity(item_num as usize);
    let mut buf = vec![0u8; item_size];
    for i in 0..item_num {
      file.read_exact(&mut buf)?;
      let file_type_raw = u32::from_le_bytes(buf[4..8].try_into()?);
      let offset_in_img = u64::from_le_bytes(buf[16..24].try_into()?);
      let size = u64::from_le_bytes(buf[24..32].try_into()?);

      let main_start = 32;
      let sub_start = main_start + type_len;
      let verify_start = sub_start + type_len;

      let main_type = read_c_string(&buf[main_start..main_start + type_len])?;
      let sub_type = read_c_string(&buf[sub_start..sub_start + type_len])?;
      let verify = u32::from_le_bytes(buf[verify_start..verify_start + 4].try_into()?) != 0;

      tracing::trace!(i, %main_type, %sub_type, offset_in_img, size, "parsed item descriptor");

      items.push(ItemDescriptor {
        offset_in_img,
        size,
        main_type,
        sub_type,
        file_type: FileType::from_raw(file_type_raw)?,
        verify,
      });
    }

    tracing::info!(version, item_count = items.len(), "composite image parsed");

    Ok(Self { file: Arc::new(Mutex::new(file)), version, items })
  }

  /// Header version (1 or 2), which selected the item descriptor layout.
  pub fn version(&self) -> u32 {
    self.version
  }

  /// All items, optionally filtered by any subset of main type, sub type,
  /// and file type. `None` matches any value for that field, mirroring the
  /// reference implementation's `items(main_type, sub_type, file_type)`.
  pub fn items(&self, main_type: Option<&str>, sub_type: Option<&str>, file_type: Option<FileType>) -> Vec<AmlImageItem> {
    self
      .items
      .iter()
      .filter(|item| {
        main_type.is_none_or(|mt| mt == item.main_type)
          && sub_type.is_none_or(|st| st == item.sub_type)
          && file_type.is_none_or(|ft| ft == item.file_type)
      })
      .map(|descriptor| AmlImageItem::new(self.file.clone(), descriptor.clone()))
      .collect()
  }

  /// Count of items, optionally filtered by main type.
  pub fn item_count(&self, main_type: Option<&str>) -> usize {
    self
      .items
      .iter()
      .filter(|item| main_type.is_none_or(|mt| mt == item.main_type))
      .count()
  }

  /// The single item matching `main_type`/`sub_type` exactly, or
  /// [`Error::ItemNotFound`].
  pub fn item_get(&self, main_type: &str, sub_type: &str) -> Result<AmlImageItem> {
    self
      .items
      .iter()
      .find(|item| item.main_type == main_type && item.sub_type == sub_type)
      .map(|descriptor| AmlImageItem::new(self.file.clone(), descriptor.clone()))
      .ok_or_else(|| Error::ItemNotFound { main_type: main_type.to_string(), sub_type: sub_type.to_string() })
  }

  /// Convenience check used by [`crate::dispatcher`] to pick an engine:
  /// does this image carry the `aml/usb_flow` sentinel item.
  pub fn has_item(&self, main_type: &str, sub_type: &str) -> bool {
    self.items.iter().any(|item| item.main_type == main_type && item.sub_type == sub_type)
  }
}

fn read_c_string(raw: &[u8]) -> Result<String> {
  let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
  Ok(String::from_utf8(raw[..end].to_vec())?)
}

/// A seekable, bounded view onto one item's bytes within the shared image
/// file. Reads and seeks never escape `[0, size)`.
pub struct AmlImageItem {
  file: Arc<Mutex<File>>,
  descriptor: ItemDescriptor,
  cur_offset: u64,
}

impl AmlImageItem {
  fn new(file: Arc<Mutex<File>>, descriptor: ItemDescriptor) -> Self {
    Self { file, descriptor, cur_offset: 0 }
  }

  pub fn main_type(&self) -> &str {
    &self.descriptor.main_type
  }

  pub fn sub_type(&self) -> &str {
    &self.descriptor.sub_type
  }

  pub fn file_type(&self) -> FileType {
    self.descriptor.file_type
  }

  pub fn is_verify(&self) -> bool {
    self.descriptor.verify
  }

  pub fn size(&self) -> u64 {
    self.descriptor.size
  }

  pub fn tell(&self) -> u64 {
    self.cur_offset
  }
}

impl Read for AmlImageItem {
  fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
    let remaining = self.descriptor.size.saturating_sub(self.cur_offset);
    let want = (out.len() as u64).min(remaining) as usize;
    if want == 0 {
      return Ok(0);
    }

    let mut file = self.file.lock().unwrap();
    file.seek(SeekFrom::Start(self.descriptor.offset_in_img + self.cur_offset))?;
    let read = file.read(&mut out[..want])?;
    self.cur_offset += read as u64;
    Ok(read)
  }
}

impl Seek for AmlImageItem {
  /// Clamps to `[0, size]`, never negative, matching the reference
  /// implementation's `seek()`.
  fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
    let target: i128 = match pos {
      SeekFrom::Start(p) => p as i128,
      SeekFrom::Current(delta) => self.cur_offset as i128 + delta as i128,
      SeekFrom::End(delta) => self.descriptor.size as i128 + delta as i128,
    };
    let clamped = target.clamp(0, self.descriptor.size as i128) as u64;
    self.cur_offset = clamped;
    Ok(clamped)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  fn write_test_image(path: &Path, version: u32, items: &[(&str, &str, &[u8])]) {
    let mut buf = Vec::new();
    buf.extend_from_slice(&0u32.to_le_bytes()); // crc
    buf.extend_from_slice(&version.to_le_bytes());
    buf.extend_from_slice(&MAGIC.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes()); // size, filled below
    buf.extend_from_slice(&4u32.to_le_bytes()); // item_align_size
    buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
    buf.extend_from_slice(&[0u8; 36]);

    let type_len = if version == 1 { 32 } else { 256 };
    let mut payload = Vec::new();
    let header_and_items_len = HEAD_SIZE + items.len() * (4 + 4 + 8 + 8 + 8 + type_len * 2 + 4 + 2 + 2 + 24);

    for (i, (main, sub, data)) in items.iter().enumerate() {
      let offset_in_img = (header_and_items_len + payload.len()) as u64;
      buf.extend_from_slice(&(i as u32).to_le_bytes()); // id
      buf.extend_from_slice(&0u32.to_le_bytes()); // file_type: normal
      buf.extend_from_slice(&0u64.to_le_bytes()); // cur_offset
      buf.extend_from_slice(&offset_in_img.to_le_bytes());
      buf.extend_from_slice(&(data.len() as u64).to_le_bytes());

      let mut main_buf = vec![0u8; type_len];
      main_buf[..main.len()].copy_from_slice(main.as_bytes());
      buf.extend_from_slice(&main_buf);

      let mut sub_buf = vec![0u8; type_len];
      sub_buf[..sub.len()].copy_from_slice(sub.as_bytes());
      buf.extend_from_slice(&sub_buf);

      buf.extend_from_slice(&0u32.to_le_bytes()); // verify
      buf.extend_from_slice(&0u16.to_le_bytes()); // is_backup
      buf.extend_from_slice(&0u16.to_le_bytes()); // backup_id
      buf.extend_from_slice(&[0u8; 24]);

      payload.extend_from_slice(data);
    }

    buf.extend_from_slice(&payload);

    let mut f = File::create(path).unwrap();
    f.write_all(&buf).unwrap();
  }

  #[test]
  fn rejects_bad_magic() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("img.bin");
    let mut f = File::create(&path).unwrap();
    f.write_all(&[0u8; HEAD_SIZE]).unwrap();
    drop(f);

    let err = AmlImage::open(&path).unwrap_err();
    assert!(matches!(err, Error::InvalidImage(_)));
  }

  #[test]
  fn parses_v2_items_and_reads_them_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("img.bin");
    write_test_image(&path, 2, &[("USB", "DDR", b"ddr payload"), ("USB", "UBOOT", b"uboot payload")]);

    let image = AmlImage::open(&path).unwrap();
    assert_eq!(image.version(), 2);
    assert_eq!(image.item_count(None), 2);
    assert_eq!(image.item_count(Some("USB")), 2);

    let mut item = image.item_get("USB", "DDR").unwrap();
    assert_eq!(item.size(), 11);
    let mut out = Vec::new();
    item.read_to_end(&mut out).unwrap();
    assert_eq!(out, b"ddr payload");
  }

  #[test]
  fn item_not_found_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("img.bin");
    write_test_image(&path, 1, &[("USB", "DDR", b"x")]);

    let image = AmlImage::open(&path).unwrap();
    let err = image.item_get("USB", "MISSING").unwrap_err();
    assert!(matches!(err, Error::ItemNotFound { .. }));
  }

  #[test]
  fn seek_clamps_to_item_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("img.bin");
    write_test_image(&path, 1, &[("USB", "DDR", b"0123456789")]);

    let image = AmlImage::open(&path).unwrap();
    let mut item = image.item_get("USB", "DDR").unwrap();

    assert_eq!(item.seek(SeekFrom::End(100)).unwrap(), 10);
    assert_eq!(item.seek(SeekFrom::Current(-100)).unwrap(), 0);
    assert_eq!(item.seek(SeekFrom::Start(4)).unwrap(), 4);

    let mut out = [0u8; 3];
    item.read_exact(&mut out).unwrap();
    assert_eq!(&out, b"456");
  }

  #[test]
  fn has_item_detects_usb_flow_sentinel() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("img.bin");
    write_test_image(&path, 2, &[("aml", "usb_flow", b"adnl")]);

    let image = AmlImage::open(&path).unwrap();
    assert!(image.has_item("aml", "usb_flow"));
    assert!(!image.has_item("aml", "other"));
  }
}
