//! USB transport abstraction.
//!
//! [`UsbTransport`] is the seam between protocol logic (`adnl`, `optimus`,
//! `cmd`) and the physical bus. [`RusbTransport`] is the real implementation,
//! backed by `rusb`. [`MockTransport`] is a scripted, in-memory stand-in used
//! by the test suites of every module above it, so the ADNL/Optimus state
//! machines can be exercised deterministically without hardware.

#[cfg(test)]
use std::collections::VecDeque;
#[cfg(test)]
use std::sync::Mutex;
use std::time::Duration;

use rusb::{Context, Direction, UsbContext};

use crate::{Error, Result};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const BULK_TIMEOUT: Duration = Duration::from_secs(5);

/// Direction-qualified control transfer request, the unit a [`MockTransport`]
/// script is built from.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
  pub request_type: u8,
  pub request: u8,
  pub value: u16,
  pub index: u16,
}

/// Everything the protocol layer needs from a live or simulated Amlogic USB
/// device. `rusb::Error` is the natural error boundary here, matching the
/// teacher's `AmlogicSoC` methods, which propagate it via `Error::UsbError`.
pub trait UsbTransport: Send + Sync {
  /// `bmRequestType=0x40` control OUT transfer.
  fn control_out(&self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<usize>;

  /// `bmRequestType=0xC0` control IN transfer.
  fn control_in(&self, request: u8, value: u16, index: u16, buf: &mut [u8]) -> Result<usize>;

  /// Bulk OUT transfer on the device's OUT endpoint.
  fn bulk_out(&self, data: &[u8]) -> Result<usize>;

  /// Bulk IN transfer on the device's IN endpoint.
  fn bulk_in(&self, buf: &mut [u8]) -> Result<usize>;

  /// Re-enumerate: release the interface and wait for the device to vanish
  /// and (optionally) come back at a new VID/PID. ADNL's BL2-to-TPL
  /// transition and Optimus's SPL-to-Uboot transition both depend on this.
  fn reset(&self) -> Result<()>;
}

/// `rusb`-backed transport talking to a real Amlogic device.
pub struct RusbTransport {
  handle: rusb::DeviceHandle<Context>,
  interface_number: u8,
  endpoint_in: u8,
  endpoint_out: u8,
}

impl RusbTransport {
  /// Opens the first device matching `vendor_id`/`product_id`, claims
  /// interface 0, and resolves its bulk endpoints.
  pub fn open(vendor_id: u16, product_id: u16) -> Result<Self> {
    tracing::debug!(vendor_id = %format!("{:#06x}", vendor_id), product_id = %format!("{:#06x}", product_id), "opening USB device");
    let context = Context::new()?;
    let device = context
      .devices()?
      .iter()
      .find(|device| {
        device
          .device_descriptor()
          .map(|desc| desc.vendor_id() == vendor_id && desc.product_id() == product_id)
          .unwrap_or(false)
      })
      .ok_or(Error::NotFound)?;

    let handle = device.open()?;
    handle.set_active_configuration(1)?;
    let interface_number: u8 = 0;
    handle.claim_interface(interface_number)?;

    let config_desc = device.active_config_descriptor()?;
    let interface = config_desc
      .interfaces()
      .find(|i| i.number() == interface_number)
      .ok_or_else(|| Error::InvalidOperation("interface 0 not found".into()))?;
    let descriptor = interface
      .descriptors()
      .next()
      .ok_or_else(|| Error::InvalidOperation("no alt setting on interface 0".into()))?;

    let mut endpoint_in = None;
    let mut endpoint_out = None;
    for ep in descriptor.endpoint_descriptors() {
      match ep.direction() {
        Direction::In => endpoint_in = Some(ep.address()),
        Direction::Out => endpoint_out = Some(ep.address()),
      }
    }
    let endpoint_in = endpoint_in.ok_or_else(|| Error::InvalidOperation("no IN endpoint".into()))?;
    let endpoint_out = endpoint_out.ok_or_else(|| Error::InvalidOperation("no OUT endpoint".into()))?;

    tracing::info!(interface_number, endpoint_in, endpoint_out, "claimed USB device");

    Ok(Self {
      handle,
      interface_number,
      endpoint_in,
      endpoint_out,
    })
  }

  /// Probes whether a device at `vendor_id`/`product_id` is currently present,
  /// without opening it. Used by Optimus's stage-detection polling loops.
  pub fn probe(vendor_id: u16, product_id: u16) -> bool {
    Self::probe_address(vendor_id, product_id).is_some()
  }

  /// Bus address of the device currently present at `vendor_id`/`product_id`,
  /// if any, without opening it. ADNL's reacquisition loop needs the address
  /// (not just presence) to tell a freshly re-enumerated device apart from
  /// one that never actually disconnected.
  pub fn probe_address(vendor_id: u16, product_id: u16) -> Option<u8> {
    let context = Context::new().ok()?;
    let devices = context.devices().ok()?;
    devices
      .iter()
      .find(|device| {
        device
          .device_descriptor()
          .map(|desc| desc.vendor_id() == vendor_id && desc.product_id() == product_id)
          .unwrap_or(false)
      })
      .map(|device| device.address())
  }

  /// Bus address of this open device, captured for comparison across a
  /// reset/re-enumeration cycle.
  pub fn device_address(&self) -> u8 {
    self.handle.device().address()
  }
}

impl UsbTransport for RusbTransport {
  fn control_out(&self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<usize> {
    Ok(self.handle.write_control(0x40, request, value, index, data, COMMAND_TIMEOUT)?)
  }

  fn control_in(&self, request: u8, value: u16, index: u16, buf: &mut [u8]) -> Result<usize> {
    Ok(self.handle.read_control(0xC0, request, value, index, buf, COMMAND_TIMEOUT)?)
  }

  fn bulk_out(&self, data: &[u8]) -> Result<usize> {
    Ok(self.handle.write_bulk(self.endpoint_out, data, BULK_TIMEOUT)?)
  }

  fn bulk_in(&self, buf: &mut [u8]) -> Result<usize> {
    Ok(self.handle.read_bulk(self.endpoint_in, buf, BULK_TIMEOUT)?)
  }

  fn reset(&self) -> Result<()> {
    self.handle.release_interface(self.interface_number)?;
    Ok(())
  }
}

impl Drop for RusbTransport {
  fn drop(&mut self) {
    if let Err(err) = self.handle.release_interface(self.interface_number) {
      tracing::trace!("interface already released: {:?}", err);
    }
  }
}

/// A single scripted exchange for [`MockTransport`].
#[cfg(test)]
#[derive(Debug, Clone)]
pub enum MockStep {
  ControlOut { expect: ControlRequest, expect_data: Vec<u8> },
  ControlIn { expect: ControlRequest, reply: Vec<u8> },
  BulkOut { expect_data: Vec<u8> },
  BulkIn { reply: Vec<u8> },
  Reset,
}

/// Deterministic, scripted [`UsbTransport`] for unit tests. Each call pops
/// the next expected step off the queue and panics (via `Error::Protocol`)
/// on a mismatch, so a test failure points at exactly which exchange in the
/// protocol sequence diverged.
#[cfg(test)]
pub struct MockTransport {
  steps: Mutex<VecDeque<MockStep>>,
}

#[cfg(test)]
impl MockTransport {
  pub fn new(steps: Vec<MockStep>) -> Self {
    Self {
      steps: Mutex::new(steps.into_iter().collect()),
    }
  }

  /// True once every scripted step has been consumed.
  pub fn is_exhausted(&self) -> bool {
    self.steps.lock().unwrap().is_empty()
  }

  fn next_step(&self) -> Result<MockStep> {
    self
      .steps
      .lock()
      .unwrap()
      .pop_front()
      .ok_or_else(|| Error::Protocol("mock transport script exhausted".into()))
  }
}

#[cfg(test)]
impl UsbTransport for MockTransport {
  fn control_out(&self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<usize> {
    let got = ControlRequest { request_type: 0x40, request, value, index };
    match self.next_step()? {
      MockStep::ControlOut { expect, expect_data } if expect == got && expect_data == data => Ok(data.len()),
      other => Err(Error::Protocol(format!("unexpected control_out {:?}, scripted: {:?}", got, other))),
    }
  }

  fn control_in(&self, request: u8, value: u16, index: u16, buf: &mut [u8]) -> Result<usize> {
    let got = ControlRequest { request_type: 0xC0, request, value, index };
    match self.next_step()? {
      MockStep::ControlIn { expect, reply } if expect == got => {
        let len = reply.len().min(buf.len());
        buf[..len].copy_from_slice(&reply[..len]);
        Ok(len)
      }
      other => Err(Error::Protocol(format!("unexpected control_in {:?}, scripted: {:?}", got, other))),
    }
  }

  fn bulk_out(&self, data: &[u8]) -> Result<usize> {
    match self.next_step()? {
      MockStep::BulkOut { expect_data } if expect_data == data => Ok(data.len()),
      other => Err(Error::Protocol(format!("unexpected bulk_out ({} bytes), scripted: {:?}", data.len(), other))),
    }
  }

  fn bulk_in(&self, buf: &mut [u8]) -> Result<usize> {
    match self.next_step()? {
      MockStep::BulkIn { reply } => {
        let len = reply.len().min(buf.len());
        buf[..len].copy_from_slice(&reply[..len]);
        Ok(len)
      }
      other => Err(Error::Protocol(format!("unexpected bulk_in, scripted: {:?}", other))),
    }
  }

  fn reset(&self) -> Result<()> {
    match self.next_step()? {
      MockStep::Reset => Ok(()),
      other => Err(Error::Protocol(format!("unexpected reset, scripted: {:?}", other))),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn mock_transport_replays_scripted_control_exchange() {
    let transport = MockTransport::new(vec![MockStep::ControlIn {
      expect: ControlRequest { request_type: 0xC0, request: 0x20, value: 0, index: 0 },
      reply: vec![1, 2, 3, 4, 5, 6, 7, 8],
    }]);

    let mut buf = [0u8; 8];
    let read = transport.control_in(0x20, 0, 0, &mut buf).unwrap();
    assert_eq!(read, 8);
    assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
    assert!(transport.is_exhausted());
  }

  #[test]
  fn mock_transport_rejects_out_of_order_call() {
    let transport = MockTransport::new(vec![MockStep::Reset]);
    let mut buf = [0u8; 4];
    assert!(transport.control_in(0x20, 0, 0, &mut buf).is_err());
  }

  #[test]
  fn mock_transport_rejects_mismatched_request() {
    let transport = MockTransport::new(vec![MockStep::ControlOut {
      expect: ControlRequest { request_type: 0x40, request: 0x01, value: 0, index: 0 },
      expect_data: vec![0xAA],
    }]);
    let err = transport.control_out(0x01, 0, 0, &[0xBB]).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
  }
}
