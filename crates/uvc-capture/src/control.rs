//! Generic UVC control handle
//!
//! A control is addressed by (unit, selector, interface). At construction
//! it is probed over the wire: GET_LEN for its size, GET_CUR for the
//! current value, and GET_MIN/GET_MAX for the range of the 1/2/4-byte
//! value controls; range discovery failing marks the control read-only.
//! Sets are asynchronous (fire-and-forget with an active-transfer list);
//! reads of the device's authoritative value go through `update`.

use std::sync::{Arc, Mutex};

use tracing::{debug, trace, warn};
use uvc_proto::{ControlDescriptor, consts};

use crate::error::{Error, Result, TransferError};
use crate::transfer::{ControlSetup, TransferRequest};
use crate::transport::UsbTransport;

/// Class-specific request targeting an interface, device-to-host.
const REQ_CLASS_GET: u8 = 0xA1;
/// Class-specific request targeting an interface, host-to-device.
const REQ_CLASS_SET: u8 = 0x21;

/// Largest control payload this layer keeps around.
const MAX_CONTROL_LEN: u16 = 256;

struct ControlInner {
    /// Wire size in bytes; 0 marks the control invalid/absent.
    len: u16,
    raw: Vec<u8>,
    min: u32,
    max: u32,
    read_only: bool,
}

/// A live, device-backed control.
pub struct Control {
    name: String,
    unit: u8,
    selector: u8,
    interface: u8,
    transport: Arc<dyn UsbTransport>,
    inner: Mutex<ControlInner>,
    /// Outstanding asynchronous SET transfers.
    active: Mutex<Vec<TransferRequest>>,
}

impl Control {
    /// Build a control from its descriptor and probe the device for size,
    /// current value and range. An unanswered probe yields an invalid
    /// control rather than an error.
    pub fn probe(
        transport: Arc<dyn UsbTransport>,
        descriptor: &ControlDescriptor,
        interface: u8,
    ) -> Control {
        let control = Control {
            name: descriptor.name.clone(),
            unit: descriptor.unit_id,
            selector: descriptor.selector,
            interface,
            transport,
            inner: Mutex::new(ControlInner {
                len: 0,
                raw: Vec::new(),
                min: 0,
                max: 0,
                read_only: true,
            }),
            active: Mutex::new(Vec::new()),
        };
        control.init();
        control
    }

    fn setup(&self, request_type: u8, request: u8) -> ControlSetup {
        ControlSetup {
            request_type,
            request,
            value: u16::from(self.selector) << 8,
            index: u16::from(self.unit) << 8 | u16::from(self.interface),
        }
    }

    fn class_get(&self, request: u8, len: u16) -> std::result::Result<Vec<u8>, TransferError> {
        let req = TransferRequest::control(
            self.transport.clone(),
            self.setup(REQ_CLASS_GET, request),
            &[],
            len,
        );
        let n = req.submit_and_wait()?;
        let mut data = req.result_data();
        data.truncate(n);
        Ok(data)
    }

    fn init(&self) {
        let len_bytes = match self.class_get(consts::GET_LEN, 2) {
            Ok(bytes) if !bytes.is_empty() => bytes,
            Ok(_) => return,
            Err(e) => {
                trace!(name = %self.name, error = %e, "control did not answer GET_LEN");
                return;
            }
        };
        let mut len = if len_bytes.len() >= 2 {
            u16::from_le_bytes([len_bytes[0], len_bytes[1]])
        } else {
            u16::from(len_bytes[0])
        };
        if len == 0 || len > MAX_CONTROL_LEN {
            warn!(name = %self.name, len, "control reports unusable length");
            return;
        }

        let raw = match self.class_get(consts::GET_CUR, len) {
            Ok(cur) if cur.len() == len as usize => cur,
            Ok(cur) if !cur.is_empty() => {
                // Some firmware answers GET_LEN with one size and GET_CUR
                // with another; believe the data.
                warn!(
                    name = %self.name,
                    expected = len,
                    received = cur.len(),
                    "current value does not match reported length, adopting received size"
                );
                len = cur.len() as u16;
                match self.class_get(consts::GET_CUR, len) {
                    Ok(retry) if retry.len() == len as usize => retry,
                    _ => {
                        warn!(name = %self.name, "retry at received size failed, control invalid");
                        return;
                    }
                }
            }
            _ => {
                warn!(name = %self.name, "control did not answer GET_CUR");
                return;
            }
        };

        let mut inner = self.inner.lock().unwrap();
        inner.len = len;
        inner.raw = raw;

        if matches!(len, 1 | 2 | 4) {
            let min = self.class_get(consts::GET_MIN, len);
            let max = self.class_get(consts::GET_MAX, len);
            match (min, max) {
                (Ok(min), Ok(max))
                    if min.len() == len as usize && max.len() == len as usize =>
                {
                    inner.min = decode_value(&min).unwrap_or(0);
                    inner.max = decode_value(&max).unwrap_or(0);
                    inner.read_only = false;
                }
                _ => {
                    // No ranges we know of; read-only to us.
                    debug!(name = %self.name, "control exposes no range, treating as read-only");
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> u8 {
        self.unit
    }

    pub fn selector(&self) -> u8 {
        self.selector
    }

    pub fn valid(&self) -> bool {
        self.inner.lock().unwrap().len > 0
    }

    pub fn read_only(&self) -> bool {
        self.inner.lock().unwrap().read_only
    }

    pub fn len(&self) -> u16 {
        self.inner.lock().unwrap().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn min(&self) -> u32 {
        self.inner.lock().unwrap().min
    }

    pub fn max(&self) -> u32 {
        self.inner.lock().unwrap().max
    }

    /// Cached raw value bytes.
    pub fn raw(&self) -> Vec<u8> {
        self.inner.lock().unwrap().raw.clone()
    }

    /// Cached value of a 1/2/4-byte control.
    pub fn get(&self) -> Result<u32> {
        let inner = self.inner.lock().unwrap();
        if inner.len == 0 {
            return Err(Error::ControlUnavailable(self.name.clone()));
        }
        decode_value(&inner.raw).ok_or_else(|| Error::ControlUnavailable(self.name.clone()))
    }

    /// Clamp `value` to the control's range and write it asynchronously.
    /// Returns the value actually written (the cached value for read-only
    /// controls).
    pub fn set(&self, value: u32) -> Result<u32> {
        let mut inner = self.inner.lock().unwrap();
        if inner.len == 0 {
            return Err(Error::ControlUnavailable(self.name.clone()));
        }
        let current = decode_value(&inner.raw)
            .ok_or_else(|| Error::ControlUnavailable(self.name.clone()))?;
        if inner.read_only {
            return Ok(current);
        }

        let clamped = value.clamp(inner.min, inner.max);
        if clamped == current {
            return Ok(clamped);
        }

        let len = inner.len;
        encode_value(&mut inner.raw, clamped);
        let req = TransferRequest::control(
            self.transport.clone(),
            self.setup(REQ_CLASS_SET, consts::SET_CUR),
            &inner.raw,
            len,
        );
        drop(inner);

        req.submit()?;
        let mut active = self.active.lock().unwrap();
        active.retain(|t| t.in_flight());
        active.push(req);
        Ok(clamped)
    }

    /// Nudge the value by a signed amount, clamped to the range.
    pub fn delta(&self, amount: i64) -> Result<u32> {
        let (min, max) = {
            let inner = self.inner.lock().unwrap();
            (inner.min, inner.max)
        };
        let current = self.get()?;
        let target = (i64::from(current) + amount)
            .clamp(i64::from(min), i64::from(max)) as u32;
        self.set(target)
    }

    /// Block until all outstanding asynchronous sets have completed.
    pub fn coalesce(&self) {
        let mut active = self.active.lock().unwrap();
        for req in active.iter() {
            req.wait();
        }
        active.clear();
    }

    /// Read the device's authoritative current value synchronously and
    /// refresh the cache.
    pub fn update(&self) -> Result<u32> {
        let len = {
            let inner = self.inner.lock().unwrap();
            if inner.len == 0 {
                return Err(Error::ControlUnavailable(self.name.clone()));
            }
            inner.len
        };
        let cur = self.class_get(consts::GET_CUR, len).map_err(Error::Transfer)?;
        let mut inner = self.inner.lock().unwrap();
        if cur.len() == inner.len as usize {
            inner.raw = cur;
        }
        decode_value(&inner.raw).ok_or_else(|| Error::ControlUnavailable(self.name.clone()))
    }
}

impl Drop for Control {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap();
        for req in active.iter() {
            req.cancel();
            req.wait();
        }
        active.clear();
    }
}

fn decode_value(raw: &[u8]) -> Option<u32> {
    match raw.len() {
        1 => Some(u32::from(raw[0])),
        2 => Some(u32::from(u16::from_le_bytes([raw[0], raw[1]]))),
        4 => Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
        _ => None,
    }
}

fn encode_value(raw: &mut [u8], value: u32) {
    match raw.len() {
        1 => raw[0] = value as u8,
        2 => raw.copy_from_slice(&(value as u16).to_le_bytes()),
        4 => raw.copy_from_slice(&value.to_le_bytes()),
        _ => {}
    }
}

/// Probe unit ids the descriptors never mentioned.
///
/// Vendor firmware is known to hide controls in units absent from the
/// catalog; scan the full unit id space and keep whatever answers GET_LEN.
pub fn discover_vendor_controls(
    transport: &Arc<dyn UsbTransport>,
    interface: u8,
) -> Vec<Arc<Control>> {
    let mut found = Vec::new();
    for unit in 1..=254u8 {
        let descriptor = ControlDescriptor {
            entity: uvc_proto::EntityKind::ExtensionUnit,
            unit_id: unit,
            selector: 1,
            name: format!("Vendor Unit {unit}"),
        };
        let control = Control::probe(transport.clone(), &descriptor, interface);
        if control.valid() {
            debug!(unit, len = control.len(), "vendor unit answered probe");
            found.push(Arc::new(control));
        }
    }
    found
}
