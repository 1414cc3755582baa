//! Probe/commit negotiation and transport sizing
//!
//! Two control round trips on the shared streaming-control structure lock
//! in a format before any video transfer is submitted: SET_CUR(probe) with
//! the candidate, GET_CUR(probe) to learn what the device clamped it to,
//! then SET_CUR(commit) with the device's answer. Commit failure is fatal
//! to starting the stream; a device overriding the requested format/frame
//! pair is not; the caller just gets told what was actually selected.

use std::sync::Arc;

use tracing::debug;
use uvc_proto::{StreamControl, consts, probe_len};

use crate::error::{Error, Result};
use crate::transfer::{ControlSetup, TransferRequest};
use crate::transport::UsbTransport;

/// Class-specific request targeting an interface, device-to-host.
const REQ_CLASS_GET: u8 = 0xA1;
/// Class-specific request targeting an interface, host-to-device.
const REQ_CLASS_SET: u8 = 0x21;

/// Runs probe/commit against one VideoStreaming interface.
pub struct StreamNegotiator {
    transport: Arc<dyn UsbTransport>,
    interface: u8,
    version: u16,
}

impl StreamNegotiator {
    pub fn new(transport: Arc<dyn UsbTransport>, interface: u8, version: u16) -> StreamNegotiator {
        StreamNegotiator {
            transport,
            interface,
            version,
        }
    }

    fn setup(&self, request_type: u8, request: u8, selector: u8) -> ControlSetup {
        ControlSetup {
            request_type,
            request,
            value: u16::from(selector) << 8,
            index: u16::from(self.interface),
        }
    }

    fn set(&self, selector: u8, control: &StreamControl) -> Result<()> {
        let wire = control.encode(self.version);
        let req = TransferRequest::control(
            self.transport.clone(),
            self.setup(REQ_CLASS_SET, consts::SET_CUR, selector),
            &wire,
            wire.len() as u16,
        );
        req.submit_and_wait()?;
        Ok(())
    }

    /// SET_CUR the probe control with a candidate.
    pub fn set_probe(&self, control: &StreamControl) -> Result<()> {
        self.set(consts::VS_PROBE_CONTROL, control)
    }

    /// GET_CUR the probe control back; the device may have clamped or
    /// overridden any field.
    pub fn get_probe(&self, control: &mut StreamControl) -> Result<()> {
        let len = probe_len(self.version) as u16;
        let req = TransferRequest::control(
            self.transport.clone(),
            self.setup(REQ_CLASS_GET, consts::GET_CUR, consts::VS_PROBE_CONTROL),
            &[],
            len,
        );
        let received = req.submit_and_wait()?;
        let data = req.result_data();
        control.decode(self.version, &data[..received.min(data.len())])?;
        debug!(
            format = control.format_index,
            frame = control.frame_index,
            interval = control.frame_interval,
            max_frame = control.max_video_frame_size,
            max_payload = control.max_payload_transfer_size,
            "probe response"
        );
        Ok(())
    }

    /// SET_CUR the commit control, locking the stream configuration in.
    pub fn commit(&self, control: &StreamControl) -> Result<()> {
        self.set(consts::VS_COMMIT_CONTROL, control)
            .map_err(|e| match e {
                Error::Transfer(t) => Error::CommitRejected(t),
                other => other,
            })
    }
}

/// Bulk transfers to keep in flight: enough to cover one frame at the
/// negotiated payload size, and never fewer than two so the bus pipeline
/// stays busy while a completion is serviced.
pub fn bulk_transfer_count(max_frame_size: u32, max_payload_size: u32) -> usize {
    let per_frame = max_frame_size.div_ceil(max_payload_size.max(1));
    per_frame.max(2) as usize
}

/// Isochronous packets for one transfer covering a whole frame at the
/// endpoint's max packet size.
pub fn iso_packet_count(max_frame_size: u32, max_packet_size: u16) -> u32 {
    max_frame_size.div_ceil(u32::from(max_packet_size).max(1)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransferError;
    use crate::testing::MockTransport;
    use crate::transfer::TransferKind;
    use std::sync::Mutex;

    #[test]
    fn test_bulk_transfer_count() {
        assert_eq!(bulk_transfer_count(10_000, 3072), 4);
        assert_eq!(bulk_transfer_count(3072, 3072), 2);
        assert_eq!(bulk_transfer_count(1, 3072), 2);
        assert_eq!(bulk_transfer_count(100, 0), 100);
    }

    #[test]
    fn test_iso_packet_count() {
        assert_eq!(iso_packet_count(10_000, 3072), 4);
        assert_eq!(iso_packet_count(3072, 3072), 1);
        assert_eq!(iso_packet_count(0, 3072), 1);
    }

    #[test]
    fn test_probe_round_trip_echoes_device_values() {
        let version = 0x0110;
        let probed: Arc<Mutex<Option<StreamControl>>> = Arc::new(Mutex::new(None));
        let probed_in_device = probed.clone();

        let transport = MockTransport::completing(move |kind, buf| {
            let TransferKind::Control { setup } = kind else {
                panic!("unexpected kind");
            };
            assert_eq!(setup.index, 1);
            match (setup.request, setup.value >> 8) {
                (consts::SET_CUR, sel)
                    if sel == u16::from(consts::VS_PROBE_CONTROL) =>
                {
                    let mut seen = StreamControl::default();
                    seen.decode(version, buf).unwrap();
                    *probed_in_device.lock().unwrap() = Some(seen);
                    Ok(buf.len())
                }
                (consts::GET_CUR, _) => {
                    // Clamp: the device insists on frame 2 and fills in
                    // its sizing.
                    let mut answer = probed_in_device.lock().unwrap().unwrap();
                    answer.frame_index = 2;
                    answer.max_video_frame_size = 614_400;
                    answer.max_payload_transfer_size = 3072;
                    let wire = answer.encode(version);
                    buf[..wire.len()].copy_from_slice(&wire);
                    Ok(wire.len())
                }
                (consts::SET_CUR, sel)
                    if sel == u16::from(consts::VS_COMMIT_CONTROL) =>
                {
                    Ok(buf.len())
                }
                other => panic!("unexpected request {other:?}"),
            }
        });

        let negotiator = StreamNegotiator::new(transport, 1, version);
        let mut control = StreamControl::candidate(1, 1, 333333);
        negotiator.set_probe(&control).unwrap();
        negotiator.get_probe(&mut control).unwrap();

        assert_eq!(control.format_index, 1);
        assert_eq!(control.frame_index, 2);
        assert_eq!(control.max_payload_transfer_size, 3072);
        assert_eq!(probed.lock().unwrap().unwrap().frame_index, 1);

        negotiator.commit(&control).unwrap();
    }

    #[test]
    fn test_commit_failure_is_fatal() {
        let transport = MockTransport::completing(|kind, buf| {
            let TransferKind::Control { setup } = kind else {
                panic!("unexpected kind");
            };
            if setup.value >> 8 == u16::from(consts::VS_COMMIT_CONTROL) {
                Err(TransferError::Stall)
            } else {
                Ok(buf.len())
            }
        });

        let negotiator = StreamNegotiator::new(transport, 1, 0x0100);
        let control = StreamControl::candidate(1, 1, 333333);
        negotiator.set_probe(&control).unwrap();

        assert!(matches!(
            negotiator.commit(&control),
            Err(Error::CommitRejected(TransferError::Stall))
        ));
    }

    #[test]
    fn test_short_probe_answer_is_an_error() {
        let transport = MockTransport::completing(|kind, buf| {
            let TransferKind::Control { setup } = kind else {
                panic!("unexpected kind");
            };
            match setup.request {
                consts::GET_CUR => Ok(10.min(buf.len())),
                _ => Ok(buf.len()),
            }
        });

        let negotiator = StreamNegotiator::new(transport, 1, 0x0100);
        let mut control = StreamControl::default();
        assert!(matches!(
            negotiator.get_probe(&mut control),
            Err(Error::Protocol(_))
        ));
    }
}
