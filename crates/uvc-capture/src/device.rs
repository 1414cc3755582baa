//! Device enumeration and claim glue
//!
//! The only module that talks to rusb's enumeration side: it opens a
//! camera, detaches kernel drivers, claims the VideoControl and
//! VideoStreaming interfaces, harvests their class-specific descriptor
//! bytes and endpoint descriptors, probes the advertised controls and
//! assembles a [`VideoSession`] around the rusb transport.

use std::sync::Arc;

use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, Direction, TransferType, UsbContext};
use tracing::{debug, info, warn};
use uvc_proto::{DescriptorCatalog, Quirks};

use crate::control::{Control, discover_vendor_controls};
use crate::error::{Error, Result};
use crate::session::{EndpointInfo, EndpointKind, StreamConfig, VideoSession};
use crate::transport::{RusbTransport, UsbTransport};

const VIDEO_CLASS: u8 = 0x0e;
const SUBCLASS_VIDEO_CONTROL: u8 = 0x01;
const SUBCLASS_VIDEO_STREAMING: u8 = 0x02;

/// An opened, claimed UVC camera.
pub struct CameraDevice {
    session: VideoSession,
    handle: Arc<DeviceHandle<Context>>,
    claimed_interfaces: Vec<u8>,
    vendor_id: u16,
    product_id: u16,
}

struct StreamCandidate {
    interface: u8,
    alt_setting: u8,
    endpoint: EndpointInfo,
}

impl CameraDevice {
    /// Open the first device matching `vendor_id:product_id`.
    pub fn open(vendor_id: u16, product_id: u16) -> Result<CameraDevice> {
        let context = Context::new()?;
        for device in context.devices()?.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            if descriptor.vendor_id() == vendor_id && descriptor.product_id() == product_id {
                return CameraDevice::claim(device, descriptor);
            }
        }
        Err(Error::Usb(rusb::Error::NoDevice))
    }

    /// Claim an already-enumerated device.
    pub fn claim(device: Device<Context>, descriptor: DeviceDescriptor) -> Result<CameraDevice> {
        let handle = Arc::new(device.open()?);
        let config = device.active_config_descriptor()?;

        let mut catalog = DescriptorCatalog::new(Quirks::for_vendor(descriptor.vendor_id()));
        let mut control_interface: Option<u8> = None;
        let mut candidates: Vec<StreamCandidate> = Vec::new();

        for interface in config.interfaces() {
            for alt in interface.descriptors() {
                if alt.class_code() != VIDEO_CLASS {
                    continue;
                }
                match alt.sub_class_code() {
                    SUBCLASS_VIDEO_CONTROL => {
                        if alt.setting_number() == 0 {
                            control_interface = Some(alt.interface_number());
                            catalog.parse_video_control(alt.extra());
                        }
                    }
                    SUBCLASS_VIDEO_STREAMING => {
                        if alt.setting_number() == 0 {
                            catalog.parse_video_streaming(alt.extra(), alt.interface_number());
                        }
                        for endpoint in alt.endpoint_descriptors() {
                            if endpoint.direction() != Direction::In {
                                continue;
                            }
                            let kind = match endpoint.transfer_type() {
                                TransferType::Bulk => EndpointKind::Bulk,
                                TransferType::Isochronous => EndpointKind::Isochronous,
                                _ => continue,
                            };
                            candidates.push(StreamCandidate {
                                interface: alt.interface_number(),
                                alt_setting: alt.setting_number(),
                                endpoint: EndpointInfo {
                                    address: endpoint.address(),
                                    max_packet_size: endpoint.max_packet_size(),
                                    kind,
                                    interval: endpoint.interval(),
                                },
                            });
                        }
                    }
                    _ => {}
                }
            }
        }

        let control_interface = control_interface.ok_or(Error::MissingVideoInterface)?;
        let chosen = pick_stream_endpoint(candidates, catalog.stream_endpoint)
            .ok_or(Error::MissingVideoEndpoint)?;
        debug!(
            interface = chosen.interface,
            alt = chosen.alt_setting,
            endpoint = format_args!("{:#04x}", chosen.endpoint.address),
            kind = ?chosen.endpoint.kind,
            "selected video endpoint"
        );

        let mut claimed_interfaces = Vec::new();
        for number in [control_interface, chosen.interface] {
            claim_interface(&handle, number)?;
            claimed_interfaces.push(number);
        }

        let transport: Arc<dyn UsbTransport> = Arc::new(RusbTransport::new(handle.clone()));

        let mut controls: Vec<Arc<Control>> = catalog
            .controls
            .iter()
            .map(|desc| Arc::new(Control::probe(transport.clone(), desc, control_interface)))
            .collect();
        if catalog.sensor_window_unit().is_none() {
            // No sensor-window unit in the descriptors; vendor firmware
            // may still answer on units the catalog never saw.
            controls.extend(discover_vendor_controls(&transport, control_interface));
        }
        let live = controls.iter().filter(|c| c.valid()).count();
        info!(
            advertised = controls.len(),
            live,
            frames = catalog.frames.len(),
            "camera claimed"
        );

        let session_config = StreamConfig {
            control_interface,
            streaming_interface: chosen.interface,
            streaming_alt_setting: chosen.alt_setting,
            endpoint: chosen.endpoint,
        };

        Ok(CameraDevice {
            session: VideoSession::new(transport, catalog, session_config, controls),
            handle,
            claimed_interfaces,
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
        })
    }

    pub fn session(&self) -> &VideoSession {
        &self.session
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.product_id
    }
}

impl Drop for CameraDevice {
    fn drop(&mut self) {
        self.session.stop_video();
        for interface in &self.claimed_interfaces {
            if let Err(e) = self.handle.release_interface(*interface) {
                warn!("Failed to release interface {}: {}", interface, e);
            }
            if let Err(e) = self.handle.attach_kernel_driver(*interface) {
                debug!(
                    "Could not reattach kernel driver to interface {} (may not have been detached): {}",
                    interface, e
                );
            }
        }
    }
}

/// Detach any kernel driver and claim the interface; the drop path
/// reattaches the driver so the device returns to kernel control.
fn claim_interface(handle: &DeviceHandle<Context>, interface: u8) -> Result<()> {
    match handle.kernel_driver_active(interface) {
        Ok(true) => {
            debug!("Detaching kernel driver from interface {}", interface);
            if let Err(e) = handle.detach_kernel_driver(interface) {
                warn!(
                    "Failed to detach kernel driver from interface {}: {}",
                    interface, e
                );
            }
        }
        Ok(false) => {}
        Err(e) => {
            debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            );
        }
    }
    handle.claim_interface(interface)?;
    debug!("Claimed interface {}", interface);
    Ok(())
}

/// Prefer the endpoint the input header names; among those, bulk beats
/// isochronous, and larger iso packets beat smaller ones.
fn pick_stream_endpoint(
    candidates: Vec<StreamCandidate>,
    header_endpoint: Option<u8>,
) -> Option<StreamCandidate> {
    let mut best: Option<StreamCandidate> = None;
    for candidate in candidates {
        if let Some(address) = header_endpoint {
            if candidate.endpoint.address != address {
                continue;
            }
        }
        best = match best {
            None => Some(candidate),
            Some(current) => {
                let replace = match (current.endpoint.kind, candidate.endpoint.kind) {
                    (EndpointKind::Isochronous, EndpointKind::Bulk) => true,
                    (EndpointKind::Isochronous, EndpointKind::Isochronous) => {
                        candidate.endpoint.max_packet_size > current.endpoint.max_packet_size
                    }
                    _ => false,
                };
                Some(if replace { candidate } else { current })
            }
        };
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk_candidate(interface: u8, address: u8) -> StreamCandidate {
        StreamCandidate {
            interface,
            alt_setting: 0,
            endpoint: EndpointInfo {
                address,
                max_packet_size: 512,
                kind: EndpointKind::Bulk,
                interval: 0,
            },
        }
    }

    fn iso_candidate(interface: u8, address: u8, packet: u16) -> StreamCandidate {
        StreamCandidate {
            interface,
            alt_setting: 1,
            endpoint: EndpointInfo {
                address,
                max_packet_size: packet,
                kind: EndpointKind::Isochronous,
                interval: 1,
            },
        }
    }

    #[test]
    fn test_pick_prefers_header_endpoint() {
        let picked = pick_stream_endpoint(
            vec![bulk_candidate(1, 0x81), bulk_candidate(1, 0x82)],
            Some(0x82),
        )
        .unwrap();
        assert_eq!(picked.endpoint.address, 0x82);
    }

    #[test]
    fn test_pick_prefers_bulk_over_iso() {
        let picked = pick_stream_endpoint(
            vec![iso_candidate(1, 0x82, 3072), bulk_candidate(1, 0x82)],
            None,
        )
        .unwrap();
        assert_eq!(picked.endpoint.kind, EndpointKind::Bulk);
    }

    #[test]
    fn test_pick_prefers_larger_iso_packets() {
        let picked = pick_stream_endpoint(
            vec![iso_candidate(1, 0x82, 1024), iso_candidate(1, 0x82, 3072)],
            None,
        )
        .unwrap();
        assert_eq!(picked.endpoint.max_packet_size, 3072);
    }

    #[test]
    fn test_pick_empty_is_none() {
        assert!(pick_stream_endpoint(Vec::new(), None).is_none());
    }

    #[test]
    fn test_open_without_device() {
        // May fail earlier without USB access; either way no panic.
        match CameraDevice::open(0xffff, 0xffff) {
            Ok(_) => panic!("nonexistent device opened"),
            Err(e) => {
                eprintln!("open failed as expected: {e}");
            }
        }
    }
}
