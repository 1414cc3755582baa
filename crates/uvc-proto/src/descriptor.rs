//! Class-specific descriptor parsing
//!
//! The enumeration layer hands us the raw "extra" byte range of each claimed
//! video interface: a sequence of self-length-prefixed records classified by
//! a (type, subtype) pair. Parsing is total: a malformed record is skipped
//! with a diagnostic and never aborts enumeration, and every field read is
//! bounds-checked against the record's declared length before it happens.

use tracing::{debug, trace, warn};

use crate::consts;
use crate::error::{ProtocolError, Result};
use crate::types::{
    ControlDescriptor, EntityKind, FormatInfo, FrameDefinition, FrameIntervals, PixelFormat,
};

/// Camera (input terminal) control bitmap: bit, selector, name.
const CAMERA_CONTROLS: &[(u8, u8, &str)] = &[
    (0, 0x01, "Scanning Mode"),
    (1, 0x02, "AE Mode"),
    (2, 0x03, "AE Priority"),
    (3, 0x04, "Exposure Time Absolute"),
    (4, 0x05, "Exposure Time Relative"),
    (5, 0x06, "Focus Absolute"),
    (6, 0x07, "Focus Relative"),
    (7, 0x09, "Iris Absolute"),
    (8, 0x0a, "Iris Relative"),
    (9, 0x0b, "Zoom Absolute"),
    (10, 0x0c, "Zoom Relative"),
    (11, 0x0d, "Pan/Tilt Absolute"),
    (12, 0x0e, "Pan/Tilt Relative"),
    (13, 0x0f, "Roll Absolute"),
    (14, 0x10, "Roll Relative"),
    (17, 0x08, "Focus Auto"),
    (18, 0x11, "Privacy"),
];

/// Processing unit control bitmap: bit, selector, name.
///
/// Bit 19 is not part of the class specification; the supported astronomy
/// cameras advertise their pixel clock there.
const PROCESSING_CONTROLS: &[(u8, u8, &str)] = &[
    (0, 0x02, "Brightness"),
    (1, 0x03, "Contrast"),
    (2, 0x06, "Hue"),
    (3, 0x07, "Saturation"),
    (4, 0x08, "Sharpness"),
    (5, 0x09, "Gamma"),
    (6, 0x0a, "White Balance Temperature"),
    (7, 0x0c, "White Balance Component"),
    (8, 0x01, "Backlight Compensation"),
    (9, 0x04, "Gain"),
    (10, 0x05, "Power Line Frequency"),
    (11, 0x10, "Hue Auto"),
    (12, 0x0b, "White Balance Temperature Auto"),
    (13, 0x0d, "White Balance Component Auto"),
    (14, 0x0e, "Digital Multiplier"),
    (15, 0x0f, "Digital Multiplier Limit"),
    (16, 0x11, "Analog Video Standard"),
    (17, 0x12, "Analog Lock Status"),
    (19, 0x13, "Pixel Clock"),
];

/// Sensor-window extension unit control bitmap: bit, selector, name.
const SENSOR_WINDOW_CONTROLS: &[(u8, u8, &str)] = &[
    (0, consts::XU_WINDOW_X, "Sensor Window X"),
    (1, consts::XU_WINDOW_Y, "Sensor Window Y"),
    (2, consts::XU_WINDOW_WIDTH, "Sensor Window Width"),
    (3, consts::XU_WINDOW_HEIGHT, "Sensor Window Height"),
    (4, consts::XU_BINNING, "Binning"),
];

/// Per-device parsing overrides keyed off the device identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct Quirks {
    /// Reinterpret 8-bit monochrome formats as this Bayer mosaic.
    ///
    /// The NexImage-class sensors tag their output Y800 but actually
    /// deliver a raw color mosaic; this is a heuristic for those devices,
    /// not a protocol fact.
    pub mono8_bayer: Option<PixelFormat>,
}

impl Quirks {
    /// Quirk set for a vendor id.
    pub fn for_vendor(vendor_id: u16) -> Quirks {
        match vendor_id {
            consts::VID_CELESTRON => Quirks {
                mono8_bayer: Some(PixelFormat::BayerGrbg),
            },
            _ => Quirks::default(),
        }
    }
}

/// One descriptor record, limited to its declared length.
///
/// All field accessors validate offsets before reading; nothing in here
/// trusts the length byte beyond the initial clamp done by the walker.
struct Record<'a> {
    bytes: &'a [u8],
}

impl<'a> Record<'a> {
    fn subtype(&self) -> u8 {
        self.bytes[2]
    }

    fn require(&self, end: usize) -> Result<()> {
        if end > self.bytes.len() {
            Err(ProtocolError::Truncated {
                needed: end,
                available: self.bytes.len(),
            })
        } else {
            Ok(())
        }
    }

    fn u8_at(&self, off: usize) -> Result<u8> {
        self.require(off + 1)?;
        Ok(self.bytes[off])
    }

    fn u16_at(&self, off: usize) -> Result<u16> {
        self.require(off + 2)?;
        Ok(u16::from_le_bytes([self.bytes[off], self.bytes[off + 1]]))
    }

    fn u32_at(&self, off: usize) -> Result<u32> {
        self.require(off + 4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[off..off + 4]);
        Ok(u32::from_le_bytes(raw))
    }

    fn slice_at(&self, off: usize, len: usize) -> Result<&'a [u8]> {
        self.require(off + len)?;
        Ok(&self.bytes[off..off + len])
    }
}

fn test_bit(bitmap: &[u8], bit: u8) -> bool {
    let byte = (bit / 8) as usize;
    byte < bitmap.len() && bitmap[byte] & (1 << (bit % 8)) != 0
}

/// Parsed capability catalog of one video function.
///
/// Built once at interface-claim time from the VideoControl and
/// VideoStreaming class-specific descriptor ranges; immutable afterwards.
#[derive(Debug, Default)]
pub struct DescriptorCatalog {
    /// Class version (bcd) from the VideoControl header.
    pub uvc_version: u16,
    /// Device clock frequency from the VideoControl header, in Hz.
    pub clock_frequency: u32,
    /// Controls advertised by terminal/unit capability bitmaps.
    pub controls: Vec<ControlDescriptor>,
    /// Uncompressed formats, in descriptor order.
    pub formats: Vec<FormatInfo>,
    /// Frame sizes across all formats, in descriptor order.
    pub frames: Vec<FrameDefinition>,
    /// Video endpoint address from the VideoStreaming input header.
    pub stream_endpoint: Option<u8>,
    quirks: Quirks,
}

impl DescriptorCatalog {
    pub fn new(quirks: Quirks) -> DescriptorCatalog {
        DescriptorCatalog {
            quirks,
            ..DescriptorCatalog::default()
        }
    }

    /// Walk the VideoControl class-specific range: class header, terminals
    /// and units.
    pub fn parse_video_control(&mut self, bytes: &[u8]) {
        for record in walk(bytes) {
            let result = match record.subtype() {
                consts::VC_HEADER => self.parse_vc_header(&record),
                consts::VC_INPUT_TERMINAL => self.parse_input_terminal(&record),
                consts::VC_PROCESSING_UNIT => self.parse_processing_unit(&record),
                consts::VC_EXTENSION_UNIT => self.parse_extension_unit(&record),
                consts::VC_OUTPUT_TERMINAL | consts::VC_SELECTOR_UNIT => {
                    trace!(subtype = record.subtype(), "skipping routing descriptor");
                    Ok(())
                }
                other => {
                    debug!(subtype = other, "unknown VideoControl descriptor subtype");
                    Ok(())
                }
            };
            if let Err(e) = result {
                warn!(subtype = record.subtype(), error = %e, "skipping malformed VideoControl record");
            }
        }
    }

    /// Walk the VideoStreaming class-specific range of `interface`: input
    /// header, then format/frame record pairs.
    pub fn parse_video_streaming(&mut self, bytes: &[u8], interface: u8) {
        // Frames attach to the most recent well-formed uncompressed format.
        let mut current: Option<FormatInfo> = None;

        for record in walk(bytes) {
            let result = match record.subtype() {
                consts::VS_INPUT_HEADER => self.parse_input_header(&record),
                consts::VS_FORMAT_UNCOMPRESSED => match self.parse_format(&record) {
                    Ok(info) => {
                        current = info;
                        Ok(())
                    }
                    Err(e) => {
                        current = None;
                        Err(e)
                    }
                },
                consts::VS_FRAME_UNCOMPRESSED => match current.as_ref() {
                    Some(format) => self.parse_frame(&record, format, interface),
                    None => {
                        trace!("frame record without a usable format, skipping");
                        Ok(())
                    }
                },
                consts::VS_FORMAT_MJPEG | consts::VS_FORMAT_FRAME_BASED => {
                    debug!(
                        subtype = record.subtype(),
                        "compressed format not consumed by this driver"
                    );
                    current = None;
                    Ok(())
                }
                consts::VS_FRAME_MJPEG
                | consts::VS_FRAME_FRAME_BASED
                | consts::VS_COLORFORMAT
                | consts::VS_STILL_IMAGE_FRAME => Ok(()),
                other => {
                    debug!(subtype = other, "unknown VideoStreaming descriptor subtype");
                    Ok(())
                }
            };
            if let Err(e) = result {
                warn!(subtype = record.subtype(), error = %e, "skipping malformed VideoStreaming record");
            }
        }
    }

    /// Frame for an exact (format, frame) index pair.
    pub fn find_frame(&self, format_index: u8, frame_index: u8) -> Option<&FrameDefinition> {
        self.frames
            .iter()
            .find(|f| f.format_index == format_index && f.frame_index == frame_index)
    }

    /// The device's advertised default frame, falling back to the first
    /// parsed one.
    pub fn default_frame(&self) -> Option<&FrameDefinition> {
        self.formats
            .first()
            .and_then(|f| self.find_frame(f.format_index, f.default_frame_index))
            .or_else(|| self.frames.first())
    }

    /// Control descriptor by name.
    pub fn control_named(&self, name: &str) -> Option<&ControlDescriptor> {
        self.controls.iter().find(|c| c.name == name)
    }

    /// Sensor-window extension unit id, when the device advertises one.
    pub fn sensor_window_unit(&self) -> Option<u8> {
        self.controls
            .iter()
            .find(|c| c.entity == EntityKind::ExtensionUnit && c.name == "Sensor Window X")
            .map(|c| c.unit_id)
    }

    fn parse_vc_header(&mut self, record: &Record<'_>) -> Result<()> {
        self.uvc_version = record.u16_at(3)?;
        self.clock_frequency = record.u32_at(7)?;
        debug!(
            version = format_args!("{:#06x}", self.uvc_version),
            clock = self.clock_frequency,
            "video control header"
        );
        Ok(())
    }

    fn parse_input_terminal(&mut self, record: &Record<'_>) -> Result<()> {
        let unit_id = record.u8_at(3)?;
        let terminal_type = record.u16_at(4)?;
        if terminal_type != consts::ITT_CAMERA {
            trace!(terminal_type, "non-camera input terminal");
            return Ok(());
        }

        let control_size = record.u8_at(14)? as usize;
        let bitmap = record.slice_at(15, control_size)?;
        self.emit_controls(EntityKind::InputTerminal, unit_id, bitmap, CAMERA_CONTROLS);
        Ok(())
    }

    fn parse_processing_unit(&mut self, record: &Record<'_>) -> Result<()> {
        let unit_id = record.u8_at(3)?;
        let control_size = record.u8_at(7)? as usize;
        let bitmap = record.slice_at(8, control_size)?;
        self.emit_controls(
            EntityKind::ProcessingUnit,
            unit_id,
            bitmap,
            PROCESSING_CONTROLS,
        );
        Ok(())
    }

    fn parse_extension_unit(&mut self, record: &Record<'_>) -> Result<()> {
        let unit_id = record.u8_at(3)?;
        let guid: [u8; 16] = record.slice_at(4, 16)?.try_into().unwrap();
        let num_pins = record.u8_at(21)? as usize;
        let control_size = record.u8_at(22 + num_pins)? as usize;
        let bitmap = record.slice_at(23 + num_pins, control_size)?;

        if guid == consts::GUID_XU_SENSOR_WINDOW {
            self.emit_controls(
                EntityKind::ExtensionUnit,
                unit_id,
                bitmap,
                SENSOR_WINDOW_CONTROLS,
            );
        } else {
            // Vendor unit we have no table for: surface anonymous entries
            // so the runtime can still probe them.
            debug!(unit_id, guid = ?guid, "vendor extension unit");
            for bit in 0..(control_size as u8 * 8) {
                if test_bit(bitmap, bit) {
                    self.controls.push(ControlDescriptor {
                        entity: EntityKind::ExtensionUnit,
                        unit_id,
                        selector: bit + 1,
                        name: format!("Vendor Unit {} Control {}", unit_id, bit + 1),
                    });
                }
            }
        }
        Ok(())
    }

    fn emit_controls(
        &mut self,
        entity: EntityKind,
        unit_id: u8,
        bitmap: &[u8],
        table: &[(u8, u8, &str)],
    ) {
        for &(bit, selector, name) in table {
            if test_bit(bitmap, bit) {
                self.controls.push(ControlDescriptor {
                    entity,
                    unit_id,
                    selector,
                    name: name.to_string(),
                });
            }
        }
    }

    fn parse_input_header(&mut self, record: &Record<'_>) -> Result<()> {
        let endpoint = record.u8_at(6)?;
        self.stream_endpoint = Some(endpoint);
        debug!(endpoint = format_args!("{endpoint:#04x}"), "video streaming input header");
        Ok(())
    }

    fn parse_format(&mut self, record: &Record<'_>) -> Result<Option<FormatInfo>> {
        let format_index = record.u8_at(3)?;
        let guid: [u8; 16] = record.slice_at(5, 16)?.try_into().unwrap();
        let bits_per_pixel = record.u8_at(21)?;
        let default_frame_index = record.u8_at(22)?;

        let Some(mut pixel_format) = PixelFormat::from_guid(&guid) else {
            // Non-fatal: reject only this format, keep walking.
            warn!(
                format_index,
                error = %ProtocolError::UnknownFormatGuid { guid },
                "skipping format"
            );
            return Ok(None);
        };

        if pixel_format == PixelFormat::Mono8 {
            if let Some(bayer) = self.quirks.mono8_bayer {
                debug!(format_index, "monochrome tag overridden to Bayer mosaic");
                pixel_format = bayer;
            }
        }

        let info = FormatInfo {
            format_index,
            pixel_format,
            bits_per_pixel,
            default_frame_index,
        };
        self.formats.push(info.clone());
        Ok(Some(info))
    }

    fn parse_frame(
        &mut self,
        record: &Record<'_>,
        format: &FormatInfo,
        interface: u8,
    ) -> Result<()> {
        let frame_index = record.u8_at(3)?;
        let width = record.u16_at(5)? as u32;
        let height = record.u16_at(7)? as u32;
        let default_interval = record.u32_at(21)?;
        let interval_type = record.u8_at(25)? as usize;

        if width == 0 || height == 0 {
            warn!(frame_index, width, height, "degenerate frame dimensions, skipping");
            return Ok(());
        }

        let intervals = if interval_type == 0 {
            FrameIntervals::Continuous {
                min: record.u32_at(26)?,
                max: record.u32_at(30)?,
                step: record.u32_at(34)?,
            }
        } else {
            let mut list = Vec::with_capacity(interval_type);
            for i in 0..interval_type {
                list.push(record.u32_at(26 + 4 * i)?);
            }
            FrameIntervals::Discrete(list)
        };

        let bytes_per_pixel = (u32::from(format.bits_per_pixel) + 7) / 8;
        let bytes_per_pixel = bytes_per_pixel.max(1);

        self.frames.push(FrameDefinition {
            format_index: format.format_index,
            frame_index,
            interface,
            pixel_format: format.pixel_format,
            width,
            height,
            bytes_per_line: width * bytes_per_pixel,
            bytes_per_pixel,
            default_interval,
            intervals,
        });
        Ok(())
    }
}

/// Iterate the well-formed records of a class-specific byte range.
///
/// A record needs at least (length, type, subtype); a declared length that
/// runs past the remaining bytes ends the walk since resynchronization is
/// impossible. Records of a type other than CS_INTERFACE are skipped.
fn walk(bytes: &[u8]) -> Vec<Record<'_>> {
    let mut records = Vec::new();
    let mut rest = bytes;

    while rest.len() >= 3 {
        let len = rest[0] as usize;
        if len < 3 {
            warn!(len, "descriptor record shorter than its fixed prefix, stopping walk");
            break;
        }
        if len > rest.len() {
            warn!(
                len,
                available = rest.len(),
                "descriptor record overruns remaining bytes, stopping walk"
            );
            break;
        }
        if rest[1] == consts::DT_CS_INTERFACE {
            records.push(Record { bytes: &rest[..len] });
        } else {
            trace!(descriptor_type = rest[1], "skipping non class-specific record");
        }
        rest = &rest[len..];
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_record(out: &mut Vec<u8>, subtype: u8, body: &[u8]) {
        out.push((body.len() + 3) as u8);
        out.push(consts::DT_CS_INTERFACE);
        out.push(subtype);
        out.extend_from_slice(body);
    }

    fn vc_header(version: u16) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&version.to_le_bytes()); // bcdUVC
        body.extend_from_slice(&0x0050u16.to_le_bytes()); // wTotalLength
        body.extend_from_slice(&48_000_000u32.to_le_bytes()); // dwClockFrequency
        body.push(1); // bInCollection
        body.push(1); // baInterfaceNr
        body
    }

    fn camera_terminal(unit_id: u8, bitmap: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(unit_id);
        body.extend_from_slice(&consts::ITT_CAMERA.to_le_bytes());
        body.push(0); // bAssocTerminal
        body.push(0); // iTerminal
        body.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // focal lengths
        body.push(bitmap.len() as u8);
        body.extend_from_slice(bitmap);
        body
    }

    fn processing_unit(unit_id: u8, bitmap: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(unit_id);
        body.push(1); // bSourceID
        body.extend_from_slice(&0u16.to_le_bytes()); // wMaxMultiplier
        body.push(bitmap.len() as u8);
        body.extend_from_slice(bitmap);
        body.push(0); // iProcessing
        body
    }

    fn extension_unit(unit_id: u8, guid: [u8; 16], bitmap: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(unit_id);
        body.extend_from_slice(&guid);
        body.push((bitmap.len() * 8) as u8); // bNumControls
        body.push(1); // bNrInPins
        body.push(2); // baSourceID
        body.push(bitmap.len() as u8);
        body.extend_from_slice(bitmap);
        body.push(0); // iExtension
        body
    }

    fn input_header(endpoint: u8) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(1); // bNumFormats
        body.extend_from_slice(&0u16.to_le_bytes()); // wTotalLength
        body.push(endpoint);
        body.extend_from_slice(&[0, 1, 0, 0, 0]); // bmInfo..bTriggerUsage
        body.push(1); // bControlSize
        body.push(0); // bmaControls
        body
    }

    fn uncompressed_format(index: u8, guid: [u8; 16], bits: u8) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(index);
        body.push(1); // bNumFrameDescriptors
        body.extend_from_slice(&guid);
        body.push(bits);
        body.push(1); // bDefaultFrameIndex
        body.extend_from_slice(&[0, 0, 0, 0]); // aspect/interlace/copy
        body
    }

    fn discrete_frame(index: u8, width: u16, height: u16, intervals: &[u32]) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(index);
        body.push(0); // bmCapabilities
        body.extend_from_slice(&width.to_le_bytes());
        body.extend_from_slice(&height.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes()); // dwMinBitRate
        body.extend_from_slice(&0u32.to_le_bytes()); // dwMaxBitRate
        body.extend_from_slice(&0u32.to_le_bytes()); // dwMaxVideoFrameBufferSize
        body.extend_from_slice(&intervals[0].to_le_bytes()); // default
        body.push(intervals.len() as u8);
        for i in intervals {
            body.extend_from_slice(&i.to_le_bytes());
        }
        body
    }

    fn continuous_frame(index: u8, width: u16, height: u16, min: u32, max: u32, step: u32) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(index);
        body.push(0);
        body.extend_from_slice(&width.to_le_bytes());
        body.extend_from_slice(&height.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        body.extend_from_slice(&min.to_le_bytes());
        body.push(0); // continuous
        body.extend_from_slice(&min.to_le_bytes());
        body.extend_from_slice(&max.to_le_bytes());
        body.extend_from_slice(&step.to_le_bytes());
        body
    }

    #[test]
    fn test_parse_video_control() {
        let mut bytes = Vec::new();
        push_record(&mut bytes, consts::VC_HEADER, &vc_header(0x0110));
        // AE Mode (bit 1) + Exposure Time Absolute (bit 3)
        push_record(&mut bytes, consts::VC_INPUT_TERMINAL, &camera_terminal(1, &[0x0a, 0, 0]));
        // Brightness (bit 0) + Gain (bit 9)
        push_record(&mut bytes, consts::VC_PROCESSING_UNIT, &processing_unit(2, &[0x01, 0x02, 0]));
        push_record(
            &mut bytes,
            consts::VC_EXTENSION_UNIT,
            &extension_unit(4, consts::GUID_XU_SENSOR_WINDOW, &[0x1f]),
        );

        let mut catalog = DescriptorCatalog::default();
        catalog.parse_video_control(&bytes);

        assert_eq!(catalog.uvc_version, 0x0110);
        assert_eq!(catalog.clock_frequency, 48_000_000);

        let names: Vec<&str> = catalog.controls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "AE Mode",
                "Exposure Time Absolute",
                "Brightness",
                "Gain",
                "Sensor Window X",
                "Sensor Window Y",
                "Sensor Window Width",
                "Sensor Window Height",
                "Binning",
            ]
        );
        assert_eq!(catalog.sensor_window_unit(), Some(4));
        assert_eq!(catalog.control_named("Gain").unwrap().unit_id, 2);
        assert_eq!(catalog.control_named("Gain").unwrap().selector, 0x04);
    }

    #[test]
    fn test_parse_video_streaming() {
        let mut bytes = Vec::new();
        push_record(&mut bytes, consts::VS_INPUT_HEADER, &input_header(0x82));
        push_record(
            &mut bytes,
            consts::VS_FORMAT_UNCOMPRESSED,
            &uncompressed_format(1, consts::GUID_Y16, 16),
        );
        push_record(
            &mut bytes,
            consts::VS_FRAME_UNCOMPRESSED,
            &discrete_frame(1, 1280, 960, &[333333, 666666]),
        );
        push_record(
            &mut bytes,
            consts::VS_FRAME_UNCOMPRESSED,
            &continuous_frame(2, 640, 480, 100000, 1000000, 100000),
        );

        let mut catalog = DescriptorCatalog::default();
        catalog.parse_video_streaming(&bytes, 1);

        assert_eq!(catalog.stream_endpoint, Some(0x82));
        assert_eq!(catalog.formats.len(), 1);
        assert_eq!(catalog.frames.len(), 2);

        let big = catalog.find_frame(1, 1).unwrap();
        assert_eq!(big.width, 1280);
        assert_eq!(big.height, 960);
        assert_eq!(big.bytes_per_pixel, 2);
        assert_eq!(big.bytes_per_line, 2560);
        assert!(big.bytes_per_line >= big.width * big.bytes_per_pixel);
        assert_eq!(big.default_interval, 333333);
        assert_eq!(
            big.intervals,
            FrameIntervals::Discrete(vec![333333, 666666])
        );

        let small = catalog.find_frame(1, 2).unwrap();
        assert_eq!(
            small.intervals,
            FrameIntervals::Continuous {
                min: 100000,
                max: 1000000,
                step: 100000
            }
        );

        assert_eq!(catalog.default_frame().unwrap().frame_index, 1);
    }

    #[test]
    fn test_unknown_guid_rejects_only_that_format() {
        let mut bytes = Vec::new();
        push_record(
            &mut bytes,
            consts::VS_FORMAT_UNCOMPRESSED,
            &uncompressed_format(1, [0xde; 16], 8),
        );
        push_record(
            &mut bytes,
            consts::VS_FRAME_UNCOMPRESSED,
            &discrete_frame(1, 640, 480, &[333333]),
        );
        push_record(
            &mut bytes,
            consts::VS_FORMAT_UNCOMPRESSED,
            &uncompressed_format(2, consts::GUID_Y800, 8),
        );
        push_record(
            &mut bytes,
            consts::VS_FRAME_UNCOMPRESSED,
            &discrete_frame(1, 320, 240, &[333333]),
        );

        let mut catalog = DescriptorCatalog::default();
        catalog.parse_video_streaming(&bytes, 1);

        assert_eq!(catalog.formats.len(), 1);
        assert_eq!(catalog.frames.len(), 1);
        assert_eq!(catalog.frames[0].format_index, 2);
        assert_eq!(catalog.frames[0].pixel_format, PixelFormat::Mono8);
    }

    #[test]
    fn test_mono8_bayer_quirk() {
        let mut bytes = Vec::new();
        push_record(
            &mut bytes,
            consts::VS_FORMAT_UNCOMPRESSED,
            &uncompressed_format(1, consts::GUID_Y800, 8),
        );
        push_record(
            &mut bytes,
            consts::VS_FRAME_UNCOMPRESSED,
            &discrete_frame(1, 2592, 1944, &[400000]),
        );

        let mut catalog = DescriptorCatalog::new(Quirks::for_vendor(consts::VID_CELESTRON));
        catalog.parse_video_streaming(&bytes, 1);

        assert_eq!(catalog.frames[0].pixel_format, PixelFormat::BayerGrbg);
    }

    #[test]
    fn test_short_record_skipped() {
        let mut bytes = Vec::new();
        // Input terminal truncated before its control bitmap.
        push_record(&mut bytes, consts::VC_INPUT_TERMINAL, &[1, 0x01, 0x02]);
        push_record(&mut bytes, consts::VC_PROCESSING_UNIT, &processing_unit(2, &[0x01]));

        let mut catalog = DescriptorCatalog::default();
        catalog.parse_video_control(&bytes);

        // The bad record was skipped, the following one still parsed.
        assert_eq!(catalog.controls.len(), 1);
        assert_eq!(catalog.controls[0].name, "Brightness");
    }

    #[test]
    fn test_walk_stops_on_overrunning_length() {
        let mut bytes = Vec::new();
        push_record(&mut bytes, consts::VC_HEADER, &vc_header(0x0100));
        bytes.extend_from_slice(&[0x40, consts::DT_CS_INTERFACE, consts::VC_PROCESSING_UNIT]);

        let mut catalog = DescriptorCatalog::default();
        catalog.parse_video_control(&bytes);
        assert_eq!(catalog.uvc_version, 0x0100);
    }

    #[test]
    fn test_parse_is_deterministic() {
        let mut bytes = Vec::new();
        push_record(&mut bytes, consts::VC_HEADER, &vc_header(0x0150));
        push_record(&mut bytes, consts::VC_PROCESSING_UNIT, &processing_unit(3, &[0xff, 0x03]));

        let mut a = DescriptorCatalog::default();
        let mut b = DescriptorCatalog::default();
        a.parse_video_control(&bytes);
        b.parse_video_control(&bytes);
        assert_eq!(a.controls, b.controls);
        assert_eq!(a.uvc_version, b.uvc_version);
    }
}
