//! Probe/commit streaming control codec
//!
//! The probe and commit controls share one little-endian wire structure
//! whose total length is fixed by the class version negotiated from the
//! VideoControl header descriptor: 26 bytes before 1.1, 34 bytes through
//! 1.4, 48 bytes from 1.5. Field order and sizes must be reproduced exactly
//! for interoperability; encoding writes every field the version covers and
//! decoding never touches fields beyond the negotiated length.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{ProtocolError, Result};

/// Wire length of the probe/commit structure before UVC 1.1.
pub const PROBE_LEN_V10: usize = 26;
/// Wire length through UVC 1.4.
pub const PROBE_LEN_V11: usize = 34;
/// Wire length from UVC 1.5.
pub const PROBE_LEN_V15: usize = 48;

/// Total probe/commit structure length for a bcd class version.
pub fn probe_len(version: u16) -> usize {
    if version >= 0x0150 {
        PROBE_LEN_V15
    } else if version >= 0x0110 {
        PROBE_LEN_V11
    } else {
        PROBE_LEN_V10
    }
}

/// Host-side mirror of the probe/commit payload.
///
/// Mutable by design: the negotiator overwrites it on every GET round trip
/// and the device may clamp or override any field. Fields past the
/// negotiated version's length simply keep their previous values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamControl {
    /// Negotiation hint bitmask; bit 0 holds dwFrameInterval fixed.
    pub hint: u16,
    pub format_index: u8,
    pub frame_index: u8,
    /// Frame interval in 100 ns units.
    pub frame_interval: u32,
    pub key_frame_rate: u16,
    pub p_frame_rate: u16,
    pub comp_quality: u16,
    pub comp_window_size: u16,
    /// Internal device latency in ms.
    pub delay: u16,
    pub max_video_frame_size: u32,
    pub max_payload_transfer_size: u32,
    // UVC 1.1
    pub clock_frequency: u32,
    pub framing_info: u8,
    pub preferred_version: u8,
    pub min_version: u8,
    pub max_version: u8,
    // UVC 1.5
    pub usage: u8,
    pub bit_depth_luma: u8,
    pub settings: u8,
    pub max_ref_frames: u8,
    pub rate_control_modes: u16,
    pub layout_per_stream: u64,
}

impl StreamControl {
    /// Candidate payload asking for a format/frame pair at an interval,
    /// with the interval-fixed hint bit set.
    pub fn candidate(format_index: u8, frame_index: u8, frame_interval: u32) -> StreamControl {
        StreamControl {
            hint: 0x0001,
            format_index,
            frame_index,
            frame_interval,
            ..StreamControl::default()
        }
    }

    /// Encode at the length `version` dictates.
    pub fn encode(&self, version: u16) -> Vec<u8> {
        let len = probe_len(version);
        let mut buf = vec![0u8; len];

        LittleEndian::write_u16(&mut buf[0..2], self.hint);
        buf[2] = self.format_index;
        buf[3] = self.frame_index;
        LittleEndian::write_u32(&mut buf[4..8], self.frame_interval);
        LittleEndian::write_u16(&mut buf[8..10], self.key_frame_rate);
        LittleEndian::write_u16(&mut buf[10..12], self.p_frame_rate);
        LittleEndian::write_u16(&mut buf[12..14], self.comp_quality);
        LittleEndian::write_u16(&mut buf[14..16], self.comp_window_size);
        LittleEndian::write_u16(&mut buf[16..18], self.delay);
        LittleEndian::write_u32(&mut buf[18..22], self.max_video_frame_size);
        LittleEndian::write_u32(&mut buf[22..26], self.max_payload_transfer_size);

        if len >= PROBE_LEN_V11 {
            LittleEndian::write_u32(&mut buf[26..30], self.clock_frequency);
            buf[30] = self.framing_info;
            buf[31] = self.preferred_version;
            buf[32] = self.min_version;
            buf[33] = self.max_version;
        }
        if len >= PROBE_LEN_V15 {
            buf[34] = self.usage;
            buf[35] = self.bit_depth_luma;
            buf[36] = self.settings;
            buf[37] = self.max_ref_frames;
            LittleEndian::write_u16(&mut buf[38..40], self.rate_control_modes);
            LittleEndian::write_u64(&mut buf[40..48], self.layout_per_stream);
        }

        buf
    }

    /// Decode a device response, overwriting only the fields `version`
    /// covers. Trailing bytes past the version length are ignored.
    pub fn decode(&mut self, version: u16, bytes: &[u8]) -> Result<()> {
        let expected = probe_len(version);
        if bytes.len() < expected {
            return Err(ProtocolError::ProbeTooShort {
                version,
                expected,
                len: bytes.len(),
            });
        }

        self.hint = LittleEndian::read_u16(&bytes[0..2]);
        self.format_index = bytes[2];
        self.frame_index = bytes[3];
        self.frame_interval = LittleEndian::read_u32(&bytes[4..8]);
        self.key_frame_rate = LittleEndian::read_u16(&bytes[8..10]);
        self.p_frame_rate = LittleEndian::read_u16(&bytes[10..12]);
        self.comp_quality = LittleEndian::read_u16(&bytes[12..14]);
        self.comp_window_size = LittleEndian::read_u16(&bytes[14..16]);
        self.delay = LittleEndian::read_u16(&bytes[16..18]);
        self.max_video_frame_size = LittleEndian::read_u32(&bytes[18..22]);
        self.max_payload_transfer_size = LittleEndian::read_u32(&bytes[22..26]);

        if expected >= PROBE_LEN_V11 {
            self.clock_frequency = LittleEndian::read_u32(&bytes[26..30]);
            self.framing_info = bytes[30];
            self.preferred_version = bytes[31];
            self.min_version = bytes[32];
            self.max_version = bytes[33];
        }
        if expected >= PROBE_LEN_V15 {
            self.usage = bytes[34];
            self.bit_depth_luma = bytes[35];
            self.settings = bytes[36];
            self.max_ref_frames = bytes[37];
            self.rate_control_modes = LittleEndian::read_u16(&bytes[38..40]);
            self.layout_per_stream = LittleEndian::read_u64(&bytes[40..48]);
        }

        Ok(())
    }
}
