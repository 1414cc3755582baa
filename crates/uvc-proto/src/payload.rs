//! Streaming payload header decoding
//!
//! Every packet on the video endpoint starts with a small header: a length
//! byte, a flag byte, and optionally a presentation timestamp and source
//! clock reference. The frame assembler keys off the toggling frame id and
//! the end-of-frame bit.

use byteorder::{ByteOrder, LittleEndian};

use crate::consts;
use crate::error::{ProtocolError, Result};

/// Decoded payload header of one streaming packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    /// Declared header length in bytes (2..=12 for the stock layout).
    pub len: usize,
    /// Toggling frame identifier; a flip marks a new frame.
    pub fid: bool,
    /// Last payload of the current frame.
    pub eof: bool,
    /// Device flagged this payload as erroneous.
    pub error: bool,
    /// Still-image payload marker.
    pub still: bool,
    /// Presentation timestamp, when the PTS bit is set.
    pub pts: Option<u32>,
    /// Source clock reference (source time clock, frame counter), when the
    /// SCR bit is set.
    pub scr: Option<(u32, u16)>,
}

impl PayloadHeader {
    /// Parse the header at the front of `packet`.
    ///
    /// The declared length is validated against both the packet size and
    /// the minimum implied by the flag bits before any field is read.
    pub fn parse(packet: &[u8]) -> Result<PayloadHeader> {
        if packet.len() < 2 {
            return Err(ProtocolError::BadPayloadHeader {
                reason: "packet shorter than the two mandatory header bytes",
            });
        }

        let len = packet[0] as usize;
        let info = packet[1];

        if len < 2 {
            return Err(ProtocolError::BadPayloadHeader {
                reason: "declared header length below minimum",
            });
        }
        if len > packet.len() {
            return Err(ProtocolError::BadPayloadHeader {
                reason: "declared header length exceeds packet",
            });
        }

        let mut expected = 2;
        if info & consts::HDR_PTS != 0 {
            expected += 4;
        }
        if info & consts::HDR_SCR != 0 {
            expected += 6;
        }
        if len < expected {
            return Err(ProtocolError::BadPayloadHeader {
                reason: "declared header length too small for its flag bits",
            });
        }

        let mut off = 2;
        let pts = if info & consts::HDR_PTS != 0 {
            let v = LittleEndian::read_u32(&packet[off..off + 4]);
            off += 4;
            Some(v)
        } else {
            None
        };
        let scr = if info & consts::HDR_SCR != 0 {
            let stc = LittleEndian::read_u32(&packet[off..off + 4]);
            let sof = LittleEndian::read_u16(&packet[off + 4..off + 6]);
            Some((stc, sof))
        } else {
            None
        };

        Ok(PayloadHeader {
            len,
            fid: info & consts::HDR_FID != 0,
            eof: info & consts::HDR_EOF != 0,
            error: info & consts::HDR_ERR != 0,
            still: info & consts::HDR_STI != 0,
            pts,
            scr,
        })
    }

    /// Parse the header and return it together with the payload data that
    /// follows it.
    pub fn split(packet: &[u8]) -> Result<(PayloadHeader, &[u8])> {
        let header = PayloadHeader::parse(packet)?;
        Ok((header, &packet[header.len..]))
    }
}
