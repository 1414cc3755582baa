//! Protocol error types

use thiserror::Error;

/// Errors produced while decoding UVC wire structures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A descriptor record declared more bytes than remain in the buffer,
    /// or a field read ran past the record's declared length.
    #[error("descriptor record truncated: needed {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// A probe/commit payload was shorter than the negotiated class version
    /// requires.
    #[error("probe payload too short: {len} bytes, UVC {version:#06x} requires {expected}")]
    ProbeTooShort {
        version: u16,
        expected: usize,
        len: usize,
    },

    /// A streaming packet was too small to carry a payload header, or the
    /// header's declared length was inconsistent with its flag bits.
    #[error("invalid payload header: {reason}")]
    BadPayloadHeader { reason: &'static str },

    /// A format descriptor carried a GUID this driver does not recognize.
    #[error("unrecognized pixel format GUID {guid:02x?}")]
    UnknownFormatGuid { guid: [u8; 16] },
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
