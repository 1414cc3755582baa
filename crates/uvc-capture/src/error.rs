//! Capture-layer error types

use thiserror::Error;
use uvc_proto::Roi;

/// Terminal outcome of a single transfer, mirroring the transport's error
/// conditions.
///
/// Transfer errors are reported per operation and are never fatal to the
/// engine itself; the caller decides whether to resubmit.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    /// Endpoint stalled (protocol error)
    #[error("endpoint stalled")]
    Stall,
    /// Device was disconnected
    #[error("device disconnected")]
    NoDevice,
    /// Buffer overflow on the bus
    #[error("transfer overflow")]
    Overflow,
    /// Transfer was cancelled before completion
    #[error("transfer cancelled")]
    Cancelled,
    /// Transfer timed out (normally invisible: resubmitted by the engine)
    #[error("transfer timed out")]
    TimedOut,
    /// Device or endpoint is busy
    #[error("device busy")]
    Busy,
    /// I/O error
    #[error("i/o error")]
    Io,
    /// Invalid parameter
    #[error("invalid parameter")]
    InvalidParam,
    /// Access denied (permissions)
    #[error("access denied")]
    Access,
    /// Device or endpoint not found
    #[error("not found")]
    NotFound,
    /// The transport backend cannot carry this transfer kind
    #[error("not supported by this transport")]
    Unsupported,
    /// Other error with message
    #[error("transport error: {message}")]
    Other { message: String },
}

/// Capture-layer errors
#[derive(Debug, Error)]
pub enum Error {
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error(transparent)]
    Protocol(#[from] uvc_proto::ProtocolError),

    /// Probe round trip produced something the stream cannot start from.
    /// Fatal to `start_video`, surfaced synchronously.
    #[error("stream negotiation failed: {0}")]
    Negotiation(String),

    /// The device refused the commit; the stream cannot start.
    #[error("commit rejected by device: {0}")]
    CommitRejected(#[source] TransferError),

    /// Caller-contract violation: the window does not fit the frame.
    /// Out-of-bounds windows are rejected, never clamped.
    #[error("region of interest {roi:?} does not fit a {width}x{height} frame")]
    InvalidRoi { roi: Roi, width: u32, height: u32 },

    #[error("control '{0}' is not available on this device")]
    ControlUnavailable(String),

    #[error("device knows no format {format} / frame {frame}")]
    UnknownFrame { format: u8, frame: u8 },

    #[error("device advertises no usable video frames")]
    NoFrames,

    #[error("no video streaming interface found")]
    MissingVideoInterface,

    #[error("no usable video endpoint found")]
    MissingVideoEndpoint,

    #[error("invalid log filter: {0}")]
    LogFilter(String),
}

/// Type alias for capture results
pub type Result<T> = std::result::Result<T, Error>;
