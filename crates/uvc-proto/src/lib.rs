//! UVC wire protocol layer
//!
//! This crate owns everything about the USB Video Class that can be decided
//! by looking at bytes: class constants, class-specific descriptor parsing
//! into a capability catalog, the probe/commit streaming-control codec, and
//! streaming payload header decoding. It has no USB dependency and is fully
//! testable on synthesized byte streams; the `uvc-capture` crate layers the
//! runtime (transfers, negotiation, frame reassembly) on top.
//!
//! # Example
//!
//! ```
//! use uvc_proto::{StreamControl, probe_len};
//!
//! // A candidate probe asking for format 1 / frame 2 at 30 fps.
//! let want = StreamControl::candidate(1, 2, 333333);
//! let wire = want.encode(0x0110);
//! assert_eq!(wire.len(), probe_len(0x0110));
//!
//! let mut echoed = StreamControl::default();
//! echoed.decode(0x0110, &wire).unwrap();
//! assert_eq!(echoed.frame_index, 2);
//! ```

pub mod consts;
pub mod descriptor;
pub mod error;
pub mod payload;
pub mod probe;
pub mod types;

pub use descriptor::{DescriptorCatalog, Quirks};
pub use error::{ProtocolError, Result};
pub use payload::PayloadHeader;
pub use probe::{PROBE_LEN_V10, PROBE_LEN_V11, PROBE_LEN_V15, StreamControl, probe_len};
pub use types::{
    ControlDescriptor, EntityKind, FormatInfo, FrameDefinition, FrameIntervals, PixelFormat, Roi,
};
