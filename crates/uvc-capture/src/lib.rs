//! Host-side UVC video-capture data plane
//!
//! Layers a usable camera driver over rusb: an asynchronous transfer
//! engine with submit/cancel/wait semantics, probe/commit stream
//! negotiation against the parsed descriptor catalog, and frame
//! reassembly through a bounded recycling buffer pool. Wire-level parsing
//! and codecs live in the `uvc-proto` crate.
//!
//! One background thread pumps the transport's event dispatch; all
//! completion callbacks, including frame delivery, run there. The buffer
//! pool is the only backpressure point: when the consumer stalls with
//! every buffer checked out, reassembly blocks rather than growing.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! fn main() -> uvc_capture::Result<()> {
//!     let camera = uvc_capture::CameraDevice::open(0x199e, 0x8207)?;
//!     let session = camera.session();
//!
//!     let frame = session.start_video(None)?;
//!     println!("streaming {}x{}", frame.width, frame.height);
//!
//!     while let Some(image) = session.next_frame(Duration::from_secs(2)) {
//!         println!("frame: {} bytes", image.data().len());
//!         session.recycle(image);
//!     }
//!     session.stop_video();
//!     Ok(())
//! }
//! ```

pub mod control;
pub mod device;
pub mod error;
pub mod frame;
pub mod logging;
pub mod negotiate;
pub mod pool;
pub mod session;
pub mod testing;
pub mod transfer;
pub mod transport;

pub use control::Control;
pub use device::CameraDevice;
pub use error::{Error, Result, TransferError};
pub use frame::FrameAssembler;
pub use negotiate::{StreamNegotiator, bulk_transfer_count, iso_packet_count};
pub use pool::{Append, BufferPool, FrameShape, ImageBuffer};
pub use session::{
    DEFAULT_POOL_DEPTH, EndpointInfo, EndpointKind, StreamConfig, VideoSession,
};
pub use transfer::{
    CompletionAction, CompletionFlag, ControlSetup, Submission, TransferKind, TransferRequest,
    TransferStatus,
};
pub use transport::{RusbTransport, UsbTransport};
