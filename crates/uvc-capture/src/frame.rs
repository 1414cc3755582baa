//! Frame reassembly from streaming payloads
//!
//! Each transfer completion hands the assembler one payload: a short header
//! followed by image bytes. A flip of the header's frame id starts a new
//! frame, the end-of-frame bit (or a fully written window) finishes one.
//! Completed buffers are pushed to the caller-provided vector; ownership of
//! work buffers moves between the pool and the assembler, never shared.
//!
//! Runs on the event-dispatch thread; `pool.get()` blocking here is the
//! stream's backpressure.

use std::sync::Arc;

use tracing::{trace, warn};
use uvc_proto::PayloadHeader;

use crate::pool::{BufferPool, ImageBuffer};

/// Reassembles discrete frames from payload-prefixed packets.
pub struct FrameAssembler {
    pool: Arc<BufferPool>,
    work: Option<ImageBuffer>,
    last_fid: Option<bool>,
}

impl FrameAssembler {
    pub fn new(pool: Arc<BufferPool>) -> FrameAssembler {
        FrameAssembler {
            pool,
            work: None,
            last_fid: None,
        }
    }

    /// Consume one payload packet, pushing any frames it completes.
    ///
    /// Malformed or device-flagged-error payloads are dropped with a
    /// diagnostic; nothing here is fatal to the stream.
    pub fn fill_frame(&mut self, packet: &[u8], completed: &mut Vec<ImageBuffer>) {
        let (header, mut data) = match PayloadHeader::split(packet) {
            Ok(split) => split,
            Err(e) => {
                warn!(error = %e, "dropping malformed payload");
                return;
            }
        };

        if header.error {
            warn!("device flagged a payload error, dropping its data");
            self.last_fid = Some(header.fid);
            return;
        }

        if self.last_fid != Some(header.fid) {
            // New frame: hand off whatever the previous one produced. An
            // empty buffer goes back to the pool so its cursor re-arms.
            if let Some(buffer) = self.work.take() {
                if buffer.is_empty() {
                    self.pool.put(buffer);
                } else {
                    completed.push(buffer);
                }
            }
            self.last_fid = Some(header.fid);
        }

        while !data.is_empty() {
            if self.work.is_none() {
                match self.pool.get() {
                    Some(buffer) => self.work = Some(buffer),
                    None => {
                        trace!("buffer pool is off, discarding payload bytes");
                        return;
                    }
                }
            }

            let buffer = self.work.as_mut().unwrap();
            let result = buffer.append(data);
            data = &data[result.consumed..];

            if result.full {
                // Window complete; leftover bytes start a new work buffer.
                completed.push(self.work.take().unwrap());
            } else if result.consumed == 0 {
                // A zero-capacity window cannot make progress.
                warn!("work buffer accepts no data, discarding payload bytes");
                return;
            }
        }

        if header.eof {
            // Hand off immediately, even short.
            if let Some(buffer) = self.work.take() {
                if buffer.is_empty() {
                    self.pool.put(buffer);
                } else {
                    completed.push(buffer);
                }
            }
        }
    }

    /// Drop the in-progress frame back into the pool and forget the frame
    /// id, ready for a fresh stream.
    pub fn reset(&mut self) {
        if let Some(buffer) = self.work.take() {
            self.pool.put(buffer);
        }
        self.last_fid = None;
    }
}
