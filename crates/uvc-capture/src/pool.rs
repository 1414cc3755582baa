//! Image buffers and the bounded recycling pool
//!
//! The pool is the system's only application-visible backpressure point:
//! the assembler's `get` blocks while all buffers are checked out, trading
//! latency for bounded memory. A buffer is owned by exactly one holder at a
//! time; it moves between the pool, the assembler and the consumer, never
//! shared.

use std::sync::{Condvar, Mutex};

use tracing::trace;
use uvc_proto::{FrameDefinition, PixelFormat, Roi};

use crate::error::{Error, Result};

/// Geometry of the frames a stream delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameShape {
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub bytes_per_line: u32,
    pub bytes_per_pixel: u32,
}

impl FrameShape {
    pub fn of_frame(frame: &FrameDefinition) -> FrameShape {
        FrameShape {
            pixel_format: frame.pixel_format,
            width: frame.width,
            height: frame.height,
            bytes_per_line: frame.bytes_per_line,
            bytes_per_pixel: frame.bytes_per_pixel,
        }
    }
}

/// Result of one append call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Append {
    /// Source bytes consumed; always nonzero unless the buffer was already
    /// full or the input empty.
    pub consumed: usize,
    /// The window is fully written.
    pub full: bool,
}

/// One image in flight: a tight window-sized allocation filled row-major
/// from payload bytes delivered in sensor order.
///
/// The write cursor tracks the absolute position within the source frame;
/// bytes outside the window are consumed but not stored, so the output is
/// exactly `roi.width * roi.height * bytes_per_pixel` bytes.
#[derive(Debug)]
pub struct ImageBuffer {
    pixel_format: PixelFormat,
    width: u32,
    height: u32,
    bytes_per_line: u32,
    bytes_per_pixel: u32,
    roi: Roi,
    /// Absolute byte offset within the packed source frame.
    cursor: usize,
    /// Bytes written into the window so far.
    written: usize,
    /// Pool generation this buffer belongs to.
    epoch: u64,
    data: Vec<u8>,
}

impl ImageBuffer {
    fn new() -> ImageBuffer {
        ImageBuffer {
            pixel_format: PixelFormat::Mono8,
            width: 0,
            height: 0,
            bytes_per_line: 0,
            bytes_per_pixel: 1,
            roi: Roi::default(),
            cursor: 0,
            written: 0,
            epoch: 0,
            data: Vec::new(),
        }
    }

    fn reset(&mut self, shape: FrameShape, roi: Roi, epoch: u64) {
        debug_assert!(roi.fits_within(shape.width, shape.height));
        self.pixel_format = shape.pixel_format;
        self.width = shape.width;
        self.height = shape.height;
        self.bytes_per_line = shape.bytes_per_line;
        self.bytes_per_pixel = shape.bytes_per_pixel;
        self.roi = roi;
        self.cursor = 0;
        self.written = 0;
        self.epoch = epoch;
        let capacity = (roi.width * roi.height * shape.bytes_per_pixel) as usize;
        self.data.resize(capacity, 0);
    }

    /// Feed sensor-order bytes. Bytes inside the window are stored, bytes
    /// outside it are skipped; either way the source cursor advances, so
    /// every call makes forward progress until the window is full.
    pub fn append(&mut self, data: &[u8]) -> Append {
        let bpp = self.bytes_per_pixel as usize;
        let row_bytes = self.width as usize * bpp;
        let win_start = self.roi.x as usize * bpp;
        let win_end = (self.roi.x + self.roi.width) as usize * bpp;
        let out_stride = self.roi.width as usize * bpp;
        let first_row = self.roi.y as usize;
        let capacity = self.data.len();

        let mut consumed = 0;
        let mut rest = data;

        while !rest.is_empty() && self.written < capacity && row_bytes > 0 {
            let row = self.cursor / row_bytes;
            let col = self.cursor % row_bytes;

            let n = if row < first_row || col >= win_end {
                // Outside the window: burn through to the next source row.
                (row_bytes - col).min(rest.len())
            } else if col < win_start {
                (win_start - col).min(rest.len())
            } else {
                let n = (win_end - col).min(rest.len());
                let out = (row - first_row) * out_stride + (col - win_start);
                self.data[out..out + n].copy_from_slice(&rest[..n]);
                self.written += n;
                n
            };

            self.cursor += n;
            consumed += n;
            rest = &rest[n..];
        }

        Append {
            consumed,
            full: capacity > 0 && self.written == capacity,
        }
    }

    /// Nothing has been written into the window yet.
    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    /// The window is fully written.
    pub fn is_full(&self) -> bool {
        !self.data.is_empty() && self.written == self.data.len()
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Source frame width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Source frame height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bytes_per_line(&self) -> u32 {
        self.bytes_per_line
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        self.bytes_per_pixel
    }

    pub fn roi(&self) -> Roi {
        self.roi
    }

    /// The window-sized image bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

struct PoolInner {
    shape: Option<FrameShape>,
    roi: Roi,
    max: usize,
    live: usize,
    idle: Vec<ImageBuffer>,
    epoch: u64,
}

/// Bounded, recycling pool of image buffers.
///
/// `get` blocks while the pool is at capacity; `reset` and `clear` bump the
/// generation, drop every buffer and release blocked waiters with `None`.
pub struct BufferPool {
    inner: Mutex<PoolInner>,
    available: Condvar,
}

impl BufferPool {
    /// A new pool starts off (max capacity 0, no shape).
    pub fn new() -> BufferPool {
        BufferPool {
            inner: Mutex::new(PoolInner {
                shape: None,
                roi: Roi::default(),
                max: 0,
                live: 0,
                idle: Vec::new(),
                epoch: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Take a buffer shaped to the pool's current geometry.
    ///
    /// Returns `None` immediately when the pool is off or unshaped.
    /// Otherwise recycles an idle buffer, allocates while under the cap, or
    /// blocks until one of those becomes possible; a concurrent
    /// `reset`/`clear` releases the wait with `None`.
    pub fn get(&self) -> Option<ImageBuffer> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.max == 0 {
                return None;
            }
            let Some(shape) = inner.shape else {
                return None;
            };

            if let Some(mut buffer) = inner.idle.pop() {
                buffer.reset(shape, inner.roi, inner.epoch);
                return Some(buffer);
            }
            if inner.live < inner.max {
                inner.live += 1;
                let mut buffer = ImageBuffer::new();
                buffer.reset(shape, inner.roi, inner.epoch);
                return Some(buffer);
            }

            let epoch = inner.epoch;
            inner = self.available.wait(inner).unwrap();
            if inner.epoch != epoch {
                return None;
            }
        }
    }

    /// Return a buffer to the idle set (capped at max) and wake one
    /// waiter. A no-op while the pool is off; buffers from an earlier
    /// generation are simply dropped.
    pub fn put(&self, buffer: ImageBuffer) {
        let mut inner = self.inner.lock().unwrap();
        if inner.max == 0 || inner.shape.is_none() {
            return;
        }
        if buffer.epoch != inner.epoch {
            trace!("dropping buffer from an earlier pool generation");
            return;
        }
        if inner.idle.len() < inner.max {
            inner.idle.push(buffer);
        } else {
            inner.live = inner.live.saturating_sub(1);
        }
        drop(inner);
        self.available.notify_one();
    }

    /// Atomically replace the pool geometry, dropping all buffers and
    /// releasing blocked waiters with `None`.
    pub fn reset(&self, shape: FrameShape, roi: Roi, max: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.shape = Some(shape);
        inner.roi = roi;
        inner.max = max;
        inner.idle.clear();
        inner.live = 0;
        inner.epoch += 1;
        drop(inner);
        self.available.notify_all();
    }

    /// Change the window for subsequently issued buffers.
    pub fn set_roi(&self, roi: Roi) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(shape) = inner.shape else {
            return Err(Error::InvalidRoi {
                roi,
                width: 0,
                height: 0,
            });
        };
        if !roi.fits_within(shape.width, shape.height) {
            return Err(Error::InvalidRoi {
                roi,
                width: shape.width,
                height: shape.height,
            });
        }
        inner.roi = roi;
        Ok(())
    }

    /// Shut the pool off: unshape it, drop all buffers and release blocked
    /// waiters with `None`.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.shape = None;
        inner.roi = Roi::default();
        inner.max = 0;
        inner.idle.clear();
        inner.live = 0;
        inner.epoch += 1;
        drop(inner);
        self.available.notify_all();
    }

    /// Max capacity 0 means off.
    pub fn is_off(&self) -> bool {
        self.inner.lock().unwrap().max == 0
    }

    pub fn roi(&self) -> Roi {
        self.inner.lock().unwrap().roi
    }

    pub fn shape(&self) -> Option<FrameShape> {
        self.inner.lock().unwrap().shape
    }

    /// Buffers currently in existence (idle or checked out).
    pub fn live_count(&self) -> usize {
        self.inner.lock().unwrap().live
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool::new()
    }
}
