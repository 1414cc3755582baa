//! Video session: the caller-facing stream surface
//!
//! Owns the negotiation/shape state behind a single lock, the buffer pool,
//! frame delivery, and the background event-pump thread. Completion
//! callbacks (and therefore frame reassembly) run on the pump thread; the
//! caller's image callback is always invoked there too, after every
//! internal lock has been released, so re-entering the session API from
//! inside the callback is allowed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uvc_proto::{DescriptorCatalog, FrameDefinition, Roi, StreamControl};

use crate::control::Control;
use crate::error::{Error, Result};
use crate::frame::FrameAssembler;
use crate::negotiate::{StreamNegotiator, bulk_transfer_count, iso_packet_count};
use crate::pool::{BufferPool, FrameShape, ImageBuffer};
use crate::transfer::TransferRequest;
use crate::transport::UsbTransport;

/// Buffers the pool hands out before `get` starts blocking.
pub const DEFAULT_POOL_DEPTH: usize = 4;

/// Pump-loop slice; also bounds image-callback dispatch latency.
const PUMP_SLICE: Duration = Duration::from_millis(10);

/// Transfer type of the video endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Endpoint description handed over by the enumeration/claim layer.
#[derive(Debug, Clone, Copy)]
pub struct EndpointInfo {
    pub address: u8,
    pub max_packet_size: u16,
    pub kind: EndpointKind,
    pub interval: u8,
}

/// Interface geometry of one claimed video function.
#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    pub control_interface: u8,
    pub streaming_interface: u8,
    pub streaming_alt_setting: u8,
    pub endpoint: EndpointInfo,
}

/// Caller-supplied image sink.
pub type ImageCallback = Arc<dyn Fn(ImageBuffer) + Send + Sync>;

/// Completed-frame hand-off: a callback slot and a pull queue.
///
/// Frames are queued by the assembler path and dispatched to the callback
/// by the pump thread with no locks held; without a callback they stay
/// queued for pull-style consumption. The queue is naturally bounded by
/// the pool's capacity.
struct FrameDelivery {
    callback: Mutex<Option<ImageCallback>>,
    ready: Mutex<VecDeque<ImageBuffer>>,
    available: Condvar,
}

impl FrameDelivery {
    fn new() -> FrameDelivery {
        FrameDelivery {
            callback: Mutex::new(None),
            ready: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    fn set_callback(&self, callback: Option<ImageCallback>) {
        *self.callback.lock().unwrap() = callback;
    }

    fn queue(&self, buffer: ImageBuffer) {
        self.ready.lock().unwrap().push_back(buffer);
        self.available.notify_one();
    }

    /// Feed queued frames to the callback, if one is installed. Runs on
    /// the pump thread; no delivery lock is held while the callback runs.
    fn dispatch_pending(&self) {
        loop {
            let Some(callback) = self.callback.lock().unwrap().clone() else {
                return;
            };
            let Some(buffer) = self.ready.lock().unwrap().pop_front() else {
                return;
            };
            (*callback)(buffer);
        }
    }

    fn try_next(&self) -> Option<ImageBuffer> {
        self.ready.lock().unwrap().pop_front()
    }

    fn next(&self, timeout: Duration) -> Option<ImageBuffer> {
        let deadline = Instant::now() + timeout;
        let mut ready = self.ready.lock().unwrap();
        loop {
            if let Some(buffer) = ready.pop_front() {
                return Some(buffer);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.available.wait_timeout(ready, deadline - now).unwrap();
            ready = guard;
        }
    }

    fn drain(&self) {
        self.ready.lock().unwrap().clear();
    }
}

/// Per-stream reassembly context shared by the streaming transfers.
struct StreamCore {
    assembler: Mutex<FrameAssembler>,
    delivery: Arc<FrameDelivery>,
    running: Arc<AtomicBool>,
}

impl StreamCore {
    /// One transfer completion. Returns whether the transfer should be
    /// resubmitted.
    fn handle_payload(&self, data: &[u8]) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        let mut completed = Vec::new();
        self.assembler.lock().unwrap().fill_frame(data, &mut completed);
        for buffer in completed {
            self.delivery.queue(buffer);
        }
        self.running.load(Ordering::Acquire)
    }
}

/// Background thread continuously pumping the transport's event dispatch.
struct EventPump {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EventPump {
    fn start(transport: Arc<dyn UsbTransport>, delivery: Arc<FrameDelivery>) -> EventPump {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let thread = std::thread::Builder::new()
            .name("uvc-events".to_string())
            .spawn(move || {
                debug!("event pump started");
                while flag.load(Ordering::Acquire) {
                    if let Err(e) = transport.process_events(PUMP_SLICE, None) {
                        warn!(error = %e, "error dispatching usb events");
                        std::thread::sleep(Duration::from_millis(100));
                    }
                    delivery.dispatch_pending();
                }
                debug!("event pump stopped");
            })
            .expect("failed to spawn event pump thread");
        EventPump {
            running,
            thread: Some(thread),
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            // A callback may stop the session from the pump thread
            // itself; never join the current thread.
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.stop();
    }
}

struct StreamState {
    probe: StreamControl,
    current: Option<FrameDefinition>,
    /// Effective window, sensor coordinates.
    roi: Option<Roi>,
    transfers: Vec<TransferRequest>,
}

/// The four sensor-window controls, when the device exposes them.
struct WindowControls {
    x: Arc<Control>,
    y: Arc<Control>,
    width: Arc<Control>,
    height: Arc<Control>,
}

/// A negotiated, streamable video function.
pub struct VideoSession {
    transport: Arc<dyn UsbTransport>,
    catalog: Arc<DescriptorCatalog>,
    config: StreamConfig,
    controls: Vec<Arc<Control>>,
    pool: Arc<BufferPool>,
    delivery: Arc<FrameDelivery>,
    /// Guards negotiation/shape state against the event thread.
    state: Mutex<StreamState>,
    running: Arc<AtomicBool>,
    pump: Mutex<Option<EventPump>>,
}

impl VideoSession {
    pub fn new(
        transport: Arc<dyn UsbTransport>,
        catalog: DescriptorCatalog,
        config: StreamConfig,
        controls: Vec<Arc<Control>>,
    ) -> VideoSession {
        VideoSession {
            transport,
            catalog: Arc::new(catalog),
            config,
            controls,
            pool: Arc::new(BufferPool::new()),
            delivery: Arc::new(FrameDelivery::new()),
            state: Mutex::new(StreamState {
                probe: StreamControl::default(),
                current: None,
                roi: None,
                transfers: Vec::new(),
            }),
            running: Arc::new(AtomicBool::new(false)),
            pump: Mutex::new(None),
        }
    }

    /// Negotiate and start streaming.
    ///
    /// `selection` is a (format index, frame index) pair; `None` picks the
    /// device default. The device has the last word: the returned
    /// definition is the frame actually committed, which may differ from
    /// the request.
    pub fn start_video(&self, selection: Option<(u8, u8)>) -> Result<FrameDefinition> {
        let mut state = self.state.lock().unwrap();
        self.halt_streaming(&mut state);

        let wanted = match selection {
            Some((format, frame)) => self
                .catalog
                .find_frame(format, frame)
                .ok_or(Error::UnknownFrame { format, frame })?,
            None => self.catalog.default_frame().ok_or(Error::NoFrames)?,
        }
        .clone();

        self.transport.set_alt_setting(
            self.config.streaming_interface,
            self.config.streaming_alt_setting,
        )?;

        let negotiator = StreamNegotiator::new(
            self.transport.clone(),
            self.config.streaming_interface,
            self.catalog.uvc_version,
        );
        let mut probe = StreamControl::candidate(
            wanted.format_index,
            wanted.frame_index,
            wanted.default_interval,
        );
        negotiator.set_probe(&probe)?;
        negotiator.get_probe(&mut probe)?;

        // Resolve the device's answer by exact index match. A mismatch
        // against the request is non-fatal; an answer the catalog has
        // never heard of is.
        let selected = match self.catalog.find_frame(probe.format_index, probe.frame_index) {
            Some(frame) => frame.clone(),
            None => {
                return Err(Error::Negotiation(format!(
                    "device selected unknown format {} / frame {}",
                    probe.format_index, probe.frame_index
                )));
            }
        };
        if selected.format_index != wanted.format_index
            || selected.frame_index != wanted.frame_index
        {
            warn!(
                requested_format = wanted.format_index,
                requested_frame = wanted.frame_index,
                selected_format = selected.format_index,
                selected_frame = selected.frame_index,
                "device overrode the requested frame"
            );
        }

        let (shape, pool_roi, effective_roi) = self.resolve_geometry(&selected, state.roi);
        self.pool.reset(shape, pool_roi, DEFAULT_POOL_DEPTH);

        negotiator.commit(&probe)?;

        let max_frame = if probe.max_video_frame_size > 0 {
            probe.max_video_frame_size
        } else {
            selected.max_frame_size()
        };
        let max_payload = if probe.max_payload_transfer_size > 0 {
            probe.max_payload_transfer_size
        } else {
            max_frame
        };

        let core = Arc::new(StreamCore {
            assembler: Mutex::new(FrameAssembler::new(self.pool.clone())),
            delivery: self.delivery.clone(),
            running: self.running.clone(),
        });
        self.running.store(true, Ordering::Release);

        let endpoint = self.config.endpoint;
        let transfers: Vec<TransferRequest> = match endpoint.kind {
            EndpointKind::Bulk => {
                let count = bulk_transfer_count(max_frame, max_payload);
                debug!(count, payload = max_payload, "pipelining bulk transfers");
                (0..count)
                    .map(|_| {
                        TransferRequest::bulk(
                            self.transport.clone(),
                            endpoint.address,
                            max_payload as usize,
                        )
                    })
                    .collect()
            }
            EndpointKind::Isochronous => {
                let packets = iso_packet_count(max_frame, endpoint.max_packet_size);
                debug!(packets, packet_size = endpoint.max_packet_size, "single iso transfer");
                vec![TransferRequest::isochronous(
                    self.transport.clone(),
                    endpoint.address,
                    packets,
                    u32::from(endpoint.max_packet_size),
                )]
            }
            _ => {
                self.running.store(false, Ordering::Release);
                return Err(Error::MissingVideoEndpoint);
            }
        };

        for request in &transfers {
            let core = core.clone();
            request.set_stream_callback(move |data| core.handle_payload(data));
            request.submit()?;
        }

        state.probe = probe;
        state.roi = Some(effective_roi);
        state.current = Some(selected.clone());
        state.transfers = transfers;
        drop(state);

        self.ensure_pump();
        info!(
            format = selected.format_index,
            frame = selected.frame_index,
            width = selected.width,
            height = selected.height,
            "video started"
        );
        Ok(selected)
    }

    /// Stop streaming, release the pool and park the event thread.
    pub fn stop_video(&self) {
        let mut state = self.state.lock().unwrap();
        self.halt_streaming(&mut state);
        state.current = None;
        drop(state);

        if let Some(mut pump) = self.pump.lock().unwrap().take() {
            pump.stop();
        }
        self.delivery.drain();
        info!("video stopped");
    }

    /// Cancel and drain all streaming transfers. The pool is shut off
    /// first so a completion blocked on buffer backpressure unblocks.
    fn halt_streaming(&self, state: &mut StreamState) {
        self.running.store(false, Ordering::Release);
        self.pool.clear();
        for request in state.transfers.drain(..) {
            request.cancel();
            request.wait();
        }
    }

    fn ensure_pump(&self) {
        let mut pump = self.pump.lock().unwrap();
        if pump.is_none() {
            *pump = Some(EventPump::start(
                self.transport.clone(),
                self.delivery.clone(),
            ));
        }
    }

    /// Current effective window, in sensor coordinates.
    pub fn roi(&self) -> Roi {
        let state = self.state.lock().unwrap();
        state.roi.unwrap_or_else(|| {
            state
                .current
                .as_ref()
                .map(|f| Roi::full(f.width, f.height))
                .unwrap_or_default()
        })
    }

    /// Change the capture window.
    ///
    /// With sensor-window controls present the request is round-tripped
    /// through the device and its authoritative values reshape the pool;
    /// without them the window is a software crop applied during
    /// reassembly. Out-of-bounds windows are rejected. Returns the window
    /// actually in effect.
    pub fn set_roi(&self, roi: Roi) -> Result<Roi> {
        let mut state = self.state.lock().unwrap();

        let Some(frame) = state.current.clone() else {
            // Not streaming yet: validate against the default frame and
            // remember the request for the next start.
            if let Some(frame) = self.catalog.default_frame() {
                if !roi.fits_within(frame.width, frame.height) {
                    return Err(Error::InvalidRoi {
                        roi,
                        width: frame.width,
                        height: frame.height,
                    });
                }
            }
            state.roi = Some(roi);
            return Ok(roi);
        };

        if !roi.fits_within(frame.width, frame.height) {
            return Err(Error::InvalidRoi {
                roi,
                width: frame.width,
                height: frame.height,
            });
        }

        if let Some(window) = self.window_controls() {
            let effective = self.write_window(&window, roi, &frame)?;
            state.roi = Some(effective);
            Ok(effective)
        } else {
            self.pool.set_roi(roi)?;
            state.roi = Some(roi);
            Ok(roi)
        }
    }

    /// Change the sensor binning factor via the vendor window unit.
    ///
    /// Returns the factor the device settled on. Errors when the device
    /// has no binning control; binning is not emulated in software.
    pub fn set_binning(&self, factor: u32) -> Result<u32> {
        let mut state = self.state.lock().unwrap();
        let control = self
            .control("Binning")
            .ok_or_else(|| Error::ControlUnavailable("Binning".to_string()))?;

        control.set(factor)?;
        control.coalesce();
        let actual = control.update()?;

        // Binning rescales the delivered frame; let the device's window
        // values drive the new shape.
        if let (Some(frame), Some(window)) = (state.current.clone(), self.window_controls()) {
            let roi = state.roi.unwrap_or_else(|| Roi::full(frame.width, frame.height));
            let effective = self.write_window(&window, roi, &frame)?;
            state.roi = Some(effective);
        }
        Ok(actual)
    }

    /// Install the image callback. Completed frames are handed to it on
    /// the event thread with no session lock held.
    pub fn set_image_callback(&self, callback: impl Fn(ImageBuffer) + Send + Sync + 'static) {
        self.delivery.set_callback(Some(Arc::new(callback)));
    }

    /// Remove the image callback, switching to pull-style consumption via
    /// [`next_frame`](Self::next_frame).
    pub fn clear_image_callback(&self) {
        self.delivery.set_callback(None);
    }

    /// Pull the next completed frame, waiting up to `timeout`.
    pub fn next_frame(&self, timeout: Duration) -> Option<ImageBuffer> {
        self.delivery.next(timeout)
    }

    /// Pull a completed frame if one is already waiting.
    pub fn try_next_frame(&self) -> Option<ImageBuffer> {
        self.delivery.try_next()
    }

    /// Hand a consumed frame back for recycling.
    pub fn recycle(&self, buffer: ImageBuffer) {
        self.pool.put(buffer);
    }

    /// All streamable frames the device advertises.
    pub fn formats(&self) -> &[FrameDefinition] {
        &self.catalog.frames
    }

    /// The frame committed by the last `start_video`, if streaming.
    pub fn current_format(&self) -> Option<FrameDefinition> {
        self.state.lock().unwrap().current.clone()
    }

    /// The probe/commit payload as the device last returned it, with its
    /// authoritative sizing fields.
    pub fn negotiated(&self) -> StreamControl {
        self.state.lock().unwrap().probe
    }

    /// Control by name.
    pub fn control(&self, name: &str) -> Option<Arc<Control>> {
        self.controls
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// Control by position, in discovery order.
    pub fn control_at(&self, index: usize) -> Option<Arc<Control>> {
        self.controls.get(index).cloned()
    }

    pub fn controls(&self) -> &[Arc<Control>] {
        &self.controls
    }

    pub fn catalog(&self) -> &DescriptorCatalog {
        &self.catalog
    }

    fn window_controls(&self) -> Option<WindowControls> {
        let find = |name: &str| {
            self.controls
                .iter()
                .find(|c| c.name() == name && c.valid())
                .cloned()
        };
        Some(WindowControls {
            x: find("Sensor Window X")?,
            y: find("Sensor Window Y")?,
            width: find("Sensor Window Width")?,
            height: find("Sensor Window Height")?,
        })
    }

    /// Round-trip a window through the device and reshape the pool from
    /// its authoritative post-set values. The delivered frame then is the
    /// window itself, so reassembly uses a full-frame crop.
    fn write_window(
        &self,
        window: &WindowControls,
        roi: Roi,
        frame: &FrameDefinition,
    ) -> Result<Roi> {
        window.x.set(roi.x)?;
        window.y.set(roi.y)?;
        window.width.set(roi.width)?;
        window.height.set(roi.height)?;
        for control in [&window.x, &window.y, &window.width, &window.height] {
            control.coalesce();
        }

        let effective = Roi {
            x: window.x.update()?,
            y: window.y.update()?,
            width: window.width.update()?,
            height: window.height.update()?,
        };
        debug!(?roi, ?effective, "device window round trip");

        let shape = FrameShape {
            pixel_format: frame.pixel_format,
            width: effective.width,
            height: effective.height,
            bytes_per_line: effective.width * frame.bytes_per_pixel,
            bytes_per_pixel: frame.bytes_per_pixel,
        };
        self.pool
            .reset(shape, Roi::full(effective.width, effective.height), DEFAULT_POOL_DEPTH);
        Ok(effective)
    }

    /// Shape, pool window and effective sensor window for a freshly
    /// committed frame.
    fn resolve_geometry(
        &self,
        frame: &FrameDefinition,
        requested: Option<Roi>,
    ) -> (FrameShape, Roi, Roi) {
        if let Some(window) = self.window_controls() {
            // Device-cropped: the authoritative window is what arrives on
            // the wire.
            let current = (|| -> Result<Roi> {
                Ok(Roi {
                    x: window.x.update()?,
                    y: window.y.update()?,
                    width: window.width.update()?,
                    height: window.height.update()?,
                })
            })();
            match current {
                Ok(window_roi) if window_roi.width > 0 && window_roi.height > 0 => {
                    let shape = FrameShape {
                        pixel_format: frame.pixel_format,
                        width: window_roi.width,
                        height: window_roi.height,
                        bytes_per_line: window_roi.width * frame.bytes_per_pixel,
                        bytes_per_pixel: frame.bytes_per_pixel,
                    };
                    let pool_roi = Roi::full(window_roi.width, window_roi.height);
                    return (shape, pool_roi, window_roi);
                }
                Ok(_) => warn!("device window reads degenerate, using software crop"),
                Err(e) => warn!(error = %e, "device window unreadable, using software crop"),
            }
        }

        let shape = FrameShape::of_frame(frame);
        let roi = requested
            .filter(|r| r.fits_within(frame.width, frame.height))
            .unwrap_or_else(|| Roi::full(frame.width, frame.height));
        (shape, roi, roi)
    }
}

impl Drop for VideoSession {
    fn drop(&mut self) {
        self.stop_video();
    }
}
