//! Asynchronous transfer engine
//!
//! Wraps the transport's callback-driven native I/O in a reusable
//! submit/cancel/wait primitive. A request is created once with its kind and
//! scratch buffer and then cycles through submit/wait any number of times.
//!
//! State machine: `Idle -> InFlight` on submit, then `Completed`, `Failed`
//! or `Cancelled` when the transport delivers the completion. A timed-out
//! completion is not terminal: the request is resubmitted transparently and
//! stays `InFlight`. Destruction while in flight cancels and drains before
//! the buffer is released.

use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{error, trace, warn};

use crate::error::TransferError;
use crate::transport::UsbTransport;

/// Timeout baked into every request at fill time. Not exposed per call;
/// a timed-out completion is invisible to callers.
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_millis(1000);

/// Slice used when pumping events from `wait`.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Completion flag shared between a request and the transport's
/// event-dispatch primitive, so a blocking wait can be scoped to one
/// request.
#[derive(Debug, Default)]
pub struct CompletionFlag {
    set: AtomicBool,
}

impl CompletionFlag {
    pub fn new(set: bool) -> CompletionFlag {
        CompletionFlag {
            set: AtomicBool::new(set),
        }
    }

    pub fn set(&self) {
        self.set.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.set.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }
}

/// The 8-byte setup stage of a control transfer, minus the length
/// (implied by the data buffer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlSetup {
    /// True for device-to-host transfers (bit 7 of bmRequestType).
    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

/// What kind of native request to fill. The four kinds differ only here;
/// the lifecycle is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control { setup: ControlSetup },
    Bulk { endpoint: u8 },
    Interrupt { endpoint: u8 },
    Isochronous {
        endpoint: u8,
        packets: u32,
        packet_size: u32,
    },
}

impl TransferKind {
    fn label(&self) -> &'static str {
        match self {
            TransferKind::Control { .. } => "control",
            TransferKind::Bulk { .. } => "bulk",
            TransferKind::Interrupt { .. } => "interrupt",
            TransferKind::Isochronous { .. } => "isochronous",
        }
    }
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Never submitted, or drained after a terminal completion.
    Idle,
    InFlight,
    Completed,
    Cancelled,
    Failed,
}

/// What the transport should do after delivering a completion.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionAction {
    Done,
    /// Hand the submission back to the bus: a timed-out completion, or a
    /// streaming callback asking to be re-armed.
    Resubmit,
}

/// Callback run on the event-dispatch thread with the received bytes.
/// Returning `true` resubmits the request for continuous streaming.
pub type StreamCallback = Box<dyn FnMut(&[u8]) -> bool + Send>;

struct TransferState {
    status: TransferStatus,
    bytes: usize,
    error: Option<TransferError>,
}

struct TransferShared {
    kind: Mutex<TransferKind>,
    buf: Mutex<Vec<u8>>,
    state: Mutex<TransferState>,
    flag: CompletionFlag,
    cancel_requested: AtomicBool,
    callback: Mutex<Option<StreamCallback>>,
    timeout: Duration,
}

/// Handle the transport holds while a request is on the bus.
///
/// Completion must be delivered exactly once per submission through
/// [`Submission::complete`].
#[derive(Clone)]
pub struct Submission {
    shared: Arc<TransferShared>,
}

impl Submission {
    /// Kind of native request to fill.
    pub fn kind(&self) -> TransferKind {
        *self.shared.kind.lock().unwrap()
    }

    /// Fill-time timeout for the native operation.
    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    /// Whether cancellation was requested after submission.
    pub fn cancel_requested(&self) -> bool {
        self.shared.cancel_requested.load(Ordering::Acquire)
    }

    /// Run `f` over the request's scratch buffer.
    ///
    /// Only the transport touches the buffer while the request is in
    /// flight; the engine keeps it untouched until a terminal completion.
    pub fn with_buffer_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut buf = self.shared.buf.lock().unwrap();
        f(&mut buf)
    }

    /// Deliver the native completion.
    ///
    /// Updates the state machine, sets the completion flag and dispatches
    /// the streaming callback. Errors never propagate out of this call;
    /// they are recorded and logged here because the native callback
    /// context has nowhere to raise them.
    pub fn complete(&self, result: Result<usize, TransferError>) -> CompletionAction {
        let shared = &self.shared;
        let label = self.kind().label();

        if matches!(result, Err(TransferError::TimedOut))
            && !shared.cancel_requested.load(Ordering::Acquire)
        {
            trace!(kind = label, "transfer timed out, resubmitting");
            return CompletionAction::Resubmit;
        }

        let outcome = if shared.cancel_requested.load(Ordering::Acquire) {
            Err(TransferError::Cancelled)
        } else {
            result
        };

        match outcome {
            Ok(bytes) => {
                {
                    let mut state = shared.state.lock().unwrap();
                    state.status = TransferStatus::Completed;
                    state.bytes = bytes;
                    state.error = None;
                }
                shared.flag.set();

                let resubmit = {
                    let mut slot = shared.callback.lock().unwrap();
                    match slot.as_mut() {
                        Some(cb) => {
                            let buf = shared.buf.lock().unwrap();
                            let len = bytes.min(buf.len());
                            std::panic::catch_unwind(AssertUnwindSafe(|| cb(&buf[..len])))
                                .unwrap_or_else(|_| {
                                    error!(kind = label, "panic in transfer callback");
                                    false
                                })
                        }
                        None => false,
                    }
                };

                if resubmit && !shared.cancel_requested.load(Ordering::Acquire) {
                    let mut state = shared.state.lock().unwrap();
                    state.status = TransferStatus::InFlight;
                    state.bytes = 0;
                    shared.flag.clear();
                    CompletionAction::Resubmit
                } else {
                    CompletionAction::Done
                }
            }
            Err(e) => {
                let status = if e == TransferError::Cancelled {
                    TransferStatus::Cancelled
                } else {
                    warn!(kind = label, error = %e, "transfer failed");
                    TransferStatus::Failed
                };
                let mut state = shared.state.lock().unwrap();
                state.status = status;
                state.bytes = 0;
                state.error = Some(e);
                drop(state);
                shared.flag.set();
                CompletionAction::Done
            }
        }
    }
}

/// A reusable asynchronous transfer request.
pub struct TransferRequest {
    transport: Arc<dyn UsbTransport>,
    shared: Arc<TransferShared>,
}

impl TransferRequest {
    fn new(transport: Arc<dyn UsbTransport>, kind: TransferKind, buf: Vec<u8>) -> TransferRequest {
        TransferRequest {
            transport,
            shared: Arc::new(TransferShared {
                kind: Mutex::new(kind),
                buf: Mutex::new(buf),
                state: Mutex::new(TransferState {
                    status: TransferStatus::Idle,
                    bytes: 0,
                    error: None,
                }),
                // A never-submitted request counts as complete so that
                // wait() returns immediately.
                flag: CompletionFlag::new(true),
                cancel_requested: AtomicBool::new(false),
                callback: Mutex::new(None),
                timeout: DEFAULT_TRANSFER_TIMEOUT,
            }),
        }
    }

    /// Two-phase control request. For OUT transfers `data` is copied into
    /// the scratch buffer at fill time; for IN transfers `data.len()` (or
    /// `length`) sizes the data stage and the received bytes are copied out
    /// with [`read_result`](Self::read_result) after completion.
    pub fn control(
        transport: Arc<dyn UsbTransport>,
        setup: ControlSetup,
        data: &[u8],
        length: u16,
    ) -> TransferRequest {
        let buf = if setup.is_in() {
            vec![0u8; length as usize]
        } else {
            data.to_vec()
        };
        TransferRequest::new(transport, TransferKind::Control { setup }, buf)
    }

    /// Streaming bulk request with an owned buffer of `buf_size` bytes.
    pub fn bulk(transport: Arc<dyn UsbTransport>, endpoint: u8, buf_size: usize) -> TransferRequest {
        TransferRequest::new(transport, TransferKind::Bulk { endpoint }, vec![0u8; buf_size])
    }

    /// Interrupt request with a fixed buffer sized to the endpoint's max
    /// packet.
    pub fn interrupt(
        transport: Arc<dyn UsbTransport>,
        endpoint: u8,
        max_packet: u16,
    ) -> TransferRequest {
        TransferRequest::new(
            transport,
            TransferKind::Interrupt { endpoint },
            vec![0u8; max_packet as usize],
        )
    }

    /// Isochronous request with packet count and size fixed at
    /// construction.
    pub fn isochronous(
        transport: Arc<dyn UsbTransport>,
        endpoint: u8,
        packets: u32,
        packet_size: u32,
    ) -> TransferRequest {
        TransferRequest::new(
            transport,
            TransferKind::Isochronous {
                endpoint,
                packets,
                packet_size,
            },
            vec![0u8; (packets * packet_size) as usize],
        )
    }

    /// Refill a control request for the next round trip.
    ///
    /// Fails with `Busy` while the previous submission is still in flight.
    pub fn refill_control(
        &self,
        setup: ControlSetup,
        data: &[u8],
        length: u16,
    ) -> Result<(), TransferError> {
        let state = self.shared.state.lock().unwrap();
        if state.status == TransferStatus::InFlight {
            return Err(TransferError::Busy);
        }
        *self.shared.kind.lock().unwrap() = TransferKind::Control { setup };
        let mut buf = self.shared.buf.lock().unwrap();
        if setup.is_in() {
            buf.clear();
            buf.resize(length as usize, 0);
        } else {
            buf.clear();
            buf.extend_from_slice(data);
        }
        Ok(())
    }

    /// Hand the request to the transport. A no-op while in flight: state
    /// and byte count are left untouched.
    pub fn submit(&self) -> Result<(), TransferError> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.status == TransferStatus::InFlight {
                return Ok(());
            }
            state.status = TransferStatus::InFlight;
            state.bytes = 0;
            state.error = None;
            self.shared.cancel_requested.store(false, Ordering::Release);
            self.shared.flag.clear();
        }

        if let Err(e) = self.transport.submit(Submission {
            shared: self.shared.clone(),
        }) {
            let mut state = self.shared.state.lock().unwrap();
            state.status = TransferStatus::Failed;
            state.error = Some(e.clone());
            drop(state);
            self.shared.flag.set();
            return Err(e);
        }
        Ok(())
    }

    /// Request asynchronous cancellation. The terminal completion still
    /// arrives through the transport; observe it with [`wait`](Self::wait).
    pub fn cancel(&self) {
        let in_flight = self.shared.state.lock().unwrap().status == TransferStatus::InFlight;
        if in_flight {
            self.shared.cancel_requested.store(true, Ordering::Release);
            self.transport.cancel(&Submission {
                shared: self.shared.clone(),
            });
        }
    }

    /// Block until the completion flag is set, pumping the transport's
    /// event dispatch scoped to this request. Returns the bytes
    /// transferred; 0 on cancel or error.
    pub fn wait(&self) -> usize {
        while !self.shared.flag.is_set() {
            if let Err(e) = self
                .transport
                .process_events(WAIT_SLICE, Some(&self.shared.flag))
            {
                warn!(error = %e, "event dispatch failed while waiting");
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        let state = self.shared.state.lock().unwrap();
        if state.status == TransferStatus::Completed {
            state.bytes
        } else {
            0
        }
    }

    /// Submit and block for the terminal status.
    pub fn submit_and_wait(&self) -> Result<usize, TransferError> {
        self.submit()?;
        let bytes = self.wait();
        let state = self.shared.state.lock().unwrap();
        match state.status {
            TransferStatus::Completed => Ok(bytes),
            _ => Err(state
                .error
                .clone()
                .unwrap_or(TransferError::Other {
                    message: "transfer ended without a completion".into(),
                })),
        }
    }

    pub fn status(&self) -> TransferStatus {
        self.shared.state.lock().unwrap().status
    }

    pub fn in_flight(&self) -> bool {
        !self.shared.flag.is_set()
    }

    pub fn is_complete(&self) -> bool {
        self.shared.flag.is_set()
    }

    /// Error of the last terminal completion, if it was not a success.
    pub fn last_error(&self) -> Option<TransferError> {
        self.shared.state.lock().unwrap().error.clone()
    }

    /// Bytes transferred by the last completion.
    pub fn bytes_transferred(&self) -> usize {
        self.shared.state.lock().unwrap().bytes
    }

    /// Copy the completed data stage to `out`; returns the bytes copied.
    pub fn read_result(&self, out: &mut [u8]) -> usize {
        let bytes = self.bytes_transferred();
        let buf = self.shared.buf.lock().unwrap();
        let n = bytes.min(buf.len()).min(out.len());
        out[..n].copy_from_slice(&buf[..n]);
        n
    }

    /// Completed data stage as an owned vector.
    pub fn result_data(&self) -> Vec<u8> {
        let bytes = self.bytes_transferred();
        let buf = self.shared.buf.lock().unwrap();
        buf[..bytes.min(buf.len())].to_vec()
    }

    /// Install the streaming callback dispatched on each completion.
    pub fn set_stream_callback(&self, cb: impl FnMut(&[u8]) -> bool + Send + 'static) {
        *self.shared.callback.lock().unwrap() = Some(Box::new(cb));
    }
}

impl Drop for TransferRequest {
    fn drop(&mut self) {
        // Never let a native completion touch freed state: drain first.
        if self.in_flight() {
            self.cancel();
            self.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;

    #[test]
    fn test_unsubmitted_wait_returns_immediately() {
        let transport = MockTransport::completing(|_, _| Ok(0));
        let req = TransferRequest::bulk(transport, 0x82, 64);
        assert_eq!(req.status(), TransferStatus::Idle);
        assert!(!req.in_flight());
        assert_eq!(req.wait(), 0);
    }

    #[test]
    fn test_submit_while_in_flight_is_noop() {
        let transport = MockTransport::completing(|_, buf| {
            buf[..4].copy_from_slice(&[1, 2, 3, 4]);
            Ok(4)
        });
        let req = TransferRequest::bulk(transport.clone(), 0x82, 64);

        req.submit().unwrap();
        assert!(req.in_flight());
        assert_eq!(transport.pending(), 1);

        // Second submit: state and queue depth unchanged.
        req.submit().unwrap();
        assert!(req.in_flight());
        assert_eq!(transport.pending(), 1);

        assert_eq!(req.wait(), 4);
        assert_eq!(req.status(), TransferStatus::Completed);
        assert_eq!(req.result_data(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_cancel_then_wait_is_reusable() {
        let transport = MockTransport::completing(|_, buf| {
            buf[0] = 0xAB;
            Ok(1)
        });
        let req = TransferRequest::bulk(transport.clone(), 0x82, 16);

        req.submit().unwrap();
        req.cancel();
        assert_eq!(req.wait(), 0);
        assert_eq!(req.status(), TransferStatus::Cancelled);
        assert_eq!(req.last_error(), Some(TransferError::Cancelled));

        // The request is implicitly reusable after the terminal status.
        assert_eq!(req.submit_and_wait().unwrap(), 1);
        assert_eq!(req.status(), TransferStatus::Completed);
    }

    #[test]
    fn test_error_reports_zero_bytes() {
        let transport = MockTransport::completing(|_, _| Err(TransferError::Stall));
        let req = TransferRequest::bulk(transport, 0x82, 16);

        req.submit().unwrap();
        assert_eq!(req.wait(), 0);
        assert_eq!(req.status(), TransferStatus::Failed);
        assert_eq!(req.last_error(), Some(TransferError::Stall));
    }

    #[test]
    fn test_timeout_is_invisible_and_resubmits() {
        let mut first = true;
        let transport = MockTransport::completing(move |_, buf| {
            if first {
                first = false;
                Err(TransferError::TimedOut)
            } else {
                buf[0] = 7;
                Ok(1)
            }
        });
        let req = TransferRequest::interrupt(transport.clone(), 0x81, 16);

        assert_eq!(req.submit_and_wait().unwrap(), 1);
        // Both executions went through the transport.
        assert_eq!(transport.executed(), 2);
    }

    #[test]
    fn test_stream_callback_resubmits_until_told_otherwise() {
        let transport = MockTransport::completing(|_, buf| {
            buf[0] = 1;
            Ok(1)
        });
        let req = TransferRequest::bulk(transport.clone(), 0x82, 16);

        let mut rounds = 0;
        req.set_stream_callback(move |data| {
            assert_eq!(data, &[1]);
            rounds += 1;
            rounds < 3
        });

        req.submit().unwrap();
        // Pump until the callback stops requesting resubmission.
        while req.in_flight() {
            transport
                .process_events(Duration::from_millis(10), None)
                .unwrap();
        }
        assert_eq!(transport.executed(), 3);
        assert_eq!(req.status(), TransferStatus::Completed);
    }

    #[test]
    fn test_control_out_copies_data_at_fill() {
        let transport = MockTransport::completing(|kind, buf| {
            match kind {
                TransferKind::Control { setup } => {
                    assert!(!setup.is_in());
                    assert_eq!(buf, &[0xDE, 0xAD]);
                }
                _ => panic!("unexpected kind"),
            }
            Ok(2)
        });
        let setup = ControlSetup {
            request_type: 0x21,
            request: 0x01,
            value: 0x0100,
            index: 1,
        };
        let req = TransferRequest::control(transport, setup, &[0xDE, 0xAD], 2);
        assert_eq!(req.submit_and_wait().unwrap(), 2);
    }

    #[test]
    fn test_control_in_copies_to_destination() {
        let transport = MockTransport::completing(|_, buf| {
            buf[..3].copy_from_slice(&[9, 8, 7]);
            Ok(3)
        });
        let setup = ControlSetup {
            request_type: 0xA1,
            request: 0x81,
            value: 0x0100,
            index: 1,
        };
        let req = TransferRequest::control(transport, setup, &[], 8);
        assert_eq!(req.submit_and_wait().unwrap(), 3);

        let mut dest = [0u8; 8];
        assert_eq!(req.read_result(&mut dest), 3);
        assert_eq!(&dest[..3], &[9, 8, 7]);
    }

    #[test]
    fn test_refill_control_rejected_in_flight() {
        let transport = MockTransport::completing(|_, _| Ok(0));
        let setup = ControlSetup {
            request_type: 0xA1,
            request: 0x81,
            value: 0,
            index: 0,
        };
        let req = TransferRequest::control(transport, setup, &[], 4);
        req.submit().unwrap();
        assert_eq!(
            req.refill_control(setup, &[], 4),
            Err(TransferError::Busy)
        );
        req.wait();
        assert!(req.refill_control(setup, &[1], 0).is_ok());
    }

    #[test]
    fn test_drop_in_flight_drains() {
        let transport = MockTransport::completing(|_, _| Ok(0));
        {
            let req = TransferRequest::bulk(transport.clone(), 0x82, 16);
            req.submit().unwrap();
            // Dropped while in flight: destructor cancels and drains.
        }
        assert_eq!(transport.pending(), 0);
    }

    #[test]
    fn test_iso_buffer_sized_from_packets() {
        let transport = MockTransport::completing(|kind, buf| {
            match kind {
                TransferKind::Isochronous {
                    packets,
                    packet_size,
                    ..
                } => assert_eq!(buf.len(), (packets * packet_size) as usize),
                _ => panic!("unexpected kind"),
            }
            Ok(0)
        });
        let req = TransferRequest::isochronous(transport, 0x82, 8, 3072);
        assert_eq!(req.submit_and_wait().unwrap(), 0);
    }
}
