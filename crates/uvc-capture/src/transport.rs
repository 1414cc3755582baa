//! Bus transport seam
//!
//! The engine consumes the bus through [`UsbTransport`]: submit/cancel on an
//! opaque submission plus a blocking "process pending events, optionally
//! until a completion flag is set" primitive. [`RusbTransport`] implements
//! it over a rusb device handle; tests use the scriptable mock in
//! [`crate::testing`].
//!
//! Concurrent safety of blocking waits interleaved with the background pump
//! is the transport's contract: the shared dispatch queue here may be
//! drained from any number of threads at once.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use rusb::{Context, DeviceHandle};
use tracing::{debug, warn};

use crate::error::TransferError;
use crate::transfer::{CompletionAction, CompletionFlag, Submission, TransferKind};

/// Direction bit of an endpoint address.
const ENDPOINT_IN: u8 = 0x80;

/// What the engine needs from the bus layer.
///
/// Completions are delivered inline from `process_events`, on whichever
/// thread is pumping; that thread runs the engine's completion dispatch,
/// including any streaming callbacks.
pub trait UsbTransport: Send + Sync {
    /// Hand a filled request to the bus. The transport must eventually
    /// deliver exactly one completion per submission via
    /// [`Submission::complete`].
    fn submit(&self, submission: Submission) -> Result<(), TransferError>;

    /// Request asynchronous cancellation of a pending submission.
    fn cancel(&self, submission: &Submission);

    /// Dispatch pending bus events for up to `timeout`, returning early
    /// once `done` is set. May overrun the timeout by the duration of one
    /// native operation.
    fn process_events(
        &self,
        timeout: Duration,
        done: Option<&CompletionFlag>,
    ) -> Result<(), TransferError>;

    /// Select an alternate setting on a claimed interface.
    fn set_alt_setting(&self, interface: u8, alt_setting: u8) -> Result<(), TransferError>;
}

/// Shared submission queue used by the transport implementations.
///
/// `process` pops submissions and runs them through an executor closure,
/// delivering completions and honoring the engine's resubmit directives.
pub struct TransferQueue {
    pending: Mutex<VecDeque<Submission>>,
    activity: Condvar,
}

impl TransferQueue {
    pub fn new() -> TransferQueue {
        TransferQueue {
            pending: Mutex::new(VecDeque::new()),
            activity: Condvar::new(),
        }
    }

    pub fn push(&self, submission: Submission) {
        self.pending.lock().unwrap().push_back(submission);
        self.activity.notify_all();
    }

    /// Wake pumping threads so a cancellation request is observed promptly.
    pub fn wake(&self) {
        self.activity.notify_all();
    }

    /// Number of submissions waiting for dispatch.
    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain submissions for up to `timeout`, stopping early when `done`
    /// becomes set. `exec` performs the native operation for one
    /// submission.
    pub fn process(
        &self,
        timeout: Duration,
        done: Option<&CompletionFlag>,
        exec: impl Fn(&Submission) -> Result<usize, TransferError>,
    ) -> Result<(), TransferError> {
        let deadline = Instant::now() + timeout;
        let mut pending = self.pending.lock().unwrap();

        loop {
            if done.is_some_and(|flag| flag.is_set()) {
                return Ok(());
            }

            if let Some(submission) = pending.pop_front() {
                drop(pending);

                let action = if submission.cancel_requested() {
                    submission.complete(Err(TransferError::Cancelled))
                } else {
                    let result = exec(&submission);
                    submission.complete(result)
                };
                if action == CompletionAction::Resubmit {
                    self.push(submission);
                }

                pending = self.pending.lock().unwrap();
                self.activity.notify_all();
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let (guard, _) = self
                .activity
                .wait_timeout(pending, deadline - now)
                .unwrap();
            pending = guard;
        }
    }
}

impl Default for TransferQueue {
    fn default() -> Self {
        TransferQueue::new()
    }
}

/// Production transport over an opened rusb device handle.
///
/// Submissions queue up and are executed with rusb's blocking transfer
/// calls by whichever thread pumps `process_events`, normally the
/// session's event thread, or a caller blocked in `wait`.
pub struct RusbTransport {
    handle: Arc<DeviceHandle<Context>>,
    queue: TransferQueue,
}

impl RusbTransport {
    pub fn new(handle: Arc<DeviceHandle<Context>>) -> RusbTransport {
        RusbTransport {
            handle,
            queue: TransferQueue::new(),
        }
    }

    fn execute(&self, submission: &Submission) -> Result<usize, TransferError> {
        let kind = submission.kind();
        let timeout = submission.timeout();

        submission.with_buffer_mut(|buf| match kind {
            TransferKind::Control { setup } => {
                if setup.is_in() {
                    self.handle
                        .read_control(
                            setup.request_type,
                            setup.request,
                            setup.value,
                            setup.index,
                            buf,
                            timeout,
                        )
                        .map_err(map_rusb_error)
                } else {
                    self.handle
                        .write_control(
                            setup.request_type,
                            setup.request,
                            setup.value,
                            setup.index,
                            buf,
                            timeout,
                        )
                        .map_err(map_rusb_error)
                }
            }
            TransferKind::Bulk { endpoint } => {
                if endpoint & ENDPOINT_IN != 0 {
                    self.handle
                        .read_bulk(endpoint, buf, timeout)
                        .map_err(map_rusb_error)
                } else {
                    self.handle
                        .write_bulk(endpoint, buf, timeout)
                        .map_err(map_rusb_error)
                }
            }
            TransferKind::Interrupt { endpoint } => {
                if endpoint & ENDPOINT_IN != 0 {
                    self.handle
                        .read_interrupt(endpoint, buf, timeout)
                        .map_err(map_rusb_error)
                } else {
                    self.handle
                        .write_interrupt(endpoint, buf, timeout)
                        .map_err(map_rusb_error)
                }
            }
            TransferKind::Isochronous { endpoint, .. } => {
                // rusb's safe API carries no isochronous transfers; an
                // iso-capable backend can implement this seam instead.
                warn!(
                    endpoint = format_args!("{endpoint:#04x}"),
                    "isochronous transfer not supported by the rusb transport"
                );
                Err(TransferError::Unsupported)
            }
        })
    }
}

impl UsbTransport for RusbTransport {
    fn submit(&self, submission: Submission) -> Result<(), TransferError> {
        self.queue.push(submission);
        Ok(())
    }

    fn cancel(&self, _submission: &Submission) {
        // Cooperative: the cancel flag is checked when the submission is
        // popped; wake pumps so that happens promptly.
        self.queue.wake();
    }

    fn process_events(
        &self,
        timeout: Duration,
        done: Option<&CompletionFlag>,
    ) -> Result<(), TransferError> {
        self.queue.process(timeout, done, |sub| self.execute(sub))
    }

    fn set_alt_setting(&self, interface: u8, alt_setting: u8) -> Result<(), TransferError> {
        debug!(interface, alt_setting, "selecting alternate setting");
        self.handle
            .set_alternate_setting(interface, alt_setting)
            .map_err(map_rusb_error)
    }
}

/// Map rusb::Error to TransferError
///
/// This provides a clean mapping from low-level rusb errors to the
/// engine's per-transfer error conditions.
pub fn map_rusb_error(err: rusb::Error) -> TransferError {
    match err {
        rusb::Error::Timeout => TransferError::TimedOut,
        rusb::Error::Pipe => TransferError::Stall,
        rusb::Error::NoDevice => TransferError::NoDevice,
        rusb::Error::NotFound => TransferError::NotFound,
        rusb::Error::Busy => TransferError::Busy,
        rusb::Error::Overflow => TransferError::Overflow,
        rusb::Error::Io => TransferError::Io,
        rusb::Error::InvalidParam => TransferError::InvalidParam,
        rusb::Error::Access => TransferError::Access,
        _ => TransferError::Other {
            message: err.to_string(),
        },
    }
}
