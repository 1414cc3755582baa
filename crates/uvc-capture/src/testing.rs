//! Test utilities for uvc-capture
//!
//! Provides a scriptable transport so the engine, negotiator and session
//! can be exercised without hardware. The mock shares the production
//! dispatch-queue semantics: submissions stay pending until some thread
//! pumps `process_events`, which is where the scripted handler runs and
//! completions are delivered.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::TransferError;
use crate::transfer::{CompletionFlag, Submission, TransferKind};
use crate::transport::{TransferQueue, UsbTransport};

/// Scripted device behavior: receives the transfer kind and the request's
/// scratch buffer, returns the bytes transferred or a transfer error.
pub type MockHandler =
    Box<dyn FnMut(&TransferKind, &mut [u8]) -> Result<usize, TransferError> + Send>;

/// Transport double backed by a handler closure.
pub struct MockTransport {
    queue: TransferQueue,
    handler: Mutex<MockHandler>,
    executed: AtomicUsize,
    alt_settings: Mutex<Vec<(u8, u8)>>,
}

impl MockTransport {
    /// Mock whose submissions complete through `handler` when pumped.
    pub fn completing(
        handler: impl FnMut(&TransferKind, &mut [u8]) -> Result<usize, TransferError> + Send + 'static,
    ) -> Arc<MockTransport> {
        Arc::new(MockTransport {
            queue: TransferQueue::new(),
            handler: Mutex::new(Box::new(handler)),
            executed: AtomicUsize::new(0),
            alt_settings: Mutex::new(Vec::new()),
        })
    }

    /// Submissions waiting to be pumped.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Handler invocations so far (excludes cancelled submissions).
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::Acquire)
    }

    /// Alternate-setting selections observed, in order.
    pub fn alt_settings(&self) -> Vec<(u8, u8)> {
        self.alt_settings.lock().unwrap().clone()
    }
}

impl UsbTransport for MockTransport {
    fn submit(&self, submission: Submission) -> Result<(), TransferError> {
        self.queue.push(submission);
        Ok(())
    }

    fn cancel(&self, _submission: &Submission) {
        self.queue.wake();
    }

    fn process_events(
        &self,
        timeout: Duration,
        done: Option<&CompletionFlag>,
    ) -> Result<(), TransferError> {
        self.queue.process(timeout, done, |submission| {
            self.executed.fetch_add(1, Ordering::AcqRel);
            let kind = submission.kind();
            let mut guard = self.handler.lock().unwrap();
            let handler = &mut *guard;
            submission.with_buffer_mut(|buf| handler(&kind, buf))
        })
    }

    fn set_alt_setting(&self, interface: u8, alt_setting: u8) -> Result<(), TransferError> {
        self.alt_settings.lock().unwrap().push((interface, alt_setting));
        Ok(())
    }
}
