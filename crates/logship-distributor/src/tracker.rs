//! Completion tracking for a fan-out.
//!
//! A [`StreamTracker`] counts replica acknowledgements for one stream. The
//! [`PushTracker`] counts streams still pending across every write path and
//! reports the outcome of the whole push exactly once: either success when
//! the last stream is done, or the first error that pushed a stream past its
//! failure budget.

use crate::error::{DistributorError, Result};
use crate::stream::KeyedStream;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Replica acknowledgements for one stream.
#[derive(Debug)]
pub struct StreamTracker {
    /// The stream being written.
    pub stream: KeyedStream,
    min_success: usize,
    max_failures: usize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

impl StreamTracker {
    /// Track a stream that needs `min_success` acknowledgements and
    /// tolerates `max_failures` failures.
    pub fn new(stream: KeyedStream, min_success: usize, max_failures: usize) -> Self {
        Self {
            stream,
            min_success,
            max_failures,
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }

    /// Record an acknowledgement. Returns true exactly once, on the
    /// acknowledgement that reaches `min_success`.
    pub fn record_success(&self) -> bool {
        self.succeeded.fetch_add(1, Ordering::AcqRel) + 1 == self.min_success
    }

    /// Record a failure. Returns true once failures exceed `max_failures`.
    pub fn record_failure(&self) -> bool {
        self.failed.fetch_add(1, Ordering::AcqRel) + 1 > self.max_failures
    }

    /// Acknowledgements so far.
    pub fn succeeded(&self) -> usize {
        self.succeeded.load(Ordering::Acquire)
    }

    /// Failures so far.
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Acquire)
    }
}

/// Countdown of pending streams for one push.
#[derive(Debug)]
pub struct PushTracker {
    pending: AtomicI64,
    failed: AtomicBool,
    outcome: mpsc::Sender<Result<()>>,
}

/// Receiving side of a [`PushTracker`].
#[derive(Debug)]
pub struct PushCompletion {
    outcome: mpsc::Receiver<Result<()>>,
}

impl PushTracker {
    /// Tracker expecting `pending` stream completions. It must be created
    /// before any write starts.
    pub fn new(pending: usize) -> (Arc<Self>, PushCompletion) {
        let (tx, rx) = mpsc::channel(1);
        let tracker = Arc::new(Self {
            pending: AtomicI64::new(pending as i64),
            failed: AtomicBool::new(false),
            outcome: tx,
        });
        if pending == 0 {
            let _ = tracker.outcome.try_send(Ok(()));
        }
        (tracker, PushCompletion { outcome: rx })
    }

    /// Report a stream as done (`Ok`) or failed (`Err`).
    ///
    /// Success fires when the pending count reaches zero. The first error
    /// fires immediately; later results are ignored.
    pub fn done_with_result(&self, result: Result<()>) {
        match result {
            Ok(()) => {
                if self.pending.fetch_sub(1, Ordering::AcqRel) == 1
                    && !self.failed.load(Ordering::Acquire)
                {
                    let _ = self.outcome.try_send(Ok(()));
                }
            }
            Err(err) => {
                if !self.failed.swap(true, Ordering::AcqRel) {
                    let _ = self.outcome.try_send(Err(err));
                }
            }
        }
    }

    /// Streams still pending.
    pub fn pending(&self) -> i64 {
        self.pending.load(Ordering::Acquire)
    }
}

impl PushCompletion {
    /// Wait for the push outcome. Returns [`DistributorError::Cancelled`] if
    /// `cancel` fires first, and [`DistributorError::Shutdown`] if every
    /// tracker handle was dropped without an outcome.
    pub async fn wait(mut self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            outcome = self.outcome.recv() => outcome.unwrap_or(Err(DistributorError::Shutdown)),
            _ = cancel.cancelled() => Err(DistributorError::Cancelled),
        }
    }
}
