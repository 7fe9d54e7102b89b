//! Background review writer.
//!
//! Abstained cases are handed to a bounded channel with `try_send`; a
//! dedicated thread drains it into the `ReviewSink`. The decision path never
//! waits on the sink: a full or closed channel drops the case and counts it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::domain::ReviewCase;
use crate::ports::ReviewSink;

/// Pending cases held before new ones are dropped.
pub const DEFAULT_REVIEW_CAPACITY: usize = 1024;

enum ReviewMessage {
    Case(Box<ReviewCase>),
    Flush(mpsc::Sender<()>),
}

/// Handle to the writer thread. Dropping it drains the channel and joins.
pub(crate) struct ReviewWriter {
    tx: Option<SyncSender<ReviewMessage>>,
    handle: Option<JoinHandle<()>>,
    failures: Arc<AtomicU64>,
}

impl ReviewWriter {
    pub(crate) fn spawn<R>(sink: Arc<R>, capacity: usize, failures: Arc<AtomicU64>) -> Self
    where
        R: ReviewSink + 'static,
    {
        let (tx, rx) = mpsc::sync_channel::<ReviewMessage>(capacity.max(1));
        let thread_failures = Arc::clone(&failures);

        let spawned = thread::Builder::new()
            .name("kairos-review-writer".into())
            .spawn(move || {
                for message in rx {
                    match message {
                        ReviewMessage::Case(case) => {
                            if let Err(e) = sink.submit(&case) {
                                thread_failures.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!("Failed to queue review case {}: {}", case.id, e);
                            }
                        }
                        ReviewMessage::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            });

        match spawned {
            Ok(handle) => Self {
                tx: Some(tx),
                handle: Some(handle),
                failures,
            },
            Err(e) => {
                tracing::error!("Failed to start review writer, reviews will be dropped: {e}");
                Self {
                    tx: None,
                    handle: None,
                    failures,
                }
            }
        }
    }

    /// Enqueue without blocking.
    pub(crate) fn submit(&self, case: ReviewCase) {
        let Some(tx) = &self.tx else {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match tx.try_send(ReviewMessage::Case(Box::new(case))) {
            Ok(()) => {}
            Err(TrySendError::Full(ReviewMessage::Case(case))) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Review queue full, dropping case {}", case.id);
            }
            Err(TrySendError::Full(_)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Review writer stopped, dropping abstained case");
            }
        }
    }

    /// Block until every case enqueued before this call reached the sink.
    ///
    /// Returns `false` if the writer is not running.
    pub(crate) fn flush(&self) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        let (ack_tx, ack_rx) = mpsc::channel();
        if tx.send(ReviewMessage::Flush(ack_tx)).is_err() {
            return false;
        }
        ack_rx.recv().is_ok()
    }
}

impl Drop for ReviewWriter {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Review writer thread panicked");
            }
        }
    }
}
