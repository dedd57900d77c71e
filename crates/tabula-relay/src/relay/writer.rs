//! Ordered, non-blocking frame delivery to the client transport.
//!
//! Frames go into an unbounded queue that a single drain task forwards to the
//! bounded transport channel. A full transport channel is the saturation
//! signal: the drain task waits for capacity while callers keep enqueueing,
//! so delivery order always matches enqueue order. The transport is released
//! once the writer is closed or dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::frame::Frame;

/// Result of closing a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Frames accepted by the transport.
    pub sent: usize,
    /// `false` when frames were still queued when the writer gave up.
    pub flushed: bool,
}

/// Handle to a running drain task.
pub struct FrameWriter {
    queue: Option<mpsc::UnboundedSender<Frame>>,
    sealed: bool,
    lost: CancellationToken,
    sent: Arc<AtomicUsize>,
    drain: JoinHandle<()>,
}

impl FrameWriter {
    /// Start draining into `transport`.
    pub fn spawn(transport: mpsc::Sender<Frame>) -> Self {
        let (queue, pending) = mpsc::unbounded_channel();
        let lost = CancellationToken::new();
        let sent = Arc::new(AtomicUsize::new(0));
        let drain = tokio::spawn(drain(pending, transport, lost.clone(), Arc::clone(&sent)));
        Self {
            queue: Some(queue),
            sealed: false,
            lost,
            sent,
            drain,
        }
    }

    /// Queue a frame without waiting.
    ///
    /// Returns `false` when the frame was discarded because a terminal frame
    /// was already queued or the transport is gone.
    pub fn enqueue(&mut self, frame: Frame) -> bool {
        if self.sealed {
            debug!(kind = frame.kind(), "Discarding frame after terminal");
            return false;
        }
        let Some(queue) = &self.queue else {
            return false;
        };
        if frame.is_terminal() {
            self.sealed = true;
        }
        queue.send(frame).is_ok()
    }

    /// Token cancelled once the client transport is closed or a write fails.
    pub fn lost_token(&self) -> CancellationToken {
        self.lost.clone()
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Whether a terminal frame has been queued.
    pub const fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Stop accepting frames and wait until every queued frame has reached
    /// the transport, however slowly the client reads. Gives up only if the
    /// client goes away first.
    pub async fn finish(mut self) -> FlushOutcome {
        self.seal();

        let joined = tokio::select! {
            biased;
            res = &mut self.drain => res,
            () = self.lost.cancelled() => {
                self.drain.abort();
                debug!("Client lost while flushing, discarding queued frames");
                return self.outcome(false);
            }
        };
        self.joined(joined)
    }

    /// Stop accepting frames and give queued ones `grace` to reach the
    /// transport. Anything still pending after that is dropped.
    pub async fn close(mut self, grace: Duration) -> FlushOutcome {
        self.seal();

        match tokio::time::timeout(grace, &mut self.drain).await {
            Ok(joined) => self.joined(joined),
            Err(_) => {
                self.drain.abort();
                debug!(grace_ms = grace.as_millis(), "Flush grace elapsed, discarding queued frames");
                self.outcome(false)
            }
        }
    }

    fn seal(&mut self) {
        self.sealed = true;
        self.queue = None;
    }

    fn joined(&self, joined: Result<(), tokio::task::JoinError>) -> FlushOutcome {
        match joined {
            Ok(()) => self.outcome(!self.is_lost()),
            Err(e) => {
                warn!(error = %e, "Frame drain task failed");
                self.outcome(false)
            }
        }
    }

    fn outcome(&self, flushed: bool) -> FlushOutcome {
        FlushOutcome {
            sent: self.sent.load(Ordering::Acquire),
            flushed,
        }
    }
}

impl Drop for FrameWriter {
    fn drop(&mut self) {
        self.drain.abort();
    }
}

async fn drain(
    mut pending: mpsc::UnboundedReceiver<Frame>,
    transport: mpsc::Sender<Frame>,
    lost: CancellationToken,
    sent: Arc<AtomicUsize>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            () = transport.closed() => {
                debug!(sent = sent.load(Ordering::Relaxed), "Client transport closed");
                lost.cancel();
                break;
            }
            frame = pending.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        // Waits while the transport is saturated.
        if transport.send(frame).await.is_err() {
            debug!(sent = sent.load(Ordering::Relaxed), "Client transport write failed");
            lost.cancel();
            break;
        }
        sent.fetch_add(1, Ordering::Release);
    }
}
