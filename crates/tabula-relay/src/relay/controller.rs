//! Per-connection relay controller.
//!
//! A relay resolves a session, opens the upstream generation, and pumps
//! upstream bytes through line reassembly and translation into the frame
//! writer until one of the exit conditions fires. Every exit goes through
//! a single teardown that runs at most once.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tabula_core::config::RelayConfig;
use tabula_core::ndjson::LineReassembler;
use tabula_core::prompt::build_prompt;

use super::frame::Frame;
use super::translator::EventTranslator;
use super::types::{RelayOutcome, RelayState, TerminationReason};
use super::watchdog::Watchdog;
use super::writer::FrameWriter;
use crate::session::{SessionError, SessionPayload, SessionStore};
use crate::upstream::{ByteStream, Upstream, UpstreamError};

/// Shared dependencies for starting relays.
#[derive(Clone)]
pub struct RelayContext {
    sessions: SessionStore,
    upstream: Arc<dyn Upstream>,
    config: RelayConfig,
    connect_timeout: Duration,
    active: Arc<AtomicUsize>,
}

/// A started relay: the client end of its frame channel plus the task
/// driving it.
pub struct RelayStream {
    pub frames: mpsc::Receiver<Frame>,
    pub task: JoinHandle<RelayOutcome>,
}

impl RelayContext {
    pub fn new(
        sessions: SessionStore,
        upstream: Arc<dyn Upstream>,
        config: RelayConfig,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            sessions,
            upstream,
            config,
            connect_timeout,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub const fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn upstream(&self) -> &Arc<dyn Upstream> {
        &self.upstream
    }

    /// Relays currently running.
    pub fn active_relays(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Attach a stream to a session and start relaying.
    ///
    /// Fails without spawning anything when the session is unknown or
    /// already has a stream; see [`rejection_frame`] for what the client
    /// should receive in that case.
    pub async fn open_stream(&self, session_id: &str) -> Result<RelayStream, SessionError> {
        let mut relay = Relay::new(self.clone(), session_id.to_string());

        relay.transition(RelayState::SessionResolving);
        let payload = match self.sessions.claim(session_id).await {
            Ok(payload) => payload,
            Err(e) => {
                info!(session_id = %session_id, error = %e, "Stream rejected");
                return Err(e);
            }
        };

        let (transport, frames) = mpsc::channel(self.config.transport_capacity.max(1));
        relay.attach(FrameWriter::spawn(transport));

        let guard = ActiveGuard::enter(Arc::clone(&self.active));
        let task = tokio::spawn(async move {
            let _guard = guard;
            relay.run(payload).await
        });

        Ok(RelayStream { frames, task })
    }
}

/// The single frame sent to a client whose stream could not be attached.
pub fn rejection_frame(error: &SessionError) -> Frame {
    let reason = match error {
        SessionError::AlreadyAttached(_) => TerminationReason::SessionBusy,
        SessionError::NotFound(_) | SessionError::IdExhausted => TerminationReason::SessionNotFound,
    };
    closing_frame(&reason, Duration::ZERO).unwrap_or_else(|| Frame::error(error.to_string()))
}

struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

enum Step {
    Chunk(Option<Result<bytes::Bytes, UpstreamError>>),
    Silence,
    ClientGone,
}

/// One relay instance. Owns everything it touches except the session store.
struct Relay {
    ctx: RelayContext,
    session_id: String,
    state: RelayState,
    terminated: bool,
    writer: Option<FrameWriter>,
    lost: CancellationToken,
    upstream: Option<ByteStream>,
    watchdog: Watchdog,
    reader: LineReassembler,
    translator: EventTranslator,
    overflows: u64,
    frames_sent: usize,
    started: Instant,
}

impl Relay {
    fn new(ctx: RelayContext, session_id: String) -> Self {
        let watchdog = Watchdog::new(ctx.config.watchdog_window());
        let reader = LineReassembler::new(ctx.config.max_buffer_bytes);
        Self {
            ctx,
            session_id,
            state: RelayState::Idle,
            terminated: false,
            writer: None,
            lost: CancellationToken::new(),
            upstream: None,
            watchdog,
            reader,
            translator: EventTranslator::new(),
            overflows: 0,
            frames_sent: 0,
            started: Instant::now(),
        }
    }

    /// Bind the client transport once the session has been claimed.
    fn attach(&mut self, writer: FrameWriter) {
        self.lost = writer.lost_token();
        self.writer = Some(writer);
    }

    fn transition(&mut self, next: RelayState) {
        trace!(session_id = %self.session_id, from = ?self.state, to = ?next, "Relay state");
        self.state = next;
    }

    async fn run(mut self, payload: SessionPayload) -> RelayOutcome {
        let reason = self.connect_and_stream(payload).await;
        self.terminate(reason.clone()).await;
        self.outcome(reason)
    }

    async fn connect_and_stream(&mut self, payload: SessionPayload) -> TerminationReason {
        self.transition(RelayState::UpstreamConnecting);
        let prompt = build_prompt(&payload.tabular_data, &payload.question);
        let connect_timeout = self.ctx.connect_timeout;
        let upstream = Arc::clone(&self.ctx.upstream);

        let opened = tokio::select! {
            biased;
            () = self.lost.cancelled() => return TerminationReason::ClientGone,
            res = tokio::time::timeout(connect_timeout, upstream.open(prompt)) => res,
        };

        match opened {
            Ok(Ok(body)) => {
                debug!(session_id = %self.session_id, "Upstream stream opened");
                self.upstream = Some(body);
            }
            Ok(Err(e)) => return TerminationReason::ConnectFailed(e.to_string()),
            Err(_) => {
                return TerminationReason::ConnectFailed(
                    UpstreamError::Timeout(connect_timeout).to_string(),
                );
            }
        }

        self.transition(RelayState::Streaming);
        self.watchdog.arm();
        self.pump().await
    }

    async fn pump(&mut self) -> TerminationReason {
        loop {
            let Some(body) = self.upstream.as_mut() else {
                return TerminationReason::UpstreamEnded;
            };

            let step = tokio::select! {
                biased;
                () = self.lost.cancelled() => Step::ClientGone,
                () = self.watchdog.expired() => Step::Silence,
                chunk = body.next() => Step::Chunk(chunk),
            };

            let bytes = match step {
                Step::ClientGone => return TerminationReason::ClientGone,
                Step::Silence => return TerminationReason::Timeout,
                Step::Chunk(None) => return TerminationReason::UpstreamEnded,
                Step::Chunk(Some(Err(e))) => return TerminationReason::UpstreamError(e.to_string()),
                Step::Chunk(Some(Ok(bytes))) => bytes,
            };

            self.watchdog.rearm();
            let lines = self.reader.push(&bytes);
            trace!(
                session_id = %self.session_id,
                len = bytes.len(),
                lines = lines.len(),
                buffered = self.reader.pending_len(),
                "Upstream chunk"
            );

            for line in lines {
                let Some(frame) = self.translator.translate_line(&line) else {
                    continue;
                };
                let reason = match &frame {
                    Frame::Done => Some(TerminationReason::Completed),
                    Frame::Error(message) => Some(TerminationReason::UpstreamError(message.clone())),
                    _ => None,
                };
                if let Some(writer) = self.writer.as_mut()
                    && !writer.enqueue(frame)
                    && writer.is_lost()
                {
                    return TerminationReason::ClientGone;
                }
                if let Some(reason) = reason {
                    return reason;
                }
            }
        }
    }

    /// Tear the relay down. Only the first call has any effect; returns
    /// whether this call performed the teardown.
    async fn terminate(&mut self, reason: TerminationReason) -> bool {
        if self.terminated {
            debug!(session_id = %self.session_id, reason = %reason, "Relay already terminated");
            return false;
        }
        self.terminated = true;
        self.transition(RelayState::Terminating);

        self.watchdog.disarm();

        if self.upstream.take().is_some() {
            debug!(session_id = %self.session_id, "Upstream request aborted");
        }

        let reader = std::mem::replace(&mut self.reader, LineReassembler::new(0));
        self.overflows = reader.overflow_count();
        if let Some(partial) = reader.finish() {
            debug!(
                session_id = %self.session_id,
                pending = partial.len(),
                "Discarding incomplete trailing record"
            );
        }

        // Released before the writer closes, so the client stream only ends
        // once the session is gone.
        self.ctx.sessions.delete(&self.session_id).await;

        if let Some(mut writer) = self.writer.take() {
            if !writer.is_sealed()
                && !writer.is_lost()
                && let Some(frame) = closing_frame(&reason, self.watchdog.window())
            {
                writer.enqueue(frame);
            }
            // Only a departed client forfeits queued frames; every other exit
            // waits until the client has been handed all of them.
            let flush = if reason == TerminationReason::ClientGone || writer.is_lost() {
                writer.close(self.ctx.config.flush_grace()).await
            } else {
                writer.finish().await
            };
            if !flush.flushed {
                debug!(session_id = %self.session_id, sent = flush.sent, "Queued frames were not delivered");
            }
            self.frames_sent = flush.sent;
        }

        self.transition(RelayState::Closed);
        true
    }

    fn outcome(&self, reason: TerminationReason) -> RelayOutcome {
        let outcome = RelayOutcome {
            session_id: self.session_id.clone(),
            reason,
            tokens: self.translator.tokens(),
            malformed: self.translator.malformed(),
            overflows: self.overflows,
            frames_sent: self.frames_sent,
            duration: self.started.elapsed(),
        };

        let duration_ms = u64::try_from(outcome.duration.as_millis()).unwrap_or(u64::MAX);
        match &outcome.reason {
            reason if reason.is_success() || *reason == TerminationReason::ClientGone => info!(
                session_id = %outcome.session_id,
                reason = %outcome.reason,
                tokens = outcome.tokens,
                malformed = outcome.malformed,
                overflows = outcome.overflows,
                frames_sent = outcome.frames_sent,
                duration_ms,
                "Relay finished"
            ),
            _ => warn!(
                session_id = %outcome.session_id,
                reason = %outcome.reason,
                tokens = outcome.tokens,
                malformed = outcome.malformed,
                overflows = outcome.overflows,
                frames_sent = outcome.frames_sent,
                duration_ms,
                "Relay failed"
            ),
        }
        outcome
    }
}

/// Frame that closes the client stream for a given exit, if the client can
/// still be reached.
fn closing_frame(reason: &TerminationReason, window: Duration) -> Option<Frame> {
    match reason {
        TerminationReason::Completed | TerminationReason::UpstreamEnded => Some(Frame::Done),
        TerminationReason::SessionNotFound => Some(Frame::error("Session not found")),
        TerminationReason::SessionBusy => Some(Frame::error("Session already streaming")),
        TerminationReason::ConnectFailed(e) | TerminationReason::UpstreamError(e) => {
            Some(Frame::error(e.clone()))
        }
        TerminationReason::Timeout => Some(Frame::timeout(format!(
            "No data from upstream for {}s",
            window.as_secs()
        ))),
        TerminationReason::ClientGone => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[path = "controller_tests.rs"]
mod tests;
