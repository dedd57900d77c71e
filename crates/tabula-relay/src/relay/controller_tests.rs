//! Tests for the relay controller.

use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio_stream::wrappers::ReceiverStream;

use super::*;

type Chunk = Result<Bytes, UpstreamError>;

/// Upstream body that records when it is dropped.
struct TrackedBody {
    inner: ReceiverStream<Chunk>,
    dropped: Arc<AtomicBool>,
}

impl Stream for TrackedBody {
    type Item = Chunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Chunk>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for TrackedBody {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
enum Behaviour {
    #[default]
    Stream,
    Fail(UpstreamError),
    Hang,
}

/// Scripted upstream: the test feeds body chunks through a channel.
#[derive(Default)]
struct FakeUpstream {
    behaviour: Behaviour,
    body: Mutex<Option<mpsc::Receiver<Chunk>>>,
    aborted: Arc<AtomicBool>,
    prompts: Mutex<Vec<String>>,
}

impl FakeUpstream {
    fn was_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Upstream for FakeUpstream {
    async fn open(&self, prompt: String) -> Result<ByteStream, UpstreamError> {
        self.prompts.lock().unwrap().push(prompt);
        match &self.behaviour {
            Behaviour::Fail(e) => return Err(e.clone()),
            Behaviour::Hang => std::future::pending::<()>().await,
            Behaviour::Stream => {}
        }
        let rx = self.body.lock().unwrap().take().expect("body opened once");
        Ok(Box::pin(TrackedBody {
            inner: ReceiverStream::new(rx),
            dropped: Arc::clone(&self.aborted),
        }))
    }

    async fn health(&self) -> Result<(), UpstreamError> {
        Ok(())
    }
}

struct Harness {
    ctx: RelayContext,
    upstream: Arc<FakeUpstream>,
    chunks: mpsc::Sender<Chunk>,
}

impl Harness {
    fn new(behaviour: Behaviour) -> Self {
        Self::with_config(behaviour, test_config())
    }

    fn with_config(behaviour: Behaviour, config: RelayConfig) -> Self {
        let (chunks, body) = mpsc::channel(16);
        let upstream = Arc::new(FakeUpstream {
            behaviour,
            body: Mutex::new(Some(body)),
            ..FakeUpstream::default()
        });
        let ctx = RelayContext::new(
            SessionStore::new(Duration::from_secs(600)),
            Arc::clone(&upstream) as Arc<dyn Upstream>,
            config,
            Duration::from_secs(45),
        );
        Self {
            ctx,
            upstream,
            chunks,
        }
    }

    async fn session(&self) -> String {
        self.ctx
            .sessions()
            .create(SessionPayload {
                tabular_data: "a,b\n1,2".into(),
                question: "sum".into(),
            })
            .await
            .unwrap()
    }

    async fn send(&self, chunk: &str) {
        self.chunks
            .send(Ok(Bytes::copy_from_slice(chunk.as_bytes())))
            .await
            .unwrap();
    }
}

fn test_config() -> RelayConfig {
    RelayConfig {
        watchdog_secs: 45,
        max_buffer_bytes: 1024 * 1024,
        flush_grace_ms: 1000,
        transport_capacity: 4,
    }
}

async fn open(h: &Harness, id: &str) -> RelayStream {
    match h.ctx.open_stream(id).await {
        Ok(stream) => stream,
        Err(e) => panic!("stream rejected: {e}"),
    }
}

async fn collect(mut frames: mpsc::Receiver<Frame>) -> Vec<Frame> {
    let mut out = Vec::new();
    while let Some(frame) = frames.recv().await {
        out.push(frame);
    }
    out
}

// --- Happy path ---

#[tokio::test]
async fn relays_tokens_then_done_and_releases_session() {
    let h = Harness::new(Behaviour::Stream);
    let id = h.session().await;
    let stream = open(&h, &id).await;

    h.send("{\"response\":\"| sum\",\"done\":false}\n").await;
    h.send("{\"response\":\" |\",\"do").await;
    h.send("ne\":false}\n{\"done\":true}\n").await;

    let frames = collect(stream.frames).await;
    assert_eq!(
        frames,
        vec![Frame::token("| sum"), Frame::token(" |"), Frame::Done]
    );

    let outcome = stream.task.await.unwrap();
    assert_eq!(outcome.reason, TerminationReason::Completed);
    assert_eq!(outcome.tokens, 2);
    assert_eq!(outcome.frames_sent, 3);
    assert!(h.ctx.sessions().get(&id).await.is_none());
    assert!(h.upstream.was_aborted());

    let prompts = h.upstream.prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("Question: sum"));
}

#[tokio::test]
async fn upstream_end_without_done_still_closes_with_done() {
    let h = Harness::new(Behaviour::Stream);
    let id = h.session().await;
    let stream = open(&h, &id).await;

    h.send("{\"response\":\"x\"}\n{\"respo").await;
    drop(h.chunks);

    // The trailing partial record is discarded.
    let frames = collect(stream.frames).await;
    assert_eq!(frames, vec![Frame::token("x"), Frame::Done]);
    let outcome = stream.task.await.unwrap();
    assert_eq!(outcome.reason, TerminationReason::UpstreamEnded);
    assert!(h.ctx.sessions().get(&id).await.is_none());
}

#[tokio::test]
async fn malformed_line_is_skipped() {
    let h = Harness::new(Behaviour::Stream);
    let id = h.session().await;
    let stream = open(&h, &id).await;

    h.send("{\"response\":\"a\"}\nnot json\n{\"response\":\"b\"}\n{\"done\":true}\n")
        .await;

    let frames = collect(stream.frames).await;
    assert_eq!(
        frames,
        vec![Frame::token("a"), Frame::token("b"), Frame::Done]
    );
    let outcome = stream.task.await.unwrap();
    assert_eq!(outcome.malformed, 1);
    assert_eq!(outcome.reason, TerminationReason::Completed);
}

#[tokio::test]
async fn oversized_partial_record_is_dropped_and_stream_continues() {
    let config = RelayConfig {
        max_buffer_bytes: 64,
        ..test_config()
    };
    let h = Harness::with_config(Behaviour::Stream, config);
    let id = h.session().await;
    let stream = open(&h, &id).await;

    h.send(&format!("{{\"response\":\"{}", "x".repeat(100))).await;
    h.send("tail\"}\n{\"response\":\"ok\"}\n{\"done\":true}\n").await;

    let frames = collect(stream.frames).await;
    assert_eq!(frames, vec![Frame::token("ok"), Frame::Done]);
    let outcome = stream.task.await.unwrap();
    assert_eq!(outcome.overflows, 1);
    assert_eq!(outcome.malformed, 1);
}

#[tokio::test(start_paused = true)]
async fn slow_client_still_receives_every_frame() {
    let config = RelayConfig {
        transport_capacity: 1,
        ..test_config()
    };
    let h = Harness::with_config(Behaviour::Stream, config);
    let id = h.session().await;
    let stream = open(&h, &id).await;

    h.send("{\"response\":\"a\"}\n{\"response\":\"b\"}\n{\"response\":\"c\"}\n{\"done\":true}\n")
        .await;

    // Well past the flush grace before the client reads anything.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let frames = collect(stream.frames).await;
    assert_eq!(
        frames,
        vec![
            Frame::token("a"),
            Frame::token("b"),
            Frame::token("c"),
            Frame::Done
        ]
    );
    let outcome = stream.task.await.unwrap();
    assert_eq!(outcome.reason, TerminationReason::Completed);
    assert_eq!(outcome.frames_sent, 4);
    assert!(h.ctx.sessions().get(&id).await.is_none());
}

// --- Failure paths ---

#[tokio::test(start_paused = true)]
async fn silent_upstream_times_out_once() {
    let h = Harness::new(Behaviour::Stream);
    let id = h.session().await;
    let stream = open(&h, &id).await;

    let frames = collect(stream.frames).await;
    assert_eq!(frames.len(), 1);
    assert!(matches!(&frames[0], Frame::Timeout(msg) if msg.contains("45s")));
    assert!(!frames.contains(&Frame::Done));

    let outcome = stream.task.await.unwrap();
    assert_eq!(outcome.reason, TerminationReason::Timeout);
    assert!(h.upstream.was_aborted());
    assert!(h.ctx.sessions().get(&id).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn steady_chunks_keep_the_watchdog_quiet() {
    let h = Harness::new(Behaviour::Stream);
    let id = h.session().await;
    let mut stream = open(&h, &id).await;

    for i in 0..4 {
        tokio::time::sleep(Duration::from_secs(30)).await;
        h.send(&format!("{{\"response\":\"{i}\"}}\n")).await;
        assert_eq!(stream.frames.recv().await, Some(Frame::token(&i.to_string())));
    }
    h.send("{\"done\":true}\n").await;

    assert_eq!(collect(stream.frames).await, vec![Frame::Done]);
    assert_eq!(
        stream.task.await.unwrap().reason,
        TerminationReason::Completed
    );
}

fn alive_tasks() -> usize {
    tokio::runtime::Handle::current().metrics().num_alive_tasks()
}

#[tokio::test]
async fn unknown_session_is_rejected_without_a_relay() {
    let h = Harness::new(Behaviour::Stream);
    let tasks_before = alive_tasks();

    let err = h.ctx.open_stream("missing").await.err().unwrap();
    assert_eq!(alive_tasks(), tasks_before);
    assert_eq!(err, SessionError::NotFound("missing".into()));
    assert_eq!(rejection_frame(&err), Frame::error("Session not found"));
    assert_eq!(h.ctx.active_relays(), 0);
    assert!(h.upstream.prompts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn second_attach_is_rejected() {
    let h = Harness::new(Behaviour::Stream);
    let id = h.session().await;
    let _first = open(&h, &id).await;
    let tasks_before = alive_tasks();

    let err = h.ctx.open_stream(&id).await.err().unwrap();
    assert_eq!(alive_tasks(), tasks_before);
    assert_eq!(err, SessionError::AlreadyAttached(id.clone()));
    assert_eq!(
        rejection_frame(&err),
        Frame::error("Session already streaming")
    );
}

#[tokio::test]
async fn connect_failure_becomes_error_frame() {
    let h = Harness::new(Behaviour::Fail(UpstreamError::Connect(
        "connection refused".into(),
    )));
    let id = h.session().await;
    let stream = open(&h, &id).await;

    let frames = collect(stream.frames).await;
    assert_eq!(
        frames,
        vec![Frame::error("Upstream unreachable: connection refused")]
    );
    let outcome = stream.task.await.unwrap();
    assert!(matches!(outcome.reason, TerminationReason::ConnectFailed(_)));
    assert!(h.ctx.sessions().get(&id).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn slow_connect_times_out() {
    let h = Harness::new(Behaviour::Hang);
    let id = h.session().await;
    let stream = open(&h, &id).await;

    let frames = collect(stream.frames).await;
    assert_eq!(frames.len(), 1);
    assert!(matches!(&frames[0], Frame::Error(msg) if msg.contains("did not respond")));
}

#[tokio::test]
async fn mid_stream_transport_error_is_reported() {
    let h = Harness::new(Behaviour::Stream);
    let id = h.session().await;
    let stream = open(&h, &id).await;

    h.send("{\"response\":\"a\"}\n").await;
    h.chunks
        .send(Err(UpstreamError::Transport("connection reset".into())))
        .await
        .unwrap();

    let frames = collect(stream.frames).await;
    assert_eq!(
        frames,
        vec![
            Frame::token("a"),
            Frame::error("Upstream transport error: connection reset")
        ]
    );
    assert!(h.upstream.was_aborted());
}

#[tokio::test]
async fn client_disconnect_aborts_upstream() {
    let h = Harness::new(Behaviour::Stream);
    let id = h.session().await;
    let mut stream = open(&h, &id).await;

    h.send("{\"response\":\"a\"}\n").await;
    assert_eq!(stream.frames.recv().await, Some(Frame::token("a")));
    assert_eq!(h.ctx.active_relays(), 1);
    drop(stream.frames);

    let outcome = stream.task.await.unwrap();
    assert_eq!(outcome.reason, TerminationReason::ClientGone);
    assert!(h.upstream.was_aborted());
    assert!(h.ctx.sessions().get(&id).await.is_none());
    assert_eq!(h.ctx.active_relays(), 0);
}

// --- Teardown ---

#[tokio::test]
async fn terminate_runs_once() {
    let h = Harness::new(Behaviour::Stream);
    let id = h.session().await;
    let (transport, frames) = mpsc::channel(4);
    let mut relay = Relay::new(h.ctx.clone(), id.clone());
    relay.attach(FrameWriter::spawn(transport));
    relay.watchdog.arm();

    assert!(relay.terminate(TerminationReason::Timeout).await);
    assert!(!relay.terminate(TerminationReason::Completed).await);
    assert!(!relay.terminate(TerminationReason::UpstreamError("late".into())).await);

    assert_eq!(relay.state, RelayState::Closed);
    assert!(!relay.watchdog.is_armed());
    let frames = collect(frames).await;
    assert_eq!(frames.len(), 1);
    assert!(matches!(frames[0], Frame::Timeout(_)));
    assert!(h.ctx.sessions().get(&id).await.is_none());
}

#[test]
fn client_gone_has_no_closing_frame() {
    let window = Duration::from_secs(45);
    assert_eq!(closing_frame(&TerminationReason::ClientGone, window), None);
    assert_eq!(
        closing_frame(&TerminationReason::Completed, window),
        Some(Frame::Done)
    );
}
