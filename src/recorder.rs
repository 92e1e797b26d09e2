//! Session recording.
//!
//! A [`Recorder`] taps the output and window-size streams of an exec and
//! feeds them, coalesced into frames, to the session's replay sink. Output
//! is never held back waiting for the sink: frames are queued to a pump
//! task that owns the sink.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::directory::{ReplayService, ReplaySink};
use crate::replay::{FrameKind, ReplayFrame};
use crate::request::WindowSize;
use crate::sandbox::{BoxedWriter, ExecAttachOptions};

/// Frames of the same kind closer than this (in ms) are merged.
pub const COALESCE_WINDOW_MS: i64 = 100;

/// Buffers at most one frame and merges bursts of small writes into it.
#[derive(Debug, Default)]
pub struct FrameCoalescer {
    pending: Option<ReplayFrame>,
}

impl FrameCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a frame. Returns the previously buffered frame when it is
    /// complete and must be written out.
    pub fn push(&mut self, frame: ReplayFrame) -> Option<ReplayFrame> {
        let Some(pending) = self.pending.as_mut() else {
            self.pending = Some(frame);
            return None;
        };

        let gap = (i64::from(frame.timestamp) - i64::from(pending.timestamp)).abs();
        if gap > COALESCE_WINDOW_MS
            || pending.kind != frame.kind
            || frame.kind == FrameKind::WindowSize
        {
            return self.pending.replace(frame);
        }

        pending.payload.extend_from_slice(&frame.payload);
        None
    }

    /// Take whatever is still buffered.
    pub fn finish(&mut self) -> Option<ReplayFrame> {
        self.pending.take()
    }
}

/// Shared session clock, milliseconds since recording started.
#[derive(Debug, Clone, Copy)]
struct Clock(Instant);

impl Clock {
    fn elapsed_ms(&self) -> u32 {
        u32::try_from(self.0.elapsed().as_millis()).unwrap_or(u32::MAX)
    }
}

enum Record {
    Frame(ReplayFrame),
    Close,
}

#[derive(Clone)]
struct FrameTap {
    session_id: i64,
    clock: Clock,
    tx: mpsc::UnboundedSender<Record>,
}

impl FrameTap {
    fn emit(&self, kind: FrameKind, payload: Vec<u8>) {
        let frame = ReplayFrame::new(self.session_id, self.clock.elapsed_ms(), kind, payload);
        // pump gone means the recorder was closed
        let _ = self.tx.send(Record::Frame(frame));
    }
}

/// Records every chunk successfully written through it.
pub struct RecordedWriter {
    inner: BoxedWriter,
    kind: FrameKind,
    tap: FrameTap,
}

impl AsyncWrite for RecordedWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            if *n > 0 {
                this.tap.emit(this.kind, buf[..*n].to_vec());
            }
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Recording attached to one exec.
pub struct Recorder {
    tx: Option<mpsc::UnboundedSender<Record>>,
    pump: Option<JoinHandle<()>>,
    window: Option<JoinHandle<()>>,
}

impl Recorder {
    /// Open the replay stream for `session_id` and wire the recorder into
    /// `opts`. If the stream cannot be opened the session proceeds
    /// unrecorded.
    pub async fn start(
        opts: &mut ExecAttachOptions,
        session_id: i64,
        replays: &dyn ReplayService,
    ) -> Self {
        let sink = match replays.open(session_id).await {
            Ok(sink) => sink,
            Err(e) => {
                warn!(session_id, "Failed to open replay stream, not recording: {:#}", e);
                return Self::disabled();
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump(session_id, sink, rx));
        let tap = FrameTap {
            session_id,
            clock: Clock(Instant::now()),
            tx: tx.clone(),
        };

        let stdout = std::mem::replace(&mut opts.stdout, Box::new(tokio::io::sink()));
        opts.stdout = Box::new(RecordedWriter {
            inner: stdout,
            kind: FrameKind::Stdout,
            tap: tap.clone(),
        });
        if let Some(stderr) = opts.stderr.take() {
            opts.stderr = Some(Box::new(RecordedWriter {
                inner: stderr,
                kind: FrameKind::Stderr,
                tap: tap.clone(),
            }));
        }

        let window = opts.window.take().map(|mut upstream| {
            let (proxy_tx, proxy_rx) = mpsc::channel::<WindowSize>(4);
            opts.window = Some(proxy_rx);
            tokio::spawn(async move {
                while let Some(size) = upstream.recv().await {
                    tap.emit(
                        FrameKind::WindowSize,
                        crate::replay::encode_window_size(size.cols, size.rows).to_vec(),
                    );
                    if proxy_tx.send(size).await.is_err() {
                        break;
                    }
                }
            })
        });

        Self {
            tx: Some(tx),
            pump: Some(pump),
            window,
        }
    }

    /// A recorder that records nothing.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            pump: None,
            window: None,
        }
    }

    #[cfg(test)]
    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Flush the buffered frame and close the replay stream.
    pub async fn close(mut self) {
        if let Some(window) = self.window.take() {
            window.abort();
        }
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Record::Close);
        }
        if let Some(pump) = self.pump.take() {
            if let Err(e) = pump.await {
                warn!("Replay pump task failed: {}", e);
            }
        }
    }
}

async fn pump(
    session_id: i64,
    mut sink: Box<dyn ReplaySink>,
    mut rx: mpsc::UnboundedReceiver<Record>,
) {
    let mut coalescer = FrameCoalescer::new();
    let mut failed = false;

    while let Some(record) = rx.recv().await {
        match record {
            Record::Frame(frame) => {
                if let Some(ready) = coalescer.push(frame) {
                    send(&mut sink, &ready, &mut failed).await;
                }
            }
            Record::Close => break,
        }
    }

    if let Some(last) = coalescer.finish() {
        send(&mut sink, &last, &mut failed).await;
    }
    if let Err(e) = sink.close().await {
        warn!(session_id, "Failed to close replay stream: {:#}", e);
    }
    debug!(session_id, "Replay stream closed");
}

async fn send(sink: &mut Box<dyn ReplaySink>, frame: &ReplayFrame, failed: &mut bool) {
    if let Err(e) = sink.send(frame).await {
        // one warning per session is enough
        if !*failed {
            warn!(session_id = frame.session_id, "Failed to write replay frame: {:#}", e);
            *failed = true;
        }
    }
}
