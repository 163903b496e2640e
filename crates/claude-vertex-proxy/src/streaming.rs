//! Streaming relay (SSE).
//!
//! Vertex AI's `:streamRawPredict` answers with Anthropic-style SSE events
//! (`message_start`, `content_block_delta`, ..., `message_stop`). A spawned
//! producer task reads the upstream body, cuts it into frames, runs each one
//! through the [`StreamTranslator`] and pushes it into a bounded channel; the
//! HTTP response drains the other end as a [`RelayStream`].
//!
//! - Frames are forwarded as soon as they are complete, in upstream order.
//! - If the client goes away the receiver is dropped, the producer notices
//!   and drops the upstream body, which cancels the Vertex AI call.
//! - A failure, the request deadline, or an upstream body that ends without
//!   `message_stop` all end the stream with an `event: error` frame.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, Instrument};

use crate::error::ProxyError;
use crate::lifecycle::Lifecycle;
use crate::proxy::millis;
use crate::translation::{StreamEnd, StreamTranslator};
use crate::upstream::ByteStream;

/// Client side of the relay.
pub struct RelayStream {
    rx: mpsc::Receiver<Bytes>,
}

impl Stream for RelayStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|frame| frame.map(Ok))
    }
}

/// Relay settings for one streaming request.
#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    pub capacity: usize,
    pub deadline: Instant,
    /// Reported in the timeout error.
    pub timeout: Duration,
}

/// Start relaying `upstream` to a new [`RelayStream`].
pub fn spawn_relay(
    upstream: ByteStream,
    translator: StreamTranslator,
    lifecycle: Lifecycle,
    options: RelayOptions,
) -> RelayStream {
    let (tx, rx) = mpsc::channel(options.capacity.max(1));
    tokio::spawn(produce(upstream, translator, lifecycle, options, tx).in_current_span());
    RelayStream { rx }
}

enum PumpError {
    Upstream(ProxyError),
    ClientGone,
}

async fn produce(
    upstream: ByteStream,
    mut translator: StreamTranslator,
    mut lifecycle: Lifecycle,
    options: RelayOptions,
    tx: mpsc::Sender<Bytes>,
) {
    let result = tokio::select! {
        _ = tx.closed() => Err(PumpError::ClientGone),
        pumped = timeout_at(options.deadline, pump(upstream, &mut translator, &tx)) => match pumped {
            Ok(result) => result,
            Err(_) => Err(PumpError::Upstream(ProxyError::UpstreamTimeout {
                after_ms: millis(options.timeout),
            })),
        },
    };

    let error = match result {
        Ok(()) => match translator.end() {
            StreamEnd::Completed => {
                lifecycle.advance();
                debug!(frames = translator.frames(), "stream relayed");
                return;
            }
            StreamEnd::UpstreamError(message) => {
                lifecycle.fail(format!("upstream stream error: {message}"));
                return;
            }
            StreamEnd::Truncated => ProxyError::UpstreamTransport(
                "upstream stream ended before message_stop".to_string(),
            ),
        },
        Err(PumpError::ClientGone) => {
            lifecycle.fail("client disconnected");
            return;
        }
        Err(PumpError::Upstream(err)) => err,
    };

    let error = lifecycle.fail(error);
    let _ = tx.send(error.sse_frame()).await;
}

async fn pump(
    mut upstream: ByteStream,
    translator: &mut StreamTranslator,
    tx: &mpsc::Sender<Bytes>,
) -> Result<(), PumpError> {
    let mut framer = SseFramer::default();

    // Nothing after message_stop is relayed, errors included.
    while translator.end() != StreamEnd::Completed {
        let Some(chunk) = upstream.next().await else {
            break;
        };
        let chunk = chunk.map_err(PumpError::Upstream)?;
        framer.push(&chunk);
        while let Some(frame) = framer.next_frame() {
            forward(frame, translator, tx).await?;
        }
    }

    if let Some(frame) = framer.finish() {
        forward(frame, translator, tx).await?;
    }
    Ok(())
}

async fn forward(
    frame: Bytes,
    translator: &mut StreamTranslator,
    tx: &mpsc::Sender<Bytes>,
) -> Result<(), PumpError> {
    let frame = translator.translate(frame).map_err(PumpError::Upstream)?;
    tx.send(frame).await.map_err(|_| PumpError::ClientGone)
}

/// Cuts a byte stream into SSE frames.
///
/// Frames are separated by a blank line. Line endings are normalised to `\n`
/// so that every emitted frame ends in `\n\n`.
#[derive(Debug, Default)]
pub struct SseFramer {
    buffer: BytesMut,
}

impl SseFramer {
    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.contains(&b'\r') || self.buffer.last() == Some(&b'\r') {
            self.buffer.extend_from_slice(chunk);
            let normalised = normalise_newlines(&self.buffer);
            self.buffer = normalised;
        } else {
            self.buffer.extend_from_slice(chunk);
        }
    }

    pub fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            let end = self.buffer.windows(2).position(|w| w == b"\n\n")? + 2;
            let frame = self.buffer.split_to(end).freeze();
            if frame.iter().any(|b| *b != b'\n') {
                return Some(frame);
            }
        }
    }

    /// A trailing frame that was never terminated, if any.
    pub fn finish(&mut self) -> Option<Bytes> {
        let mut frame = self.buffer.split();
        if frame.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        while frame.last() == Some(&b'\n') {
            frame.truncate(frame.len() - 1);
        }
        frame.extend_from_slice(b"\n\n");
        Some(frame.freeze())
    }
}

/// `\r\n` and lone `\r` become `\n`; a `\r` at the very end is kept until the
/// next chunk shows whether a `\n` follows.
fn normalise_newlines(input: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'\r' if i + 1 == input.len() => out.extend_from_slice(b"\r"),
            b'\r' if input[i + 1] == b'\n' => {
                out.extend_from_slice(b"\n");
                i += 1;
            }
            b'\r' => out.extend_from_slice(b"\n"),
            byte => out.extend_from_slice(&[byte]),
        }
        i += 1;
    }
    out
}
