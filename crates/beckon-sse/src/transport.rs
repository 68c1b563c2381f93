//! The SSE half-duplex pair as one logical connection.
//!
//! A connection is two HTTP exchanges sharing a connection id: a long-lived
//! GET whose response body is a `text/event-stream` feed, and short POSTs
//! carrying upstream frames. [`sse_connection`] bridges them:
//!
//! - upstream: POST bodies go through an in-process byte pipe that
//!   [`SseTransport::recv`] reads framed messages from;
//! - downstream: each outbound frame is rewritten into an SSE `data:` block
//!   and handed to the GET response task over a capacity-1 job channel,
//!   with the write acknowledged back over a capacity-1 result channel.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::body::Bytes;
use axum::http::StatusCode;
use beckon_session::{JsonFramed, MessageTransport, RecvError};
use beckon_wire::{self as wire, Message, RECORD_SEPARATOR};
use futures_util::Stream;
use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Configuration for an SSE connection.
#[derive(Debug, Clone)]
pub struct SseConfig {
    /// Pause after a successful POST, damping the client-side race where
    /// the next POST arrives before the pipe was observed to drain.
    pub post_settle_delay: Duration,
    /// Capacity of the upstream byte pipe.
    pub pipe_capacity: usize,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            post_settle_delay: Duration::from_millis(50),
            pipe_capacity: 4096,
        }
    }
}

/// Create the pieces of one SSE connection.
///
/// The [`SseTransport`] goes to the connection driver, the
/// [`SsePostHandler`] to the upstream POST route, and the
/// [`SseDownstream`] becomes the GET response body. All three share the
/// cancellation token; tripping it ends the downstream feed and fails
/// subsequent reads, writes and POSTs.
pub fn sse_connection(
    connection_id: impl Into<String>,
    token: CancellationToken,
    config: SseConfig,
) -> (SseTransport, SsePostHandler, SseDownstream) {
    let (pipe_read, pipe_write) = duplex(config.pipe_capacity);
    let (job_tx, job_rx) = mpsc::channel(1);
    let (job_result_tx, job_result_rx) = mpsc::channel(1);

    let transport = SseTransport {
        connection_id: connection_id.into(),
        token: token.clone(),
        upstream: JsonFramed::new(pipe_read),
        job_tx,
        job_result_rx,
    };
    let post = SsePostHandler {
        token: token.clone(),
        post_writing: AtomicBool::new(false),
        writer: tokio::sync::Mutex::new(pipe_write),
        settle_delay: config.post_settle_delay,
    };
    let downstream = SseDownstream {
        token,
        job_rx,
        job_result_tx,
    };
    (transport, post, downstream)
}

fn cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "sse connection cancelled")
}

/// Rewrite one frame into SSE wire form: every line prefixed with
/// `data: `, the block terminated by a blank line.
fn into_event_stream_block(frame: &[u8]) -> Vec<u8> {
    let trimmed = {
        let mut end = frame.len();
        while end > 0 && frame[end - 1] == b'\n' {
            end -= 1;
        }
        &frame[..end]
    };
    let mut block = Vec::with_capacity(trimmed.len() + 16);
    for line in trimmed.split(|b| *b == b'\n') {
        block.extend_from_slice(b"data: ");
        block.extend_from_slice(line);
        block.push(b'\n');
    }
    block.push(b'\n');
    block
}

/// The duplex message transport the connection driver runs against.
pub struct SseTransport {
    connection_id: String,
    token: CancellationToken,
    upstream: JsonFramed<DuplexStream>,
    job_tx: mpsc::Sender<Vec<u8>>,
    job_result_rx: mpsc::Receiver<io::Result<usize>>,
}

impl SseTransport {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Hand one SSE block to the downstream response task and await its
    /// write result.
    async fn send_block(&mut self, frame: Vec<u8>) -> io::Result<()> {
        if self.token.is_cancelled() {
            return Err(cancelled());
        }
        let block = into_event_stream_block(&frame);
        tokio::select! {
            _ = self.token.cancelled() => return Err(cancelled()),
            sent = self.job_tx.send(block) => {
                if sent.is_err() {
                    return Err(cancelled());
                }
            }
        }
        match self.job_result_rx.recv().await {
            Some(Ok(_)) => Ok(()),
            Some(Err(e)) => Err(e),
            None => Err(cancelled()),
        }
    }
}

impl MessageTransport for SseTransport {
    async fn send(&mut self, msg: &Message) -> io::Result<()> {
        let frame = wire::encode_frame(msg)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.send_block(frame).await
    }

    async fn send_text(&mut self, text: &str) -> io::Result<()> {
        let mut frame = text.as_bytes().to_vec();
        frame.push(RECORD_SEPARATOR);
        self.send_block(frame).await
    }

    async fn recv(&mut self) -> Result<Option<Message>, RecvError> {
        tokio::select! {
            _ = self.token.cancelled() => Err(RecvError::Io(cancelled())),
            result = self.upstream.recv() => result,
        }
    }

    async fn recv_text(&mut self) -> Result<Option<String>, RecvError> {
        tokio::select! {
            _ = self.token.cancelled() => Err(RecvError::Io(cancelled())),
            result = self.upstream.recv_text() => result,
        }
    }
}

/// Upstream half: feeds POST bodies into the connection's byte pipe.
///
/// At most one POST may be in flight per connection; the `post_writing`
/// flag turns a concurrent second POST into `409 Conflict`.
pub struct SsePostHandler {
    token: CancellationToken,
    post_writing: AtomicBool,
    writer: tokio::sync::Mutex<DuplexStream>,
    settle_delay: Duration,
}

impl SsePostHandler {
    /// Consume one upstream request body.
    ///
    /// - `410 Gone` when the connection is already cancelled.
    /// - `409 Conflict` when another POST is in flight.
    /// - `500 Internal Server Error` when the pipe write fails.
    /// - `200 OK` on success, after the settle delay.
    pub async fn consume_request(&self, body: &[u8]) -> StatusCode {
        if self.token.is_cancelled() {
            return StatusCode::GONE;
        }
        if self.post_writing.swap(true, Ordering::SeqCst) {
            return StatusCode::CONFLICT;
        }

        let result = {
            let mut writer = self.writer.lock().await;
            tokio::select! {
                _ = self.token.cancelled() => Err(cancelled()),
                written = writer.write_all(body) => written,
            }
        };
        self.post_writing.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                tokio::time::sleep(self.settle_delay).await;
                StatusCode::OK
            }
            Err(e) => {
                debug!(error = %e, "upstream pipe write failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Downstream half: the source of the GET response body.
pub struct SseDownstream {
    token: CancellationToken,
    job_rx: mpsc::Receiver<Vec<u8>>,
    job_result_tx: mpsc::Sender<io::Result<usize>>,
}

impl SseDownstream {
    /// Turn the job channel into the event-stream body. Each block is
    /// acknowledged to the writer as it is handed to the HTTP response;
    /// the stream ends when the token trips.
    pub fn into_body_stream(
        self,
    ) -> impl Stream<Item = Result<Bytes, std::convert::Infallible>> + Send {
        futures_util::stream::unfold(self, |mut downstream| async move {
            tokio::select! {
                _ = downstream.token.cancelled() => None,
                block = downstream.job_rx.recv() => match block {
                    Some(bytes) => {
                        let _ = downstream.job_result_tx.send(Ok(bytes.len())).await;
                        Some((Ok(Bytes::from(bytes)), downstream))
                    }
                    None => None,
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn test_config() -> SseConfig {
        SseConfig {
            post_settle_delay: Duration::from_millis(1),
            pipe_capacity: 4096,
        }
    }

    #[test]
    fn blocks_prefix_every_line_and_end_blank() {
        let block = into_event_stream_block(b"{\"type\":6}\x1e");
        assert_eq!(block, b"data: {\"type\":6}\x1e\n\n");

        let block = into_event_stream_block(b"a\nb\n");
        assert_eq!(block, b"data: a\ndata: b\n\n");
    }

    #[tokio::test]
    async fn post_bodies_come_out_as_frames() {
        let token = CancellationToken::new();
        let (mut transport, post, _downstream) = sse_connection("c1", token, test_config());

        let status = post.consume_request(b"{\"type\":6}\x1e").await;
        assert_eq!(status, StatusCode::OK);

        let msg = transport.recv().await.unwrap().unwrap();
        assert_eq!(msg, Message::Ping);
    }

    #[tokio::test]
    async fn send_hands_formatted_blocks_downstream() {
        let token = CancellationToken::new();
        let (mut transport, _post, downstream) = sse_connection("c1", token, test_config());

        let mut events = Box::pin(downstream.into_body_stream());
        let send = tokio::spawn(async move {
            transport.send(&Message::Ping).await.unwrap();
            transport
        });

        let block = events.next().await.unwrap().unwrap();
        assert_eq!(&block[..], b"data: {\"type\":6}\x1e\n\n");
        send.await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_posts_conflict() {
        let token = CancellationToken::new();
        let config = SseConfig {
            post_settle_delay: Duration::from_millis(1),
            pipe_capacity: 8,
        };
        let (mut transport, post, _downstream) = sse_connection("c1", token, config);
        let post = std::sync::Arc::new(post);

        // The body exceeds the pipe capacity and nobody reads yet, so the
        // first POST parks inside the pipe write.
        let big_body = vec![b'x'; 64];
        let first = {
            let post = post.clone();
            tokio::spawn(async move { post.consume_request(&big_body).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(post.consume_request(b"y").await, StatusCode::CONFLICT);

        // Draining the pipe lets the first POST finish.
        let drain = tokio::spawn(async move {
            // 64 x's and one y never form a frame; pull raw text until the
            // writer side finishes.
            let _ = transport.recv_text().await;
        });
        assert_eq!(first.await.unwrap(), StatusCode::OK);
        drain.abort();
    }

    #[tokio::test]
    async fn posts_after_cancellation_are_gone() {
        let token = CancellationToken::new();
        let (_transport, post, _downstream) = sse_connection("c1", token.clone(), test_config());

        token.cancel();
        assert_eq!(post.consume_request(b"data").await, StatusCode::GONE);
    }

    #[tokio::test]
    async fn cancellation_ends_the_downstream_feed_and_fails_sends() {
        let token = CancellationToken::new();
        let (mut transport, _post, downstream) = sse_connection("c1", token.clone(), test_config());

        let mut events = Box::pin(downstream.into_body_stream());
        token.cancel();

        assert!(events.next().await.is_none());
        assert!(transport.send(&Message::Ping).await.is_err());
        assert!(transport.recv().await.is_err());
    }
}
