//! Record-separator framing for async byte streams.
//!
//! Frames are UTF-8 JSON texts terminated by 0x1E. This module is generic
//! over the transport type - it works with any type that implements
//! `AsyncRead + AsyncWrite + Unpin`, including:
//! - `TcpStream` (TCP sockets)
//! - `UnixStream` (Unix domain sockets)
//! - In-memory duplex pipes (tests, the SSE upstream pipe)

use std::io;

use beckon_wire::{self as wire, Message, RECORD_SEPARATOR};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::RecvError;
use crate::transport::MessageTransport;

const RECV_BUF_COMPACT_THRESHOLD: usize = 64 * 1024;

fn compact_recv_buffer(buf: &mut Vec<u8>, unread_start: &mut usize) {
    if *unread_start == buf.len() {
        buf.clear();
        *unread_start = 0;
        return;
    }

    if *unread_start >= RECV_BUF_COMPACT_THRESHOLD && *unread_start >= buf.len() / 2 {
        buf.drain(..*unread_start);
        *unread_start = 0;
    }
}

/// Extract the next complete frame's text from the buffer, if any.
fn take_frame_text(buf: &mut Vec<u8>, unread_start: &mut usize) -> Result<Option<String>, RecvError> {
    let Some(rel_idx) = buf[*unread_start..].iter().position(|b| *b == RECORD_SEPARATOR) else {
        return Ok(None);
    };

    let frame_end = *unread_start + rel_idx;
    let frame = buf[*unread_start..frame_end].to_vec();
    *unread_start = frame_end + 1;
    compact_recv_buffer(buf, unread_start);

    let text = String::from_utf8(frame).map_err(|e| {
        RecvError::Decode(wire::DecodeError::Malformed(format!("invalid utf-8: {e}")))
    })?;
    Ok(Some(text))
}

/// A record-separator framed connection over an async byte stream.
///
/// Generic over the transport type `S` so the same framing logic works
/// with sockets, in-memory pipes, or any other async byte stream.
pub struct JsonFramed<S> {
    stream: S,
    buf: Vec<u8>,
    unread_start: usize,
}

impl<S> JsonFramed<S> {
    /// Create a new framed connection from an async stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            unread_start: 0,
        }
    }

    /// Consume the framed wrapper and return the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S> JsonFramed<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Send a message as one frame.
    pub async fn send(&mut self, msg: &Message) -> io::Result<()> {
        let frame = wire::encode_frame(msg)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Send raw text as one frame, terminator appended.
    pub async fn send_text(&mut self, text: &str) -> io::Result<()> {
        self.stream.write_all(text.as_bytes()).await?;
        self.stream.write_all(&[RECORD_SEPARATOR]).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive the next frame's text.
    ///
    /// Returns `Ok(None)` on clean EOF. EOF with buffered bytes and no
    /// terminator is an error: the peer went away mid-frame.
    pub async fn recv_text(&mut self) -> Result<Option<String>, RecvError> {
        loop {
            if let Some(text) = take_frame_text(&mut self.buf, &mut self.unread_start)? {
                return Ok(Some(text));
            }

            let mut tmp = [0u8; 4096];
            let n = self.stream.read(&mut tmp).await.map_err(RecvError::Io)?;
            if n == 0 {
                let trailing = self.buf.len().saturating_sub(self.unread_start);
                if trailing != 0 {
                    return Err(RecvError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("eof with {trailing} trailing bytes and no frame terminator"),
                    )));
                }
                return Ok(None);
            }
            compact_recv_buffer(&mut self.buf, &mut self.unread_start);
            self.buf.extend_from_slice(&tmp[..n]);
        }
    }

    /// Receive and decode the next message.
    pub async fn recv(&mut self) -> Result<Option<Message>, RecvError> {
        match self.recv_text().await? {
            Some(text) => wire::decode(&text).map(Some).map_err(RecvError::Decode),
            None => Ok(None),
        }
    }
}

impl<S> MessageTransport for JsonFramed<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, msg: &Message) -> io::Result<()> {
        JsonFramed::send(self, msg).await
    }

    async fn recv(&mut self) -> Result<Option<Message>, RecvError> {
        JsonFramed::recv(self).await
    }

    async fn recv_text(&mut self) -> Result<Option<String>, RecvError> {
        JsonFramed::recv_text(self).await
    }

    async fn send_text(&mut self, text: &str) -> io::Result<()> {
        JsonFramed::send_text(self, text).await
    }
}
