//! Message transport abstraction.
//!
//! The driver loop is written against [`MessageTransport`] so the framing
//! mechanism stays out of it:
//! - [`JsonFramed`](crate::framing::JsonFramed) implements it for any async
//!   byte stream (TCP, Unix sockets, in-memory pipes).
//! - The SSE transport implements it directly, bridging the long-poll POST
//!   upstream and the event-stream downstream.

use std::io;

use beckon_wire::Message;

use crate::errors::RecvError;

/// Trait for transports that can send and receive hub protocol messages.
pub trait MessageTransport: Send {
    /// Send a message over the transport.
    fn send(&mut self, msg: &Message) -> impl std::future::Future<Output = io::Result<()>> + Send;

    /// Receive the next message.
    ///
    /// Returns `Ok(None)` when the peer closed the connection cleanly.
    /// Decode failures are surfaced as [`RecvError::Decode`] so the caller
    /// can distinguish recoverable message errors from framing corruption;
    /// either way the transport has already advanced past the bad frame.
    fn recv(
        &mut self,
    ) -> impl std::future::Future<Output = Result<Option<Message>, RecvError>> + Send;

    /// Receive the next frame as raw text, without protocol decoding.
    ///
    /// Used for the handshake exchange, which precedes the message loop.
    fn recv_text(
        &mut self,
    ) -> impl std::future::Future<Output = Result<Option<String>, RecvError>> + Send;

    /// Send raw text as one frame. Used for the handshake response.
    fn send_text(
        &mut self,
        text: &str,
    ) -> impl std::future::Future<Output = io::Result<()>> + Send;
}
