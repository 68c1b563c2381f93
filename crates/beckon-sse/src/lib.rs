#![deny(unsafe_code)]

//! Server-Sent-Events transport for the hub protocol.
//!
//! Multiplexes a half-duplex HTTP POST upstream with an SSE downstream
//! into one logical connection, and provides the axum routes that mount a
//! hub at a base path.

mod router;
pub use router::map_hub;

mod transport;
pub use transport::{sse_connection, SseConfig, SseDownstream, SsePostHandler, SseTransport};
