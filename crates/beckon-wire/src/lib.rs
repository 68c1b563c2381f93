#![deny(unsafe_code)]

//! Wire-level message types for the JSON hub protocol.
//!
//! Frames are JSON objects terminated by a record-separator byte (0x1E).
//! Every object carries a numeric `type` field that selects the message
//! kind; the remaining fields are kind-specific. Buffered framing over
//! byte streams lives in `beckon-session`; this crate only knows how to
//! turn one frame's text into a [`Message`] and back.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame terminator for the JSON hub protocol.
pub const RECORD_SEPARATOR: u8 = 0x1E;

/// Numeric `type` discriminants.
///
/// Variant numbering is wire-significant and fixed by the protocol.
pub mod kind {
    pub const INVOCATION: u8 = 1;
    pub const STREAM_ITEM: u8 = 2;
    pub const COMPLETION: u8 = 3;
    pub const STREAM_INVOCATION: u8 = 4;
    pub const CANCEL_INVOCATION: u8 = 5;
    pub const PING: u8 = 6;
    pub const CLOSE: u8 = 7;
}

/// A client→server or server→client method invocation.
///
/// An absent `invocation_id` marks the call as fire-and-forget: the
/// receiver must not emit a completion for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    pub target: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stream_ids: Vec<String>,
}

/// One element of a streaming result, preceding the terminal completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamItemMessage {
    pub invocation_id: String,
    pub item: Value,
}

/// The single terminal frame for an invocation.
///
/// At most one of `result` / `error` is present. Both absent is a valid
/// completion (void methods, clean stream end).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionMessage {
    pub invocation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CompletionMessage {
    /// Completion carrying a result value.
    pub fn result(invocation_id: impl Into<String>, result: Value) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// Completion carrying an error.
    pub fn error(invocation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    /// Completion with neither result nor error.
    pub fn empty(invocation_id: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            result: None,
            error: None,
        }
    }
}

/// Cancels an in-flight streaming invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelInvocationMessage {
    pub invocation_id: String,
}

/// Terminates the connection, optionally carrying the terminal error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Handshake request sent by the client before the message loop starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: u32,
}

/// Handshake response. An empty object signals success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Invocation(InvocationMessage),
    StreamInvocation(InvocationMessage),
    StreamItem(StreamItemMessage),
    Completion(CompletionMessage),
    CancelInvocation(CancelInvocationMessage),
    Ping,
    Close(CloseMessage),
}

/// Error decoding a frame.
#[derive(Debug)]
pub enum DecodeError {
    /// The frame is not a JSON object with a numeric `type` field.
    /// Unrecoverable: the byte stream can no longer be trusted.
    Malformed(String),
    /// The frame parsed as JSON but a kind-specific field was missing or
    /// had the wrong type. Recoverable at the connection level.
    Field {
        kind: u8,
        /// Best-effort invocation id recovered from the raw object, empty
        /// when it was absent or not a string.
        invocation_id: String,
        detail: String,
    },
    /// The numeric `type` is not a known message kind.
    UnknownKind(u8),
}

impl DecodeError {
    /// Whether the connection must be torn down after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DecodeError::Malformed(_))
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Malformed(detail) => write!(f, "malformed frame: {detail}"),
            DecodeError::Field { kind, detail, .. } => {
                write!(f, "invalid message of type {kind}: {detail}")
            }
            DecodeError::UnknownKind(kind) => write!(f, "unknown message type {kind}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Serialization wrapper that injects the numeric `type` discriminant.
#[derive(Serialize)]
struct Tagged<'a, T> {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(flatten)]
    msg: &'a T,
}

/// Encode a message as one frame's JSON text (no terminator).
pub fn encode(msg: &Message) -> Result<String, serde_json::Error> {
    match msg {
        Message::Invocation(m) => serde_json::to_string(&Tagged {
            kind: kind::INVOCATION,
            msg: m,
        }),
        Message::StreamInvocation(m) => serde_json::to_string(&Tagged {
            kind: kind::STREAM_INVOCATION,
            msg: m,
        }),
        Message::StreamItem(m) => serde_json::to_string(&Tagged {
            kind: kind::STREAM_ITEM,
            msg: m,
        }),
        Message::Completion(m) => serde_json::to_string(&Tagged {
            kind: kind::COMPLETION,
            msg: m,
        }),
        Message::CancelInvocation(m) => serde_json::to_string(&Tagged {
            kind: kind::CANCEL_INVOCATION,
            msg: m,
        }),
        Message::Ping => Ok(format!("{{\"type\":{}}}", kind::PING)),
        Message::Close(m) => serde_json::to_string(&Tagged {
            kind: kind::CLOSE,
            msg: m,
        }),
    }
}

/// Encode a message as a complete frame, terminator included.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = encode(msg)?.into_bytes();
    bytes.push(RECORD_SEPARATOR);
    Ok(bytes)
}

/// Decode one frame's JSON text into a message.
///
/// Numeric argument literals stay as arbitrary JSON numbers here; integer
/// coercion happens at argument binding time, not in the codec.
pub fn decode(text: &str) -> Result<Message, DecodeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_u64)
        .ok_or_else(|| DecodeError::Malformed("missing or non-numeric \"type\" field".into()))?
        as u8;
    // Recovered before the typed decode so field errors can still be
    // reported against the offending invocation.
    let invocation_id = value
        .get("invocationId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let field_err = |e: serde_json::Error| DecodeError::Field {
        kind,
        invocation_id: invocation_id.clone(),
        detail: e.to_string(),
    };
    match kind {
        kind::INVOCATION => serde_json::from_value(value)
            .map(Message::Invocation)
            .map_err(field_err),
        kind::STREAM_INVOCATION => serde_json::from_value(value)
            .map(Message::StreamInvocation)
            .map_err(field_err),
        kind::STREAM_ITEM => serde_json::from_value(value)
            .map(Message::StreamItem)
            .map_err(field_err),
        kind::COMPLETION => serde_json::from_value(value)
            .map(Message::Completion)
            .map_err(field_err),
        kind::CANCEL_INVOCATION => serde_json::from_value(value)
            .map(Message::CancelInvocation)
            .map_err(field_err),
        kind::PING => Ok(Message::Ping),
        kind::CLOSE => serde_json::from_value(value)
            .map(Message::Close)
            .map_err(field_err),
        other => Err(DecodeError::UnknownKind(other)),
    }
}
