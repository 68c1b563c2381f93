use std::io;
use std::time::Duration;

/// Error receiving from a transport.
///
/// Decode errors keep their structure so the driver can tell recoverable
/// per-message failures apart from framing corruption.
#[derive(Debug)]
pub enum RecvError {
    Io(io::Error),
    Decode(beckon_wire::DecodeError),
}

impl std::fmt::Display for RecvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecvError::Io(e) => write!(f, "transport read failed: {e}"),
            RecvError::Decode(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RecvError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecvError::Io(e) => Some(e),
            RecvError::Decode(e) => Some(e),
        }
    }
}

impl From<io::Error> for RecvError {
    fn from(e: io::Error) -> Self {
        RecvError::Io(e)
    }
}

/// Error terminating a connection.
#[derive(Debug)]
pub enum ConnectionError {
    /// IO error on the transport.
    Io(io::Error),
    /// The inbound byte stream could not be decoded any further.
    Malformed(String),
    /// Handshake failed or timed out.
    Handshake(String),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {e}"),
            ConnectionError::Malformed(detail) => write!(f, "malformed inbound frame: {detail}"),
            ConnectionError::Handshake(detail) => write!(f, "handshake failed: {detail}"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

/// Error delivering a completion to a pending invocation.
#[derive(Debug)]
pub enum RegistryError {
    /// The completion's invocation id is not tracked by the registry.
    UnknownInvocationId(String),
    /// The waiter did not take delivery within the receive timeout.
    ReceiveTimeout(Duration),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::UnknownInvocationId(id) => {
                write!(f, "unknown completion id {id:?}")
            }
            RegistryError::ReceiveTimeout(timeout) => {
                write!(
                    f,
                    "timeout ({timeout:?}) waiting for hub to receive client sent value"
                )
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Error from a server→client invocation made through a [`ClientProxy`].
///
/// [`ClientProxy`]: crate::ClientProxy
#[derive(Debug)]
pub enum ClientInvokeError {
    /// The client reported an error completion.
    Completion(String),
    /// The connection closed before the completion arrived.
    ConnectionClosed,
}

impl std::fmt::Display for ClientInvokeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientInvokeError::Completion(e) => write!(f, "client returned error: {e}"),
            ClientInvokeError::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ClientInvokeError {}

/// A non-fatal inbound error the driver recovered from.
///
/// Handed to the receive-error handler when one is installed, otherwise
/// logged.
#[derive(Debug)]
pub enum ReceiveError {
    Decode(beckon_wire::DecodeError),
    Registry(RegistryError),
}

impl std::fmt::Display for ReceiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReceiveError::Decode(e) => write!(f, "{e}"),
            ReceiveError::Registry(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ReceiveError {}
