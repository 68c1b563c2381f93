#![deny(unsafe_code)]

//! Session layer for the hub protocol: method table, argument binding,
//! invocation dispatch, the pending-invocation registry, and the
//! per-connection driver loop.
//!
//! A server embeds this crate by building a [`Hub`], wrapping a transport
//! in [`JsonFramed`] (or providing its own [`MessageTransport`]), and
//! spawning [`ServerConnection::run`] per accepted connection.

mod bind;
pub use bind::{BindError, HubArgument, Json, ParamKind};

mod caller;
pub use caller::{connection_context, ClientProxy, ConnectionContext};

mod connection;
pub use connection::{ServerConfig, ServerConnection};

mod dispatch;

mod errors;
pub use errors::{ClientInvokeError, ConnectionError, ReceiveError, RecvError, RegistryError};

mod framing;
pub use framing::JsonFramed;

mod hub;
pub use hub::{
    stream, CallFault, Hub, HubBuilder, HubMethod, MethodFuture, MethodReply, StreamClosed,
    StreamSender, Streaming, StreamingHubMethod, ValueStream,
};

mod invoke;
pub use invoke::{InvocationRegistry, LOOP_ENDED};

mod transport;
pub use transport::MessageTransport;

pub(crate) const CHANNEL_SIZE: usize = 1024;
