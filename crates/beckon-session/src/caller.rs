//! Server→client calls and the per-connection context.
//!
//! Hub methods reach their caller through a task-local context scoped
//! around each dispatch. The context carries a [`ClientProxy`] bound to the
//! connection's outbound queue and invocation registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use beckon_wire::{InvocationMessage, Message};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::errors::ClientInvokeError;
use crate::invoke::InvocationRegistry;

/// Generates unique invocation ids for server-issued calls on one
/// connection. Monotonically increasing counter starting at 1.
pub(crate) struct InvocationIdSource {
    next: AtomicU64,
}

impl InvocationIdSource {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    fn next(&self) -> String {
        self.next.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

/// Handle for invoking methods on the connected client.
#[derive(Clone)]
pub struct ClientProxy {
    connection_id: String,
    out_tx: mpsc::Sender<Message>,
    registry: Arc<InvocationRegistry>,
    ids: Arc<InvocationIdSource>,
}

impl ClientProxy {
    pub(crate) fn new(
        connection_id: String,
        out_tx: mpsc::Sender<Message>,
        registry: Arc<InvocationRegistry>,
        ids: Arc<InvocationIdSource>,
    ) -> Self {
        Self {
            connection_id,
            out_tx,
            registry,
            ids,
        }
    }

    /// The connection this proxy belongs to.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Fire-and-forget invocation: no id is allocated and no completion is
    /// awaited.
    pub async fn send(
        &self,
        target: impl Into<String>,
        arguments: Vec<Value>,
    ) -> Result<(), ClientInvokeError> {
        let msg = Message::Invocation(InvocationMessage {
            invocation_id: None,
            target: target.into(),
            arguments,
            stream_ids: Vec::new(),
        });
        self.out_tx
            .send(msg)
            .await
            .map_err(|_| ClientInvokeError::ConnectionClosed)
    }

    /// Invoke a client method and await its completion.
    ///
    /// The invocation is registered before the frame goes out, so the
    /// completion cannot race past the waiter. If the message loop ends
    /// first, the registry's sentinel error resolves the wait.
    pub async fn invoke(
        &self,
        target: impl Into<String>,
        arguments: Vec<Value>,
    ) -> Result<Value, ClientInvokeError> {
        let id = self.ids.next();
        let (mut result_rx, mut error_rx) = self.registry.new_invocation(&id);

        let msg = Message::Invocation(InvocationMessage {
            invocation_id: Some(id.clone()),
            target: target.into(),
            arguments,
            stream_ids: Vec::new(),
        });
        if self.out_tx.send(msg).await.is_err() {
            self.registry.delete_invocation(&id);
            return Err(ClientInvokeError::ConnectionClosed);
        }

        let outcome = tokio::select! {
            result = result_rx.recv() => match result {
                Some(value) => Ok(value),
                None => Err(ClientInvokeError::ConnectionClosed),
            },
            error = error_rx.recv() => match error {
                Some(detail) => Err(ClientInvokeError::Completion(detail)),
                None => Err(ClientInvokeError::ConnectionClosed),
            },
        };
        self.registry.delete_invocation(&id);
        outcome
    }
}

/// Per-connection context available to hub methods during dispatch.
#[derive(Clone)]
pub struct ConnectionContext {
    /// Proxy for calling back into the client that made the invocation.
    pub client: ClientProxy,
}

tokio::task_local! {
    /// Task-local dispatch context. Task-local rather than thread-local:
    /// worker tasks for different connections can share an executor thread
    /// and must not observe each other's context.
    static CONNECTION_CONTEXT: ConnectionContext;
}

/// The context of the invocation currently being dispatched, if the caller
/// runs inside one.
pub fn connection_context() -> Option<ConnectionContext> {
    CONNECTION_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// Run a future with the given connection context in scope.
pub(crate) async fn with_context<F>(ctx: ConnectionContext, fut: F) -> F::Output
where
    F: std::future::Future,
{
    CONNECTION_CONTEXT.scope(ctx, fut).await
}
