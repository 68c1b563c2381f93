//! Turns inbound invocations into hub method calls and outbound
//! completion/stream-item sequences.
//!
//! Each invocation runs on its own worker task; outbound frames funnel
//! through the connection's single writer, so frames from one worker stay
//! in program order while distinct workers may interleave at frame
//! granularity.

use std::any::Any;
use std::sync::Arc;

use beckon_wire::{CompletionMessage, InvocationMessage, Message, StreamItemMessage};
use futures_util::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::caller::{with_context, ConnectionContext};
use crate::hub::{Hub, MethodReply, ValueStream};

const CLOSED_AT_START: &str = "hub method returned a stream that was already closed";

/// Dispatch one invocation to completion.
///
/// `streaming_requested` is true for stream-invocation frames: each yielded
/// value goes out as a stream item and the terminal completion is empty.
/// A plain invocation of a streaming method instead resolves with the first
/// yielded value. Either way, a sequence that ends before yielding anything
/// is reported as an error: a pre-closed source is a programming error in
/// the hub method, not a successful empty result.
pub(crate) async fn dispatch_invocation(
    hub: Arc<Hub>,
    invocation: InvocationMessage,
    streaming_requested: bool,
    out_tx: mpsc::Sender<Message>,
    ctx: ConnectionContext,
) {
    let InvocationMessage {
        invocation_id,
        target,
        arguments,
        stream_ids: _,
    } = invocation;

    let Some(entry) = hub.method(&target) else {
        debug!(target = %target, "invocation of unknown method");
        if let Some(id) = invocation_id {
            send_completion(&out_tx, CompletionMessage::error(id, format!("unknown method {target:?}"))).await;
        }
        return;
    };

    if streaming_requested && !entry.is_streaming() {
        if let Some(id) = invocation_id {
            let error = format!("method {:?} does not return a stream", entry.name());
            send_completion(&out_tx, CompletionMessage::error(id, error)).await;
        }
        return;
    }

    // The panic guard covers binding, the user future, and result
    // serialization; a panicking method must never take the connection
    // down with it.
    let call = with_context(ctx, async move { entry.invoke(arguments).await });
    let outcome = std::panic::AssertUnwindSafe(call).catch_unwind().await;

    let reply = match outcome {
        Ok(Ok(reply)) => reply,
        Ok(Err(fault)) => {
            if let Some(id) = invocation_id {
                send_completion(&out_tx, CompletionMessage::error(id, fault.to_string())).await;
            }
            return;
        }
        Err(panic) => {
            debug!(target = %target, "hub method panicked");
            if let Some(id) = invocation_id {
                send_completion(&out_tx, CompletionMessage::error(id, panic_message(panic))).await;
            }
            return;
        }
    };

    match reply {
        MethodReply::Value(value) => {
            // Fire-and-forget invocations emit nothing on success.
            if let Some(id) = invocation_id {
                send_completion(&out_tx, completion_for_value(id, value)).await;
            }
        }
        MethodReply::Stream(stream) => {
            let Some(id) = invocation_id else {
                // No id means nothing observable can be emitted; drop the
                // sequence without running it.
                return;
            };
            if streaming_requested {
                run_stream(id, stream, &out_tx).await;
            } else {
                resolve_first_value(id, stream, &out_tx).await;
            }
        }
    }
}

/// Emit every yielded value as a stream item, then the terminal completion.
async fn run_stream(id: String, mut stream: ValueStream, out_tx: &mpsc::Sender<Message>) {
    let mut yielded = false;
    while let Some(item) = stream.next().await {
        match item {
            Ok(value) => {
                yielded = true;
                let msg = Message::StreamItem(StreamItemMessage {
                    invocation_id: id.clone(),
                    item: value,
                });
                if out_tx.send(msg).await.is_err() {
                    return;
                }
            }
            Err(detail) => {
                send_completion(out_tx, CompletionMessage::error(id, detail)).await;
                return;
            }
        }
    }
    let completion = if yielded {
        CompletionMessage::empty(id)
    } else {
        CompletionMessage::error(id, CLOSED_AT_START)
    };
    send_completion(out_tx, completion).await;
}

/// Resolve a plain invocation of a streaming method with its first value.
async fn resolve_first_value(id: String, mut stream: ValueStream, out_tx: &mpsc::Sender<Message>) {
    let completion = match stream.next().await {
        Some(Ok(value)) => completion_for_value(id, value),
        Some(Err(detail)) => CompletionMessage::error(id, detail),
        None => CompletionMessage::error(id, CLOSED_AT_START),
    };
    send_completion(out_tx, completion).await;
}

/// Null results stand for "no result": void methods complete without a
/// result field.
fn completion_for_value(id: String, value: Value) -> CompletionMessage {
    if value.is_null() {
        CompletionMessage::empty(id)
    } else {
        CompletionMessage::result(id, value)
    }
}

async fn send_completion(out_tx: &mpsc::Sender<Message>, completion: CompletionMessage) {
    if out_tx.send(Message::Completion(completion)).await.is_err() {
        debug!("connection writer gone, dropping completion");
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "hub method panicked".to_string()
    }
}
