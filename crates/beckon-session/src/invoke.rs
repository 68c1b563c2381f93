//! Registry of server→client invocations awaiting their completions.
//!
//! When hub code invokes a method on the connected client, the call's id is
//! registered here; the driver loop feeds inbound completions back through
//! [`InvocationRegistry::receive_completion`]. Delivery to the waiter runs
//! on a detached task raced against a bounded timeout, so a slow or dead
//! waiter can never stall the driver.
//!
//! The map mutex is held only across map reads and writes, never across a
//! channel send.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use beckon_wire::CompletionMessage;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::errors::RegistryError;

/// Sentinel error pushed to every waiter when the message loop ends.
pub const LOOP_ENDED: &str = "message loop ended";

struct InvocationSlots {
    result_tx: mpsc::Sender<Value>,
    error_tx: mpsc::Sender<String>,
}

/// Tracks in-flight server-issued invocations by id.
pub struct InvocationRegistry {
    slots: Mutex<HashMap<String, InvocationSlots>>,
    chan_receive_timeout: Duration,
}

impl InvocationRegistry {
    pub fn new(chan_receive_timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            chan_receive_timeout,
        }
    }

    /// Allocate the delivery slots for a new invocation.
    ///
    /// A colliding id silently replaces the previous slots; callers are
    /// expected to pick unique ids.
    pub fn new_invocation(
        &self,
        id: impl Into<String>,
    ) -> (mpsc::Receiver<Value>, mpsc::Receiver<String>) {
        let (result_tx, result_rx) = mpsc::channel(1);
        let (error_tx, error_rx) = mpsc::channel(1);
        self.lock().insert(
            id.into(),
            InvocationSlots {
                result_tx,
                error_tx,
            },
        );
        (result_rx, error_rx)
    }

    /// Remove an invocation and close both slots. Idempotent.
    pub fn delete_invocation(&self, id: &str) {
        self.lock().remove(id);
    }

    /// Close every result slot and asynchronously push the sentinel error
    /// into every error slot, then start over with an empty map.
    ///
    /// Non-blocking for the caller; the sentinel pushes run detached so a
    /// waiter that is not at its receive point yet still observes them.
    pub fn cancel_all(&self) {
        let drained: Vec<InvocationSlots> = {
            let mut slots = self.lock();
            slots.drain().map(|(_, v)| v).collect()
        };
        for slot in drained {
            drop(slot.result_tx);
            tokio::spawn(async move {
                let _ = slot.error_tx.send(LOOP_ENDED.to_string()).await;
            });
        }
    }

    /// Whether this id has a waiter.
    pub fn handles(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Deliver a completion to its waiter.
    ///
    /// An error completion feeds only the error slot; otherwise the result
    /// slot is fed, with null standing in for an absent result. Delivery is
    /// bounded by the configured receive timeout.
    pub async fn receive_completion(
        &self,
        completion: &CompletionMessage,
    ) -> Result<(), RegistryError> {
        let senders = {
            let slots = self.lock();
            slots
                .get(&completion.invocation_id)
                .map(|s| (s.result_tx.clone(), s.error_tx.clone()))
        };
        let Some((result_tx, error_tx)) = senders else {
            return Err(RegistryError::UnknownInvocationId(
                completion.invocation_id.clone(),
            ));
        };

        match completion.error.as_deref().filter(|e| !e.is_empty()) {
            Some(error) => self.deliver(error_tx, error.to_string()).await,
            None => {
                let result = completion.result.clone().unwrap_or(Value::Null);
                self.deliver(result_tx, result).await
            }
        }
    }

    /// Deliver an inbound stream item to its waiter's result slot.
    ///
    /// The invocation stays registered; the terminal completion removes it.
    pub async fn receive_stream_item(
        &self,
        id: &str,
        item: Value,
    ) -> Result<(), RegistryError> {
        let result_tx = {
            let slots = self.lock();
            slots.get(id).map(|s| s.result_tx.clone())
        };
        let Some(result_tx) = result_tx else {
            return Err(RegistryError::UnknownInvocationId(id.to_string()));
        };
        self.deliver(result_tx, item).await
    }

    /// Race a detached send against the receive timeout. The send task
    /// keeps going after a timeout; dropping the slots releases it.
    async fn deliver<T: Send + 'static>(
        &self,
        tx: mpsc::Sender<T>,
        value: T,
    ) -> Result<(), RegistryError> {
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(value).await;
            let _ = done_tx.send(());
        });
        match tokio::time::timeout(self.chan_receive_timeout, done_rx).await {
            Ok(_) => Ok(()),
            Err(_) => Err(RegistryError::ReceiveTimeout(self.chan_receive_timeout)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, InvocationSlots>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
