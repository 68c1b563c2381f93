//! Per-connection driver loop.
//!
//! One task owns the transport for both directions: inbound frames route
//! by kind (invocations to workers, completions to the registry), outbound
//! frames from concurrent workers funnel through a single queue. Per-
//! invocation errors never terminate the connection; framing and transport
//! errors do.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use beckon_wire::{self as wire, CloseMessage, CompletionMessage, InvocationMessage, Message};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::caller::{ClientProxy, ConnectionContext, InvocationIdSource};
use crate::dispatch::dispatch_invocation;
use crate::errors::{ConnectionError, ReceiveError, RecvError};
use crate::hub::Hub;
use crate::invoke::InvocationRegistry;
use crate::transport::MessageTransport;
use crate::CHANNEL_SIZE;

/// Configuration for a server connection.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bound on handing a completion to a waiting hub method.
    pub chan_receive_timeout: Duration,
    /// Bound on waiting for the client's handshake request.
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            chan_receive_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

enum LoopEvent {
    Outbound(Message),
    Inbound(Message),
    InboundError(RecvError),
    PeerClosed,
    Cancelled,
}

/// A live server-side connection, ready to run its message loop.
pub struct ServerConnection<T> {
    io: T,
    hub: Arc<Hub>,
    connection_id: String,
    token: CancellationToken,
    registry: Arc<InvocationRegistry>,
    out_tx: mpsc::Sender<Message>,
    out_rx: mpsc::Receiver<Message>,
    client: ClientProxy,
    /// Active streaming workers by invocation id, for cancellation.
    active_streams: HashMap<String, AbortHandle>,
    on_receive_error: Option<Box<dyn Fn(&ReceiveError) + Send>>,
    config: ServerConfig,
}

impl<T> ServerConnection<T>
where
    T: MessageTransport,
{
    pub fn new(hub: Arc<Hub>, io: T, config: ServerConfig) -> Self {
        let connection_id = ulid::Ulid::new().to_string();
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_SIZE);
        let registry = Arc::new(InvocationRegistry::new(config.chan_receive_timeout));
        let client = ClientProxy::new(
            connection_id.clone(),
            out_tx.clone(),
            registry.clone(),
            Arc::new(InvocationIdSource::new()),
        );
        Self {
            io,
            hub,
            connection_id,
            token: CancellationToken::new(),
            registry,
            out_tx,
            out_rx,
            client,
            active_streams: HashMap::new(),
            on_receive_error: None,
            config,
        }
    }

    /// Use an externally assigned connection id.
    pub fn with_connection_id(mut self, id: impl Into<String>) -> Self {
        self.connection_id = id.into();
        self
    }

    /// Share a cancellation token with the transport or an embedding server.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Subscribe to non-fatal inbound errors. Without a handler they are
    /// logged and the loop continues.
    pub fn on_receive_error(mut self, handler: impl Fn(&ReceiveError) + Send + 'static) -> Self {
        self.on_receive_error = Some(Box::new(handler));
        self
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Proxy for invoking methods on this connection's client.
    pub fn client(&self) -> ClientProxy {
        self.client.clone()
    }

    /// Run handshake and message loop until the connection ends.
    ///
    /// On return the token is cancelled and every waiter on a pending
    /// server-issued invocation has been released.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        debug!(connection_id = %self.connection_id, "connection started");
        let result = self.run_inner().await;

        self.token.cancel();
        for (_, handle) in self.active_streams.drain() {
            handle.abort();
        }
        self.registry.cancel_all();

        match &result {
            Ok(()) => debug!(connection_id = %self.connection_id, "connection ended"),
            Err(e) => debug!(connection_id = %self.connection_id, error = %e, "connection failed"),
        }
        result
    }

    async fn run_inner(&mut self) -> Result<(), ConnectionError> {
        self.process_handshake().await?;
        self.message_loop().await
    }

    async fn process_handshake(&mut self) -> Result<(), ConnectionError> {
        let request =
            tokio::time::timeout(self.config.handshake_timeout, self.io.recv_text()).await;
        let text = match request {
            Err(_) => {
                return Err(ConnectionError::Handshake(
                    "timed out waiting for handshake request".into(),
                ));
            }
            Ok(Err(RecvError::Io(e))) => return Err(ConnectionError::Io(e)),
            Ok(Err(RecvError::Decode(e))) => {
                return Err(ConnectionError::Handshake(e.to_string()));
            }
            Ok(Ok(None)) => {
                return Err(ConnectionError::Handshake(
                    "connection closed before handshake".into(),
                ));
            }
            Ok(Ok(Some(text))) => text,
        };

        let request: wire::HandshakeRequest = match serde_json::from_str(&text) {
            Ok(request) => request,
            Err(e) => {
                let detail = format!("invalid handshake request: {e}");
                self.send_handshake_error(&detail).await;
                return Err(ConnectionError::Handshake(detail));
            }
        };
        if request.protocol != "json" || request.version != 1 {
            let detail = format!(
                "protocol {:?} version {} is not supported",
                request.protocol, request.version
            );
            self.send_handshake_error(&detail).await;
            return Err(ConnectionError::Handshake(detail));
        }

        let response = serde_json::to_string(&wire::HandshakeResponse::default())
            .map_err(|e| ConnectionError::Handshake(e.to_string()))?;
        self.io.send_text(&response).await?;
        debug!(connection_id = %self.connection_id, "handshake complete");
        Ok(())
    }

    async fn send_handshake_error(&mut self, detail: &str) {
        let response = wire::HandshakeResponse {
            error: Some(detail.to_string()),
        };
        if let Ok(text) = serde_json::to_string(&response) {
            let _ = self.io.send_text(&text).await;
        }
    }

    async fn message_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            let event = tokio::select! {
                _ = self.token.cancelled() => LoopEvent::Cancelled,
                outbound = self.out_rx.recv() => match outbound {
                    Some(msg) => LoopEvent::Outbound(msg),
                    None => LoopEvent::Cancelled,
                },
                inbound = self.io.recv() => match inbound {
                    Ok(Some(msg)) => LoopEvent::Inbound(msg),
                    Ok(None) => LoopEvent::PeerClosed,
                    Err(e) => LoopEvent::InboundError(e),
                },
            };

            match event {
                LoopEvent::Cancelled => return Ok(()),
                LoopEvent::PeerClosed => return Ok(()),
                LoopEvent::Outbound(msg) => self.io.send(&msg).await?,
                LoopEvent::Inbound(msg) => {
                    if let Flow::Stop = self.handle_message(msg).await? {
                        return Ok(());
                    }
                }
                LoopEvent::InboundError(RecvError::Io(e)) => return Err(ConnectionError::Io(e)),
                LoopEvent::InboundError(RecvError::Decode(e)) => {
                    if e.is_fatal() {
                        let detail = e.to_string();
                        let close = Message::Close(CloseMessage {
                            error: Some(detail.clone()),
                        });
                        let _ = self.io.send(&close).await;
                        return Err(ConnectionError::Malformed(detail));
                    }
                    self.handle_recoverable(e).await?;
                }
            }
        }
    }

    async fn handle_message(&mut self, msg: Message) -> Result<Flow, ConnectionError> {
        match msg {
            Message::Invocation(invocation) => self.spawn_worker(invocation, false),
            Message::StreamInvocation(invocation) => self.spawn_worker(invocation, true),
            Message::Completion(completion) => {
                if let Err(e) = self.registry.receive_completion(&completion).await {
                    self.report_receive_error(ReceiveError::Registry(e));
                }
            }
            Message::StreamItem(item) => {
                if self.registry.handles(&item.invocation_id) {
                    if let Err(e) = self
                        .registry
                        .receive_stream_item(&item.invocation_id, item.item)
                        .await
                    {
                        self.report_receive_error(ReceiveError::Registry(e));
                    }
                } else {
                    debug!(
                        invocation_id = %item.invocation_id,
                        "dropping stream item for unknown invocation"
                    );
                }
            }
            Message::CancelInvocation(cancel) => {
                if let Some(handle) = self.active_streams.remove(&cancel.invocation_id) {
                    debug!(invocation_id = %cancel.invocation_id, "cancelling stream");
                    handle.abort();
                }
            }
            Message::Ping => {}
            Message::Close(close) => {
                debug!(connection_id = %self.connection_id, error = ?close.error, "client requested close");
                self.flush_outbound().await?;
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    /// A frame that parsed as JSON but failed its typed decode. Invocation
    /// kinds answer with an error completion; everything else is dropped.
    async fn handle_recoverable(&mut self, e: wire::DecodeError) -> Result<(), ConnectionError> {
        if let wire::DecodeError::Field {
            kind,
            invocation_id,
            ..
        } = &e
        {
            if *kind == wire::kind::INVOCATION || *kind == wire::kind::STREAM_INVOCATION {
                let completion = CompletionMessage::error(invocation_id.clone(), e.to_string());
                self.io.send(&Message::Completion(completion)).await?;
            }
        }
        self.report_receive_error(ReceiveError::Decode(e));
        Ok(())
    }

    fn spawn_worker(&mut self, invocation: InvocationMessage, streaming: bool) {
        self.active_streams
            .retain(|_, handle| !handle.is_finished());

        let ctx = ConnectionContext {
            client: self.client.clone(),
        };
        let stream_id = if streaming {
            invocation.invocation_id.clone()
        } else {
            None
        };
        let task = tokio::spawn(dispatch_invocation(
            self.hub.clone(),
            invocation,
            streaming,
            self.out_tx.clone(),
            ctx,
        ));
        if let Some(id) = stream_id {
            self.active_streams.insert(id, task.abort_handle());
        }
    }

    /// Drain frames already queued by workers before a graceful stop.
    async fn flush_outbound(&mut self) -> Result<(), ConnectionError> {
        while let Ok(msg) = self.out_rx.try_recv() {
            self.io.send(&msg).await?;
        }
        Ok(())
    }

    fn report_receive_error(&self, error: ReceiveError) {
        match &self.on_receive_error {
            Some(handler) => handler(&error),
            None => warn!(error = %error, "inbound message error"),
        }
    }
}
