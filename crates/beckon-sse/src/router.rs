//! Axum glue mounting a hub at a base path.
//!
//! `GET ?id=<connection-id>` opens the event-stream downstream and starts
//! the connection's driver; `POST ?id=<connection-id>` carries upstream
//! frames. A connection id is generated when the client does not supply
//! one. Body extraction failures on POST are answered by axum with a 4xx
//! before the handler runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use beckon_session::{Hub, ServerConfig, ServerConnection};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::transport::{sse_connection, SseConfig, SsePostHandler};

struct HubShared {
    hub: Arc<Hub>,
    server_config: ServerConfig,
    sse_config: SseConfig,
    /// Live upstream handlers by connection id.
    connections: Mutex<HashMap<String, Arc<SsePostHandler>>>,
}

impl HubShared {
    fn connections(&self) -> MutexGuard<'_, HashMap<String, Arc<SsePostHandler>>> {
        match self.connections.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[derive(Deserialize)]
struct ConnectionQuery {
    id: Option<String>,
}

/// Build a router serving the given hub over SSE.
///
/// Nest it at the hub's base path:
///
/// ```ignore
/// let app = axum::Router::new().nest("/chat", map_hub(hub, Default::default(), Default::default()));
/// ```
pub fn map_hub(hub: Arc<Hub>, server_config: ServerConfig, sse_config: SseConfig) -> Router {
    let state = Arc::new(HubShared {
        hub,
        server_config,
        sse_config,
        connections: Mutex::new(HashMap::new()),
    });
    Router::new()
        .route("/", get(open_event_stream).post(consume_upstream))
        .with_state(state)
}

async fn open_event_stream(
    State(state): State<Arc<HubShared>>,
    Query(query): Query<ConnectionQuery>,
) -> Response {
    let connection_id = query
        .id
        .unwrap_or_else(|| ulid::Ulid::new().to_string());

    let token = CancellationToken::new();
    let (transport, post, downstream) = sse_connection(
        connection_id.clone(),
        token.clone(),
        state.sse_config.clone(),
    );

    {
        let mut connections = state.connections();
        if connections.contains_key(&connection_id) {
            return StatusCode::CONFLICT.into_response();
        }
        connections.insert(connection_id.clone(), Arc::new(post));
    }

    let connection = ServerConnection::new(
        state.hub.clone(),
        transport,
        state.server_config.clone(),
    )
    .with_connection_id(connection_id.clone())
    .with_token(token);

    let shared = state.clone();
    let id = connection_id.clone();
    tokio::spawn(async move {
        if let Err(e) = connection.run().await {
            debug!(connection_id = %id, error = %e, "sse connection ended with error");
        }
        shared.connections().remove(&id);
    });

    debug!(connection_id = %connection_id, "sse downstream opened");
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Body::from_stream(downstream.into_body_stream()),
    )
        .into_response()
}

async fn consume_upstream(
    State(state): State<Arc<HubShared>>,
    Query(query): Query<ConnectionQuery>,
    body: Bytes,
) -> StatusCode {
    let Some(connection_id) = query.id else {
        return StatusCode::BAD_REQUEST;
    };
    let handler = state.connections().get(&connection_id).cloned();
    match handler {
        Some(handler) => handler.consume_request(&body).await,
        None => StatusCode::NOT_FOUND,
    }
}
