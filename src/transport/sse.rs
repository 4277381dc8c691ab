//! EventStream binding: one SSE connection per conversation.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::context::GatewayContext;
use crate::protocol::JsonRpcMessage;
use crate::proxy::ProxyAdapter;
use crate::transport::channel::{duplex, TransportEnd};
use crate::transport::MountPoint;

#[derive(Clone)]
struct EventStreamState {
    adapter: Arc<ProxyAdapter>,
    ctx: GatewayContext,
    mount: MountPoint,
    streams: Arc<DashMap<Uuid, mpsc::Sender<JsonRpcMessage>>>,
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    session_id: Option<String>,
}

pub fn routes(adapter: Arc<ProxyAdapter>, ctx: GatewayContext, mount: MountPoint) -> Router {
    let state = EventStreamState {
        adapter,
        ctx,
        mount,
        streams: Arc::new(DashMap::new()),
    };
    Router::new()
        .route("/sse", get(open_stream))
        .route("/messages/", post(post_message))
        .with_state(state)
}

/// Removes the connection's inbound sender when the response stream is dropped.
struct StreamGuard {
    id: Uuid,
    backend: String,
    streams: Arc<DashMap<Uuid, mpsc::Sender<JsonRpcMessage>>>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.streams.remove(&self.id);
        tracing::info!(backend = %self.backend, session_id = %self.id.simple(), "Event stream closed");
    }
}

async fn open_stream(State(state): State<EventStreamState>) -> Response {
    state.ctx.status.touch();

    let id = Uuid::new_v4();
    let backend = state.adapter.label().to_string();
    let capacity = state.ctx.settings.backends.channel_capacity;
    let (proxy_end, TransportEnd { tx, rx }) = duplex(capacity);
    state.streams.insert(id, tx);

    let adapter = Arc::clone(&state.adapter);
    state.ctx.shutdown.spawn(async move {
        if let Err(e) = adapter.forward(proxy_end).await {
            tracing::warn!(backend = %adapter.label(), session_id = %id.simple(), error = %e, "Event stream conversation ended");
        }
    });

    let endpoint = state
        .mount
        .path(&format!("/messages/?session_id={}", id.simple()));
    tracing::info!(backend = %backend, session_id = %id.simple(), endpoint = %endpoint, "Event stream opened");

    let guard = StreamGuard {
        id,
        backend,
        streams: Arc::clone(&state.streams),
    };
    let first = Event::default().event("endpoint").data(endpoint);
    let messages = stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let msg = rx.recv().await?;
        Some((Ok::<_, Infallible>(message_event(&msg)), (rx, guard)))
    });
    let events = stream::once(async move { Ok::<_, Infallible>(first) }).chain(messages);

    let sse = Sse::new(events);
    match state.ctx.settings.transport.sse_keep_alive_secs {
        0 => sse.into_response(),
        secs => sse
            .keep_alive(KeepAlive::new().interval(Duration::from_secs(secs)).text("ping"))
            .into_response(),
    }
}

pub(crate) fn message_event(msg: &JsonRpcMessage) -> Event {
    match msg.to_line() {
        Ok(line) => Event::default().event("message").data(line),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode message for event stream");
            Event::default().comment("encode error")
        }
    }
}

async fn post_message(
    State(state): State<EventStreamState>,
    Query(query): Query<MessagesQuery>,
    body: Bytes,
) -> Response {
    state.ctx.status.touch();

    let Some(raw_id) = query.session_id else {
        return (StatusCode::BAD_REQUEST, "session_id is required").into_response();
    };
    let Ok(id) = Uuid::parse_str(&raw_id) else {
        tracing::warn!(session_id = %raw_id, "Received invalid session ID");
        return (StatusCode::BAD_REQUEST, "Invalid session ID").into_response();
    };
    let Some(tx) = state.streams.get(&id).map(|entry| entry.value().clone()) else {
        tracing::warn!(session_id = %raw_id, "Could not find session for ID");
        return (StatusCode::NOT_FOUND, "Could not find session").into_response();
    };

    let msg = match serde_json::from_slice::<JsonRpcMessage>(&body) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(session_id = %raw_id, error = %e, "Failed to parse message");
            return (StatusCode::BAD_REQUEST, "Could not parse message").into_response();
        }
    };

    if tx.send(msg).await.is_err() {
        state.streams.remove(&id);
        return (StatusCode::NOT_FOUND, "Could not find session").into_response();
    }
    (StatusCode::ACCEPTED, "Accepted").into_response()
}
