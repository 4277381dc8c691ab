//! MultiplexedSession binding: header-identified sessions over plain HTTP.
//!
//! Responses are returned as JSON bodies. Server-initiated traffic
//! (notifications and requests from the backend) goes to the session's
//! standalone event stream opened with `GET`.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::stream;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::context::GatewayContext;
use crate::observability::metrics;
use crate::protocol::{error_codes, JsonRpcMessage, MessageKind, RequestId};
use crate::proxy::ProxyAdapter;
use crate::transport::channel::{duplex, TransportEnd};
use crate::transport::sse::message_event;

/// Request and response header carrying the session id.
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

const NO_VALID_SESSION: &str = "Bad Request: No valid session ID provided";

/// Gateway-wide table of live multiplexed sessions.
///
/// Inserts happen only under `creation_lock`; lookups and removals go
/// straight to the concurrent maps.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<MultiplexedSession>>,
    /// Backend label → id of a session no request has named yet.
    unclaimed: DashMap<String, String>,
    creation_lock: tokio::sync::Mutex<()>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            unclaimed: DashMap::new(),
            creation_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<Arc<MultiplexedSession>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Ids of the live sessions bound to `backend`.
    pub fn session_ids(&self, backend: &str) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().backend() == backend)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Session `id`, but only if it belongs to `backend`.
    fn lookup(&self, id: &str, backend: &str) -> Option<Arc<MultiplexedSession>> {
        self.get(id)
            .filter(|session| session.backend() == backend && session.is_live())
    }

    fn remove(&self, id: &str) -> Option<Arc<MultiplexedSession>> {
        let removed = self.sessions.remove(id).map(|(_, session)| session);
        if let Some(session) = &removed {
            self.unclaimed.remove_if(session.backend(), |_, pending| pending == id);
        }
        removed
    }

    /// Join the backend's unclaimed session, or create one.
    ///
    /// A session is joinable only while the header-less request that created
    /// it (or one that joined it) is still being served. Holds the creation
    /// lock only while deciding and registering; the session's tasks run
    /// after it is released.
    async fn join_or_create(
        self: &Arc<Self>,
        adapter: &Arc<ProxyAdapter>,
        ctx: &GatewayContext,
    ) -> Arc<MultiplexedSession> {
        let _guard = self.creation_lock.lock().await;
        let backend = adapter.label();

        let waiting = self.unclaimed.get(backend).map(|entry| entry.value().clone());
        if let Some(id) = waiting {
            if let Some(session) = self.lookup(&id, backend).filter(|session| session.try_join()) {
                tracing::info!(backend = %backend, session_id = %id, "Joined unclaimed session");
                return session;
            }
            self.unclaimed.remove(backend);
        }

        let session = MultiplexedSession::start(Arc::clone(adapter), Arc::clone(self), ctx, false);
        self.sessions.insert(session.id().to_string(), Arc::clone(&session));
        self.unclaimed.insert(backend.to_string(), session.id().to_string());
        metrics::record_session_created(backend);
        tracing::info!(backend = %backend, session_id = %session.id(), "Created new session");
        session
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct PendingCall {
    original_id: RequestId,
    reply: oneshot::Sender<JsonRpcMessage>,
}

/// One long-lived conversation shared by many HTTP requests.
pub struct MultiplexedSession {
    id: String,
    backend: String,
    created_at: DateTime<Utc>,
    claimed: AtomicBool,
    /// Header-less requests currently served by this session.
    joiners: AtomicUsize,
    /// Never registered and never names itself in a response header.
    stateless: bool,
    to_pump: Mutex<Option<mpsc::Sender<JsonRpcMessage>>>,
    pending: DashMap<u64, PendingCall>,
    next_id: AtomicU64,
    standalone: Mutex<Option<mpsc::UnboundedSender<JsonRpcMessage>>>,
}

impl MultiplexedSession {
    fn start(
        adapter: Arc<ProxyAdapter>,
        registry: Arc<SessionRegistry>,
        ctx: &GatewayContext,
        stateless: bool,
    ) -> Arc<Self> {
        let (proxy_end, TransportEnd { tx, rx }) = duplex(ctx.settings.backends.channel_capacity);
        let session = Arc::new(Self {
            id: Uuid::new_v4().simple().to_string(),
            backend: adapter.label().to_string(),
            created_at: Utc::now(),
            claimed: AtomicBool::new(false),
            joiners: AtomicUsize::new(1),
            stateless,
            to_pump: Mutex::new(Some(tx)),
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            standalone: Mutex::new(None),
        });

        let id = session.id.clone();
        ctx.shutdown.spawn(async move {
            if let Err(e) = adapter.forward(proxy_end).await {
                tracing::warn!(backend = %adapter.label(), session_id = %id, error = %e, "Session pump ended");
            }
        });
        ctx.shutdown
            .spawn(Arc::clone(&session).dispatch(rx, registry));
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    pub fn is_live(&self) -> bool {
        lock(&self.to_pump).as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Count one more header-less request in, unless the session is already
    /// spoken for.
    fn try_join(&self) -> bool {
        !self.is_claimed()
            && self
                .joiners
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n > 0).then_some(n + 1))
                .is_ok()
    }

    /// A header-less request finished. The last one out claims the session.
    fn leave(&self, registry: &SessionRegistry) {
        if self.joiners.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.claim(registry);
        }
    }

    fn claim(&self, registry: &SessionRegistry) {
        if !self.claimed.swap(true, Ordering::AcqRel) {
            registry
                .unclaimed
                .remove_if(&self.backend, |_, pending| pending == &self.id);
        }
    }

    /// Close the inbound side; the pump and dispatcher wind down from there.
    fn terminate(&self) {
        drop(lock(&self.to_pump).take());
        drop(lock(&self.standalone).take());
    }

    async fn dispatch(
        self: Arc<Self>,
        mut from_pump: mpsc::Receiver<JsonRpcMessage>,
        registry: Arc<SessionRegistry>,
    ) {
        while let Some(mut msg) = from_pump.recv().await {
            if msg.kind() == MessageKind::Response {
                let call = msg
                    .id()
                    .and_then(|id| id.as_u64())
                    .and_then(|seq| self.pending.remove(&seq))
                    .map(|(_, call)| call);
                if let Some(call) = call {
                    msg.set_id(call.original_id);
                    let _ = call.reply.send(msg);
                    continue;
                }
            }
            self.push_standalone(msg);
        }

        registry.remove(&self.id);
        self.terminate();
        // Dropping the reply senders fails every waiting request.
        self.pending.clear();
        tracing::info!(
            backend = %self.backend,
            session_id = %self.id,
            age_ms = (Utc::now() - self.created_at).num_milliseconds(),
            "Session closed"
        );
    }

    fn push_standalone(&self, msg: JsonRpcMessage) {
        let mut slot = lock(&self.standalone);
        let Some(tx) = slot.as_ref() else {
            tracing::debug!(
                session_id = %self.id,
                method = ?msg.method(),
                "No standalone stream; dropping server message"
            );
            return;
        };
        if tx.send(msg).is_err() {
            *slot = None;
        }
    }

    async fn handle_post(&self, body: Bytes) -> Response {
        let (messages, batch) = match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Array(items)) if !items.is_empty() => (items, true),
            Ok(Value::Array(_)) => {
                return self.rpc_error(StatusCode::BAD_REQUEST, error_codes::INVALID_REQUEST, "Empty batch");
            }
            Ok(value) => (vec![value], false),
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "Failed to parse request body");
                return self.rpc_error(StatusCode::BAD_REQUEST, error_codes::PARSE_ERROR, "Parse error");
            }
        };

        let messages: Vec<JsonRpcMessage> = messages.into_iter().map(JsonRpcMessage::from_value).collect();
        let malformed = messages.iter().any(|msg| match msg.kind() {
            MessageKind::Invalid => true,
            MessageKind::Request => msg.id().is_none(),
            _ => false,
        });
        if malformed {
            return self.rpc_error(
                StatusCode::BAD_REQUEST,
                error_codes::INVALID_REQUEST,
                "Invalid JSON-RPC message",
            );
        }

        let Some(to_pump) = lock(&self.to_pump).clone() else {
            return (StatusCode::SERVICE_UNAVAILABLE, "Session is closed").into_response();
        };

        let mut waiters = Vec::new();
        for mut msg in messages {
            if msg.kind() == MessageKind::Request {
                let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
                let original_id = msg.id().unwrap_or(RequestId::Number(0));
                let (reply, waiter) = oneshot::channel();
                self.pending.insert(
                    seq,
                    PendingCall {
                        original_id: original_id.clone(),
                        reply,
                    },
                );
                msg.set_id(RequestId::from(seq));
                waiters.push((original_id, waiter));
            }
            if to_pump.send(msg).await.is_err() {
                return (StatusCode::SERVICE_UNAVAILABLE, "Session is closed").into_response();
            }
        }

        if waiters.is_empty() {
            return self.with_session_header((StatusCode::ACCEPTED, "Accepted").into_response());
        }

        let mut replies = Vec::with_capacity(waiters.len());
        for (original_id, waiter) in waiters {
            let reply = waiter.await.unwrap_or_else(|_| {
                JsonRpcMessage::error_response(
                    Some(original_id),
                    error_codes::BACKEND_CLOSED,
                    "backend closed before responding",
                )
            });
            replies.push(reply.into_value());
        }

        let body = if batch {
            Value::Array(replies)
        } else {
            replies.pop().unwrap_or(Value::Null)
        };
        self.with_session_header(Json(body).into_response())
    }

    fn open_standalone(&self, keep_alive_secs: u64) -> Response {
        let rx = {
            let mut slot = lock(&self.standalone);
            if slot.as_ref().is_some_and(|tx| !tx.is_closed()) {
                return (StatusCode::CONFLICT, "Conflict: Only one SSE stream is allowed per session")
                    .into_response();
            }
            let (tx, rx) = mpsc::unbounded_channel();
            *slot = Some(tx);
            rx
        };
        tracing::debug!(session_id = %self.id, "Standalone event stream opened");

        let events = stream::unfold(rx, |mut rx| async move {
            let msg = rx.recv().await?;
            Some((Ok::<_, Infallible>(message_event(&msg)), rx))
        });
        let sse = Sse::new(events);
        let response = match keep_alive_secs {
            0 => sse.into_response(),
            secs => sse
                .keep_alive(KeepAlive::new().interval(Duration::from_secs(secs)).text("ping"))
                .into_response(),
        };
        self.with_session_header(response)
    }

    fn rpc_error(&self, status: StatusCode, code: i64, message: &str) -> Response {
        let body = JsonRpcMessage::error_response(None, code, message).into_value();
        self.with_session_header((status, Json(body)).into_response())
    }

    fn with_session_header(&self, mut response: Response) -> Response {
        if self.stateless {
            return response;
        }
        if let Ok(value) = HeaderValue::from_str(&self.id) {
            response.headers_mut().insert(MCP_SESSION_ID_HEADER, value);
        }
        response
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What happens to a session when the request that used it is done.
enum Scope {
    /// Header-less request on a shared session.
    Joined,
    /// Stateless request; the session lives only for this request.
    Ephemeral,
}

/// Ends a request's hold on its session, also when the client goes away
/// mid-request.
struct ScopeGuard<'a> {
    session: &'a MultiplexedSession,
    registry: &'a SessionRegistry,
    scope: Scope,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        match self.scope {
            Scope::Joined => self.session.leave(self.registry),
            Scope::Ephemeral => self.session.terminate(),
        }
    }
}

#[derive(Clone)]
struct MultiplexedState {
    adapter: Arc<ProxyAdapter>,
    ctx: GatewayContext,
}

pub fn routes(adapter: Arc<ProxyAdapter>, ctx: GatewayContext) -> Router {
    let state = MultiplexedState { adapter, ctx };
    Router::new()
        .route("/mcp", any(handle_request))
        .route("/mcp/", any(handle_request))
        .with_state(state)
}

async fn handle_request(
    State(state): State<MultiplexedState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.ctx.status.touch();

    if method != Method::POST && method != Method::GET && method != Method::DELETE {
        return (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed").into_response();
    }

    if state.ctx.settings.transport.stateless {
        return handle_stateless(&state, method, body).await;
    }

    let registry = &state.ctx.sessions;
    let backend = state.adapter.label();
    let header = headers
        .get(MCP_SESSION_ID_HEADER)
        .map(|value| value.to_str().unwrap_or_default());

    let session = match header {
        Some(id) => match registry.lookup(id, backend) {
            Some(session) => {
                session.claim(registry);
                tracing::debug!(backend = %backend, session_id = %id, "Dispatching to existing session");
                session
            }
            None => {
                tracing::warn!(backend = %backend, session_id = %id, "Rejected request with unknown session ID");
                return (StatusCode::BAD_REQUEST, NO_VALID_SESSION).into_response();
            }
        },
        None if method == Method::POST => {
            let session = registry.join_or_create(&state.adapter, &state.ctx).await;
            let _scope = ScopeGuard {
                session: &session,
                registry,
                scope: Scope::Joined,
            };
            return session.handle_post(body).await;
        }
        None => return (StatusCode::BAD_REQUEST, NO_VALID_SESSION).into_response(),
    };

    match method {
        Method::GET => session.open_standalone(state.ctx.settings.transport.sse_keep_alive_secs),
        Method::DELETE => {
            registry.remove(session.id());
            session.terminate();
            tracing::info!(backend = %backend, session_id = %session.id(), "Session terminated by client");
            session.with_session_header(StatusCode::OK.into_response())
        }
        _ => session.handle_post(body).await,
    }
}

/// Every POST gets its own conversation; nothing is registered and no
/// session id is handed out.
async fn handle_stateless(state: &MultiplexedState, method: Method, body: Bytes) -> Response {
    if method != Method::POST {
        return (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed: sessions are disabled").into_response();
    }
    let session = MultiplexedSession::start(
        Arc::clone(&state.adapter),
        Arc::clone(&state.ctx.sessions),
        &state.ctx,
        true,
    );
    tracing::debug!(backend = %state.adapter.label(), "Serving stateless request");
    let _scope = ScopeGuard {
        session: &session,
        registry: &state.ctx.sessions,
        scope: Scope::Ephemeral,
    };
    session.handle_post(body).await
}
