//! ProxyAdapter: relays conversations to one backend.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::BackendSession;
use crate::observability::metrics::{self, DIRECTION_TO_BACKEND, DIRECTION_TO_CLIENT};
use crate::protocol::{error_codes, JsonRpcMessage, MessageKind, RequestId};
use crate::transport::channel::ProxyEnd;

/// No conversation has been active yet.
const NO_CONVERSATION: u64 = 0;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("backend '{0}' already has an adapter")]
    AlreadyBound(String),

    #[error("backend '{0}' closed its channel")]
    BackendClosed(String),
}

/// Identifies one `forward()` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConversationId(u64);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// A request the backend still owes an answer for.
#[derive(Debug, Clone)]
struct PendingRequest {
    conversation: ConversationId,
    original_id: RequestId,
}

/// Bidirectional forwarding unit bound to a single backend.
pub struct ProxyAdapter {
    backend: Arc<BackendSession>,
    label: String,
    conversations: DashMap<ConversationId, mpsc::UnboundedSender<JsonRpcMessage>>,
    pending: DashMap<u64, PendingRequest>,
    next_conversation: AtomicU64,
    // Starts at 1; id 0 was the handshake.
    next_request: AtomicU64,
    last_active: AtomicU64,
    cancel: CancellationToken,
    demux: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyAdapter {
    /// Bind to `backend` and start reading its channel.
    ///
    /// `cancel` ends the demultiplexer and every conversation.
    pub fn new(
        backend: Arc<BackendSession>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, ForwardError> {
        let label = backend.label().to_string();
        let incoming = backend
            .take_incoming()
            .ok_or_else(|| ForwardError::AlreadyBound(label.clone()))?;

        let adapter = Arc::new(Self {
            backend,
            label,
            conversations: DashMap::new(),
            pending: DashMap::new(),
            next_conversation: AtomicU64::new(1),
            next_request: AtomicU64::new(1),
            last_active: AtomicU64::new(NO_CONVERSATION),
            cancel,
            demux: Mutex::new(None),
        });

        let handle = tokio::spawn(Arc::clone(&adapter).demux(incoming));
        *adapter.demux.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(adapter)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn backend(&self) -> &Arc<BackendSession> {
        &self.backend
    }

    pub fn active_conversations(&self) -> usize {
        self.conversations.len()
    }

    /// Requests forwarded to the backend and not yet answered.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Pump one transport conversation until either side closes.
    ///
    /// Both channel halves are dropped before returning.
    pub async fn forward(self: &Arc<Self>, end: ProxyEnd) -> Result<(), ForwardError> {
        let ProxyEnd {
            mut inbound,
            outbound,
        } = end;
        let (conversation, mut from_backend) = self.register();
        tracing::debug!(backend = %self.label, conversation = %conversation, "Conversation opened");

        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                msg = inbound.recv() => {
                    let Some(msg) = msg else { break Ok(()) };
                    if let Err(e) = self.from_client(conversation, msg, &outbound).await {
                        break Err(e);
                    }
                }
                msg = from_backend.recv() => {
                    let Some(msg) = msg else {
                        break Err(ForwardError::BackendClosed(self.label.clone()));
                    };
                    if outbound.send(msg).await.is_err() {
                        break Ok(());
                    }
                    metrics::record_forwarded(&self.label, DIRECTION_TO_CLIENT);
                }
            }
        };

        self.unregister(conversation);
        drop(inbound);
        drop(outbound);
        tracing::debug!(backend = %self.label, conversation = %conversation, "Conversation closed");
        result
    }

    /// Stop the demultiplexer. Conversations end as their backend queues close.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .demux
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::warn!(backend = %self.label, error = %e, "Demultiplexer task failed");
                }
            }
        }
    }

    fn register(&self) -> (ConversationId, mpsc::UnboundedReceiver<JsonRpcMessage>) {
        let id = ConversationId(self.next_conversation.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.conversations.insert(id, tx);
        self.last_active.store(id.0, Ordering::Release);
        metrics::record_active_conversations(&self.label, self.conversations.len());
        (id, rx)
    }

    fn unregister(&self, conversation: ConversationId) {
        self.conversations.remove(&conversation);
        self.pending.retain(|_, p| p.conversation != conversation);
        let _ = self.last_active.compare_exchange(
            conversation.0,
            NO_CONVERSATION,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        metrics::record_active_conversations(&self.label, self.conversations.len());
    }

    async fn from_client(
        &self,
        conversation: ConversationId,
        mut msg: JsonRpcMessage,
        outbound: &mpsc::Sender<JsonRpcMessage>,
    ) -> Result<(), ForwardError> {
        self.last_active.store(conversation.0, Ordering::Release);

        match msg.kind() {
            MessageKind::Request => {
                let Some(original_id) = msg.id() else {
                    return self.reject(outbound, None, "request id must be a string or integer").await;
                };
                if msg.method() == Some("initialize") {
                    let reply = JsonRpcMessage::response(original_id, self.backend.initialize_result().clone());
                    let _ = outbound.send(reply).await;
                    return Ok(());
                }
                let gateway_id = self.next_request.fetch_add(1, Ordering::Relaxed);
                self.pending.insert(
                    gateway_id,
                    PendingRequest {
                        conversation,
                        original_id,
                    },
                );
                msg.set_id(RequestId::from(gateway_id));
                if let Err(e) = self.to_backend(msg).await {
                    self.pending.remove(&gateway_id);
                    return Err(e);
                }
            }
            MessageKind::Notification => {
                let method = msg.method().unwrap_or_default().to_string();
                match method.as_str() {
                    "notifications/initialized" => {}
                    "notifications/cancelled" => {
                        self.rewrite_cancelled(conversation, &mut msg);
                        self.to_backend(msg).await?;
                    }
                    _ => self.to_backend(msg).await?,
                }
            }
            MessageKind::Response => self.to_backend(msg).await?,
            MessageKind::Invalid => {
                tracing::warn!(backend = %self.label, conversation = %conversation, "Invalid message from client");
                return self.reject(outbound, msg.id(), "invalid JSON-RPC message").await;
            }
        }
        Ok(())
    }

    async fn reject(
        &self,
        outbound: &mpsc::Sender<JsonRpcMessage>,
        id: Option<RequestId>,
        reason: &str,
    ) -> Result<(), ForwardError> {
        let _ = outbound
            .send(JsonRpcMessage::error_response(id, error_codes::INVALID_REQUEST, reason))
            .await;
        Ok(())
    }

    async fn to_backend(&self, msg: JsonRpcMessage) -> Result<(), ForwardError> {
        self.backend
            .send(msg)
            .await
            .map_err(|_| ForwardError::BackendClosed(self.label.clone()))?;
        metrics::record_forwarded(&self.label, DIRECTION_TO_BACKEND);
        Ok(())
    }

    /// Point a cancellation at the gateway id the backend actually saw.
    fn rewrite_cancelled(&self, conversation: ConversationId, msg: &mut JsonRpcMessage) {
        let Some(params) = msg.params_mut() else {
            return;
        };
        let Some(client_id) = params.get("requestId").and_then(RequestId::from_value) else {
            return;
        };
        let gateway_id = self
            .pending
            .iter()
            .find(|entry| entry.conversation == conversation && entry.original_id == client_id)
            .map(|entry| *entry.key());
        if let Some(gateway_id) = gateway_id {
            params.insert("requestId".to_string(), Value::from(gateway_id));
        }
    }

    async fn demux(self: Arc<Self>, mut incoming: mpsc::Receiver<JsonRpcMessage>) {
        loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = incoming.recv() => match msg {
                    Some(msg) => msg,
                    None => {
                        tracing::warn!(backend = %self.label, "Backend channel closed; ending conversations");
                        break;
                    }
                },
            };
            self.from_backend(msg).await;
        }

        // Dropping the senders ends every forward() loop on this backend.
        self.conversations.clear();
        self.pending.clear();
    }

    async fn from_backend(&self, mut msg: JsonRpcMessage) {
        match msg.kind() {
            MessageKind::Response => {
                let routed = msg
                    .id()
                    .and_then(|id| id.as_u64())
                    .and_then(|gateway_id| self.pending.remove(&gateway_id))
                    .map(|(_, pending)| pending);
                let Some(pending) = routed else {
                    tracing::warn!(backend = %self.label, id = ?msg.id(), "Unroutable response from backend");
                    return;
                };
                msg.set_id(pending.original_id);
                let delivered = self
                    .conversations
                    .get(&pending.conversation)
                    .map(|tx| tx.send(msg).is_ok())
                    .unwrap_or(false);
                if !delivered {
                    tracing::debug!(
                        backend = %self.label,
                        conversation = %pending.conversation,
                        "Conversation ended before its response arrived"
                    );
                }
            }
            MessageKind::Notification => {
                let targets: Vec<_> = self
                    .conversations
                    .iter()
                    .map(|entry| entry.value().clone())
                    .collect();
                if targets.is_empty() {
                    tracing::debug!(backend = %self.label, method = ?msg.method(), "Dropping notification with no listeners");
                }
                for tx in targets {
                    let _ = tx.send(msg.clone());
                }
            }
            MessageKind::Request => {
                let conversation = ConversationId(self.last_active.load(Ordering::Acquire));
                let delivered = self
                    .conversations
                    .get(&conversation)
                    .map(|tx| tx.send(msg.clone()).is_ok())
                    .unwrap_or(false);
                if !delivered {
                    tracing::warn!(backend = %self.label, method = ?msg.method(), "Backend request with no client connected");
                    let reply = JsonRpcMessage::error_response(
                        msg.id(),
                        error_codes::INTERNAL_ERROR,
                        "no client connected",
                    );
                    let _ = self.backend.send(reply).await;
                }
            }
            MessageKind::Invalid => {
                tracing::warn!(backend = %self.label, "Ignoring invalid message from backend");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ChannelPeer;
    use crate::config::BackendSpec;
    use crate::transport::channel::{duplex, TransportEnd};
    use serde_json::json;
    use std::time::Duration;

    fn adapter() -> (Arc<ProxyAdapter>, ChannelPeer) {
        let (backend, peer) = BackendSession::from_channel(
            BackendSpec::new(Some("mem".into()), "in-process"),
            json!({"protocolVersion": "2025-03-26", "serverInfo": {"name": "mem"}}),
            16,
        );
        let adapter = ProxyAdapter::new(backend, CancellationToken::new()).unwrap();
        (adapter, peer)
    }

    fn open(adapter: &Arc<ProxyAdapter>) -> (TransportEnd, JoinHandle<Result<(), ForwardError>>) {
        let (proxy_end, transport_end) = duplex(16);
        let adapter = Arc::clone(adapter);
        let task = tokio::spawn(async move { adapter.forward(proxy_end).await });
        (transport_end, task)
    }

    async fn recv(rx: &mut mpsc::Receiver<JsonRpcMessage>) -> JsonRpcMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_second_adapter_is_rejected() {
        let (adapter, _peer) = adapter();
        let err = ProxyAdapter::new(Arc::clone(adapter.backend()), CancellationToken::new());
        assert!(matches!(err, Err(ForwardError::AlreadyBound(_))));
    }

    #[tokio::test]
    async fn test_request_ids_are_remapped_and_restored() {
        let (adapter, mut peer) = adapter();
        let (mut client, _task) = open(&adapter);

        client
            .tx
            .send(JsonRpcMessage::request(RequestId::String("abc".into()), "tools/list", None))
            .await
            .unwrap();

        let seen = recv(&mut peer.from_gateway).await;
        let gateway_id = seen.id().unwrap();
        assert!(gateway_id.as_u64().unwrap() >= 1);
        assert_eq!(seen.method(), Some("tools/list"));

        peer.to_gateway
            .send(JsonRpcMessage::response(gateway_id, json!({"tools": []})))
            .await
            .unwrap();

        let reply = recv(&mut client.rx).await;
        assert_eq!(reply.id(), Some(RequestId::String("abc".into())));
        assert_eq!(reply.result().unwrap()["tools"], json!([]));
        assert_eq!(adapter.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_initialize_is_answered_locally() {
        let (adapter, mut peer) = adapter();
        let (mut client, _task) = open(&adapter);

        client
            .tx
            .send(JsonRpcMessage::request(RequestId::Number(1), "initialize", Some(json!({}))))
            .await
            .unwrap();
        let reply = recv(&mut client.rx).await;
        assert_eq!(reply.id(), Some(RequestId::Number(1)));
        assert_eq!(reply.result().unwrap()["serverInfo"]["name"], "mem");

        client
            .tx
            .send(JsonRpcMessage::notification("notifications/initialized", None))
            .await
            .unwrap();
        client
            .tx
            .send(JsonRpcMessage::notification("notifications/progress", None))
            .await
            .unwrap();

        // Only the second notification reaches the backend.
        let seen = recv(&mut peer.from_gateway).await;
        assert_eq!(seen.method(), Some("notifications/progress"));
    }

    #[tokio::test]
    async fn test_cancellation_targets_gateway_id() {
        let (adapter, mut peer) = adapter();
        let (client, _task) = open(&adapter);

        client
            .tx
            .send(JsonRpcMessage::request(RequestId::Number(5), "tools/call", None))
            .await
            .unwrap();
        let gateway_id = recv(&mut peer.from_gateway).await.id().unwrap();

        client
            .tx
            .send(JsonRpcMessage::notification(
                "notifications/cancelled",
                Some(json!({"requestId": 5, "reason": "user"})),
            ))
            .await
            .unwrap();
        let cancelled = recv(&mut peer.from_gateway).await;
        assert_eq!(cancelled.params().unwrap()["requestId"], Value::from(gateway_id));
        assert_eq!(cancelled.params().unwrap()["reason"], "user");
    }

    #[tokio::test]
    async fn test_notifications_reach_every_conversation() {
        let (adapter, peer) = adapter();
        let (mut first, _t1) = open(&adapter);
        let (mut second, _t2) = open(&adapter);
        while adapter.active_conversations() < 2 {
            tokio::task::yield_now().await;
        }

        peer.to_gateway
            .send(JsonRpcMessage::notification("notifications/tools/list_changed", None))
            .await
            .unwrap();

        assert_eq!(recv(&mut first.rx).await.method(), Some("notifications/tools/list_changed"));
        assert_eq!(recv(&mut second.rx).await.method(), Some("notifications/tools/list_changed"));
    }

    #[tokio::test]
    async fn test_backend_request_without_client_gets_error() {
        let (_adapter, mut peer) = adapter();
        peer.to_gateway
            .send(JsonRpcMessage::request(RequestId::Number(99), "sampling/createMessage", None))
            .await
            .unwrap();

        let reply = recv(&mut peer.from_gateway).await;
        assert_eq!(reply.id(), Some(RequestId::Number(99)));
        assert_eq!(reply.as_value()["error"]["code"], error_codes::INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn test_backend_request_goes_to_active_client() {
        let (adapter, mut peer) = adapter();
        let (mut client, _task) = open(&adapter);
        while adapter.active_conversations() < 1 {
            tokio::task::yield_now().await;
        }

        peer.to_gateway
            .send(JsonRpcMessage::request(RequestId::Number(99), "roots/list", None))
            .await
            .unwrap();
        let request = recv(&mut client.rx).await;
        assert_eq!(request.method(), Some("roots/list"));

        client
            .tx
            .send(JsonRpcMessage::response(RequestId::Number(99), json!({"roots": []})))
            .await
            .unwrap();
        let answer = recv(&mut peer.from_gateway).await;
        assert_eq!(answer.id(), Some(RequestId::Number(99)));
        assert!(answer.result().is_some());
    }

    #[tokio::test]
    async fn test_order_is_preserved_within_a_conversation() {
        let (adapter, mut peer) = adapter();
        let (mut client, _task) = open(&adapter);

        for n in 0..20 {
            client
                .tx
                .send(JsonRpcMessage::request(RequestId::Number(n), "echo", Some(json!({"n": n}))))
                .await
                .unwrap();
        }
        for n in 0..20 {
            let seen = recv(&mut peer.from_gateway).await;
            assert_eq!(seen.params().unwrap()["n"], n);
            peer.to_gateway
                .send(JsonRpcMessage::response(seen.id().unwrap(), json!({"n": n})))
                .await
                .unwrap();
        }
        for n in 0..20 {
            let reply = recv(&mut client.rx).await;
            assert_eq!(reply.id(), Some(RequestId::Number(n)));
        }
    }

    #[tokio::test]
    async fn test_backend_close_ends_conversations() {
        let (adapter, peer) = adapter();
        let (mut client, task) = open(&adapter);
        while adapter.active_conversations() < 1 {
            tokio::task::yield_now().await;
        }

        drop(peer);
        let result = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(ForwardError::BackendClosed(_))));
        assert!(client.rx.recv().await.is_none());
        assert_eq!(adapter.active_conversations(), 0);
    }

    #[tokio::test]
    async fn test_stop_ends_forwarding() {
        let (adapter, _peer) = adapter();
        let (_client, task) = open(&adapter);
        adapter.stop().await;
        let result = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
