//! In-process duplex message channel between a transport and the proxy.

use tokio::sync::mpsc;

use crate::protocol::JsonRpcMessage;

/// The half handed to [`ProxyAdapter::forward`](crate::proxy::ProxyAdapter::forward).
pub struct ProxyEnd {
    /// Messages from the HTTP client, bound for the backend.
    pub inbound: mpsc::Receiver<JsonRpcMessage>,
    /// Messages from the backend, bound for the HTTP client.
    pub outbound: mpsc::Sender<JsonRpcMessage>,
}

/// The half kept by the transport binding.
pub struct TransportEnd {
    pub tx: mpsc::Sender<JsonRpcMessage>,
    pub rx: mpsc::Receiver<JsonRpcMessage>,
}

/// A connected pair. Dropping either half closes the matching direction
/// on the other.
pub fn duplex(capacity: usize) -> (ProxyEnd, TransportEnd) {
    let (client_tx, client_rx) = mpsc::channel(capacity.max(1));
    let (server_tx, server_rx) = mpsc::channel(capacity.max(1));
    (
        ProxyEnd {
            inbound: client_rx,
            outbound: server_tx,
        },
        TransportEnd {
            tx: client_tx,
            rx: server_rx,
        },
    )
}
