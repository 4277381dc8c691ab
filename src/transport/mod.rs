//! HTTP transport bindings.
//!
//! # Data Flow
//! ```text
//! EventStream (sse.rs):
//!     GET  {prefix}/sse                 → new duplex channel → ProxyAdapter::forward
//!     POST {prefix}/messages/?session_id → that connection's channel
//!
//! MultiplexedSession (streamable.rs):
//!     *    {prefix}/mcp  (mcp-session-id header)
//!         known id     → existing session
//!         no id (POST) → creation lock → join a session whose creating
//!                        request is still in flight, or create → forward
//!         unknown id   → 400, registry untouched
//!     stateless mode: every POST gets a throwaway session, no header
//! ```
//!
//! # Design Decisions
//! - Transport kind is a closed enum; each variant knows how to bind an
//!   adapter into a route set
//! - Every binding touches `GatewayStatus` before doing anything else

pub mod channel;
pub mod sse;
pub mod streamable;

use std::sync::Arc;

use axum::Router;

use crate::context::GatewayContext;
use crate::proxy::ProxyAdapter;

pub use channel::{duplex, ProxyEnd, TransportEnd};
pub use streamable::{MultiplexedSession, SessionRegistry, MCP_SESSION_ID_HEADER};

/// Path prefix under which named backends are mounted.
pub const NAMED_PREFIX: &str = "/servers";

/// Where a backend's routes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    name: Option<String>,
}

impl MountPoint {
    pub fn root() -> Self {
        Self { name: None }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// `""` for the root, `/servers/<name>` otherwise.
    pub fn prefix(&self) -> String {
        match &self.name {
            Some(name) => format!("{}/{}", NAMED_PREFIX, name),
            None => String::new(),
        }
    }

    /// Absolute path of `suffix` under this mount point.
    pub fn path(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix(), suffix)
    }
}

/// The two HTTP encodings a backend is exposed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// One SSE connection per conversation, no session id.
    EventStream,
    /// Header-identified sessions shared by many HTTP requests.
    MultiplexedSession,
}

impl TransportKind {
    pub const ALL: [TransportKind; 2] = [TransportKind::EventStream, TransportKind::MultiplexedSession];

    /// Routes for this transport, relative to `mount`.
    pub fn bind(&self, adapter: Arc<ProxyAdapter>, ctx: &GatewayContext, mount: &MountPoint) -> Router {
        match self {
            TransportKind::EventStream => sse::routes(adapter, ctx.clone(), mount.clone()),
            TransportKind::MultiplexedSession => streamable::routes(adapter, ctx.clone()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransportKind::EventStream => "sse",
            TransportKind::MultiplexedSession => "streamable-http",
        }
    }
}
