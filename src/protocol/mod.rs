//! JSON-RPC envelope handling.
//!
//! # Data Flow
//! ```text
//! backend stdout (one JSON value per line)
//!     → framing.rs (line split, decode)
//!     → message.rs (JsonRpcMessage, classify)
//!     → proxy adapter (route by kind / id)
//!
//! proxy adapter
//!     → framing.rs (encode, newline, flush)
//!     → backend stdin
//! ```
//!
//! # Design Decisions
//! - The gateway never validates message schemas; it only reads the
//!   envelope fields it needs for routing (`id`, `method`, `result`, `error`)
//! - Messages stay as `serde_json::Value` end to end so unknown fields survive

pub mod framing;
pub mod message;

pub use message::{JsonRpcMessage, MessageKind, RequestId};

/// Protocol revision announced by the gateway during the backend handshake.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// Standard JSON-RPC error codes used by the gateway.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Implementation-defined: the backend went away before answering.
    pub const BACKEND_CLOSED: i64 = -32000;
}
