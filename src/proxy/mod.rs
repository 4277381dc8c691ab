//! Protocol forwarding subsystem.
//!
//! # Data Flow
//! ```text
//! transport ProxyEnd ──forward()──→ id remap ──→ BackendSession stdin
//!
//! BackendSession stdout ──demux task──┬─ response      → owning conversation (id restored)
//!                                     ├─ notification  → every conversation
//!                                     └─ request       → most recently active conversation
//! ```
//!
//! # Design Decisions
//! - One adapter per backend; it is the only reader of the backend channel
//! - Each `forward()` call is an independent conversation with its own
//!   ordering; nothing is promised across conversations
//! - Client `initialize` is answered from the handshake result, so the
//!   backend is initialized exactly once however many clients connect
//! - Demux to conversation queues are unbounded so a slow client cannot
//!   stall the backend for everyone else

pub mod adapter;

pub use adapter::{ConversationId, ForwardError, ProxyAdapter};
