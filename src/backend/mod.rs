//! Backend process subsystem.
//!
//! # Data Flow
//! ```text
//! BackendSpec
//!     → session.rs: spawn (Command, piped stdio, kill_on_drop)
//!     → writer task: mpsc → framing → child stdin
//!     → reader task: child stdout → framing → mpsc
//!     → initialize handshake (result cached)
//!     → Ready; incoming receiver handed to exactly one ProxyAdapter
//!
//! close():
//!     stop writer (stdin EOF) → wait grace → kill → Closed
//! ```
//!
//! # Design Decisions
//! - A spawn failure is an error value for that backend only; the caller
//!   decides whether the gateway can still start
//! - `close()` is idempotent and always reaps the process
//! - The spawn environment starts empty plus a small inherited set, so
//!   secrets in the gateway's environment do not leak unless passed on purpose

pub mod session;

pub use session::{
    default_environment, BackendError, BackendSession, BackendState, ChannelPeer, SpawnError,
    SpawnOptions, INHERITED_ENV_VARS,
};
