//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Mounted backends (default first, then named in config order)
//!     → router.rs (namespace checks, fail fast on collisions)
//!     → per backend: TransportKind::ALL bound under its MountPoint
//!         default → merged at the root
//!         named   → nested under /servers/<name>
//!     → /status
//!     → layers: CORS (if configured), request id, trace
//! ```
//!
//! # Design Decisions
//! - Routes compiled at startup, immutable at runtime
//! - A collision is a startup error, never a request-time surprise
//! - CORS applies uniformly to every route, status included

pub mod router;

pub use router::{GatewayRouter, MountedBackend, RouteError};
