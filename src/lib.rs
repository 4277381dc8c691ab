//! MCP stdio gateway library.
//!
//! Spawns stdio MCP servers and exposes each one over SSE and streamable
//! HTTP, the default server at the root and named servers under
//! `/servers/<name>/`.

// Core subsystems
pub mod backend;
pub mod config;
pub mod protocol;
pub mod proxy;
pub mod transport;

// HTTP surface
pub mod http;
pub mod routing;

// Cross-cutting concerns
pub mod cli;
pub mod context;
pub mod lifecycle;
pub mod observability;

pub use backend::{BackendSession, BackendState};
pub use config::{BackendSpec, GatewaySettings};
pub use context::GatewayContext;
pub use lifecycle::{LifecycleCoordinator, RunningGateway, Shutdown, StartupError};
pub use proxy::ProxyAdapter;
pub use routing::GatewayRouter;
pub use transport::TransportKind;
