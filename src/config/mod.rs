//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! CLI flags ──────────────→ GatewaySettings (listener, CORS, timeouts)
//!
//! CLI default command ──┐
//! --named-server ───────┼─→ Vec<BackendSpec>
//! named-server JSON ────┘     → validation.rs (names, reserved, collisions)
//!                             → LifecycleCoordinator
//! ```
//!
//! # Design Decisions
//! - `BackendSpec` is immutable once built; the coordinator only reads it
//! - Malformed entries in the JSON file are dropped one by one with a
//!   warning; only a malformed document is fatal
//! - Disabled entries are dropped at load time, never reach the coordinator
//! - A backend with a bad name or command is skipped on its own; only
//!   namespace collisions stop startup

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_named_backends, parse_named_backends, ConfigError};
pub use schema::{
    BackendDefaults, BackendSpec, CorsConfig, GatewaySettings, ListenerConfig,
    ObservabilityConfig, TransportConfig, DEFAULT_INSTANCE_LABEL,
};
pub use validation::{validate_spec, validate_specs, ValidationError};
