//! HTTP surface subsystem.
//!
//! # Data Flow
//! ```text
//! TCP listener
//!     → server.rs (axum::serve, graceful stop on the shutdown token)
//!     → routing::GatewayRouter (status route + per-backend transports)
//!     → status.rs (GET /status)
//! ```

pub mod server;
pub mod status;

pub use server::{GatewayServer, ServerError};
pub use status::{GatewayStatus, StatusSnapshot, INSTANCE_CONFIGURED};
