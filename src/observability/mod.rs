//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured tracing events, request-id carrying spans)
//!     → metrics.rs (counters and gauges keyed by backend)
//!
//! Consumers:
//!     → stderr (fmt layer, filtered by RUST_LOG or --debug)
//!     → Prometheus scrape endpoint (only with --metrics-address)
//! ```
//!
//! # Design Decisions
//! - Metric updates are no-ops until an exporter is installed
//! - Labels are backend labels (`default` or the configured name)

pub mod logging;
pub mod metrics;
