//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (coordinator.rs):
//!     specs → validate → spawn each backend (default first, then named in order)
//!           → push close → bind ProxyAdapter → push stop
//!           → GatewayRouter → push "trigger + wait for transport tasks"
//!
//! Shutdown:
//!     signal (signals.rs) or caller → Shutdown::trigger (shutdown.rs)
//!     → server drains → ResourceStack::unwind (resources.rs), newest first
//! ```
//!
//! # Design Decisions
//! - A backend that fails to spawn is logged and skipped; startup only
//!   fails when nothing could be started
//! - Every release action is bounded by a timeout; shutdown never hangs
//! - No global state: the coordinator owns the `GatewayContext`

pub mod coordinator;
pub mod resources;
pub mod shutdown;
pub mod signals;

pub use coordinator::{LifecycleCoordinator, RunningGateway, StartupError};
pub use resources::ResourceStack;
pub use shutdown::Shutdown;
pub use signals::shutdown_signal;
