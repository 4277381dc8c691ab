//! Explicit gateway context.
//!
//! Every component that registers a task, updates status or touches the
//! session registry gets this passed in. There are no process-wide
//! singletons.

use std::sync::Arc;

use crate::config::GatewaySettings;
use crate::http::status::GatewayStatus;
use crate::lifecycle::Shutdown;
use crate::transport::streamable::SessionRegistry;

/// Shared, cheaply clonable handle to gateway-wide state.
#[derive(Clone)]
pub struct GatewayContext {
    pub settings: Arc<GatewaySettings>,
    pub shutdown: Shutdown,
    pub status: Arc<GatewayStatus>,
    pub sessions: Arc<SessionRegistry>,
}

impl GatewayContext {
    pub fn new(settings: GatewaySettings) -> Self {
        Self {
            settings: Arc::new(settings),
            shutdown: Shutdown::new(),
            status: Arc::new(GatewayStatus::new()),
            sessions: Arc::new(SessionRegistry::new()),
        }
    }
}
