//! Gateway activity status and the `/status` route.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwap;
use axum::extract::State;
use axum::Json;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// State label reported for every mounted backend.
pub const INSTANCE_CONFIGURED: &str = "configured";

/// Last activity time and the mounted backend instances.
///
/// Written concurrently by every transport; the timestamp only moves forward.
pub struct GatewayStatus {
    last_activity: ArcSwap<DateTime<Utc>>,
    instances: RwLock<BTreeMap<String, String>>,
}

/// Body of `GET /status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub api_last_activity: String,
    pub server_instances: BTreeMap<String, String>,
}

impl GatewayStatus {
    pub fn new() -> Self {
        Self {
            last_activity: ArcSwap::from_pointee(Utc::now()),
            instances: RwLock::new(BTreeMap::new()),
        }
    }

    /// Record activity now.
    pub fn touch(&self) {
        let now = Utc::now();
        self.last_activity
            .rcu(|current| Arc::new((**current).max(now)));
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        **self.last_activity.load()
    }

    pub fn set_instance(&self, label: &str, state: &str) {
        let mut instances = self
            .instances
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        instances.insert(label.to_string(), state.to_string());
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let instances = self
            .instances
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        StatusSnapshot {
            api_last_activity: self
                .last_activity()
                .to_rfc3339_opts(SecondsFormat::Micros, false),
            server_instances: instances,
        }
    }
}

impl Default for GatewayStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// GET /status
pub async fn status_handler(State(status): State<Arc<GatewayStatus>>) -> Json<StatusSnapshot> {
    Json(status.snapshot())
}
