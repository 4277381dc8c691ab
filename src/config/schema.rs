//! Configuration schema definitions.
//!
//! `GatewaySettings` covers the HTTP side of the gateway; `BackendSpec`
//! describes one stdio backend process.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Label used for the unnamed backend in logs and in `/status`.
pub const DEFAULT_INSTANCE_LABEL: &str = "default";

/// One backend process definition.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BackendSpec {
    /// `None` for the default backend mounted at the root.
    pub name: Option<String>,

    /// Executable to spawn.
    pub command: String,

    /// Arguments, in order.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment layered over the gateway's minimal inherited set.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory. `None` inherits the gateway's.
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl BackendSpec {
    pub fn new(name: Option<String>, command: impl Into<String>) -> Self {
        Self {
            name,
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            enabled: true,
        }
    }

    /// Name used in logs, metrics and the status route.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_INSTANCE_LABEL)
    }

    pub fn is_default(&self) -> bool {
        self.name.is_none()
    }

    /// `command arg1 arg2 ...`, for log lines.
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Root settings for the gateway process.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewaySettings {
    /// Listener configuration (bind host and port).
    pub listener: ListenerConfig,

    /// Cross-origin policy applied to every route.
    pub cors: CorsConfig,

    /// Backend process handling.
    pub backends: BackendDefaults,

    /// Transport tuning.
    pub transport: TransportConfig,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub bind_host: String,

    /// `0` asks the OS for an ephemeral port.
    pub port: u16,
}

impl ListenerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            port: 0,
        }
    }
}

/// CORS configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct CorsConfig {
    /// `None` disables the CORS layer. `"*"` allows any origin.
    pub allow_origins: Option<Vec<String>>,
}

/// Backend process settings shared by every backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendDefaults {
    /// Upper bound on the initialize exchange after spawn.
    pub handshake_timeout_secs: u64,

    /// How long a backend gets to exit after stdin closes before it is killed.
    /// Also bounds how long shutdown waits for pump tasks.
    pub shutdown_grace_secs: u64,

    /// Capacity of the per-backend and per-conversation message channels.
    pub channel_capacity: usize,
}

impl Default for BackendDefaults {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 30,
            shutdown_grace_secs: 5,
            channel_capacity: 64,
        }
    }
}

/// Transport tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Interval for SSE keep-alive comments. `0` disables them.
    pub sse_keep_alive_secs: u64,

    /// Serve every streamable HTTP request as its own conversation, without
    /// session ids.
    pub stateless: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            sse_keep_alive_secs: 15,
            stateless: false,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Verbose logging.
    pub debug: bool,

    /// Prometheus exporter address. `None` leaves metrics unexported.
    pub metrics_address: Option<String>,
}
