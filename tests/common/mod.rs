//! Shared utilities for gateway integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mcp_gateway::backend::BackendSession;
use mcp_gateway::config::{BackendSpec, GatewaySettings};
use mcp_gateway::http::ServerError;
use mcp_gateway::lifecycle::LifecycleCoordinator;
use mcp_gateway::GatewayContext;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// sed script that answers `{..."method":"m","params":P}` with
/// `{..."result":{"method":"m","params":P}}`. Lines without params echo back.
pub const SED_RESPONDER: &str =
    r#"s/"method":"\([^"]*\)","params":\(.*\)}$/"result":{"method":"\1","params":\2}}/"#;

/// A stdio backend that answers every request with its own method and params.
pub fn responder(name: Option<&str>) -> BackendSpec {
    let mut spec = BackendSpec::new(name.map(str::to_string), "sed");
    spec.args = vec!["-u".into(), "-e".into(), SED_RESPONDER.into()];
    spec
}

/// Like [`responder`], but takes `delay` to answer each line, so requests
/// stay in flight long enough to overlap.
pub fn slow_responder(name: Option<&str>, delay: &str) -> BackendSpec {
    let mut spec = BackendSpec::new(name.map(str::to_string), "sh");
    spec.args = vec![
        "-c".into(),
        r#"while IFS= read -r line; do sleep "$1"; printf '%s\n' "$line" | sed -e "$2"; done"#.into(),
        "slow-responder".into(),
        delay.into(),
        SED_RESPONDER.into(),
    ];
    spec
}

/// A backend whose executable does not exist.
pub fn missing(name: &str) -> BackendSpec {
    BackendSpec::new(Some(name.to_string()), "mcp-gateway-test-no-such-binary")
}

pub fn test_settings() -> GatewaySettings {
    let mut settings = GatewaySettings::default();
    settings.backends.handshake_timeout_secs = 10;
    settings.backends.shutdown_grace_secs = 1;
    settings.transport.sse_keep_alive_secs = 1;
    settings
}

/// A gateway serving on an ephemeral port.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub ctx: GatewayContext,
    pub backends: Vec<Arc<BackendSession>>,
    pub namespaces: Vec<String>,
    pub failed: Vec<String>,
    server: JoinHandle<Result<(), ServerError>>,
}

impl TestGateway {
    pub async fn start(specs: Vec<BackendSpec>) -> Self {
        Self::start_with(test_settings(), specs).await
    }

    pub async fn start_with(settings: GatewaySettings, specs: Vec<BackendSpec>) -> Self {
        let gateway = LifecycleCoordinator::new(settings)
            .start(specs)
            .await
            .expect("gateway failed to start");
        let ctx = gateway.context().clone();
        let backends = gateway.backends().to_vec();
        let namespaces = gateway.namespaces().to_vec();
        let failed = gateway.failed().to_vec();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(gateway.serve(listener, std::future::pending()));

        Self {
            addr,
            ctx,
            backends,
            namespaces,
            failed,
            server,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Trigger shutdown and wait for the server and every release to finish.
    pub async fn stop(self) -> Vec<Arc<BackendSession>> {
        self.ctx.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(15), self.server)
            .await
            .expect("shutdown hung")
            .expect("server task panicked")
            .expect("server error");
        self.backends
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// Minimal reader for a `text/event-stream` response body.
pub struct SseReader {
    response: reqwest::Response,
    buffer: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

impl SseReader {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            response,
            buffer: String::new(),
        }
    }

    /// Next event with a data field. Comments (keep-alives) are skipped.
    pub async fn next_event(&mut self) -> SseEvent {
        tokio::time::timeout(Duration::from_secs(10), self.read_event())
            .await
            .expect("timed out waiting for event")
    }

    /// Next `message` event decoded as JSON, skipping notifications.
    pub async fn next_response(&mut self) -> Value {
        loop {
            let event = self.next_event().await;
            if event.event != "message" {
                continue;
            }
            let value: Value = serde_json::from_str(&event.data).unwrap();
            if value.get("method").is_none() {
                return value;
            }
        }
    }

    async fn read_event(&mut self) -> SseEvent {
        loop {
            while let Some(end) = self.buffer.find("\n\n") {
                let block: String = self.buffer.drain(..end + 2).collect();
                if let Some(event) = parse_block(&block) {
                    return event;
                }
            }
            let chunk = self
                .response
                .chunk()
                .await
                .expect("stream error")
                .expect("stream ended");
            self.buffer
                .push_str(&String::from_utf8_lossy(&chunk).replace("\r\n", "\n"));
        }
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = String::from("message");
    let mut data: Option<String> = None;
    for line in block.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event = rest.trim_start().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            let rest = rest.strip_prefix(' ').unwrap_or(rest);
            match &mut data {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(rest);
                }
                None => data = Some(rest.to_string()),
            }
        }
    }
    data.map(|data| SseEvent { event, data })
}
