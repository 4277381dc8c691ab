//! Startup composition, status reporting and shutdown guarantees.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::http::StatusCode;
use chrono::DateTime;
use mcp_gateway::backend::BackendState;
use mcp_gateway::config::parse_named_backends;
use mcp_gateway::http::StatusSnapshot;
use mcp_gateway::transport::MCP_SESSION_ID_HEADER;
use serde_json::json;

mod common;

use common::{client, missing, responder, SseReader, TestGateway, SED_RESPONDER};

async fn status(gateway: &TestGateway) -> StatusSnapshot {
    let response = client().get(gateway.url("/status")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    response.json().await.unwrap()
}

#[tokio::test]
async fn test_config_file_backends_are_mounted_by_name_only() {
    let doc = json!({
        "mcpServers": {
            "echo": {"command": "sed", "args": ["-u", "-e", SED_RESPONDER]},
            "off": {"command": "x", "enabled": false},
            "broken": {"args": ["no command"]}
        }
    })
    .to_string();
    let specs = parse_named_backends(&doc, &BTreeMap::new()).unwrap();
    assert_eq!(specs.len(), 1);

    let gateway = TestGateway::start(specs).await;
    assert_eq!(gateway.namespaces, vec!["/servers/echo".to_string()]);
    assert_eq!(gateway.backends.len(), 1);

    let http = client();
    let named = http
        .post(gateway.url("/servers/echo/mcp"))
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(named.status(), StatusCode::OK);

    for path in ["/mcp", "/sse", "/servers/off/mcp", "/servers/broken/mcp"] {
        let response = http.post(gateway.url(path)).body("{}").send().await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", path);
    }

    let snapshot = status(&gateway).await;
    assert_eq!(snapshot.server_instances.len(), 1);
    assert_eq!(snapshot.server_instances["echo"], "configured");

    gateway.stop().await;
}

#[tokio::test]
async fn test_invalid_config_entry_is_skipped_and_siblings_start() {
    let doc = json!({
        "mcpServers": {
            "status": {"command": "sed", "args": ["-u", "-e", SED_RESPONDER]},
            "good": {"command": "sed", "args": ["-u", "-e", SED_RESPONDER]}
        }
    })
    .to_string();
    let specs = parse_named_backends(&doc, &BTreeMap::new()).unwrap();
    assert_eq!(specs.len(), 2);

    let gateway = TestGateway::start(specs).await;
    assert_eq!(gateway.namespaces, vec!["/servers/good".to_string()]);
    assert_eq!(gateway.failed, vec!["status".to_string()]);

    let response = client()
        .post(gateway.url("/servers/good/mcp"))
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The reserved name still answers as the status route, not as a backend.
    let snapshot = status(&gateway).await;
    assert_eq!(snapshot.server_instances.len(), 1);
    assert!(snapshot.server_instances.contains_key("good"));

    gateway.stop().await;
}

#[tokio::test]
async fn test_spawn_failure_is_isolated() {
    let gateway = TestGateway::start(vec![missing("ghost"), responder(Some("alive"))]).await;
    assert_eq!(gateway.failed, vec!["ghost".to_string()]);

    let snapshot = status(&gateway).await;
    assert!(!snapshot.server_instances.contains_key("ghost"));
    assert!(snapshot.server_instances.contains_key("alive"));

    let response = client()
        .post(gateway.url("/servers/alive/mcp"))
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let ghost = client()
        .post(gateway.url("/servers/ghost/mcp"))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(ghost.status(), StatusCode::NOT_FOUND);

    gateway.stop().await;
}

#[tokio::test]
async fn test_status_timestamp_never_goes_backwards() {
    let gateway = TestGateway::start(vec![responder(None)]).await;
    let http = client();

    let mut previous = DateTime::parse_from_rfc3339(&status(&gateway).await.api_last_activity).unwrap();
    for n in 0..5 {
        http.post(gateway.url("/mcp"))
            .json(&json!({"jsonrpc": "2.0", "id": n, "method": "initialize", "params": {}}))
            .send()
            .await
            .unwrap();
        let snapshot = status(&gateway).await;
        assert!(snapshot.api_last_activity.ends_with("+00:00"));
        let current = DateTime::parse_from_rfc3339(&snapshot.api_last_activity).unwrap();
        assert!(current >= previous);
        previous = current;
    }

    gateway.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_every_backend_with_open_streams() {
    let gateway = TestGateway::start(vec![responder(None), responder(Some("a")), responder(Some("b"))]).await;
    let http = client();

    let sse = http.get(gateway.url("/servers/a/sse")).send().await.unwrap();
    let mut reader = SseReader::new(sse);
    assert_eq!(reader.next_event().await.event, "endpoint");

    let init = http
        .post(gateway.url("/servers/b/mcp"))
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}))
        .send()
        .await
        .unwrap();
    let session = init.headers()[MCP_SESSION_ID_HEADER].to_str().unwrap().to_string();
    let standalone = http
        .get(gateway.url("/servers/b/mcp"))
        .header(MCP_SESSION_ID_HEADER, &session)
        .send()
        .await
        .unwrap();
    assert_eq!(standalone.status(), StatusCode::OK);

    let pids: Vec<u32> = gateway.backends.iter().filter_map(|b| b.pid()).collect();
    assert_eq!(pids.len(), 3);
    let ctx = gateway.ctx.clone();

    let backends = tokio::time::timeout(Duration::from_secs(20), gateway.stop())
        .await
        .expect("shutdown did not finish");
    assert!(backends.iter().all(|b| b.state() == BackendState::Closed));
    assert!(ctx.sessions.is_empty());
    assert_eq!(ctx.shutdown.active_tasks(), 0);

    #[cfg(target_os = "linux")]
    for pid in pids {
        assert!(
            !std::path::Path::new(&format!("/proc/{}", pid)).exists(),
            "backend {} still running",
            pid
        );
    }
}
