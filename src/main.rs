//! MCP stdio gateway.
//!
//! ```text
//!                    ┌──────────────────────────── mcp-gateway ────────────────────────────┐
//!   GET  /sse        │  routing        transport              proxy            backend       │
//!   POST /messages/ ─┼─▶ /status  ──▶ EventStream ────┐                                     │
//!   *    /mcp        │   /        ──▶ Multiplexed ────┼──▶ ProxyAdapter ──▶ BackendSession ─┼──▶ stdio server
//!   /servers/<name>/…│   /servers/…                   │   (id remap,       (spawn, stdin/   │
//!                    │                 SessionRegistry┘    demux)           stdout, close)  │
//!                    │                                                                      │
//!                    │  lifecycle: ordered spawn, reverse-order release on shutdown         │
//!                    └──────────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;

use clap::{CommandFactory, Parser};

use mcp_gateway::cli::{Cli, CliError};
use mcp_gateway::http::GatewayServer;
use mcp_gateway::lifecycle::{shutdown_signal, LifecycleCoordinator};
use mcp_gateway::observability::{logging, metrics};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init(cli.debug);

    tracing::info!("mcp-gateway v{} starting", env!("CARGO_PKG_VERSION"));

    let specs = match cli.build_specs() {
        Ok(specs) => specs,
        Err(CliError::NoBackends) => {
            let _ = Cli::command().print_help();
            tracing::error!("{}", CliError::NoBackends);
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!(error = %e, "Configuration error");
            std::process::exit(1);
        }
    };
    let settings = cli.settings();

    if let Some(address) = &settings.observability.metrics_address {
        match address.parse::<SocketAddr>() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics exporter");
                }
            }
            Err(_) => {
                tracing::error!(metrics_address = %address, "Failed to parse metrics address");
            }
        }
    }

    let bind_address = settings.listener.bind_address();
    let gateway = match LifecycleCoordinator::new(settings).start(specs).await {
        Ok(gateway) => gateway,
        Err(e) => {
            tracing::error!(error = %e, "Gateway failed to start");
            std::process::exit(1);
        }
    };

    let listener = match GatewayServer::bind(&bind_address).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "Failed to bind listener");
            let mut gateway = gateway;
            gateway.shutdown().await;
            std::process::exit(1);
        }
    };
    let local_addr = listener.local_addr()?;
    if gateway.context().settings.transport.stateless {
        tracing::info!("Streamable HTTP is stateless; no session ids are issued");
    }
    for namespace in gateway.namespaces() {
        let base = namespace.trim_end_matches('/');
        tracing::info!(
            sse = %format!("http://{}{}/sse", local_addr, base),
            streamable = %format!("http://{}{}/mcp", local_addr, base),
            "Serving backend"
        );
    }

    gateway.serve(listener, shutdown_signal()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
