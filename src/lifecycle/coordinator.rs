//! Startup and shutdown ordering for every backend and its routes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;

use crate::backend::{BackendSession, SpawnOptions};
use crate::config::{validate_spec, validate_specs, BackendSpec, GatewaySettings, ValidationError};
use crate::context::GatewayContext;
use crate::http::{GatewayServer, ServerError};
use crate::observability::metrics;
use crate::proxy::{ForwardError, ProxyAdapter};
use crate::routing::{GatewayRouter, MountedBackend, RouteError};

use super::resources::ResourceStack;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("no backends configured")]
    NoBackends,

    #[error(
        "invalid backend configuration: {}",
        .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
    )]
    InvalidBackends(Vec<ValidationError>),

    #[error("none of the {0} configured backends could be started")]
    NoUsableBackends(usize),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Forward(#[from] ForwardError),
}

/// Brings a set of backends up in order and hands back a [`RunningGateway`].
pub struct LifecycleCoordinator {
    ctx: GatewayContext,
    resources: ResourceStack,
    backends: Vec<Arc<BackendSession>>,
    mounted: Vec<MountedBackend>,
    failed: Vec<String>,
}

impl LifecycleCoordinator {
    pub fn new(settings: GatewaySettings) -> Self {
        let grace = Duration::from_secs(settings.backends.shutdown_grace_secs);
        Self {
            ctx: GatewayContext::new(settings),
            resources: ResourceStack::new(grace * 2 + Duration::from_secs(1)),
            backends: Vec::new(),
            mounted: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn context(&self) -> &GatewayContext {
        &self.ctx
    }

    /// Spawn every enabled backend and compose the route table.
    ///
    /// Backends with an unusable name or command, and backends that fail to
    /// spawn, are skipped and reported by [`RunningGateway::failed`]. Two
    /// backends claiming the same namespace stop startup. Anything acquired
    /// so far is released before an error is returned.
    pub async fn start(mut self, specs: Vec<BackendSpec>) -> Result<RunningGateway, StartupError> {
        let mut specs: Vec<BackendSpec> = specs.into_iter().filter(|spec| spec.enabled).collect();
        if specs.is_empty() {
            return Err(StartupError::NoBackends);
        }
        validate_specs(&specs).map_err(StartupError::InvalidBackends)?;
        let total = specs.len();

        let failed = &mut self.failed;
        specs.retain(|spec| match validate_spec(spec) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(backend = %spec.label(), error = %e, "Skipping backend with invalid configuration");
                failed.push(spec.label().to_string());
                false
            }
        });
        // Stable: named backends keep their configured order.
        specs.sort_by_key(|spec| !spec.is_default());

        let opts = SpawnOptions::from(&self.ctx.settings.backends);
        for spec in specs {
            if let Err(e) = self.acquire(spec, &opts).await {
                self.resources.unwind().await;
                return Err(e);
            }
        }

        if self.mounted.is_empty() {
            self.resources.unwind().await;
            return Err(StartupError::NoUsableBackends(total));
        }
        if !self.failed.is_empty() {
            tracing::warn!(
                failed = ?self.failed,
                started = self.mounted.len(),
                "Starting with a subset of the configured backends"
            );
        }

        let router = match GatewayRouter::build(&self.mounted, &self.ctx) {
            Ok(router) => router,
            Err(e) => {
                self.resources.unwind().await;
                return Err(e.into());
            }
        };

        // Last acquired, first released: stop transport tasks before adapters and backends.
        let shutdown = self.ctx.shutdown.clone();
        let grace = Duration::from_secs(self.ctx.settings.backends.shutdown_grace_secs);
        self.resources.push("transport tasks", move || async move {
            shutdown.trigger();
            if !shutdown.wait_for_tasks(grace).await {
                tracing::warn!(
                    remaining = shutdown.active_tasks(),
                    "Transport tasks still running after grace period"
                );
            }
        });

        let namespaces = router.namespaces().to_vec();
        Ok(RunningGateway {
            ctx: self.ctx,
            router: router.into_router(),
            namespaces,
            resources: self.resources,
            backends: self.backends,
            failed: self.failed,
        })
    }

    async fn acquire(&mut self, spec: BackendSpec, opts: &SpawnOptions) -> Result<(), StartupError> {
        let label = spec.label().to_string();
        let name = spec.name.clone();

        let session = match BackendSession::spawn(spec, opts).await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(backend = %label, error = %e, "Failed to start backend; skipping");
                metrics::record_spawn_failure(&label);
                self.failed.push(label);
                return Ok(());
            }
        };
        let closing = Arc::clone(&session);
        self.resources
            .push(format!("backend {}", label), move || async move { closing.close().await });

        let adapter = ProxyAdapter::new(Arc::clone(&session), self.ctx.shutdown.subscribe().child_token())?;
        let stopping = Arc::clone(&adapter);
        self.resources
            .push(format!("adapter {}", label), move || async move { stopping.stop().await });

        self.backends.push(session);
        self.mounted.push(MountedBackend { name, adapter });
        Ok(())
    }
}

/// A started gateway: backends up, routes composed, not yet serving.
pub struct RunningGateway {
    ctx: GatewayContext,
    router: Router,
    namespaces: Vec<String>,
    resources: ResourceStack,
    backends: Vec<Arc<BackendSession>>,
    failed: Vec<String>,
}

impl RunningGateway {
    pub fn context(&self) -> &GatewayContext {
        &self.ctx
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Mounted route namespaces, default first.
    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }

    /// Backends that started, in acquisition order.
    pub fn backends(&self) -> &[Arc<BackendSession>] {
        &self.backends
    }

    /// Labels of backends that failed to start.
    pub fn failed(&self) -> &[String] {
        &self.failed
    }

    /// Serve on `listener` until `signal` resolves or shutdown is triggered,
    /// then release everything.
    pub async fn serve<F>(mut self, listener: TcpListener, signal: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.ctx.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = signal => shutdown.trigger(),
                _ = shutdown.triggered() => {}
            }
        });

        let server = GatewayServer::new(self.router());
        let result = server.run(listener, self.ctx.shutdown.clone()).await;
        self.shutdown().await;
        result
    }

    /// Release every resource in reverse order. Safe to call twice.
    pub async fn shutdown(&mut self) {
        if self.resources.is_empty() {
            return;
        }
        tracing::info!(backends = self.backends.len(), "Shutting down gateway");
        self.ctx.shutdown.trigger();
        self.resources.unwind().await;
        tracing::info!("Gateway shutdown complete");
    }
}
