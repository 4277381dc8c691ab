//! Route table composition.

use std::collections::HashSet;
use std::sync::Arc;

use axum::http::{HeaderName, HeaderValue};
use axum::routing::get;
use axum::Router;
use thiserror::Error;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::config::validation::validate_name;
use crate::config::{CorsConfig, ValidationError};
use crate::context::GatewayContext;
use crate::http::status::{status_handler, INSTANCE_CONFIGURED};
use crate::proxy::ProxyAdapter;
use crate::transport::{MountPoint, TransportKind, MCP_SESSION_ID_HEADER};

/// Path of the gateway-wide status route.
pub const STATUS_PATH: &str = "/status";

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("route namespace '{0}' is claimed by more than one backend")]
    DuplicateNamespace(String),

    #[error("backend cannot be mounted: {0}")]
    InvalidName(#[from] ValidationError),
}

/// A backend ready to be exposed.
pub struct MountedBackend {
    /// `None` mounts at the root.
    pub name: Option<String>,
    pub adapter: Arc<ProxyAdapter>,
}

impl MountedBackend {
    pub fn mount_point(&self) -> MountPoint {
        match &self.name {
            Some(name) => MountPoint::named(name.clone()),
            None => MountPoint::root(),
        }
    }
}

/// The composed route table.
pub struct GatewayRouter {
    router: Router,
    namespaces: Vec<String>,
}

impl GatewayRouter {
    /// Validate every namespace, then bind each backend's transports.
    ///
    /// Also records each mounted backend in the gateway status.
    pub fn build(backends: &[MountedBackend], ctx: &GatewayContext) -> Result<Self, RouteError> {
        let mut seen = HashSet::new();
        for backend in backends {
            if let Some(name) = &backend.name {
                validate_name(name)?;
            }
            let namespace = namespace_of(&backend.mount_point());
            if !seen.insert(namespace.clone()) {
                return Err(RouteError::DuplicateNamespace(namespace));
            }
        }

        let mut app = Router::new().route(
            STATUS_PATH,
            get(status_handler).with_state(Arc::clone(&ctx.status)),
        );
        let mut namespaces = Vec::with_capacity(backends.len());

        for backend in backends {
            let mount = backend.mount_point();
            let routes = TransportKind::ALL
                .iter()
                .fold(Router::new(), |routes, kind| {
                    routes.merge(kind.bind(Arc::clone(&backend.adapter), ctx, &mount))
                });
            app = match mount.name() {
                None => app.merge(routes),
                Some(_) => app.nest(&mount.prefix(), routes),
            };

            let namespace = namespace_of(&mount);
            tracing::info!(
                backend = %backend.adapter.label(),
                namespace = %namespace,
                "Mounted backend routes"
            );
            ctx.status.set_instance(backend.adapter.label(), INSTANCE_CONFIGURED);
            namespaces.push(namespace);
        }

        if let Some(cors) = cors_layer(&ctx.settings.cors) {
            app = app.layer(cors);
        }
        let x_request_id = HeaderName::from_static("x-request-id");
        let app = app
            .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid));

        Ok(Self {
            router: app,
            namespaces,
        })
    }

    /// Mounted prefixes: `/` for the default backend, `/servers/<name>` otherwise.
    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }

    pub fn into_router(self) -> Router {
        self.router
    }
}

fn namespace_of(mount: &MountPoint) -> String {
    match mount.name() {
        Some(_) => mount.prefix(),
        None => "/".to_string(),
    }
}

fn cors_layer(config: &CorsConfig) -> Option<CorsLayer> {
    let origins = config.allow_origins.as_ref()?;
    let layer = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(MCP_SESSION_ID_HEADER)]);

    if origins.iter().any(|origin| origin == "*") {
        return Some(layer.allow_origin(Any));
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    Some(layer.allow_origin(AllowOrigin::list(allowed)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendSession, ChannelPeer};
    use crate::config::{BackendSpec, GatewaySettings};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use tower::ServiceExt;

    fn mounted(ctx: &GatewayContext, name: Option<&str>) -> (MountedBackend, ChannelPeer) {
        let (session, peer) = BackendSession::from_channel(
            BackendSpec::new(name.map(str::to_string), "in-process"),
            json!({}),
            8,
        );
        let adapter = ProxyAdapter::new(session, ctx.shutdown.subscribe().child_token()).unwrap();
        (
            MountedBackend {
                name: name.map(str::to_string),
                adapter,
            },
            peer,
        )
    }

    #[tokio::test]
    async fn test_namespaces_match_backends() {
        let ctx = GatewayContext::new(GatewaySettings::default());
        let (default, _p1) = mounted(&ctx, None);
        let (fetch, _p2) = mounted(&ctx, Some("fetch"));
        let router = GatewayRouter::build(&[default, fetch], &ctx).unwrap();

        assert_eq!(router.namespaces(), &["/".to_string(), "/servers/fetch".to_string()]);
        let instances = ctx.status.snapshot().server_instances;
        assert_eq!(instances.keys().collect::<Vec<_>>(), vec!["default", "fetch"]);
    }

    #[tokio::test]
    async fn test_duplicate_namespace_fails_fast() {
        let ctx = GatewayContext::new(GatewaySettings::default());
        let (a, _p1) = mounted(&ctx, Some("dup"));
        let (b, _p2) = mounted(&ctx, Some("dup"));
        let err = GatewayRouter::build(&[a, b], &ctx).err().unwrap();
        assert!(matches!(err, RouteError::DuplicateNamespace(ns) if ns == "/servers/dup"));
        assert!(ctx.status.snapshot().server_instances.is_empty());
    }

    #[tokio::test]
    async fn test_reserved_name_rejected() {
        let ctx = GatewayContext::new(GatewaySettings::default());
        let (status, _p) = mounted(&ctx, Some("status"));
        let err = GatewayRouter::build(&[status], &ctx).err().unwrap();
        assert!(matches!(err, RouteError::InvalidName(ValidationError::ReservedName(_))));
    }

    #[tokio::test]
    async fn test_named_backend_is_not_at_root() {
        let ctx = GatewayContext::new(GatewaySettings::default());
        let (echo, _p) = mounted(&ctx, Some("echo"));
        let app = GatewayRouter::build(&[echo], &ctx).unwrap().into_router();

        let root = app
            .clone()
            .oneshot(Request::post("/mcp").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(root.status(), StatusCode::NOT_FOUND);

        let status = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(status.status(), StatusCode::OK);
        assert!(status.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_cors_exposes_session_header() {
        let mut settings = GatewaySettings::default();
        settings.cors.allow_origins = Some(vec!["*".to_string()]);
        let ctx = GatewayContext::new(settings);
        let app = GatewayRouter::build(&[], &ctx).unwrap().into_router();

        let response = app
            .oneshot(
                Request::get("/status")
                    .header("origin", "http://example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
        assert!(response.headers()["access-control-expose-headers"]
            .to_str()
            .unwrap()
            .contains(MCP_SESSION_ID_HEADER));
    }
}
