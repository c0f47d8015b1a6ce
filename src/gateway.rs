//! Gateway assembly — discovery, the HTTP surface, and process lifecycle.
//!
//! One `Gateway` owns the discovered downstream set, the routing catalog,
//! the session registry, and the audit sink; the axum router exposes the
//! single wildcard route family `ALL /mcp/{serverName}` with unrestricted
//! cross-origin access. `GatewayHandle::stop()` is idempotent: it cancels
//! every downstream client, drops live sessions, and closes the listener.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{Request, Response};
use axum::routing::any;
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::audit::capture::capture_exchange;
use crate::audit::AuditSink;
use crate::catalog::RoutingCatalog;
use crate::config::{AuditConfig, ManifoldConfig};
use crate::discovery::discover;
use crate::downstream::{DownstreamHandle, DownstreamServer};
use crate::error::ManifoldError;
use crate::session::SessionRegistry;

/// A running gateway's shared state: immutable catalog, session registry,
/// audit sink, and the discovered downstream set.
pub struct Gateway {
    catalog: Arc<RoutingCatalog>,
    registry: Arc<SessionRegistry>,
    sink: Arc<dyn AuditSink>,
    downstreams: Vec<Arc<DownstreamServer>>,
    audit: AuditConfig,
    cancel: CancellationToken,
}

impl Gateway {
    /// Run discovery over the configured servers and assemble the gateway.
    ///
    /// All-or-nothing: any server's bootstrap failure propagates and nothing
    /// starts listening.
    pub async fn discover(
        config: ManifoldConfig,
        sink: Arc<dyn AuditSink>,
    ) -> crate::Result<Arc<Self>> {
        let cancel = CancellationToken::new();
        let downstreams = discover(&config, &cancel).await?;

        let handles: Vec<Arc<dyn DownstreamHandle>> = downstreams
            .iter()
            .map(|server| server.clone() as Arc<dyn DownstreamHandle>)
            .collect();
        let catalog = Arc::new(RoutingCatalog::build(handles));

        let registry = SessionRegistry::new(catalog.clone(), &config.session);
        registry.spawn_reaper(
            Duration::from_secs(config.session.reap_interval_secs),
            cancel.child_token(),
        );

        Ok(Arc::new(Self {
            catalog,
            registry,
            sink,
            downstreams,
            audit: config.audit,
            cancel,
        }))
    }

    pub fn catalog(&self) -> &Arc<RoutingCatalog> {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The axum application: one wildcard route family, permissive CORS.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/mcp/:server", any(handle_mcp))
            .layer(CorsLayer::permissive())
            .with_state(self.clone())
    }

    /// Bind the listener and start serving.
    pub async fn serve(self: Arc<Self>, addr: &str) -> crate::Result<GatewayHandle> {
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            ManifoldError::Transport("gateway".to_string(), format!("failed to bind {}: {}", addr, e))
        })?;
        let local_addr = listener.local_addr().map_err(|e| {
            ManifoldError::Transport("gateway".to_string(), e.to_string())
        })?;

        let app = self.router();
        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await
            {
                tracing::error!(error = %e, "gateway server error");
            }
        });

        tracing::info!(addr = %local_addr, "manifold gateway listening");
        Ok(GatewayHandle {
            gateway: self,
            local_addr,
            task: tokio::sync::Mutex::new(Some(task)),
            stopped: AtomicBool::new(false),
        })
    }
}

/// Handler for every request under `/mcp/{serverName}`.
///
/// Resolves or mints the session, then hands the exchange to the audit
/// capture proxy which replays it into the session transport.
async fn handle_mcp(
    State(gateway): State<Arc<Gateway>>,
    Path(server_name): Path<String>,
    request: Request<Body>,
) -> Response<Body> {
    let transport = match gateway
        .registry
        .resolve_or_create(request.headers(), &server_name)
        .await
    {
        Ok(transport) => Some(transport),
        Err(e) => {
            tracing::warn!(server = %server_name, error = %e, "no session transport available");
            None
        }
    };
    let session_hint = transport
        .as_ref()
        .map(|t| t.session_id().to_string())
        .unwrap_or_default();

    capture_exchange(
        gateway.sink.clone(),
        &gateway.audit,
        &server_name,
        transport,
        &session_hint,
        request,
    )
    .await
}

/// Handle to a serving gateway. `stop()` may be called any number of times.
pub struct GatewayHandle {
    gateway: Arc<Gateway>,
    local_addr: SocketAddr,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl GatewayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the gateway: close every downstream client, drop live sessions,
    /// then close the listening socket. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("stopping manifold gateway");

        // Cancellation cascades to downstream services, session reaper, and
        // the axum graceful shutdown.
        self.gateway.cancel.cancel();
        self.gateway.registry.shutdown().await;
        for server in &self.gateway.downstreams {
            server.close().await;
        }
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        tracing::info!("manifold gateway stopped");
    }
}
