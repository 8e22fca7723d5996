//! `VigilServer`: Axum HTTP + WebSocket server.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use vigil_auth::{AuthError, ChannelAuthorizer, JwtAuthenticator, TokenSource, extract_token};
use vigil_bus::{Bus, EventPublisher, SyncConfig, Synchronizer};
use vigil_core::{Channel, InstanceId};

use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::metrics;
use crate::shutdown::ShutdownCoordinator;
use crate::stats::{MetricsSnapshot, WsMetrics};
use crate::websocket::connection::ClientConnection;
use crate::websocket::connection_log;
use crate::websocket::handler::SessionContext;
use crate::websocket::heartbeat;
use crate::websocket::registry::{self, RegistryHandle};
use crate::websocket::session::{SessionTiming, run_session};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<ServerConfig>,
    session: SessionContext,
    authenticator: Arc<JwtAuthenticator>,
    sync: Arc<Synchronizer>,
    connection_slots: Arc<Semaphore>,
    prometheus: PrometheusHandle,
    start_time: Instant,
}

/// One server instance (replica).
pub struct VigilServer {
    config: Arc<ServerConfig>,
    instance_id: InstanceId,
    registry: RegistryHandle,
    sync: Arc<Synchronizer>,
    authenticator: Arc<JwtAuthenticator>,
    authorizer: ChannelAuthorizer,
    metrics: Arc<WsMetrics>,
    connection_slots: Arc<Semaphore>,
    prometheus: PrometheusHandle,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    listening: AtomicBool,
}

impl VigilServer {
    /// Build a server and start its background tasks: the registry actor,
    /// the health monitor and, when `bus` is set, the bus subscriber and
    /// health check. Must be called inside a Tokio runtime.
    ///
    /// `prometheus` is the handle from [`metrics::install_recorder`]; pass
    /// `None` to render from a detached recorder instead.
    pub fn new(
        config: ServerConfig,
        authenticator: JwtAuthenticator,
        authorizer: ChannelAuthorizer,
        bus: Option<Arc<dyn Bus>>,
        sync_config: SyncConfig,
        prometheus: Option<PrometheusHandle>,
    ) -> Self {
        let config = Arc::new(config);
        let instance_id = InstanceId::new();
        let ws_metrics = Arc::new(WsMetrics::new());
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let connection_slots = Arc::new(Semaphore::new(config.max_connections.min(Semaphore::MAX_PERMITS)));

        let (actor, registry) = registry::channel(Arc::clone(&ws_metrics), config.stale_after());
        let sync = Arc::new(Synchronizer::new(
            instance_id.clone(),
            bus,
            Arc::new(registry.clone()),
            sync_config,
        ));

        shutdown.track(tokio::spawn(actor.run(shutdown.token())));
        shutdown.track(tokio::spawn(heartbeat::run_monitor(
            registry.clone(),
            config.heartbeat_interval(),
            shutdown.token(),
        )));
        shutdown.track_all(sync.spawn(&shutdown.token()));

        info!(
            instance_id = %instance_id,
            bus_enabled = sync.bus_enabled(),
            "server instance created"
        );

        Self {
            config,
            instance_id,
            registry,
            sync,
            authenticator: Arc::new(authenticator),
            authorizer,
            metrics: ws_metrics,
            connection_slots,
            prometheus: prometheus.unwrap_or_else(metrics::detached_handle),
            shutdown,
            start_time: Instant::now(),
            listening: AtomicBool::new(false),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            config: Arc::clone(&self.config),
            session: SessionContext {
                registry: self.registry.clone(),
                authorizer: self.authorizer.clone(),
                metrics: Arc::clone(&self.metrics),
            },
            authenticator: Arc::clone(&self.authenticator),
            sync: Arc::clone(&self.sync),
            connection_slots: Arc::clone(&self.connection_slots),
            prometheus: self.prometheus.clone(),
            start_time: self.start_time,
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(prometheus_handler))
            .route("/ws/metrics", get(ws_metrics_handler))
            .route("/ws/channels/{channel}", get(channel_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind and serve in the background. Returns the bound address.
    pub async fn listen(&self) -> Result<SocketAddr, ServerError> {
        if self.listening.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyStarted);
        }
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr: addr.clone(), source })?;
        let local = listener.local_addr()?;

        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();
        let cancel = self.shutdown.token();
        self.shutdown.track(tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                cancel.cancelled().await;
            });
            if let Err(e) = serve.await {
                warn!(error = %e, "http server exited with error");
            }
        }));

        info!(addr = %local, instance_id = %self.instance_id, "vigil server listening");
        Ok(local)
    }

    /// Cancel everything and wait for background tasks. Every connection is
    /// closed; queued-but-unsent messages are discarded.
    pub async fn shutdown_gracefully(&self) -> bool {
        info!(instance_id = %self.instance_id, "shutting down");
        self.shutdown.drain(self.config.shutdown_timeout()).await
    }

    /// Typed publishing handle for event producers.
    pub fn publisher(&self) -> EventPublisher {
        EventPublisher::new(Arc::clone(&self.sync))
    }

    /// Cross-instance synchronizer.
    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.sync
    }

    /// Registry handle.
    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    /// This replica's identity.
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Current `/ws/metrics` snapshot.
    pub fn ws_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Extractors
// ─────────────────────────────────────────────────────────────────────────────

/// Best-effort client address: `X-Forwarded-For`, `X-Real-IP`, then the
/// socket peer.
struct RemoteAddr(Option<String>);

impl<S: Send + Sync> FromRequestParts<S> for RemoteAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header_value = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.split(',').next().unwrap_or(v).trim().to_owned())
                .filter(|v| !v.is_empty())
        };
        let addr = header_value("x-forwarded-for")
            .or_else(|| header_value("x-real-ip"))
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.to_string())
            });
        Ok(Self(addr))
    }
}

#[derive(Debug, Default, Deserialize)]
struct WsParams {
    token: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

fn unauthorized(state: &AppState, remote: Option<&str>, error: &AuthError) -> Response {
    state.session.metrics.record_auth_error("authentication");
    connection_log::authentication_error(None, remote, error);
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "Authentication failed", "detail": error.to_string() })),
    )
        .into_response()
}

/// GET /ws
async fn ws_handler(
    State(state): State<AppState>,
    RemoteAddr(remote): RemoteAddr,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let header_str = |name: header::HeaderName| headers.get(name).and_then(|v| v.to_str().ok());
    let Some(extracted) = extract_token(
        params.token.as_deref(),
        header_str(header::AUTHORIZATION),
        header_str(header::SEC_WEBSOCKET_PROTOCOL),
    ) else {
        return unauthorized(&state, remote.as_deref(), &AuthError::MissingToken);
    };

    let credential = match state.authenticator.authenticate(&extracted.token) {
        Ok(credential) => credential,
        Err(e) => return unauthorized(&state, remote.as_deref(), &e),
    };

    // The slot is held until the session ends, so a burst of upgrades
    // cannot race past the limit while the registry catches up.
    let Ok(slot) = Arc::clone(&state.connection_slots).try_acquire_owned() else {
        let max = state.config.max_connections;
        warn!(max, "connection limit reached, refusing upgrade");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "Server at capacity" })),
        )
            .into_response();
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let mut ws = ws.max_message_size(state.config.max_message_size);
    if let TokenSource::Protocol(entry) = extracted.source {
        ws = ws.protocols([entry]);
    }

    let capacity = state.config.send_queue_capacity.max(1);
    let timing = SessionTiming {
        write_timeout: state.config.write_timeout(),
        tick: state.config.heartbeat_interval(),
        reauth_grace: state.config.reauth_grace(),
    };
    let ctx = state.session.clone();
    ws.on_upgrade(move |socket| async move {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = Arc::new(ClientConnection::new(
            credential.principal,
            credential.expires_at,
            remote,
            tx,
        ));
        run_session(socket, conn, rx, ctx, timing).await;
        drop(slot);
    })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.session.registry.connection_count(),
        state.sync.bus_enabled(),
        state.sync.is_connected(),
        state.sync.instance_id().as_str(),
    ))
}

/// GET /metrics
async fn prometheus_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(&state.prometheus),
    )
}

/// GET /ws/metrics
async fn ws_metrics_handler(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.session.metrics.snapshot())
}

/// GET /ws/channels/{channel}
async fn channel_handler(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let channel = match Channel::parse(&name) {
        Ok(channel) => channel,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid channel format: {e}") })),
            )
                .into_response();
        }
    };
    let subscribers = state.session.registry.subscribers(channel.as_str()).await;
    Json(json!({
        "channel": channel.as_str(),
        "subscriber_count": subscribers.len(),
        "subscribers": subscribers,
        "instance_id": state.sync.instance_id(),
    }))
    .into_response()
}
