//! `XqwsServer`: axum HTTP + `WebSocket` server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::{Extension, Router};
use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};
use xqws_settings::XqwsSettings;

use crate::health::{self, HealthResponse};
use crate::query::{BoundFunction, QueryEvaluator, TextSerializer, ValueSerializer};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::session::run_ws_session;
use crate::websocket::{Connection, ConnectionRegistry, ProtocolContext, QueryBridge};

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Registry, bridge and settings shared by every session.
    pub ctx: Arc<ProtocolContext>,
    /// Serializer handed to new connections.
    pub serializer: Arc<dyn ValueSerializer>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Monotonic start time, for uptime.
    pub start_time: Instant,
    /// Wall-clock start time.
    pub started_at: DateTime<Utc>,
}

/// The messaging server.
pub struct XqwsServer {
    ctx: Arc<ProtocolContext>,
    serializer: Arc<dyn ValueSerializer>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    started_at: DateTime<Utc>,
}

impl XqwsServer {
    /// Create a server evaluating queries with `evaluator`.
    pub fn new(settings: XqwsSettings, evaluator: Arc<dyn QueryEvaluator>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let bridge = Arc::new(QueryBridge::new(evaluator, registry.clone()));
        Self {
            ctx: Arc::new(ProtocolContext {
                registry,
                bridge,
                settings: Arc::new(settings),
            }),
            serializer: Arc::new(TextSerializer),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Builder: replace the default [`TextSerializer`].
    #[must_use]
    pub fn with_serializer(mut self, serializer: Arc<dyn ValueSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Build the axum router.
    ///
    /// `WebSocket` clients connect on the configured path or any path below
    /// it; the exact path selects a bound route function.
    pub fn router(&self) -> Router {
        let state = AppState {
            ctx: self.ctx.clone(),
            serializer: self.serializer.clone(),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
            started_at: self.started_at,
        };
        let ws_path = self.ctx.settings.server.ws_path.as_str();
        let nested = format!("{}/{{*rest}}", ws_path.trim_end_matches('/'));

        Router::new()
            .route("/health", get(health_handler))
            .route(ws_path, get(ws_handler))
            .route(&nested, get(ws_handler))
            .with_state(state)
    }

    /// Bind the configured address and serve in a background task.
    ///
    /// Returns the bound address (useful with port `0`) and the task handle.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let server = &self.ctx.settings.server;
        let listener = TcpListener::bind((server.host.as_str(), server.port)).await?;
        let addr = listener.local_addr()?;
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let token = self.shutdown.token();

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "server error");
            }
        });
        info!(%addr, ws_path = %server.ws_path, "server listening");
        Ok((addr, handle))
    }

    /// Close all connections, abort jobs and wait for `handles`.
    pub async fn shutdown_gracefully(&self, handles: Vec<JoinHandle<()>>) {
        let timeout = Duration::from_secs(self.ctx.settings.server.shutdown_timeout_secs);
        self.shutdown
            .graceful_shutdown(&self.ctx.registry, &self.ctx.bridge, handles, Some(timeout))
            .await;
    }

    /// Live connections.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.ctx.registry
    }

    /// Query dispatch bridge.
    pub fn bridge(&self) -> &Arc<QueryBridge> {
        &self.ctx.bridge
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Effective settings.
    pub fn settings(&self) -> &XqwsSettings {
        &self.ctx.settings
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.started_at,
        state.ctx.registry.len(),
        state.ctx.bridge.active_jobs(),
        state.shutdown.is_shutting_down(),
    ))
}

/// GET on the `WebSocket` path: upgrade and run a session.
async fn ws_handler(
    State(state): State<AppState>,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let path = uri.path().to_owned();
    let remote = connect_info.map(|Extension(ConnectInfo(addr))| addr);
    let max_message_size = state.ctx.settings.server.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, path, remote, state))
}

async fn handle_socket(
    socket: WebSocket,
    path: String,
    remote: Option<SocketAddr>,
    state: AppState,
) {
    let ctx = state.ctx;
    let (tx, rx) = mpsc::channel(ctx.settings.server.send_queue_capacity);
    let connection = Connection::new(ctx.registry.next_id(), tx)
        .with_path(path)
        .with_remote_addr(remote)
        .with_serializer(state.serializer);
    if let Some(route) = ctx.settings.route_for(connection.path()) {
        connection.bind(BoundFunction {
            query: route.query.clone(),
            base_uri: route.base_uri.clone(),
        });
    }
    run_ws_session(socket, Arc::new(connection), rx, ctx).await;
}
