use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{close_code, WebSocketUpgrade};
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use courier_broker::Brokers;
use courier_coord::{LockCoordinator, PresenceTracker, Roster};
use courier_core::{DomainEvent, OfferId, Role};
use courier_telemetry::DispatchMetrics;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::auth::IdentityResolver;
use crate::config::CourierConfig;
use crate::fanout::Fanout;
use crate::gateway::{Gateway, GatewaySettings};
use crate::health::{self, StatsResponse};
use crate::push::PushGateway;
use crate::registry::ConnectionRegistry;
use crate::relay;

pub const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";

const INTERNAL_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub push: PushGateway,
    pub brokers: Brokers,
    pub internal_token: Option<Arc<str>>,
    pub started: Instant,
}

impl AppState {
    /// Wire every component from configuration.
    pub fn new(
        config: &CourierConfig,
        brokers: Brokers,
        resolver: Arc<dyn IdentityResolver>,
        metrics: Arc<DispatchMetrics>,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        let prefix = config.broker.channel_prefix.as_str();
        let registry = Arc::new(ConnectionRegistry::new(config.server.max_send_queue));
        let fanout = Arc::new(Fanout::new(brokers.clone(), registry.clone(), prefix, metrics.clone()));
        let dispatch = &config.dispatch;

        let gateway = Arc::new(Gateway {
            registry,
            locks: Arc::new(LockCoordinator::new(
                brokers.clone(),
                dispatch.lock_ttl(),
                prefix,
                metrics.clone(),
            )),
            presence: Arc::new(PresenceTracker::new(
                brokers.clone(),
                dispatch.viewer_ttl(),
                prefix,
                metrics.clone(),
            )),
            roster: Arc::new(Roster::new(brokers.clone(), dispatch.roster_ttl(), prefix, metrics.clone())),
            fanout: fanout.clone(),
            resolver,
            metrics,
            tracker: tracker.clone(),
            shutdown,
            settings: GatewaySettings {
                heartbeat_interval: Duration::from_secs(config.server.heartbeat_interval_secs),
                idle_timeout: Duration::from_secs(config.server.idle_timeout_secs),
            },
        });

        Self {
            gateway,
            push: PushGateway::new(fanout, tracker),
            brokers,
            internal_token: config.internal_token.as_deref().map(Arc::from),
            started: Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let internal = Router::new()
        .route("/events", post(push_event))
        .route("/locks/{order_id}/release", post(release_lock))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_internal_token))
        .layer(TimeoutLayer::new(INTERNAL_REQUEST_TIMEOUT));

    Router::new()
        .route("/ws/driver/{token}", get(driver_ws))
        .route("/ws/user/{token}", get(user_ws))
        .route("/ws/stats", get(stats_handler))
        .route("/health", get(health_handler))
        .nest("/internal", internal)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(
    config: &CourierConfig,
    brokers: Brokers,
    resolver: Arc<dyn IdentityResolver>,
    metrics: Arc<DispatchMetrics>,
) -> Result<ServerHandle, std::io::Error> {
    let tracker = TaskTracker::new();
    let shutdown = CancellationToken::new();
    let state = AppState::new(
        config,
        brokers.clone(),
        resolver,
        metrics,
        tracker.clone(),
        shutdown.clone(),
    );
    let registry = state.gateway.registry.clone();

    relay::start(state.gateway.fanout.clone(), &tracker, shutdown.clone()).await;
    spawn_sweeper(brokers.clone(), &tracker, shutdown.clone());

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(
        port = local_addr.port(),
        host = %config.server.host,
        mode = %brokers.mode(),
        "Courier server started"
    );

    let server_token = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(server_token.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "HTTP server failed");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        token: shutdown,
        tracker,
        registry,
        server,
    })
}

/// Handle returned by `start()`. Keeps background tasks alive until
/// [`ServerHandle::shutdown`].
pub struct ServerHandle {
    pub port: u16,
    token: CancellationToken,
    tracker: TaskTracker,
    registry: Arc<ConnectionRegistry>,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting, close every connection, and wait up to `timeout` for
    /// tracked background work to finish.
    pub async fn shutdown(self, timeout: Duration) {
        tracing::info!(
            connections = self.registry.connection_count(),
            pending_tasks = self.tracker.len(),
            "Shutting down"
        );
        self.token.cancel();
        self.registry.close_all(close_code::AWAY, "Server shutting down");
        self.tracker.close();

        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            tracing::warn!(?timeout, remaining = self.tracker.len(), "Background tasks still running after timeout");
        }
        if tokio::time::timeout(timeout, self.server).await.is_err() {
            tracing::warn!(?timeout, "HTTP server did not stop in time");
        }
    }
}

/// Periodically drop expired entries from the local store.
fn spawn_sweeper(brokers: Brokers, tracker: &TaskTracker, shutdown: CancellationToken) {
    tracker.spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = brokers.local.sweep();
                    if removed > 0 {
                        tracing::debug!(removed, "Swept expired local state");
                    }
                }
            }
        }
    });
}

async fn driver_ws(ws: WebSocketUpgrade, Path(token): Path<String>, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| state.gateway.serve(socket, Role::Fulfiller, token))
}

async fn user_ws(ws: WebSocketUpgrade, Path(token): Path<String>, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| state.gateway.serve(socket, Role::Requester, token))
}

async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    let gateway = &state.gateway;
    let drivers = match gateway.roster.count(Role::Fulfiller).await {
        Some(n) => n,
        None => gateway.registry.count_local(Role::Fulfiller) as u64,
    };
    let users = match gateway.roster.count(Role::Requester).await {
        Some(n) => n,
        None => gateway.registry.count_local(Role::Requester) as u64,
    };

    Json(StatsResponse {
        active_drivers: drivers,
        active_users: users,
        total_connections: drivers + users,
        local_connections: gateway.registry.connection_count(),
        mode: state.brokers.mode(),
        metrics: gateway.metrics.snapshot(),
    })
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let broker_ok = state.brokers.shared.ping().await.is_ok();
    Json(health::health_check(
        state.started,
        state.brokers.mode(),
        broker_ok,
        state.gateway.registry.connection_count(),
    ))
}

async fn push_event(State(state): State<AppState>, Json(event): Json<DomainEvent>) -> impl IntoResponse {
    let event_type = event.event_type();
    state.push.dispatch(event);
    (StatusCode::ACCEPTED, Json(json!({"accepted": true, "event_type": event_type})))
}

async fn release_lock(State(state): State<AppState>, Path(order_id): Path<i64>) -> impl IntoResponse {
    state.gateway.locks.release(OfferId(order_id)).await;
    Json(json!({"released": order_id}))
}

async fn require_internal_token(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if let Some(expected) = state.internal_token.as_deref() {
        let supplied = req
            .headers()
            .get(INTERNAL_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok());
        if supplied != Some(expected) {
            tracing::warn!(path = %req.uri().path(), "Rejected internal request");
            return (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid internal token"}))).into_response();
        }
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticResolver;

    fn config(internal_token: Option<&str>) -> CourierConfig {
        let mut config = CourierConfig::default();
        config.server.host = "127.0.0.1".into();
        config.server.port = 0;
        config.internal_token = internal_token.map(str::to_owned);
        config
    }

    async fn boot(internal_token: Option<&str>) -> ServerHandle {
        start(
            &config(internal_token),
            Brokers::standalone(),
            Arc::new(StaticResolver::new()),
            Arc::new(DispatchMetrics::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let handle = boot(None).await;
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["mode"], "standalone");
        assert_eq!(body["connections"], 0);

        handle.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn stats_start_empty() {
        let handle = boot(None).await;
        let url = format!("http://127.0.0.1:{}/ws/stats", handle.port);
        let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body["active_drivers"], 0);
        assert_eq!(body["active_users"], 0);
        assert_eq!(body["total_connections"], 0);
        assert_eq!(body["mode"], "standalone");
        handle.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn internal_routes_require_token_when_configured() {
        let handle = boot(Some("hunter2")).await;
        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{}/internal/locks/42/release", handle.port);

        let resp = client.post(&url).send().await.unwrap();
        assert_eq!(resp.status(), 401);

        let resp = client
            .post(&url)
            .header(INTERNAL_TOKEN_HEADER, "wrong")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        let resp = client
            .post(&url)
            .header(INTERNAL_TOKEN_HEADER, "hunter2")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["released"], 42);

        handle.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn malformed_event_is_rejected() {
        let handle = boot(None).await;
        let url = format!("http://127.0.0.1:{}/internal/events", handle.port);
        let resp = reqwest::Client::new()
            .post(&url)
            .json(&json!({"type": "order_exploded"}))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
        handle.shutdown(Duration::from_secs(5)).await;
    }

    #[test]
    fn build_router_creates_routes() {
        let state = AppState::new(
            &CourierConfig::default(),
            Brokers::standalone(),
            Arc::new(StaticResolver::new()),
            Arc::new(DispatchMetrics::new()),
            TaskTracker::new(),
            CancellationToken::new(),
        );
        let _router = build_router(state);
    }
}
