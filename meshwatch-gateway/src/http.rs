/**
 * HTTP SURFACE - subscriber endpoint and read-only REST views
 *
 * ROLE: `/ws` upgrades dashboard connections into subscribers; the REST
 * routes expose the same state for scripts and debugging.
 *
 * SUBSCRIBER LIFECYCLE:
 * - origin checked against the allow-list before the upgrade (403 otherwise)
 * - snapshot rendered and queued while the state lock is held, then the
 *   connection is registered, so no update can slip in between
 * - one writer task drains the subscriber queue onto the socket (send
 *   timeout, periodic pings); one reader task discards inbound frames
 * - whichever task ends first tears the connection down and deregisters it
 */

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};
use uuid::Uuid;

use crate::broadcast::SubscriberRegistry;
use crate::config::GatewayConfig;
use crate::health::{GatewayHealth, HealthTracker};
use crate::models::{Alert, FrameKind, Machine};
use crate::state::{GatewayState, Shared};

#[derive(Clone)]
pub struct AppState {
    pub state: Shared<GatewayState>,
    pub registry: SubscriberRegistry,
    pub health: HealthTracker,
    pub config: Arc<GatewayConfig>,
}

#[derive(Debug, Deserialize)]
struct AlertsParams {
    limit: Option<usize>,
}

pub fn build_router(app: AppState) -> Router {
    let cors = cors_layer(&app.config.http.allowed_origins);
    Router::new()
        .route("/ws", get(subscribe))
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/machines", get(get_machines))
        .route("/machines/{id}", get(get_machine))
        .route("/alerts", get(get_alerts))
        .with_state(app)
        .layer(cors)
}

/// CORS restricted to the configured origins. An empty list allows any
/// origin; unparsable entries are skipped.
fn cors_layer(allowed: &[String]) -> CorsLayer {
    let base = CorsLayer::new().allow_methods([Method::GET]).allow_headers([header::CONTENT_TYPE]);
    if allowed.is_empty() {
        return base.allow_origin(AllowOrigin::any());
    }
    let origins: Vec<HeaderValue> = allowed
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring unparsable allowed origin");
                None
            }
        })
        .collect();
    base.allow_origin(origins)
}

/// A missing Origin header means a non-browser client and is let through.
pub fn origin_allowed(allowed: &[String], origin: Option<&HeaderValue>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match origin {
        None => true,
        Some(value) => value
            .to_str()
            .map(|o| allowed.iter().any(|a| a.eq_ignore_ascii_case(o)))
            .unwrap_or(false),
    }
}

// GET /ws
async fn subscribe(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(app): State<AppState>,
) -> Response {
    let origin = headers.get(header::ORIGIN);
    if !origin_allowed(&app.config.http.allowed_origins, origin) {
        tracing::warn!(origin = ?origin, "subscriber rejected: origin not allowed");
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| handle_subscriber(socket, app))
}

async fn handle_subscriber(socket: WebSocket, app: AppState) {
    let conn_id = Uuid::new_v4();

    let registered = {
        let state = app.state.lock();
        state
            .frame(FrameKind::Snapshot, app.config.alerts.snapshot_limit)
            .map(|snapshot| app.registry.register(snapshot.into()))
    };
    let (sub_id, rx) = match registered {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!(%conn_id, error = %e, "cannot render snapshot, dropping subscriber");
            return;
        }
    };
    tracing::info!(%conn_id, subscriber = sub_id, total = app.registry.len(), "subscriber connected");

    let (sink, mut stream) = socket.split();
    let broadcast = &app.config.broadcast;
    let mut writer = tokio::spawn(write_frames(
        sink,
        rx,
        broadcast.send_timeout(),
        broadcast.ping_interval(),
        conn_id,
    ));
    let mut reader = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(%conn_id, error = %e, "subscriber read failed");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    app.registry.deregister(sub_id);
    tracing::info!(%conn_id, subscriber = sub_id, "subscriber disconnected");
}

/// Drains one subscriber queue onto its socket. Ends on a write error or
/// timeout, after sending a Close frame, or once the registry has dropped the
/// queue (lagging subscriber) and every queued frame went out.
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    send_timeout: Duration,
    ping_every: Duration,
    conn_id: Uuid,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + ping_every, ping_every);
    loop {
        let msg = tokio::select! {
            queued = rx.recv() => queued.unwrap_or(Message::Close(None)),
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };
        let closing = matches!(msg, Message::Close(_));
        match tokio::time::timeout(send_timeout, sink.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(%conn_id, error = %e, "subscriber write failed");
                break;
            }
            Err(_) => {
                tracing::warn!(%conn_id, timeout_secs = send_timeout.as_secs(), "subscriber write timed out");
                break;
            }
        }
        if closing {
            break;
        }
    }
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<GatewayHealth> {
    Json(app.health.get_health(&app.state, &app.registry))
}

// GET /machines
async fn get_machines(State(app): State<AppState>) -> Json<Vec<Machine>> {
    let list = app.state.lock().machines().values().cloned().collect();
    Json(list)
}

// GET /machines/{id}
async fn get_machine(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Machine>, StatusCode> {
    let state = app.state.lock();
    let Some(m) = state.machine(&id) else { return Err(StatusCode::NOT_FOUND); };
    Ok(Json(m.clone()))
}

// GET /alerts?limit=N
async fn get_alerts(
    State(app): State<AppState>,
    Query(params): Query<AlertsParams>,
) -> Json<Vec<Alert>> {
    let state = app.state.lock();
    let limit = params
        .limit
        .unwrap_or(app.config.alerts.snapshot_limit)
        .min(state.alerts().capacity());
    Json(state.alerts().recent(limit).cloned().collect())
}
