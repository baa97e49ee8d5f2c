use crate::chain::{redact_credentials, ActiveFeed, CameraChain, CameraEndpoint};
use crate::config::{ApiConfig, ProbeConfig};
use crate::error::{ChainError, FailcamError, Result};
use crate::failover::FailoverController;
use crate::frame::LatestFrame;
use crate::journal::{AlertBook, Journal};
use crate::pipeline::{liveness_timeout, PipelineFactory};
use crate::probe::HealthSnapshot;
use crate::recording::Recorder;
use crate::store::EndpointStore;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

/// Shared handles for the HTTP handlers.
#[derive(Clone)]
pub struct ApiState {
    pub controller: Arc<FailoverController>,
    pub recorder: Arc<Recorder>,
    pub journal: Arc<Journal>,
    pub alerts: Arc<AlertBook>,
    pub chain: Arc<RwLock<CameraChain>>,
    pub store: EndpointStore,
    pub snapshot: Arc<RwLock<HealthSnapshot>>,
    pub active: Arc<RwLock<ActiveFeed>>,
    pub latest: LatestFrame,
    pub factory: Arc<dyn PipelineFactory>,
    pub probe_config: ProbeConfig,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/health", get(health))
        .route("/logs/since/:ts", get(logs_since))
        .route("/alerts", get(list_alerts))
        .route("/alerts/:id/acknowledge", post(acknowledge_alert))
        .route("/cameras/backups", get(list_backups).post(add_backup))
        .route("/cameras/backups/test", post(test_endpoint))
        .route("/cameras/backups/:id", delete(remove_backup))
        .route("/recordings", get(list_recordings))
        .route("/recordings/status", get(recording_status))
        .route("/recordings/start", post(start_recording))
        .route("/recordings/stop", post(stop_recording))
        .route("/stream/start", post(start_stream))
        .route("/stream/stop", post(stop_stream))
        .route("/stream/status", get(stream_status))
        .route("/feed.mjpg", get(feed_mjpg))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the token is cancelled.
pub async fn serve(config: &ApiConfig, state: ApiState, shutdown: CancellationToken) -> Result<()> {
    let addr = format!("{}:{}", config.ip, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(FailcamError::Io)?;
    info!("API listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(FailcamError::Io)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn chain_error_response(e: ChainError) -> Response {
    let status = match &e {
        ChainError::DuplicateId { .. } => StatusCode::CONFLICT,
        ChainError::UnknownEndpoint { .. } => StatusCode::NOT_FOUND,
        ChainError::EndpointUnreachable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ChainError::InvalidEndpoint { .. } => StatusCode::BAD_REQUEST,
    };
    error_response(status, e.to_string())
}

/// Endpoint representation safe to return to API clients: credentials are
/// never echoed back.
#[derive(Debug, Serialize)]
struct EndpointView {
    id: String,
    name: String,
    host: String,
    port: u16,
    url: String,
    has_credentials: bool,
    added_at: DateTime<Utc>,
}

impl From<&CameraEndpoint> for EndpointView {
    fn from(ep: &CameraEndpoint) -> Self {
        Self {
            id: ep.id.clone(),
            name: ep.name.clone(),
            host: ep.host.clone(),
            port: ep.port,
            url: ep.redacted_url(),
            has_credentials: ep.username.is_some() && ep.password.is_some(),
            added_at: ep.added_at,
        }
    }
}

async fn status(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let feed = state.active.read().clone();
    Json(json!({
        "feed": {
            "name": feed.name,
            "label": feed.label.as_str(),
            "url": redact_credentials(&feed.url),
        },
        "state": state.controller.state().as_str(),
        "stream_running": state.controller.is_running(),
        "recording_active": state.recorder.is_active(),
    }))
}

async fn health(State(state): State<ApiState>) -> Json<HealthSnapshot> {
    Json(state.snapshot.read().clone())
}

async fn logs_since(State(state): State<ApiState>, Path(ts): Path<i64>) -> Response {
    let Some(since) = Utc.timestamp_opt(ts, 0).single() else {
        return error_response(StatusCode::BAD_REQUEST, "invalid unix timestamp");
    };
    Json(state.journal.since(since)).into_response()
}

async fn list_alerts(State(state): State<ApiState>) -> Response {
    Json(state.alerts.list()).into_response()
}

async fn acknowledge_alert(State(state): State<ApiState>, Path(id): Path<u64>) -> Response {
    if state.alerts.acknowledge(id) {
        Json(json!({ "acknowledged": id })).into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, format!("unknown alert id {}", id))
    }
}

async fn list_backups(State(state): State<ApiState>) -> Response {
    let views: Vec<EndpointView> = state
        .chain
        .read()
        .backups()
        .iter()
        .map(EndpointView::from)
        .collect();
    Json(views).into_response()
}

#[derive(Debug, Deserialize)]
struct AddBackupRequest {
    id: Option<String>,
    name: String,
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
}

async fn add_backup(
    State(state): State<ApiState>,
    Json(req): Json<AddBackupRequest>,
) -> Response {
    let id = req
        .id
        .unwrap_or_else(|| format!("cam_{}", Uuid::new_v4().simple()));

    let endpoint = match CameraEndpoint::new(
        id,
        req.name,
        req.host,
        req.port,
        req.username,
        req.password,
    ) {
        Ok(ep) => ep,
        Err(e) => return chain_error_response(e),
    };

    // Only endpoints that actually serve frames may enter the chain;
    // otherwise a failover could land on a dead camera we vouched for.
    let live = state
        .factory
        .probe_live(&endpoint.url(), liveness_timeout(&state.probe_config))
        .await;
    if !live {
        return chain_error_response(ChainError::EndpointUnreachable {
            id: endpoint.id,
            host: endpoint.host,
            port: endpoint.port,
        });
    }

    let view = EndpointView::from(&endpoint);
    let backups = {
        let mut chain = state.chain.write();
        if let Err(e) = chain.add_backup(endpoint) {
            return chain_error_response(e);
        }
        chain.backups().to_vec()
    };

    if let Err(e) = state.store.save(&backups) {
        error!("Backup added but persistence failed: {}", e);
    }
    state
        .journal
        .record("CAMERAS", format!("Backup '{}' added", view.name));

    (StatusCode::CREATED, Json(view)).into_response()
}

async fn remove_backup(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let removed = {
        let mut chain = state.chain.write();
        match chain.remove_backup(&id) {
            Ok(ep) => (ep, chain.backups().to_vec()),
            Err(e) => return chain_error_response(e),
        }
    };

    if let Err(e) = state.store.save(&removed.1) {
        error!("Backup removed but persistence failed: {}", e);
    }
    state
        .journal
        .record("CAMERAS", format!("Backup '{}' removed", removed.0.name));

    Json(json!({ "removed": id })).into_response()
}

#[derive(Debug, Deserialize)]
struct TestEndpointRequest {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
}

async fn test_endpoint(
    State(state): State<ApiState>,
    Json(req): Json<TestEndpointRequest>,
) -> Response {
    let endpoint = match CameraEndpoint::new(
        "probe",
        "probe",
        req.host,
        req.port,
        req.username,
        req.password,
    ) {
        Ok(ep) => ep,
        Err(e) => return chain_error_response(e),
    };

    let live = state
        .factory
        .probe_live(&endpoint.url(), liveness_timeout(&state.probe_config))
        .await;
    Json(json!({ "reachable": live })).into_response()
}

async fn list_recordings(State(state): State<ApiState>) -> Response {
    match state.recorder.list_recordings() {
        Ok(files) => Json(files).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn recording_status(State(state): State<ApiState>) -> Response {
    Json(state.recorder.status()).into_response()
}

async fn start_recording(State(state): State<ApiState>) -> Response {
    if state.recorder.start("manual request") {
        Json(json!({ "started": true })).into_response()
    } else {
        error_response(StatusCode::CONFLICT, "already recording")
    }
}

async fn stop_recording(State(state): State<ApiState>) -> Response {
    if state.recorder.stop() {
        Json(json!({ "stopped": true })).into_response()
    } else {
        error_response(StatusCode::CONFLICT, "not recording")
    }
}

async fn start_stream(State(state): State<ApiState>) -> Response {
    if state.controller.is_running() {
        return error_response(StatusCode::CONFLICT, "stream already running");
    }
    match state.controller.start().await {
        Ok(()) => Json(json!({ "started": true })).into_response(),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

async fn stop_stream(State(state): State<ApiState>) -> Response {
    if !state.controller.is_running() {
        return error_response(StatusCode::CONFLICT, "stream not running");
    }
    state.controller.stop().await;
    Json(json!({ "stopped": true })).into_response()
}

async fn stream_status(State(state): State<ApiState>) -> Response {
    Json(json!({
        "running": state.controller.is_running(),
        "state": state.controller.state().as_str(),
    }))
    .into_response()
}

const MJPEG_BOUNDARY: &str = "failcamframe";

/// Live view: the latest annotated frame, multipart-replaced at roughly the
/// recording rate. Frames are deduplicated by id so idle feeds do not
/// resend the same JPEG.
async fn feed_mjpg(State(state): State<ApiState>) -> Response {
    let latest = state.latest.clone();

    let stream = async_stream::stream! {
        let mut interval = tokio::time::interval(Duration::from_millis(50));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_id: Option<u64> = None;

        loop {
            interval.tick().await;
            let Some(frame) = latest.snapshot() else { continue };
            if last_id == Some(frame.id) {
                continue;
            }
            last_id = Some(frame.id);

            let header = format!(
                "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                MJPEG_BOUNDARY,
                frame.jpeg.len()
            );
            let mut part = Vec::with_capacity(header.len() + frame.jpeg.len() + 2);
            part.extend_from_slice(header.as_bytes());
            part.extend_from_slice(&frame.jpeg);
            part.extend_from_slice(b"\r\n");
            yield Ok::<Bytes, Infallible>(Bytes::from(part));
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={}", MJPEG_BOUNDARY),
        )
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
