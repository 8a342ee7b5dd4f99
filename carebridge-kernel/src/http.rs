/**
 * API HTTP CAREBRIDGE - Consultation et flux temps réel
 *
 * RÔLE :
 * - routes de lecture : identités, alertes, historique vitals/positions
 * - état du service : /health (public), /system/health
 * - WebSocket : /ws/health, /ws/location, /ws/alerts
 *
 * SÉCURITÉ :
 * - header x-api-key obligatoire sauf /health et /ws/...
 * - clé lue depuis CAREBRIDGE_API_KEY au démarrage ; sans clé, API fermée
 */

use crate::broadcast::{serve_session, BroadcastRegistry, Channel};
use crate::health::{HealthTracker, KernelHealth};
use crate::identity::IdentityResolver;
use crate::models::{AlertEvent, AlertStatus, Identity};
use crate::pipeline::PipelineStats;
use crate::store::{PersistenceError, SharedStore, StoredPosition, StoredVital};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::{routing::get, Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub resolver: Arc<IdentityResolver>,
    pub stats: Arc<PipelineStats>,
    pub registry: Arc<BroadcastRegistry>,
    pub health_tracker: HealthTracker,
    pub api_key: Option<Arc<str>>,
}

fn authorized(path: &str, provided: Option<&str>, expected: Option<&str>) -> bool {
    if path == "/health" || path.starts_with("/ws/") {
        return true;
    }
    match (expected, provided) {
        (Some(expected), Some(provided)) => !expected.is_empty() && provided == expected,
        _ => false,
    }
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let provided = req.headers().get("x-api-key").and_then(|v| v.to_str().ok());
    if !authorized(req.uri().path(), provided, app.api_key.as_deref()) {
        if app.api_key.is_none() {
            warn!("[http] CAREBRIDGE_API_KEY not set - API access denied");
        }
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/identities", get(list_identities))
        .route("/identities/{external_id}", get(get_identity))
        .route("/alerts", get(list_alerts))
        .route("/patients/{external_id}/vitals", get(patient_vitals))
        .route("/patients/{external_id}/positions", get(patient_positions))
        .route("/ws/health", get(ws_health))
        .route("/ws/location", get(ws_location))
        .route("/ws/alerts", get(ws_alerts))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

fn internal(e: PersistenceError) -> StatusCode {
    warn!("[http] store error: {}", e);
    StatusCode::INTERNAL_SERVER_ERROR
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health_tracker.get_health(&app.resolver, &app.stats, &app.registry))
}

// GET /identities
async fn list_identities(State(app): State<AppState>) -> Result<Json<Vec<Identity>>, StatusCode> {
    app.store.list_identities().await.map(Json).map_err(internal)
}

// GET /identities/{external_id}
async fn get_identity(
    State(app): State<AppState>,
    Path(external_id): Path<String>,
) -> Result<Json<Identity>, StatusCode> {
    find_identity(&app, &external_id).await.map(Json)
}

async fn find_identity(app: &AppState, external_id: &str) -> Result<Identity, StatusCode> {
    app.store
        .find_identity_by_external_id(external_id)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Default, Deserialize)]
struct AlertsParams {
    status: Option<String>,
}

// GET /alerts?status=active|resolved
async fn list_alerts(
    State(app): State<AppState>,
    Query(params): Query<AlertsParams>,
) -> Result<Json<Vec<AlertEvent>>, StatusCode> {
    let status = match params.status.as_deref() {
        None => None,
        Some(s) => Some(AlertStatus::parse(s).ok_or(StatusCode::BAD_REQUEST)?),
    };
    app.store.list_alerts(status).await.map(Json).map_err(internal)
}

#[derive(Debug, Default, Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

impl HistoryParams {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

// GET /patients/{external_id}/vitals?limit=
async fn patient_vitals(
    State(app): State<AppState>,
    Path(external_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<StoredVital>>, StatusCode> {
    let identity = find_identity(&app, &external_id).await?;
    app.store
        .recent_vitals(&identity.internal_id, params.limit())
        .await
        .map(Json)
        .map_err(internal)
}

// GET /patients/{external_id}/positions?limit=
async fn patient_positions(
    State(app): State<AppState>,
    Path(external_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<StoredPosition>>, StatusCode> {
    let identity = find_identity(&app, &external_id).await?;
    app.store
        .recent_positions(&identity.internal_id, params.limit())
        .await
        .map(Json)
        .map_err(internal)
}

fn upgrade(ws: WebSocketUpgrade, channel: Channel, registry: Arc<BroadcastRegistry>) -> Response {
    ws.on_upgrade(move |socket| serve_session(socket, channel, registry))
}

async fn ws_health(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    upgrade(ws, Channel::Health, app.registry)
}

async fn ws_location(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    upgrade(ws, Channel::Location, app.registry)
}

async fn ws_alerts(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    upgrade(ws, Channel::Alerts, app.registry)
}
