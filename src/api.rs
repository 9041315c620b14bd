// synckairos: REST Surface (RS) — §4.5.
//
// Validates requests, invokes the Session Engine, and serializes
// responses. Also exposes the time endpoint, health checks, metrics, and
// the WebSocket upgrade. Authentication/JWT validation and CORS are
// external-collaborator concerns (§1); `Authenticator` is the seam a
// caller plugs a real validator into.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, FromRequestParts, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::audit::AuditQueue;
use crate::engine::SessionEngine;
use crate::error::{SyncKairosError, SyncKairosResult};
use crate::health::HealthChecker;
use crate::hub::Hub;
use crate::metrics::{LatencyTimer, SharedMetrics};
use crate::model::{CreateSessionRequest, Session};
use crate::store::StateStore;

const MAX_BATCH_IDS: usize = 50;

/// Trivially accepts any token. Token validation belongs to an external
/// collaborator (§1); a real deployment swaps this for a JWT verifier.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<(), SyncKairosError>;
}

pub struct AllowAllAuthenticator;

impl Authenticator for AllowAllAuthenticator {
    fn authenticate(&self, _token: &str) -> Result<(), SyncKairosError> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SessionEngine>,
    pub store: Arc<dyn StateStore>,
    pub audit: Arc<AuditQueue>,
    pub hub: Arc<Hub>,
    pub health: Arc<HealthChecker>,
    pub metrics: SharedMetrics,
    pub authenticator: Arc<dyn Authenticator>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/batch", post(batch_sessions))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/sessions/:id/start", post(start_session))
        .route("/sessions/:id/switch", post(switch_cycle))
        .route("/sessions/:id/pause", post(pause_session))
        .route("/sessions/:id/resume", post(resume_session))
        .route("/sessions/:id/complete", post(complete_session))
        .route("/sessions/:id/poll", get(poll_session))
        .route("/time", get(time_endpoint))
        .route("/health", get(health_endpoint))
        .route("/ready", get(ready_endpoint))
        .route("/metrics", get(metrics_endpoint))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Response, SyncKairosError> {
    let session = state.engine.create_session(req).await?;
    Ok((StatusCode::CREATED, Json(session)).into_response())
}

/// Serves both the REST snapshot and the WebSocket handshake at the same
/// path (spec §6: `GET /sessions/{id}?token=<jwt>`), content-negotiated
/// by the `Upgrade` header, since a client following the documented URL
/// expects a WS upgrade there rather than a distinct `/ws` endpoint.
async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(q): Query<WsQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    request: Request,
) -> Result<Response, SyncKairosError> {
    let wants_upgrade = headers
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if wants_upgrade {
        state
            .authenticator
            .authenticate(q.token.as_deref().unwrap_or_default())?;

        if !state.hub.check_connect_quota(addr.ip()) {
            state.metrics.record_connection_rejected();
            return Err(SyncKairosError::RateLimitExceeded(
                "connection quota exceeded for this IP".to_string(),
            ));
        }

        let is_mobile = headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(|ua| ua.to_lowercase().contains("mobile"))
            .unwrap_or(false);

        let (mut parts, _body) = request.into_parts();
        let ws = WebSocketUpgrade::from_request_parts(&mut parts, &state)
            .await
            .map_err(|_| SyncKairosError::Validation("invalid websocket upgrade request".to_string()))?;

        let hub = state.hub.clone();
        return Ok(ws
            .on_upgrade(move |socket| async move { hub.handle_socket(id, socket, is_mobile).await })
            .into_response());
    }

    let timer = LatencyTimer::start();
    let result = state.engine.get_current_state(id).await;
    state
        .metrics
        .record_store_request(result.is_ok(), timer.elapsed_ms());
    Ok(Json(result?).into_response())
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, SyncKairosError> {
    state.engine.delete_session(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Session>, SyncKairosError> {
    Ok(Json(state.engine.start_session(id).await?))
}

#[derive(Debug, Deserialize)]
struct SwitchRequest {
    next_participant_id: Option<Uuid>,
    current_participant_id: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SwitchResponse {
    state: Session,
    expired_participant_id: Option<Uuid>,
    applied_action: Option<String>,
}

async fn switch_cycle(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<SwitchRequest>,
) -> Result<Response, SyncKairosError> {
    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    if let Some(key) = &idempotency_key {
        if let Some(cached) = state.store.get_idempotent_response(key).await? {
            return Ok(Json(cached).into_response());
        }
    }

    let timer = LatencyTimer::start();
    let result = state
        .engine
        .switch_cycle(id, req.current_participant_id, req.next_participant_id)
        .await;
    let was_conflict = matches!(result, Err(SyncKairosError::ConcurrentModification { .. }));
    state
        .metrics
        .record_switch(result.is_ok(), timer.elapsed_ms(), was_conflict);

    let switch_result = result?;
    let response = SwitchResponse {
        state: switch_result.state,
        expired_participant_id: switch_result.expired_participant_id,
        applied_action: switch_result.applied_action,
    };

    if let Some(key) = idempotency_key {
        let value = serde_json::to_value(&response)?;
        state.store.put_idempotent_response(&key, value).await?;
    }

    Ok(Json(response).into_response())
}

async fn pause_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Session>, SyncKairosError> {
    Ok(Json(state.engine.pause_session(id).await?))
}

async fn resume_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Session>, SyncKairosError> {
    Ok(Json(state.engine.resume_session(id).await?))
}

async fn complete_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Session>, SyncKairosError> {
    Ok(Json(state.engine.complete_session(id).await?))
}

#[derive(Debug, Deserialize)]
struct PollQuery {
    since_version: Option<u64>,
}

async fn poll_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(q): Query<PollQuery>,
) -> Result<Response, SyncKairosError> {
    let session = state.engine.get_current_state(id).await?;
    if let Some(since) = q.since_version {
        if session.version <= since {
            return Ok(StatusCode::NOT_MODIFIED.into_response());
        }
    }
    Ok(Json(session).into_response())
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    session_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
struct BatchEntry {
    session_id: Uuid,
    state: Option<Session>,
    error: Option<String>,
}

async fn batch_sessions(
    State(state): State<AppState>,
    Json(req): Json<BatchRequest>,
) -> Result<Json<Vec<BatchEntry>>, SyncKairosError> {
    if req.session_ids.len() > MAX_BATCH_IDS {
        return Err(SyncKairosError::Validation(format!(
            "batch accepts at most {MAX_BATCH_IDS} ids, got {}",
            req.session_ids.len()
        )));
    }

    let mut entries = Vec::with_capacity(req.session_ids.len());
    for id in req.session_ids {
        match state.engine.get_current_state(id).await {
            Ok(session) => entries.push(BatchEntry {
                session_id: id,
                state: Some(session),
                error: None,
            }),
            Err(e) => entries.push(BatchEntry {
                session_id: id,
                state: None,
                error: Some(e.to_string()),
            }),
        }
    }
    Ok(Json(entries))
}

async fn time_endpoint() -> Json<crate::time::ServerTime> {
    Json(crate::time::now())
}

async fn health_endpoint(State(state): State<AppState>) -> Response {
    let (ok, body) = state.health.health();
    let status = if ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body)).into_response()
}

async fn ready_endpoint(State(state): State<AppState>) -> Response {
    let (ok, body) = state.health.ready();
    let status = if ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body)).into_response()
}

async fn metrics_endpoint(State(state): State<AppState>) -> Json<crate::metrics::MetricsSnapshot> {
    Json(state.metrics.snapshot(state.audit.metrics()))
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_all_authenticator_accepts_any_token() {
        let auth = AllowAllAuthenticator;
        assert!(auth.authenticate("anything").is_ok());
        assert!(auth.authenticate("").is_ok());
    }
}
