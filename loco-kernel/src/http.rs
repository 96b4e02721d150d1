/**
 * API REST LOCO - Serveur HTTP + WebSocket du kernel
 *
 * RÔLE :
 * Expose la flotte au dashboard : instances découvertes, santé profonde,
 * récupération, focus (instances actives) et canaux temps réel.
 *
 * FONCTIONNEMENT :
 * - Routes : /health, /api/status, /api/instances..., /api/quality/..., /api/active
 * - WebSocket : /ws/active (diffusion du focus), /ws/signaling, /ws/tunnel/{id}
 * - Erreurs : 404 instance inconnue, 409 circuit ouvert / déjà en cours,
 *   429 limite de récupération, 422 corps invalide, 500 persistance
 *
 * SÉCURITÉ :
 * - Si une clé est configurée, les routes POST exigent le header x-api-key
 * - /health et les lectures restent ouverts
 */

use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, StreamExt};
use futures::SinkExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::select;
use tracing::{debug, error, warn};

use crate::active::{SharedActive, Subscription};
use crate::discovery::{DiscoverySnapshot, SharedDiscovery};
use crate::health::{HealthTracker, KernelHealth};
use crate::models::{format_ts, to_view, DiscoveryMode, InstanceView};
use crate::quality::{Classification, HealthReport, SharedMonitor};
use crate::recovery::{RecoveryDecision, RecoveryError, RecoveryStateView, RejectReason, SharedRecovery, Trigger};
use crate::session::{Connection, ConnectionKind, ConnectionState};
use crate::signaling::{self, SharedSignaling};
use crate::tunnel::SharedTunnel;

#[derive(Clone)]
pub struct AppState {
    pub discovery: SharedDiscovery,
    pub monitor: SharedMonitor,
    pub recovery: SharedRecovery,
    pub active: SharedActive,
    pub signaling: SharedSignaling,
    pub tunnel: SharedTunnel,
    pub health_tracker: HealthTracker,
    pub api_key: Option<String>,
}

type ApiError = (StatusCode, Json<Value>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn api_error(code: StatusCode, msg: impl Into<String>) -> ApiError {
    (code, Json(json!({ "error": msg.into() })))
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let Some(expected) = app.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };
    if req.method() != Method::POST {
        return Ok(next.run(req).await);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);
    if !ok {
        warn!("[http] rejected {} {}: missing or invalid x-api-key", req.method(), req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/status", get(get_status))
        .route("/api/instances", get(list_instances))
        .route("/api/instances/live", get(live_instances))
        .route("/api/instances/discovery-info", get(discovery_info))
        .route("/api/instances/refresh", post(refresh_instances))
        .route("/api/quality/deep-health", get(all_deep_health))
        .route("/api/quality/deep-health/{id}", get(deep_health))
        .route("/api/quality/history/{id}", get(health_history))
        .route("/api/quality/recover/{id}", post(trigger_recovery))
        .route("/api/quality/recovery-status", get(recovery_status))
        .route("/api/quality/recovery/{id}/reset", post(reset_circuit))
        .route("/api/active", get(get_active).post(set_active))
        .route("/ws/active", get(ws_active))
        .route("/ws/signaling", get(ws_signaling))
        .route("/ws/tunnel/{id}", get(ws_tunnel))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

async fn get_status(State(app): State<AppState>) -> Json<KernelHealth> {
    let snapshot = app.discovery.current();
    Json(app.health_tracker.get_health(&snapshot, app.active.get().version))
}

async fn list_instances(State(app): State<AppState>) -> Json<Vec<InstanceView>> {
    Json(app.discovery.current().instances.iter().map(to_view).collect())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LiveStats {
    total: usize,
    ready: usize,
    not_ready: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LiveHealth {
    ready: bool,
    reachable: bool,
    latency_ms: Option<u64>,
    details: String,
    score: Option<u8>,
    classification: Option<Classification>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LiveInstance {
    #[serde(flatten)]
    instance: InstanceView,
    status: &'static str,
    health: LiveHealth,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LiveView {
    mode: DiscoveryMode,
    service_name: String,
    namespace: String,
    stale: bool,
    last_update: Option<String>,
    stats: LiveStats,
    instances: Vec<LiveInstance>,
}

async fn live_instances(State(app): State<AppState>) -> Json<LiveView> {
    let snapshot = app.discovery.current();
    let conf = app.discovery.conf();

    let instances: Vec<LiveInstance> = stream::iter(snapshot.instances.clone())
        .map(|inst| {
            let monitor = app.monitor.clone();
            async move {
                let probe = monitor.quick_check(&inst).await;
                let latest = monitor.latest(&inst.id);
                let status = match (inst.is_ready(), probe.reachable) {
                    (false, _) => "not-ready",
                    (true, true) => "ready",
                    (true, false) => "degraded",
                };
                LiveInstance {
                    instance: to_view(&inst),
                    status,
                    health: LiveHealth {
                        ready: inst.is_ready(),
                        reachable: probe.reachable,
                        latency_ms: probe.latency_ms,
                        details: probe.details,
                        score: latest.as_ref().map(|r| r.score),
                        classification: latest.as_ref().map(|r| r.classification),
                    },
                }
            }
        })
        .buffered(16)
        .collect()
        .await;

    let ready = snapshot.ready_count();
    Json(LiveView {
        mode: snapshot.mode,
        service_name: conf.service_name.clone(),
        namespace: conf.namespace.clone(),
        stale: snapshot.stale,
        last_update: snapshot.last_update.map(format_ts),
        stats: LiveStats { total: snapshot.instances.len(), ready, not_ready: snapshot.instances.len() - ready },
        instances,
    })
}

fn discovery_json(app: &AppState, snapshot: &DiscoverySnapshot) -> Value {
    let conf = app.discovery.conf();
    json!({
        "mode": snapshot.mode,
        "stale": snapshot.stale,
        "degraded": snapshot.degraded,
        "lastUpdate": snapshot.last_update.map(format_ts),
        "lastError": snapshot.last_error,
        "fallbackReason": snapshot.fallback_reason,
        "clusterConfigured": app.discovery.cluster_configured(),
        "namespace": conf.namespace,
        "serviceName": conf.service_name,
        "labelSelector": conf.label_selector,
        "intervalSecs": conf.interval_secs,
        "gracePeriodSecs": conf.grace_period_secs,
        "total": snapshot.instances.len(),
        "ready": snapshot.ready_count(),
    })
}

async fn discovery_info(State(app): State<AppState>) -> Json<Value> {
    let snapshot = app.discovery.current();
    Json(discovery_json(&app, &snapshot))
}

async fn refresh_instances(State(app): State<AppState>) -> Json<Value> {
    let snapshot = app.discovery.discover().await;
    let mut body = discovery_json(&app, &snapshot);
    body["instances"] = json!(snapshot.instances.iter().map(to_view).collect::<Vec<_>>());
    Json(body)
}

async fn all_deep_health(State(app): State<AppState>) -> Json<Vec<HealthReport>> {
    Json(app.monitor.all_latest())
}

async fn deep_health(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<HealthReport> {
    if app.discovery.resolve(&id).is_none() {
        return Err(api_error(StatusCode::NOT_FOUND, format!("unknown instance {id}")));
    }
    app.monitor
        .latest(&id)
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("no health report yet for {id}")))
}

async fn health_history(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<Vec<HealthReport>> {
    if app.discovery.resolve(&id).is_none() {
        return Err(api_error(StatusCode::NOT_FOUND, format!("unknown instance {id}")));
    }
    Ok(Json(app.monitor.history(&id)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecoverBody {
    #[serde(default)]
    force_recovery: bool,
}

/// Corps optionnel : vide = non forcé
async fn trigger_recovery(State(app): State<AppState>, Path(id): Path<String>, body: Bytes) -> Response {
    let req: RecoverBody = if body.iter().all(u8::is_ascii_whitespace) {
        RecoverBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(b) => b,
            Err(e) => return api_error(StatusCode::UNPROCESSABLE_ENTITY, format!("invalid body: {e}")).into_response(),
        }
    };

    let decision = match app.recovery.recover(&id, req.force_recovery, Trigger::Manual) {
        Ok(d) => d,
        Err(RecoveryError::UnknownInstance(_)) => {
            return api_error(StatusCode::NOT_FOUND, format!("unknown instance {id}")).into_response()
        }
        Err(e) => {
            error!("[http] recovery of {id} failed: {e}");
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let code = match decision {
        RecoveryDecision::Accepted => StatusCode::ACCEPTED,
        RecoveryDecision::Rejected(RejectReason::RateLimited) => StatusCode::TOO_MANY_REQUESTS,
        RecoveryDecision::Rejected(RejectReason::CircuitOpen) | RecoveryDecision::AlreadyInProgress => {
            StatusCode::CONFLICT
        }
    };
    let mut body = serde_json::to_value(decision).unwrap_or_default();
    body["instanceId"] = json!(id);
    body["forced"] = json!(req.force_recovery);
    if let Some(st) = app.recovery.status(&id) {
        body["retryAfterSecs"] = json!(st.retry_after_secs);
    }
    (code, Json(body)).into_response()
}

async fn recovery_status(State(app): State<AppState>) -> Json<Vec<RecoveryStateView>> {
    Json(app.recovery.snapshot())
}

async fn reset_circuit(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<RecoveryStateView> {
    if !app.recovery.reset(&id) {
        return Err(api_error(StatusCode::NOT_FOUND, format!("no recovery state for {id}")));
    }
    app.recovery
        .status(&id)
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("no recovery state for {id}")))
}

async fn get_active(State(app): State<AppState>) -> Json<Value> {
    let set = app.active.get();
    Json(json!({ "active": set.ids, "version": set.version }))
}

#[derive(Debug, Deserialize)]
struct SetActiveBody {
    ids: Vec<String>,
}

async fn set_active(State(app): State<AppState>, Json(body): Json<SetActiveBody>) -> Response {
    match app.active.set_active(body.ids).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => {
            error!("[http] set_active failed: {e}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn ws_active(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| active_socket(socket, app.active))
}

async fn ws_signaling(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| signaling::handle_socket(socket, app.signaling))
}

async fn ws_tunnel(ws: WebSocketUpgrade, State(app): State<AppState>, Path(id): Path<String>) -> Response {
    ws.on_upgrade(move |socket| app.tunnel.handle_socket(socket, id))
}

/// `{"id": "x"}`, `{"id": null}` ou `{"ids": [...]}` -> nouvelle liste active
fn parse_focus(text: &str) -> Result<Vec<String>, String> {
    let value: Value = serde_json::from_str(text).map_err(|e| format!("invalid message: {e}"))?;
    if let Some(ids) = value.get("ids") {
        return serde_json::from_value(ids.clone()).map_err(|e| format!("invalid ids: {e}"));
    }
    match value.get("id") {
        Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(id)) => Ok(vec![id.clone()]),
        _ => Err("expected id or ids".into()),
    }
}

async fn active_socket(socket: WebSocket, active: SharedActive) {
    let mut conn = Connection::new(ConnectionKind::Active);
    let _ = conn.advance(ConnectionState::Connecting);
    let Subscription { id: sub_id, mut rx } = active.subscribe();
    let _ = conn.advance(ConnectionState::Open);
    let (mut sink, mut stream) = socket.split();

    loop {
        select! {
            update = rx.recv() => match update {
                Some(update) => {
                    let Ok(text) = serde_json::to_string(&update) else { continue };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => {
                    // retiré par le coordinateur : abonné trop lent
                    let frame = CloseFrame { code: close_code::AGAIN, reason: Utf8Bytes::from_static("subscriber too slow") };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => match parse_focus(text.as_str()) {
                    Ok(ids) => {
                        if let Err(e) = active.set_active(ids).await {
                            error!("[http] focus from subscriber {sub_id} failed: {e}");
                        }
                    }
                    Err(reason) => {
                        debug!("[http] subscriber {sub_id}: {reason}");
                        let err = json!({ "type": "error", "reason": reason }).to_string();
                        if sink.send(Message::Text(err.into())).await.is_err() {
                            break;
                        }
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!("[http] subscriber {sub_id} error: {e}");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = conn.advance(ConnectionState::Closing);
    active.unsubscribe(sub_id);
    conn.close();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_focus() {
        assert_eq!(parse_focus(r#"{"id":"instance-2"}"#).unwrap(), vec!["instance-2"]);
        assert!(parse_focus(r#"{"id":null}"#).unwrap().is_empty());
        assert_eq!(parse_focus(r#"{"ids":["a","b"]}"#).unwrap(), vec!["a", "b"]);
        assert!(parse_focus(r#"{"ids":"a"}"#).is_err());
        assert!(parse_focus(r#"{"focus":1}"#).is_err());
        assert!(parse_focus("nope").is_err());
    }
}
