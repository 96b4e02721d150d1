/*!
Stub d'agent d'instance

Sert le payload de santé (`GET /health`) et enregistre les actions de
récupération reçues (`POST /recover/{action}`). Le payload et les actions en
échec sont modifiables pendant le test.
*/

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::test_utils::serve;

/// Construit un payload de santé au format de l'agent
#[derive(Debug, Clone)]
pub struct HealthPayloadBuilder {
    process: bool,
    display: bool,
    audio: bool,
    bridge_up: bool,
    tap_up: bool,
    frame_rate: u32,
}

impl Default for HealthPayloadBuilder {
    fn default() -> Self {
        Self { process: true, display: true, audio: true, bridge_up: true, tap_up: true, frame_rate: 15 }
    }
}

impl HealthPayloadBuilder {
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn process(mut self, up: bool) -> Self {
        self.process = up;
        self
    }

    pub fn display(mut self, up: bool) -> Self {
        self.display = up;
        self
    }

    pub fn audio(mut self, up: bool) -> Self {
        self.audio = up;
        self
    }

    pub fn network(mut self, up: bool) -> Self {
        self.bridge_up = up;
        self.tap_up = up;
        self
    }

    pub fn build(&self) -> Value {
        let all_ok = self.process && self.display && self.audio && self.bridge_up && self.tap_up;
        json!({
            "status": if all_ok { "healthy" } else { "degraded" },
            "qemu_healthy": self.process,
            "video": {
                "vnc_available": self.display,
                "display_active": self.display,
                "estimated_frame_rate": if self.display { self.frame_rate } else { 0 },
                "vnc_port": 5901
            },
            "audio": {
                "pulse_running": self.audio,
                "audio_devices": if self.audio { 1 } else { 0 },
                "alsa_devices": 1
            },
            "network": {
                "bridge_up": self.bridge_up,
                "tap_up": self.tap_up,
                "tx_packets": 1200,
                "rx_packets": 1350,
                "tx_errors": 0,
                "rx_errors": 0
            },
            "performance": {
                "cpu_usage": 23.5,
                "memory_usage": 41.0,
                "load_average": 0.42,
                "qemu_cpu": 18.0,
                "qemu_memory": 12.5
            }
        })
    }
}

#[derive(Default)]
struct AgentInner {
    payload: Mutex<Value>,
    health_status: Mutex<u16>,
    failing_actions: Mutex<Vec<String>>,
    calls: Mutex<Vec<String>>,
}

/// Agent d'instance en mémoire, servi sur un port éphémère
#[derive(Clone)]
pub struct StubAgent {
    inner: Arc<AgentInner>,
    addr: SocketAddr,
}

impl StubAgent {
    pub async fn start() -> Result<Self> {
        let inner = Arc::new(AgentInner {
            payload: Mutex::new(HealthPayloadBuilder::healthy().build()),
            health_status: Mutex::new(200),
            ..Default::default()
        });
        let router = Router::new()
            .route("/health", get(health))
            .route("/recover/{action}", post(recover))
            .with_state(inner.clone());
        let addr = serve(router).await?;
        log::info!("stub agent on {addr}");
        Ok(Self { inner, addr })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_payload(&self, payload: Value) {
        *self.inner.payload.lock() = payload;
    }

    /// Code HTTP renvoyé par /health (200 par défaut)
    pub fn set_health_status(&self, status: u16) {
        *self.inner.health_status.lock() = status;
    }

    pub fn fail_action(&self, action: &str) {
        self.inner.failing_actions.lock().push(action.to_string());
    }

    /// Actions reçues, dans l'ordre
    pub fn calls(&self) -> Vec<String> {
        self.inner.calls.lock().clone()
    }
}

async fn health(State(inner): State<Arc<AgentInner>>) -> (StatusCode, Json<Value>) {
    let status = StatusCode::from_u16(*inner.health_status.lock()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(inner.payload.lock().clone()))
}

async fn recover(State(inner): State<Arc<AgentInner>>, Path(action): Path<String>) -> (StatusCode, Json<Value>) {
    inner.calls.lock().push(action.clone());
    if inner.failing_actions.lock().contains(&action) {
        log::warn!("stub agent: {action} scripted to fail");
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "ok": false, "action": action })));
    }
    (StatusCode::OK, Json(json!({ "ok": true, "action": action })))
}
