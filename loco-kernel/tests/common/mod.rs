//! Démarrage d'un kernel complet sur un port éphémère, sans MQTT ni boucles de fond.

#![allow(dead_code)]

use loco_kernel::active::ActiveCoordinator;
use loco_kernel::config::{KernelConfig, StaticInstanceConf};
use loco_kernel::discovery::{FleetDiscovery, KubeClient};
use loco_kernel::events::{FocusNotifier, RecordingPublisher, SharedPublisher};
use loco_kernel::health::HealthTracker;
use loco_kernel::http::{build_router, AppState};
use loco_kernel::quality::{HealthMonitor, HttpProbe};
use loco_kernel::recovery::{HttpRecoveryExecutor, RecoveryOrchestrator};
use loco_kernel::signaling::SignalingHub;
use loco_kernel::tunnel::TunnelRelay;

use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

pub struct TestKernel {
    pub addr: SocketAddr,
    pub state: AppState,
    pub events: Arc<RecordingPublisher>,
    _data: TempDir,
}

impl TestKernel {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }
}

/// Config de test : délais courts, pas de récupération automatique
pub fn test_config() -> KernelConfig {
    let mut cfg = KernelConfig::default();
    cfg.health.timeout_secs = 1;
    cfg.health.max_attempts = 1;
    cfg.health.backoff_ms = 10;
    cfg.recovery.auto_recover = false;
    cfg.recovery.action_timeout_secs = 2;
    cfg.tunnel.connect_timeout_secs = 2;
    cfg
}

pub fn local_instance(display: u16, health: u16, control: u16) -> StaticInstanceConf {
    StaticInstanceConf {
        host: "127.0.0.1".into(),
        display_port: Some(display),
        health_port: Some(health),
        control_port: Some(control),
        ready: true,
    }
}

pub async fn start_kernel(mut cfg: KernelConfig) -> TestKernel {
    loco_devkit::init_logging();
    let data = tempfile::tempdir().unwrap();
    cfg.data_dir = data.path().to_path_buf();

    let events = Arc::new(RecordingPublisher::default());
    let publisher: SharedPublisher = events.clone();

    let discovery = match &cfg.discovery.api_url {
        Some(_) => {
            let client = KubeClient::from_config(&cfg.discovery).await.unwrap();
            FleetDiscovery::new(cfg.discovery.clone(), Some(Arc::new(client)))
        }
        None => FleetDiscovery::without_cluster(cfg.discovery.clone(), "no cluster in tests"),
    };
    let discovery = Arc::new(discovery);
    discovery.discover().await;

    let executor = Arc::new(HttpRecoveryExecutor::new(cfg.recovery.action_timeout()).unwrap());
    let recovery = Arc::new(RecoveryOrchestrator::new(
        cfg.recovery.clone(),
        discovery.clone(),
        executor,
        publisher.clone(),
    ));
    let (report_tx, report_rx) = mpsc::channel(64);
    recovery.clone().spawn_consumer(report_rx);

    let probe = Arc::new(HttpProbe::new(cfg.health.timeout()).unwrap());
    let monitor = Arc::new(HealthMonitor::new(cfg.health.clone(), probe).with_sink(report_tx));

    let notifier = Arc::new(FocusNotifier::new(publisher.clone(), discovery.clone()));
    let active = Arc::new(
        ActiveCoordinator::load(cfg.active_state_file(), cfg.active.subscriber_buffer)
            .await
            .unwrap()
            .with_notifier(notifier),
    );

    let state = AppState {
        discovery: discovery.clone(),
        monitor,
        recovery,
        active,
        signaling: Arc::new(SignalingHub::new(cfg.signaling.outbound_buffer)),
        tunnel: Arc::new(TunnelRelay::new(discovery, cfg.tunnel.clone())),
        health_tracker: HealthTracker::new(),
        api_key: cfg.server.api_key.clone(),
    };
    let addr = loco_devkit::serve(build_router(state.clone())).await.unwrap();
    TestKernel { addr, state, events, _data: data }
}

/// Réessaie `check` toutes les 20 ms jusqu'à `Some`, 5 s au plus
pub async fn eventually<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(v) = check().await {
            return v;
        }
        assert!(tokio::time::Instant::now() < deadline, "condition not met within 5s");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn get_json(client: &reqwest::Client, url: &str) -> Value {
    client.get(url).send().await.unwrap().json().await.unwrap()
}
