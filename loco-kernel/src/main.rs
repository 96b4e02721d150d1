/**
 * LOCO KERNEL - Point d'entrée principal
 *
 * RÔLE : Orchestration de tous les modules : config, découverte, santé,
 * récupération, focus, relais temps réel, événements et API HTTP.
 * Bootstrap du système complet avec gestion d'erreurs et logging.
 *
 * ARCHITECTURE : boucles de fond (discovery, monitor, recovery) + API REST/WebSocket.
 */

use loco_kernel::active::ActiveCoordinator;
use loco_kernel::config::load_config;
use loco_kernel::discovery::{FleetDiscovery, KubeClient};
use loco_kernel::events::{FocusNotifier, LogPublisher, MqttPublisher, SharedPublisher};
use loco_kernel::health::HealthTracker;
use loco_kernel::http::{self, AppState};
use loco_kernel::quality::{HealthMonitor, HttpProbe};
use loco_kernel::recovery::{HttpRecoveryExecutor, RecoveryOrchestrator};
use loco_kernel::signaling::SignalingHub;
use loco_kernel::tunnel::TunnelRelay;

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await;
    if let Err(e) = tokio::fs::create_dir_all(&cfg.data_dir).await {
        warn!("[kernel] failed to create data dir {}: {e}", cfg.data_dir.display());
    }

    // health tracker + bus
    let health_tracker = HealthTracker::new();
    let publisher: SharedPublisher = match &cfg.mqtt {
        Some(mqtt) => Arc::new(MqttPublisher::connect(mqtt, health_tracker.clone())),
        None => {
            info!("[kernel] no MQTT broker configured, events are logged only");
            Arc::new(LogPublisher)
        }
    };

    // découverte : API cluster si disponible, sinon liste statique
    let discovery = match KubeClient::from_config(&cfg.discovery).await {
        Ok(client) => FleetDiscovery::new(cfg.discovery.clone(), Some(Arc::new(client))),
        Err(e) => {
            warn!("[kernel] cluster discovery unavailable: {e}");
            FleetDiscovery::without_cluster(cfg.discovery.clone(), e.to_string())
        }
    };
    let discovery = Arc::new(discovery);
    let first = discovery.discover().await;
    info!("[kernel] discovered {} instances (mode {})", first.instances.len(), first.mode);
    discovery.clone().spawn_discovery_loop();

    // récupération, alimentée par les rapports du monitor
    let executor = Arc::new(HttpRecoveryExecutor::new(cfg.recovery.action_timeout())?);
    let recovery = Arc::new(RecoveryOrchestrator::new(
        cfg.recovery.clone(),
        discovery.clone(),
        executor,
        publisher.clone(),
    ));
    let (report_tx, report_rx) = mpsc::channel(256);
    recovery.clone().spawn_consumer(report_rx);

    // deep health
    let probe = Arc::new(HttpProbe::new(cfg.health.timeout())?);
    let monitor = Arc::new(HealthMonitor::new(cfg.health.clone(), probe).with_sink(report_tx));
    monitor.clone().spawn_monitor_loop(discovery.clone());

    // focus
    let notifier = Arc::new(FocusNotifier::new(publisher.clone(), discovery.clone()));
    let active = Arc::new(
        ActiveCoordinator::load(cfg.active_state_file(), cfg.active.subscriber_buffer)
            .await?
            .with_notifier(notifier),
    );

    // relais temps réel
    let signaling = Arc::new(SignalingHub::new(cfg.signaling.outbound_buffer));
    let tunnel = Arc::new(TunnelRelay::new(discovery.clone(), cfg.tunnel.clone()));

    // démarre la publication auto du health
    if cfg.mqtt.is_some() {
        let active_for_health = active.clone();
        health_tracker.spawn_health_publisher(publisher.clone(), discovery.clone(), move || {
            active_for_health.get().version
        });
    }

    // fabrique l'état unique pour Axum
    let app_state = AppState {
        discovery,
        monitor,
        recovery,
        active,
        signaling,
        tunnel,
        health_tracker,
        api_key: cfg.server.api_key.clone(),
    };
    if app_state.api_key.is_none() {
        warn!("[kernel] LOCO_API_KEY not set, mutating routes are open");
    }

    let app = http::build_router(app_state);
    let listener = TcpListener::bind(&cfg.server.bind).await?;
    info!("[kernel] listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
