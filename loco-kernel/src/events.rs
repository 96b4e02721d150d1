/**
 * EVENTS - Publication des événements de la flotte sur MQTT
 *
 * RÔLE : Sortie best-effort vers le bus : changements de focus (allocation de
 * ressources), alertes circuit ouvert, health périodique du kernel.
 *
 * FONCTIONNEMENT :
 * - `try_publish` non bloquant : un broker lent ou absent ne freine jamais l'appelant
 * - L'eventloop rumqttc tourne dans sa propre task et alimente le HealthTracker
 * - Sans broker configuré, les événements sont seulement tracés
 */

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::active::{ActiveUpdate, ScalingNotifier};
use crate::config::MqttConf;
use crate::discovery::SharedDiscovery;
use crate::health::HealthTracker;

pub const TOPIC_FOCUS: &str = "loco/fleet/focus@v1";
pub const TOPIC_ALERT: &str = "loco/quality/alert@v1";
pub const TOPIC_KERNEL_HEALTH: &str = "loco/kernel/health@v1";

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("MQTT publish failed: {0}")]
    Publish(#[from] rumqttc::ClientError),
}

pub trait EventPublisher: Send + Sync {
    fn publish_json(&self, topic: &str, payload: &Value) -> Result<(), EventError>;
}

pub type SharedPublisher = Arc<dyn EventPublisher>;

/// Sérialise puis publie ; les erreurs sont seulement loggées
pub fn publish_event<T: Serialize>(publisher: &dyn EventPublisher, topic: &str, payload: &T) {
    let result = serde_json::to_value(payload)
        .map_err(EventError::from)
        .and_then(|v| publisher.publish_json(topic, &v));
    if let Err(e) = result {
        warn!("[events] {topic}: {e}");
    }
}

pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    /// Crée le client et lance la task eventloop (reconnexion incluse)
    pub fn connect(cfg: &MqttConf, tracker: HealthTracker) -> Self {
        let client_id = format!("loco-kernel-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let mut opts = MqttOptions::new(client_id, &cfg.host, cfg.port);
        opts.set_keep_alive(Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(opts, 64);
        tracker.mark_mqtt_connecting();
        info!("[events] MQTT broker {}:{}", cfg.host, cfg.port);

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("[events] MQTT connected");
                        tracker.mark_mqtt_connected();
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("[events] MQTT error: {e}");
                        tracker.increment_reconnects();
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        Self { client }
    }
}

impl EventPublisher for MqttPublisher {
    fn publish_json(&self, topic: &str, payload: &Value) -> Result<(), EventError> {
        let bytes = serde_json::to_vec(payload)?;
        self.client.try_publish(topic, QoS::AtLeastOnce, false, bytes)?;
        debug!("[events] published {topic}");
        Ok(())
    }
}

/// Pas de broker : trace seulement
pub struct LogPublisher;

impl EventPublisher for LogPublisher {
    fn publish_json(&self, topic: &str, payload: &Value) -> Result<(), EventError> {
        debug!("[events] (no broker) {topic} {payload}");
        Ok(())
    }
}

/// Garde les événements en mémoire, pour les tests et l'outillage
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<(String, Value)>>,
}

impl RecordingPublisher {
    pub fn on_topic(&self, topic: &str) -> Vec<Value> {
        self.events
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish_json(&self, topic: &str, payload: &Value) -> Result<(), EventError> {
        self.events.lock().push((topic.to_string(), payload.clone()));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceProfile {
    Full,
    Reduced,
}

#[derive(Debug, Clone, Serialize)]
pub struct Allocation {
    pub id: String,
    pub profile: ResourceProfile,
}

#[derive(Debug, Clone, Serialize)]
pub struct FocusEvent {
    pub active: Vec<String>,
    pub version: u64,
    pub allocations: Vec<Allocation>,
}

/// Focalisées en `full`, le reste de la flotte connue en `reduced`
pub fn allocations(active: &[String], fleet: impl IntoIterator<Item = String>) -> Vec<Allocation> {
    let mut out: Vec<Allocation> = active
        .iter()
        .map(|id| Allocation { id: id.clone(), profile: ResourceProfile::Full })
        .collect();
    for id in fleet {
        if !active.contains(&id) {
            out.push(Allocation { id, profile: ResourceProfile::Reduced });
        }
    }
    out
}

/// Notification de scaling portée par le bus
pub struct FocusNotifier {
    publisher: SharedPublisher,
    discovery: SharedDiscovery,
}

impl FocusNotifier {
    pub fn new(publisher: SharedPublisher, discovery: SharedDiscovery) -> Self {
        Self { publisher, discovery }
    }
}

#[async_trait]
impl ScalingNotifier for FocusNotifier {
    async fn notify(&self, update: &ActiveUpdate) -> anyhow::Result<()> {
        let fleet = self.discovery.current().instances.into_iter().map(|i| i.id);
        let event = FocusEvent {
            active: update.active.clone(),
            version: update.version,
            allocations: allocations(&update.active, fleet),
        };
        self.publisher.publish_json(TOPIC_FOCUS, &serde_json::to_value(&event)?)?;
        Ok(())
    }
}
