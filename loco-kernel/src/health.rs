use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task;
use tracing::{debug, info};

use crate::discovery::{DiscoverySnapshot, SharedDiscovery};
use crate::events::{publish_event, SharedPublisher, TOPIC_KERNEL_HEALTH};
use crate::models::DiscoveryMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelHealth {
    /// `ok` ou `degraded` (découverte périmée ou repli statique sur panne)
    pub status: String,
    pub uptime_seconds: u64,
    pub instances: usize,
    pub ready_instances: usize,
    pub discovery_mode: DiscoveryMode,
    pub discovery_stale: bool,
    pub discovery_error: Option<String>,
    pub active_version: u64,
    pub memory_usage_mb: f32,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<Mutex<String>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new("disabled".to_string())),
        }
    }

    pub fn mark_mqtt_connecting(&self) {
        *self.mqtt_status.lock() = "connecting".to_string();
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn get_health(&self, snapshot: &DiscoverySnapshot, active_version: u64) -> KernelHealth {
        let degraded = snapshot.stale || snapshot.degraded;
        KernelHealth {
            status: if degraded { "degraded" } else { "ok" }.to_string(),
            uptime_seconds: self.uptime().as_secs(),
            instances: snapshot.instances.len(),
            ready_instances: snapshot.ready_count(),
            discovery_mode: snapshot.mode,
            discovery_stale: snapshot.stale,
            discovery_error: snapshot.last_error.clone(),
            active_version,
            memory_usage_mb: get_memory_usage_mb(),
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }

    /// Démarre la publication auto du health kernel (toutes les 30s)
    pub fn spawn_health_publisher<F>(&self, publisher: SharedPublisher, discovery: SharedDiscovery, active_version: F)
    where
        F: Fn() -> u64 + Send + 'static,
    {
        let tracker = self.clone();
        task::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                let health = tracker.get_health(&discovery.current(), active_version());
                publish_event(publisher.as_ref(), TOPIC_KERNEL_HEALTH, &health);
                debug!(
                    "[health] published kernel health (uptime: {}s, instances: {}, status: {})",
                    health.uptime_seconds, health.instances, health.status
                );
            }
        });
        info!("[health] kernel health publisher started");
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    if let Some(kb) = rest.split_whitespace().next().and_then(|v| v.parse::<u64>().ok()) {
                        return (kb as f32) / 1024.0;
                    }
                }
            }
        }
    }
    0.0
}
