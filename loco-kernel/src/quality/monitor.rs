//! Polling périodique des endpoints de santé, historique en mémoire et
//! check léger mis en cache pour les listings.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::report::HealthReport;
use crate::config::HealthConf;
use crate::discovery::SharedDiscovery;
use crate::models::{format_ts, Instance};
use crate::resilience::Backoff;

#[derive(Debug, Clone, thiserror::Error)]
pub enum PollError {
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("health endpoint returned HTTP {0}")]
    Status(u16),
    #[error("invalid health payload: {0}")]
    Decode(String),
    #[error("instance exposes no health port")]
    NoHealthPort,
}

/// Accès réseau aux instances, substituable en test
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// GET du payload de santé complet
    async fn fetch(&self, url: &str) -> Result<Value, PollError>;
    /// Simple ouverture TCP, sans lecture
    async fn ping(&self, host: &str, port: u16) -> Result<(), PollError>;
}

pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn fetch(&self, url: &str) -> Result<Value, PollError> {
        let resp = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                PollError::Timeout(Duration::ZERO)
            } else {
                PollError::Connect(e.to_string())
            }
        })?;
        if !resp.status().is_success() {
            return Err(PollError::Status(resp.status().as_u16()));
        }
        resp.json::<Value>().await.map_err(|e| PollError::Decode(e.to_string()))
    }

    async fn ping(&self, host: &str, port: u16) -> Result<(), PollError> {
        TcpStream::connect((host, port))
            .await
            .map(|_| ())
            .map_err(|e| PollError::Connect(e.to_string()))
    }
}

/// Résultat du check léger (pas de score ni de classification)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reachability {
    pub reachable: bool,
    pub latency_ms: Option<u64>,
    pub details: String,
    pub timed_out: bool,
    pub checked_at: String,
}

pub struct HealthMonitor {
    conf: HealthConf,
    probe: Arc<dyn HealthProbe>,
    latest: RwLock<HashMap<String, HealthReport>>,
    history: Mutex<HashMap<String, VecDeque<HealthReport>>>,
    quick_cache: Mutex<HashMap<String, (Instant, Reachability)>>,
    sink: Option<mpsc::Sender<HealthReport>>,
}

pub type SharedMonitor = Arc<HealthMonitor>;

impl HealthMonitor {
    pub fn new(conf: HealthConf, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            conf,
            probe,
            latest: RwLock::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            quick_cache: Mutex::new(HashMap::new()),
            sink: None,
        }
    }

    /// Chaque rapport enregistré est aussi poussé dans ce canal (recovery)
    pub fn with_sink(mut self, sink: mpsc::Sender<HealthReport>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Un poll complet : timeout par tentative, retry avec backoff borné
    pub async fn poll(&self, inst: &Instance) -> HealthReport {
        let Some(url) = inst.health_url(&self.conf.path) else {
            return HealthReport::unreachable(&inst.id, OffsetDateTime::now_utc(), 0, PollError::NoHealthPort.to_string());
        };

        let max_attempts = self.conf.max_attempts.max(1);
        let timeout = self.conf.timeout();
        let backoff = Backoff::new(Duration::from_millis(self.conf.backoff_ms), timeout);
        let mut last_error = PollError::Timeout(timeout);

        for attempt in 1..=max_attempts {
            let started = Instant::now();
            match tokio::time::timeout(timeout, self.probe.fetch(&url)).await {
                Ok(Ok(payload)) => {
                    let mut report = HealthReport::from_payload(&inst.id, OffsetDateTime::now_utc(), &payload);
                    report.attempts = attempt;
                    report.latency_ms = Some(started.elapsed().as_millis() as u64);
                    if !report.schema_errors.is_empty() {
                        debug!("[health] {} payload issues: {:?}", inst.id, report.schema_errors);
                    }
                    return report;
                }
                Ok(Err(PollError::Timeout(_))) | Err(_) => last_error = PollError::Timeout(timeout),
                Ok(Err(e)) => last_error = e,
            }
            debug!("[health] {} attempt {attempt}/{max_attempts} failed: {last_error}", inst.id);
            if attempt < max_attempts {
                tokio::time::sleep(backoff.delay(attempt)).await;
            }
        }

        warn!("[health] {} unreachable after {max_attempts} attempts: {last_error}", inst.id);
        HealthReport::unreachable(&inst.id, OffsetDateTime::now_utc(), max_attempts, last_error.to_string())
    }

    /// Poll de toute la flotte, au plus `concurrency` polls en vol.
    /// Chaque rapport est enregistré dès qu'il arrive, sans attendre les plus lents.
    pub async fn poll_all(&self, instances: &[Instance]) -> Vec<HealthReport> {
        {
            let known: HashSet<&str> = instances.iter().map(|i| i.id.as_str()).collect();
            self.latest.write().retain(|id, _| known.contains(id.as_str()));
            self.history.lock().retain(|id, _| known.contains(id.as_str()));
            self.quick_cache.lock().retain(|id, _| known.contains(id.as_str()));
        }

        let this = self;
        stream::iter(instances.to_vec())
            .map(move |inst| async move { this.poll(&inst).await })
            .buffer_unordered(self.conf.concurrency.max(1))
            .inspect(|report| self.record(report.clone()))
            .collect()
            .await
    }

    /// Mémorise un rapport (dernier + historique borné) et le transmet au sink
    pub fn record(&self, report: HealthReport) {
        {
            let mut history = self.history.lock();
            let entries = history.entry(report.instance_id.clone()).or_default();
            entries.push_back(report.clone());
            while entries.len() > self.conf.history_len.max(1) {
                entries.pop_front();
            }
        }
        self.latest.write().insert(report.instance_id.clone(), report.clone());

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.try_send(report) {
                warn!("[health] recovery queue rejected report: {e}");
            }
        }
    }

    pub fn latest(&self, id: &str) -> Option<HealthReport> {
        self.latest.read().get(id).cloned()
    }

    pub fn all_latest(&self) -> Vec<HealthReport> {
        let mut reports: Vec<HealthReport> = self.latest.read().values().cloned().collect();
        reports.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        reports
    }

    /// Historique du plus ancien au plus récent
    pub fn history(&self, id: &str) -> Vec<HealthReport> {
        self.history
            .lock()
            .get(id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Check léger (ouverture TCP sur le port santé), mis en cache `cache_ttl`
    pub async fn quick_check(&self, inst: &Instance) -> Reachability {
        if let Some((at, cached)) = self.quick_cache.lock().get(&inst.id) {
            if at.elapsed() < self.conf.cache_ttl() {
                return cached.clone();
            }
        }

        let port = inst.ports.health.or(inst.ports.display);
        let started = Instant::now();
        let outcome = match port {
            None => Err(PollError::NoHealthPort),
            Some(port) => match tokio::time::timeout(self.conf.timeout(), self.probe.ping(inst.host(), port)).await {
                Ok(result) => result,
                Err(_) => Err(PollError::Timeout(self.conf.timeout())),
            },
        };

        let checked_at = format_ts(OffsetDateTime::now_utc());
        let result = match outcome {
            Ok(()) => Reachability {
                reachable: true,
                latency_ms: Some(started.elapsed().as_millis() as u64),
                details: "reachable".into(),
                timed_out: false,
                checked_at,
            },
            Err(e) => Reachability {
                reachable: false,
                latency_ms: None,
                timed_out: matches!(e, PollError::Timeout(_)),
                details: e.to_string(),
                checked_at,
            },
        };
        self.quick_cache.lock().insert(inst.id.clone(), (Instant::now(), result.clone()));
        result
    }

    /// Boucle de polling sur le snapshot courant de la découverte
    pub fn spawn_monitor_loop(self: Arc<Self>, discovery: SharedDiscovery) {
        info!("[health] starting monitor loop (every {}s, {} in flight)", self.conf.interval_secs, self.conf.concurrency);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.conf.interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let snapshot = discovery.current();
                if snapshot.instances.is_empty() {
                    continue;
                }
                let reports = self.poll_all(&snapshot.instances).await;
                let unhealthy = reports.iter().filter(|r| !r.is_healthy()).count();
                debug!("[health] cycle done: {} polled, {unhealthy} unhealthy", reports.len());
            }
        });
    }
}
