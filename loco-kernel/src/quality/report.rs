//! Ingestion du payload de santé d'une instance et calcul du rapport.
//!
//! Le payload externe est faiblement typé : chaque champ attendu est extrait
//! par pointeur JSON, et tout champ absent ou mal typé compte comme un échec
//! du sous-système concerné.

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

use crate::models::format_ts;

pub const WEIGHT_PROCESS: u8 = 30;
pub const WEIGHT_DISPLAY: u8 = 25;
pub const WEIGHT_AUDIO: u8 = 20;
pub const WEIGHT_NETWORK: u8 = 15;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatus {
    pub alive: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayStatus {
    pub reachable: bool,
    pub active: bool,
    pub frame_rate: f64,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioStatus {
    pub running: bool,
    pub device_count: u32,
    pub alsa_devices: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub bridge_up: bool,
    pub tap_up: bool,
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub tx_errors: u64,
    pub rx_errors: u64,
}

impl NetworkStatus {
    pub fn interface_up(&self) -> bool {
        self.bridge_up && self.tap_up
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub load_average: Option<f64>,
    pub guest_cpu_percent: Option<f64>,
    pub guest_memory_percent: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubsystemStatus {
    pub process: ProcessStatus,
    pub display: DisplayStatus,
    pub audio: AudioStatus,
    pub network: NetworkStatus,
    pub resources: ResourceStatus,
}

/// Drapeaux booléens servant au score et à la classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubsystemFlags {
    pub process: bool,
    pub display: bool,
    pub audio: bool,
    pub network: bool,
}

impl SubsystemFlags {
    pub const ALL_OK: SubsystemFlags = SubsystemFlags { process: true, display: true, audio: true, network: true };
    pub const ALL_FAILED: SubsystemFlags = SubsystemFlags { process: false, display: false, audio: false, network: false };

    /// Noms des sous-systèmes en échec, dans un ordre stable
    pub fn failing(&self) -> Vec<&'static str> {
        [
            ("process", self.process),
            ("display", self.display),
            ("audio", self.audio),
            ("network", self.network),
        ]
        .into_iter()
        .filter(|(_, ok)| !ok)
        .map(|(name, _)| name)
        .collect()
    }
}

impl SubsystemStatus {
    pub fn flags(&self) -> SubsystemFlags {
        SubsystemFlags {
            process: self.process.alive,
            display: self.display.reachable,
            audio: self.audio.running,
            network: self.network.interface_up(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthBand {
    Healthy,
    Warning,
    Degraded,
    Critical,
}

impl HealthBand {
    pub fn from_score(score: u8) -> Self {
        match score {
            95.. => HealthBand::Healthy,
            80..=94 => HealthBand::Warning,
            50..=79 => HealthBand::Degraded,
            _ => HealthBand::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    None,
    Network,
    Process,
    Client,
    Mixed,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::None => "none",
            Classification::Network => "network",
            Classification::Process => "process",
            Classification::Client => "client",
            Classification::Mixed => "mixed",
        }
    }
}

pub fn sla_score(flags: &SubsystemFlags) -> u8 {
    let mut penalty: u8 = 0;
    if !flags.process {
        penalty += WEIGHT_PROCESS;
    }
    if !flags.display {
        penalty += WEIGHT_DISPLAY;
    }
    if !flags.audio {
        penalty += WEIGHT_AUDIO;
    }
    if !flags.network {
        penalty += WEIGHT_NETWORK;
    }
    100u8.saturating_sub(penalty)
}

/// Comptage littéral des catégories en échec (affichage et audio = client)
pub fn classify(flags: &SubsystemFlags) -> Classification {
    let mut categories = Vec::with_capacity(3);
    if !flags.network {
        categories.push(Classification::Network);
    }
    if !flags.process {
        categories.push(Classification::Process);
    }
    if !flags.display || !flags.audio {
        categories.push(Classification::Client);
    }
    match categories.as_slice() {
        [] => Classification::None,
        [single] => *single,
        _ => Classification::Mixed,
    }
}

/// Rapport de santé d'un cycle de polling
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub instance_id: String,
    pub timestamp: String,
    pub reachable: bool,
    pub attempts: u32,
    pub latency_ms: Option<u64>,
    /// Statut global annoncé par l'instance, à titre informatif
    pub reported_status: Option<String>,
    pub subsystems: SubsystemStatus,
    pub flags: SubsystemFlags,
    pub score: u8,
    pub status: HealthBand,
    pub classification: Classification,
    pub failing: Vec<&'static str>,
    pub schema_errors: Vec<String>,
    pub error: Option<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.classification == Classification::None
    }

    fn build(
        instance_id: &str,
        at: OffsetDateTime,
        subsystems: SubsystemStatus,
        flags: SubsystemFlags,
    ) -> Self {
        let score = sla_score(&flags);
        HealthReport {
            instance_id: instance_id.to_string(),
            timestamp: format_ts(at),
            reachable: true,
            attempts: 1,
            latency_ms: None,
            reported_status: None,
            subsystems,
            flags,
            score,
            status: HealthBand::from_score(score),
            classification: classify(&flags),
            failing: flags.failing(),
            schema_errors: Vec::new(),
            error: None,
        }
    }

    /// Rapport à partir d'un payload reçu
    pub fn from_payload(instance_id: &str, at: OffsetDateTime, payload: &Value) -> Self {
        let mut reader = PayloadReader { payload, errors: Vec::new() };
        let subsystems = reader.subsystems();
        let mut report = Self::build(instance_id, at, subsystems.clone(), subsystems.flags());
        report.reported_status = payload.get("status").and_then(Value::as_str).map(str::to_string);
        report.schema_errors = reader.errors;
        report
    }

    /// Instance injoignable sur toutes les tentatives : tout est en échec, score 0
    pub fn unreachable(instance_id: &str, at: OffsetDateTime, attempts: u32, error: String) -> Self {
        let mut report = Self::build(instance_id, at, SubsystemStatus::default(), SubsystemFlags::ALL_FAILED);
        report.reachable = false;
        report.score = 0;
        report.status = HealthBand::Critical;
        report.attempts = attempts;
        report.error = Some(error);
        report
    }
}

/// Lecture stricte : chaque champ manquant ou mal typé est noté et vaut "échec"
struct PayloadReader<'a> {
    payload: &'a Value,
    errors: Vec<String>,
}

impl PayloadReader<'_> {
    fn bool(&mut self, pointer: &str) -> bool {
        match self.payload.pointer(pointer) {
            Some(Value::Bool(b)) => *b,
            Some(other) => {
                self.errors.push(format!("{pointer}: expected bool, got {other}"));
                false
            }
            None => {
                self.errors.push(format!("{pointer}: missing"));
                false
            }
        }
    }

    fn count(&mut self, pointer: &str) -> u64 {
        match self.payload.pointer(pointer) {
            None => 0,
            Some(v) => v.as_u64().unwrap_or_else(|| {
                self.errors.push(format!("{pointer}: expected non-negative integer"));
                0
            }),
        }
    }

    fn float(&mut self, pointer: &str) -> Option<f64> {
        let v = self.payload.pointer(pointer)?;
        let parsed = v.as_f64();
        if parsed.is_none() {
            self.errors.push(format!("{pointer}: expected number"));
        }
        parsed
    }

    fn subsystems(&mut self) -> SubsystemStatus {
        SubsystemStatus {
            process: ProcessStatus { alive: self.bool("/qemu_healthy") },
            display: DisplayStatus {
                reachable: self.bool("/video/vnc_available"),
                active: self.payload.pointer("/video/display_active").and_then(Value::as_bool).unwrap_or(false),
                frame_rate: self.float("/video/estimated_frame_rate").unwrap_or(0.0),
                port: self
                    .payload
                    .pointer("/video/vnc_port")
                    .and_then(Value::as_u64)
                    .and_then(|p| u16::try_from(p).ok()),
            },
            audio: AudioStatus {
                running: self.bool("/audio/pulse_running"),
                device_count: self.count("/audio/audio_devices") as u32,
                alsa_devices: self.count("/audio/alsa_devices") as u32,
            },
            network: NetworkStatus {
                bridge_up: self.bool("/network/bridge_up"),
                tap_up: self.bool("/network/tap_up"),
                tx_packets: self.count("/network/tx_packets"),
                rx_packets: self.count("/network/rx_packets"),
                tx_errors: self.count("/network/tx_errors"),
                rx_errors: self.count("/network/rx_errors"),
            },
            resources: ResourceStatus {
                cpu_percent: self.float("/performance/cpu_usage"),
                memory_percent: self.float("/performance/memory_usage"),
                load_average: self.float("/performance/load_average"),
                guest_cpu_percent: self.float("/performance/qemu_cpu"),
                guest_memory_percent: self.float("/performance/qemu_memory"),
            },
        }
    }
}
