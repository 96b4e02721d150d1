use serde::{Deserialize, Serialize};
use std::{path::Path, path::PathBuf, time::Duration};
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub server: ServerConf,
    pub discovery: DiscoveryConf,
    pub health: HealthConf,
    pub recovery: RecoveryConf,
    pub active: ActiveConf,
    pub tunnel: TunnelConf,
    pub signaling: SignalingConf,
    pub mqtt: Option<MqttConf>,
    pub data_dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConf {
    pub bind: String,
    /// Si présent, les routes POST exigent le header x-api-key
    pub api_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DiscoveryConf {
    pub namespace: String,
    pub service_name: String,
    pub label_selector: String,
    /// None = API in-cluster (KUBERNETES_SERVICE_HOST + service account)
    pub api_url: Option<String>,
    pub token_path: PathBuf,
    pub ca_path: PathBuf,
    pub interval_secs: u64,
    pub grace_period_secs: u64,
    pub static_instances: Vec<StaticInstanceConf>,
    pub ports: PortsConf,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StaticInstanceConf {
    pub host: String,
    pub display_port: Option<u16>,
    pub health_port: Option<u16>,
    pub control_port: Option<u16>,
    #[serde(default = "default_true")]
    pub ready: bool,
}

/// Ports par défaut et noms des ports nommés dans les objets Endpoints
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PortsConf {
    pub display: u16,
    pub health: u16,
    pub control: u16,
    pub display_name: String,
    pub health_name: String,
    pub control_name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HealthConf {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub concurrency: usize,
    pub cache_ttl_secs: u64,
    pub path: String,
    pub history_len: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RecoveryConf {
    pub failure_threshold: u32,
    pub max_attempts_per_window: usize,
    pub window_secs: u64,
    pub action_timeout_secs: u64,
    pub auto_recover: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ActiveConf {
    /// None = <data_dir>/active.json
    pub state_file: Option<PathBuf>,
    pub subscriber_buffer: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TunnelConf {
    pub connect_timeout_secs: u64,
    pub buffer_size: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SignalingConf {
    pub outbound_buffer: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

fn default_true() -> bool {
    true
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            server: ServerConf::default(),
            discovery: DiscoveryConf::default(),
            health: HealthConf::default(),
            recovery: RecoveryConf::default(),
            active: ActiveConf::default(),
            tunnel: TunnelConf::default(),
            signaling: SignalingConf::default(),
            mqtt: None,
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl Default for ServerConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:3001".into(), api_key: None }
    }
}

impl Default for DiscoveryConf {
    fn default() -> Self {
        Self {
            namespace: "loco".into(),
            service_name: "loco-loco-emulator".into(),
            label_selector: "app=loco-loco-emulator".into(),
            api_url: None,
            token_path: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token"),
            ca_path: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/ca.crt"),
            interval_secs: 30,
            grace_period_secs: 30,
            static_instances: Vec::new(),
            ports: PortsConf::default(),
        }
    }
}

impl Default for PortsConf {
    fn default() -> Self {
        Self {
            display: 5901,
            health: 8080,
            control: 9090,
            display_name: "vnc".into(),
            health_name: "health".into(),
            control_name: "control".into(),
        }
    }
}

impl Default for HealthConf {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            timeout_secs: 5,
            max_attempts: 3,
            backoff_ms: 500,
            concurrency: 10,
            cache_ttl_secs: 10,
            path: "/health".into(),
            history_len: 20,
        }
    }
}

impl Default for RecoveryConf {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            max_attempts_per_window: 5,
            window_secs: 3600,
            action_timeout_secs: 30,
            auto_recover: true,
        }
    }
}

impl Default for ActiveConf {
    fn default() -> Self {
        Self { state_file: None, subscriber_buffer: 32 }
    }
}

impl Default for TunnelConf {
    fn default() -> Self {
        Self { connect_timeout_secs: 5, buffer_size: 64 * 1024 }
    }
}

impl Default for SignalingConf {
    fn default() -> Self {
        Self { outbound_buffer: 64 }
    }
}

impl DiscoveryConf {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl HealthConf {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl RecoveryConf {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }
}

impl TunnelConf {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl KernelConfig {
    pub fn active_state_file(&self) -> PathBuf {
        self.active
            .state_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("active.json"))
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("LOCO_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt)
    } else {
        warn!("[kernel] no {path}, using default config");
        KernelConfig::default()
    };
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
    cfg
}

pub fn parse_config(txt: &str) -> KernelConfig {
    if txt.trim().is_empty() {
        return KernelConfig::default();
    }
    serde_yaml::from_str(txt).unwrap_or_else(|e| {
        warn!("[kernel] invalid config: {e}");
        KernelConfig::default()
    })
}

/// Surcharge la config fichier avec les variables LOCO_*
pub fn apply_env_overrides<F>(cfg: &mut KernelConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(bind) = lookup("LOCO_BIND") {
        cfg.server.bind = bind;
    }
    if let Some(key) = lookup("LOCO_API_KEY").filter(|k| !k.is_empty()) {
        cfg.server.api_key = Some(key);
    }
    if let Some(ns) = lookup("LOCO_NAMESPACE") {
        cfg.discovery.namespace = ns;
    }
    if let Some(svc) = lookup("LOCO_SERVICE_NAME") {
        cfg.discovery.service_name = svc;
    }
    if let Some(list) = lookup("LOCO_STATIC_INSTANCES") {
        cfg.discovery.static_instances = parse_static_list(&list);
    }
    if let Some(dir) = lookup("LOCO_DATA_DIR") {
        cfg.data_dir = PathBuf::from(dir);
    }
    if let Some(host) = lookup("LOCO_MQTT_HOST") {
        let port = lookup("LOCO_MQTT_PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(1883);
        cfg.mqtt = Some(MqttConf { host, port });
    }
}

/// "host[:displayPort],host2" -> liste statique
fn parse_static_list(list: &str) -> Vec<StaticInstanceConf> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (host, port) = match entry.rsplit_once(':') {
                Some((h, p)) => match p.parse::<u16>() {
                    Ok(port) => (h.to_string(), Some(port)),
                    Err(_) => (entry.to_string(), None),
                },
                None => (entry.to_string(), None),
            };
            StaticInstanceConf {
                host,
                display_port: port,
                health_port: None,
                control_port: None,
                ready: true,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.health.interval(), Duration::from_secs(15));
        assert_eq!(cfg.health.timeout(), Duration::from_secs(5));
        assert_eq!(cfg.health.concurrency, 10);
        assert_eq!(cfg.recovery.failure_threshold, 5);
        assert_eq!(cfg.tunnel.connect_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.active_state_file(), PathBuf::from("./data/active.json"));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg = parse_config(
            "discovery:\n  namespace: arcade\n  static_instances:\n    - host: 10.1.0.5\n      display_port: 5902\nrecovery:\n  failure_threshold: 3\n",
        );
        assert_eq!(cfg.discovery.namespace, "arcade");
        assert_eq!(cfg.discovery.service_name, "loco-loco-emulator");
        assert_eq!(cfg.discovery.static_instances.len(), 1);
        assert!(cfg.discovery.static_instances[0].ready);
        assert_eq!(cfg.recovery.failure_threshold, 3);
        assert_eq!(cfg.recovery.max_attempts_per_window, 5);
    }

    #[test]
    fn test_invalid_yaml_falls_back() {
        let cfg = parse_config("health: [not, a, map]");
        assert_eq!(cfg.health.interval_secs, 15);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("LOCO_BIND", "127.0.0.1:4000"),
            ("LOCO_STATIC_INSTANCES", "10.0.0.1:5901, emu.local"),
            ("LOCO_MQTT_HOST", "broker"),
        ]);
        let mut cfg = KernelConfig::default();
        apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.server.bind, "127.0.0.1:4000");
        assert_eq!(cfg.discovery.static_instances.len(), 2);
        assert_eq!(cfg.discovery.static_instances[0].host, "10.0.0.1");
        assert_eq!(cfg.discovery.static_instances[0].display_port, Some(5901));
        assert_eq!(cfg.discovery.static_instances[1].host, "emu.local");
        assert_eq!(cfg.discovery.static_instances[1].display_port, None);
        let mqtt = cfg.mqtt.expect("mqtt configured");
        assert_eq!((mqtt.host.as_str(), mqtt.port), ("broker", 1883));
    }
}
