use serde::{Deserialize, Serialize};
use std::fmt;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Source qui a produit le dernier snapshot de la flotte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryMode {
    KubernetesEndpoints,
    KubernetesPods,
    Static,
}

impl DiscoveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryMode::KubernetesEndpoints => "kubernetes-endpoints",
            DiscoveryMode::KubernetesPods => "kubernetes-pods",
            DiscoveryMode::Static => "static",
        }
    }
}

impl fmt::Display for DiscoveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Readiness {
    Ready,
    NotReady,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceAddresses {
    pub pod_ip: String,
    pub hostname: Option<String>,
    pub dns_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstancePorts {
    pub display: Option<u16>,
    pub health: Option<u16>,
    pub control: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRef {
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesMeta {
    pub namespace: String,
    pub target_ref: Option<TargetRef>,
}

/// Instance de la flotte telle que vue par la découverte
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    /// `instance-<N>`, dérivé du suffixe ordinal du workload
    pub id: String,
    pub ordinal: u32,
    pub pod_name: Option<String>,
    pub addresses: InstanceAddresses,
    pub ports: InstancePorts,
    pub readiness: Readiness,
    pub kubernetes: Option<KubernetesMeta>,
    pub last_seen: OffsetDateTime,
    /// Renseigné quand l'instance a disparu de la source mais reste en période de grâce
    pub absent_since: Option<OffsetDateTime>,
}

impl Instance {
    pub fn is_ready(&self) -> bool {
        self.readiness == Readiness::Ready
    }

    /// Hôte à joindre : IP du pod, sinon hostname
    pub fn host(&self) -> &str {
        if !self.addresses.pod_ip.is_empty() {
            &self.addresses.pod_ip
        } else {
            self.addresses.hostname.as_deref().unwrap_or_default()
        }
    }

    pub fn display_endpoint(&self) -> Option<(String, u16)> {
        self.ports.display.map(|p| (self.host().to_string(), p))
    }

    pub fn health_url(&self, path: &str) -> Option<String> {
        self.ports
            .health
            .map(|p| format!("http://{}:{}{}", self.host(), p, path))
    }

    pub fn control_url(&self, suffix: &str) -> Option<String> {
        self.ports
            .control
            .map(|p| format!("http://{}:{}{}", self.host(), p, suffix))
    }
}

/// Extrait l'ordinal d'un nom de workload (ex: "loco-loco-emulator-3" -> 3)
pub fn ordinal_of(workload_name: &str) -> Option<u32> {
    let (_, suffix) = workload_name.rsplit_once('-')?;
    suffix.parse::<u32>().ok()
}

pub fn instance_id(ordinal: u32) -> String {
    format!("instance-{ordinal}")
}

pub fn format_ts(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_default()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceView {
    pub id: String,
    pub pod_name: Option<String>,
    pub ready: bool,
    pub provisioned: bool,
    pub addresses: InstanceAddresses,
    pub ports: InstancePorts,
    pub kubernetes: Option<KubernetesMeta>,
    pub last_seen: String,
}

pub fn to_view(i: &Instance) -> InstanceView {
    InstanceView {
        id: i.id.clone(),
        pod_name: i.pod_name.clone(),
        ready: i.is_ready(),
        provisioned: i.absent_since.is_none(),
        addresses: i.addresses.clone(),
        ports: i.ports,
        kubernetes: i.kubernetes.clone(),
        last_seen: format_ts(i.last_seen),
    }
}
