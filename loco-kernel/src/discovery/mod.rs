/**
 * FLEET DISCOVERY - Liste typée des instances à partir du plan de contrôle du cluster
 *
 * RÔLE : Transformer l'objet Endpoints du service (ou, à défaut, les Pods du label
 * selector) en instances `instance-<N>` prêtes / non prêtes.
 *
 * FONCTIONNEMENT :
 * - Mode primaire `kubernetes-endpoints`, repli `kubernetes-pods` si l'objet n'existe pas
 * - Échec de l'API : on garde le dernier snapshot valide, marqué `stale`
 * - Jamais de succès : liste statique, mode `static`, raison exposée (jamais cachée)
 * - Les instances disparues restent visibles (non prêtes) pendant la période de grâce
 * - Un seul cycle à la fois : un appel concurrent reçoit le snapshot courant
 */

pub mod cluster;

pub use cluster::{ClusterApi, DiscoveryError, KubeClient};

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{DiscoveryConf, PortsConf, StaticInstanceConf};
use crate::models::{
    instance_id, ordinal_of, DiscoveryMode, Instance, InstanceAddresses, InstancePorts, KubernetesMeta, Readiness,
    TargetRef,
};
use cluster::{EndpointAddress, EndpointsObject, PodList};

/// Résultat d'un cycle de découverte
#[derive(Debug, Clone)]
pub struct DiscoverySnapshot {
    pub instances: Vec<Instance>,
    pub mode: DiscoveryMode,
    /// Dernier snapshot valide resservi après un échec de l'API
    pub stale: bool,
    pub last_update: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    /// Pourquoi on tourne sur la liste statique (None en mode cluster)
    pub fallback_reason: Option<String>,
    /// Repli causé par une panne, et non par absence de configuration
    pub degraded: bool,
}

impl DiscoverySnapshot {
    fn empty() -> Self {
        Self {
            instances: Vec::new(),
            mode: DiscoveryMode::Static,
            stale: false,
            last_update: None,
            last_error: None,
            fallback_reason: None,
            degraded: false,
        }
    }

    pub fn ready_count(&self) -> usize {
        self.instances.iter().filter(|i| i.is_ready()).count()
    }

    pub fn get(&self, id: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id == id)
    }
}

/// Contexte commun aux conversions objet cluster -> Instance
pub struct ParseContext<'a> {
    pub namespace: &'a str,
    pub service_name: &'a str,
    pub ports: &'a PortsConf,
    pub now: OffsetDateTime,
}

impl ParseContext<'_> {
    fn dns_name(&self, hostname: &str) -> String {
        format!("{hostname}.{}.{}.svc.cluster.local", self.service_name, self.namespace)
    }

    fn resolve_ports<'p, I>(&self, named: I) -> InstancePorts
    where
        I: IntoIterator<Item = (Option<&'p str>, u16)>,
    {
        let mut ports = InstancePorts {
            display: Some(self.ports.display),
            health: Some(self.ports.health),
            control: Some(self.ports.control),
        };
        for (name, port) in named {
            match name {
                Some(n) if n == self.ports.display_name => ports.display = Some(port),
                Some(n) if n == self.ports.health_name => ports.health = Some(port),
                Some(n) if n == self.ports.control_name => ports.control = Some(port),
                _ => {}
            }
        }
        ports
    }
}

/// Endpoints -> instances (adresses prêtes + non prêtes)
pub fn instances_from_endpoints(obj: &EndpointsObject, ctx: &ParseContext<'_>) -> Vec<Instance> {
    let mut found = Vec::new();
    for subset in &obj.subsets {
        let ports = ctx.resolve_ports(subset.ports.iter().map(|p| (p.name.as_deref(), p.port)));
        let tagged = subset
            .addresses
            .iter()
            .map(|a| (a, Readiness::Ready))
            .chain(subset.not_ready_addresses.iter().map(|a| (a, Readiness::NotReady)));
        for (addr, readiness) in tagged {
            match instance_from_address(addr, readiness, ports, ctx) {
                Some(inst) => found.push(inst),
                None => warn!("[discovery] address {} has no ordinal workload name, skipped", addr.ip),
            }
        }
    }
    dedupe(found)
}

fn instance_from_address(
    addr: &EndpointAddress,
    readiness: Readiness,
    ports: InstancePorts,
    ctx: &ParseContext<'_>,
) -> Option<Instance> {
    let target = addr.target_ref.as_ref();
    let pod_name = target
        .and_then(|r| r.name.clone())
        .or_else(|| addr.hostname.clone())?;
    let ordinal = ordinal_of(&pod_name)?;

    let target_ref = target.map(|r| TargetRef {
        kind: r.kind.clone().unwrap_or_else(|| "Pod".into()),
        name: pod_name.clone(),
    });
    let namespace = target
        .and_then(|r| r.namespace.clone())
        .unwrap_or_else(|| ctx.namespace.to_string());

    Some(Instance {
        id: instance_id(ordinal),
        ordinal,
        addresses: InstanceAddresses {
            pod_ip: addr.ip.clone(),
            dns_name: addr.hostname.as_deref().map(|h| ctx.dns_name(h)),
            hostname: Some(addr.hostname.clone().unwrap_or_else(|| pod_name.clone())),
        },
        pod_name: Some(pod_name),
        ports,
        readiness,
        kubernetes: Some(KubernetesMeta { namespace, target_ref }),
        last_seen: ctx.now,
        absent_since: None,
    })
}

/// Pods du label selector -> instances (readiness = condition Ready)
pub fn instances_from_pods(list: &PodList, ctx: &ParseContext<'_>) -> Vec<Instance> {
    let mut found = Vec::new();
    for pod in &list.items {
        let Some(name) = pod.metadata.name.clone() else { continue };
        let Some(ordinal) = ordinal_of(&name) else {
            warn!("[discovery] pod {name} has no ordinal suffix, skipped");
            continue;
        };
        // pod sans IP : pas encore planifié, rien à joindre
        let Some(ip) = pod.status.as_ref().and_then(|s| s.pod_ip.clone()) else {
            debug!("[discovery] pod {name} has no IP yet");
            continue;
        };
        let spec = pod.spec.clone().unwrap_or_default();
        let ports = ctx.resolve_ports(
            spec.containers
                .iter()
                .flat_map(|c| c.ports.iter())
                .map(|p| (p.name.as_deref(), p.container_port)),
        );
        let hostname = spec.hostname.clone().unwrap_or_else(|| name.clone());
        let dns_name = spec.subdomain.as_ref().map(|_| ctx.dns_name(&hostname));

        found.push(Instance {
            id: instance_id(ordinal),
            ordinal,
            pod_name: Some(name.clone()),
            addresses: InstanceAddresses { pod_ip: ip, hostname: Some(hostname), dns_name },
            ports,
            readiness: if pod.is_ready() { Readiness::Ready } else { Readiness::NotReady },
            kubernetes: Some(KubernetesMeta {
                namespace: pod.metadata.namespace.clone().unwrap_or_else(|| ctx.namespace.to_string()),
                target_ref: Some(TargetRef { kind: "Pod".into(), name }),
            }),
            last_seen: ctx.now,
            absent_since: None,
        });
    }
    dedupe(found)
}

/// Liste statique : l'ordinal est la position dans la liste
pub fn instances_from_static(list: &[StaticInstanceConf], ports: &PortsConf, now: OffsetDateTime) -> Vec<Instance> {
    list.iter()
        .enumerate()
        .map(|(idx, s)| {
            let ordinal = idx as u32;
            Instance {
                id: instance_id(ordinal),
                ordinal,
                pod_name: None,
                addresses: InstanceAddresses {
                    pod_ip: String::new(),
                    hostname: Some(s.host.clone()),
                    dns_name: None,
                },
                ports: InstancePorts {
                    display: Some(s.display_port.unwrap_or(ports.display)),
                    health: Some(s.health_port.unwrap_or(ports.health)),
                    control: Some(s.control_port.unwrap_or(ports.control)),
                },
                readiness: if s.ready { Readiness::Ready } else { Readiness::NotReady },
                kubernetes: None,
                last_seen: now,
                absent_since: None,
            }
        })
        .collect()
}

/// Un id n'apparaît qu'une fois ; l'adresse prête l'emporte
fn dedupe(found: Vec<Instance>) -> Vec<Instance> {
    let mut by_ordinal: BTreeMap<u32, Instance> = BTreeMap::new();
    for inst in found {
        match by_ordinal.get(&inst.ordinal) {
            Some(existing) if existing.is_ready() || !inst.is_ready() => {
                warn!("[discovery] duplicate address for {}, keeping first", inst.id);
            }
            _ => {
                by_ordinal.insert(inst.ordinal, inst);
            }
        }
    }
    by_ordinal.into_values().collect()
}

/// Remet le drapeau `running` à false quoi qu'il arrive
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct FleetDiscovery {
    conf: DiscoveryConf,
    cluster: Option<Arc<dyn ClusterApi>>,
    unconfigured_reason: Option<String>,
    snapshot: RwLock<DiscoverySnapshot>,
    /// Instances connues (période de grâce incluse), par id
    known: Mutex<HashMap<String, Instance>>,
    has_succeeded: AtomicBool,
    running: AtomicBool,
}

pub type SharedDiscovery = Arc<FleetDiscovery>;

impl FleetDiscovery {
    pub fn new(conf: DiscoveryConf, cluster: Option<Arc<dyn ClusterApi>>) -> Self {
        Self {
            conf,
            cluster,
            unconfigured_reason: None,
            snapshot: RwLock::new(DiscoverySnapshot::empty()),
            known: Mutex::new(HashMap::new()),
            has_succeeded: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    /// Sans client cluster : on note pourquoi, exposé dans discovery-info
    pub fn without_cluster(conf: DiscoveryConf, reason: impl Into<String>) -> Self {
        let mut discovery = Self::new(conf, None);
        discovery.unconfigured_reason = Some(reason.into());
        discovery
    }

    pub fn conf(&self) -> &DiscoveryConf {
        &self.conf
    }

    pub fn cluster_configured(&self) -> bool {
        self.cluster.is_some()
    }

    /// Snapshot courant sans interroger le cluster
    pub fn current(&self) -> DiscoverySnapshot {
        self.snapshot.read().clone()
    }

    pub fn resolve(&self, id: &str) -> Option<Instance> {
        self.snapshot.read().get(id).cloned()
    }

    /// Un cycle de découverte. Si un cycle tourne déjà, renvoie le snapshot courant.
    pub async fn discover(&self) -> DiscoverySnapshot {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("[discovery] cycle already running, serving current snapshot");
            return self.current();
        }
        let _guard = CycleGuard(&self.running);
        let now = OffsetDateTime::now_utc();

        let next = match &self.cluster {
            None => self.static_snapshot(now, self.unconfigured_reason.clone(), false, None),
            Some(cluster) => match self.fetch(cluster.as_ref(), now).await {
                Ok((mode, fresh)) => {
                    self.has_succeeded.store(true, Ordering::Release);
                    DiscoverySnapshot {
                        instances: self.merge(fresh, now),
                        mode,
                        stale: false,
                        last_update: Some(now),
                        last_error: None,
                        fallback_reason: None,
                        degraded: false,
                    }
                }
                Err(e) => {
                    warn!("[discovery] cluster API unavailable: {e}");
                    if self.has_succeeded.load(Ordering::Acquire) {
                        let mut stale = self.current();
                        stale.stale = true;
                        stale.degraded = true;
                        stale.last_error = Some(e.to_string());
                        stale
                    } else {
                        self.static_snapshot(now, Some(format!("cluster API unavailable: {e}")), true, Some(e.to_string()))
                    }
                }
            },
        };

        info!(
            "[discovery] {} instances ({} ready), mode {}{}",
            next.instances.len(),
            next.ready_count(),
            next.mode,
            if next.stale { ", stale" } else { "" }
        );
        *self.snapshot.write() = next.clone();
        next
    }

    async fn fetch(
        &self,
        cluster: &dyn ClusterApi,
        now: OffsetDateTime,
    ) -> Result<(DiscoveryMode, Vec<Instance>), DiscoveryError> {
        let ctx = ParseContext {
            namespace: &self.conf.namespace,
            service_name: &self.conf.service_name,
            ports: &self.conf.ports,
            now,
        };
        match cluster.get_endpoints(&self.conf.namespace, &self.conf.service_name).await {
            Ok(obj) => Ok((DiscoveryMode::KubernetesEndpoints, instances_from_endpoints(&obj, &ctx))),
            Err(DiscoveryError::NotFound(resource)) => {
                debug!("[discovery] {resource} not found, listing pods");
                let pods = cluster.list_pods(&self.conf.namespace, &self.conf.label_selector).await?;
                Ok((DiscoveryMode::KubernetesPods, instances_from_pods(&pods, &ctx)))
            }
            Err(e) => Err(e),
        }
    }

    fn static_snapshot(
        &self,
        now: OffsetDateTime,
        reason: Option<String>,
        degraded: bool,
        error: Option<String>,
    ) -> DiscoverySnapshot {
        DiscoverySnapshot {
            instances: instances_from_static(&self.conf.static_instances, &self.conf.ports, now),
            mode: DiscoveryMode::Static,
            stale: false,
            last_update: Some(now),
            last_error: error,
            fallback_reason: reason,
            degraded,
        }
    }

    /// Fusionne un cycle frais avec les instances connues (période de grâce)
    fn merge(&self, fresh: Vec<Instance>, now: OffsetDateTime) -> Vec<Instance> {
        let grace = time::Duration::seconds(self.conf.grace_period_secs as i64);
        let mut known = self.known.lock();
        let fresh_ids: Vec<String> = fresh.iter().map(|i| i.id.clone()).collect();

        known.retain(|id, inst| {
            if fresh_ids.contains(id) {
                return true;
            }
            let since = *inst.absent_since.get_or_insert(now);
            inst.readiness = Readiness::NotReady;
            if now - since >= grace {
                info!("[discovery] {id} absent for {}s, removed", (now - since).whole_seconds());
                false
            } else {
                true
            }
        });
        for inst in fresh {
            known.insert(inst.id.clone(), inst);
        }

        let mut merged: Vec<Instance> = known.values().cloned().collect();
        merged.sort_by_key(|i| i.ordinal);
        merged
    }

    /// Boucle périodique de découverte
    pub fn spawn_discovery_loop(self: Arc<Self>) {
        info!("[discovery] starting discovery loop (every {}s)", self.conf.interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.conf.interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                self.discover().await;
            }
        });
    }
}
