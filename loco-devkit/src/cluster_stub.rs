/*!
Stub d'API cluster

Répond aux deux lectures utilisées par la découverte :
- `GET /api/v1/namespaces/{ns}/endpoints/{name}` (404 si non défini)
- `GET /api/v1/namespaces/{ns}/pods?labelSelector=...`

Un code d'échec forcé simule une API indisponible.
*/

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::test_utils::serve;

/// Construit un objet Endpoints (adresses prêtes / non prêtes, ports nommés)
#[derive(Debug, Clone)]
pub struct EndpointsBuilder {
    name: String,
    namespace: String,
    ready: Vec<(String, String)>,
    not_ready: Vec<(String, String)>,
    ports: Vec<(String, u16)>,
}

impl EndpointsBuilder {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ready: Vec::new(),
            not_ready: Vec::new(),
            ports: Vec::new(),
        }
    }

    pub fn ready(mut self, pod: &str, ip: &str) -> Self {
        self.ready.push((pod.to_string(), ip.to_string()));
        self
    }

    pub fn not_ready(mut self, pod: &str, ip: &str) -> Self {
        self.not_ready.push((pod.to_string(), ip.to_string()));
        self
    }

    pub fn port(mut self, name: &str, port: u16) -> Self {
        self.ports.push((name.to_string(), port));
        self
    }

    fn address(&self, pod: &str, ip: &str) -> Value {
        json!({
            "ip": ip,
            "hostname": pod,
            "targetRef": { "kind": "Pod", "name": pod, "namespace": self.namespace }
        })
    }

    pub fn build(&self) -> Value {
        json!({
            "kind": "Endpoints",
            "metadata": { "name": self.name, "namespace": self.namespace },
            "subsets": [{
                "addresses": self.ready.iter().map(|(p, ip)| self.address(p, ip)).collect::<Vec<_>>(),
                "notReadyAddresses": self.not_ready.iter().map(|(p, ip)| self.address(p, ip)).collect::<Vec<_>>(),
                "ports": self.ports.iter().map(|(n, p)| json!({ "name": n, "port": p, "protocol": "TCP" })).collect::<Vec<_>>()
            }]
        })
    }
}

#[derive(Default)]
struct ClusterInner {
    endpoints: Mutex<Option<Value>>,
    pods: Mutex<Option<Value>>,
    fail_with: Mutex<Option<u16>>,
    requests: AtomicUsize,
}

#[derive(Clone)]
pub struct StubCluster {
    inner: Arc<ClusterInner>,
    addr: SocketAddr,
}

impl StubCluster {
    pub async fn start() -> Result<Self> {
        let inner = Arc::new(ClusterInner::default());
        let router = Router::new()
            .route("/api/v1/namespaces/{ns}/endpoints/{name}", get(get_endpoints))
            .route("/api/v1/namespaces/{ns}/pods", get(list_pods))
            .with_state(inner.clone());
        let addr = serve(router).await?;
        log::info!("stub cluster API on {addr}");
        Ok(Self { inner, addr })
    }

    /// URL à mettre dans `discovery.api_url`
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_endpoints(&self, endpoints: Value) {
        *self.inner.endpoints.lock() = Some(endpoints);
    }

    pub fn clear_endpoints(&self) {
        *self.inner.endpoints.lock() = None;
    }

    pub fn set_pods(&self, pods: Vec<Value>) {
        *self.inner.pods.lock() = Some(json!({ "kind": "PodList", "items": pods }));
    }

    /// Toutes les requêtes répondent `status` jusqu'à `recover()`
    pub fn fail_with(&self, status: u16) {
        *self.inner.fail_with.lock() = Some(status);
    }

    pub fn recover(&self) {
        *self.inner.fail_with.lock() = None;
    }

    pub fn requests(&self) -> usize {
        self.inner.requests.load(Ordering::SeqCst)
    }
}

/// Pod prêt ou non, avec son IP et un port d'affichage nommé
pub fn pod(name: &str, ip: &str, ready: bool) -> Value {
    json!({
        "metadata": { "name": name },
        "spec": { "containers": [{ "ports": [{ "name": "vnc", "containerPort": 5901 }] }] },
        "status": {
            "podIP": ip,
            "conditions": [{ "type": "Ready", "status": if ready { "True" } else { "False" } }]
        }
    })
}

fn forced_failure(inner: &ClusterInner) -> Option<(StatusCode, Json<Value>)> {
    inner.requests.fetch_add(1, Ordering::SeqCst);
    let status = (*inner.fail_with.lock())?;
    let code = StatusCode::from_u16(status).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
    Some((code, Json(json!({ "kind": "Status", "code": status }))))
}

async fn get_endpoints(
    State(inner): State<Arc<ClusterInner>>,
    Path((_ns, name)): Path<(String, String)>,
) -> (StatusCode, Json<Value>) {
    if let Some(failure) = forced_failure(&inner) {
        return failure;
    }
    match inner.endpoints.lock().clone() {
        Some(obj) => (StatusCode::OK, Json(obj)),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "kind": "Status", "reason": "NotFound", "message": format!("endpoints \"{name}\" not found") })),
        ),
    }
}

async fn list_pods(State(inner): State<Arc<ClusterInner>>, Path(_ns): Path<String>) -> (StatusCode, Json<Value>) {
    if let Some(failure) = forced_failure(&inner) {
        return failure;
    }
    let pods = inner.pods.lock().clone().unwrap_or_else(|| json!({ "kind": "PodList", "items": [] }));
    (StatusCode::OK, Json(pods))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_builder() {
        let obj = EndpointsBuilder::new("loco", "svc")
            .ready("pod-0", "10.0.0.1")
            .not_ready("pod-1", "10.0.0.2")
            .port("vnc", 5901)
            .build();
        assert_eq!(obj["subsets"][0]["addresses"][0]["ip"], "10.0.0.1");
        assert_eq!(obj["subsets"][0]["notReadyAddresses"][0]["targetRef"]["name"], "pod-1");
        assert_eq!(obj["subsets"][0]["ports"][0]["port"], 5901);
    }

    #[tokio::test]
    async fn test_missing_endpoints_is_404() {
        let cluster = StubCluster::start().await.unwrap();
        let resp = reqwest::get(format!("{}/api/v1/namespaces/loco/endpoints/svc", cluster.url())).await.unwrap();
        assert_eq!(resp.status().as_u16(), 404);

        cluster.fail_with(503);
        let resp = reqwest::get(format!("{}/api/v1/namespaces/loco/pods?labelSelector=a%3Db", cluster.url()))
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 503);
        assert_eq!(cluster.requests(), 2);
    }
}
