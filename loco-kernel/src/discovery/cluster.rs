//! Accès lecture à l'API du cluster : objets Endpoints et Pods.
//!
//! Seul le sous-ensemble des objets Kubernetes utile à la découverte est
//! désérialisé ; tout le reste est ignoré.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::config::DiscoveryConf;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("cluster API not configured: {0}")]
    NotConfigured(String),
    #[error("cluster API request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("cluster API returned {status} for {resource}")]
    Status { status: u16, resource: String },
    #[error("cluster object not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObjectMeta {
    pub name: Option<String>,
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointsObject {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub subsets: Vec<EndpointSubset>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSubset {
    #[serde(default)]
    pub addresses: Vec<EndpointAddress>,
    #[serde(default)]
    pub not_ready_addresses: Vec<EndpointAddress>,
    #[serde(default)]
    pub ports: Vec<EndpointPort>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointAddress {
    pub ip: String,
    pub hostname: Option<String>,
    pub target_ref: Option<ObjectReference>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectReference {
    pub kind: Option<String>,
    pub name: Option<String>,
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointPort {
    pub name: Option<String>,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodList {
    #[serde(default)]
    pub items: Vec<Pod>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pod {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: Option<PodSpec>,
    pub status: Option<PodStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodSpec {
    pub hostname: Option<String>,
    pub subdomain: Option<String>,
    #[serde(default)]
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Container {
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    pub name: Option<String>,
    pub container_port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodStatus {
    #[serde(rename = "podIP")]
    pub pod_ip: Option<String>,
    #[serde(default)]
    pub conditions: Vec<PodCondition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PodCondition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
}

impl Pod {
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.conditions.iter().any(|c| c.kind == "Ready" && c.status == "True"))
            .unwrap_or(false)
    }
}

/// Lecture des objets de readiness du cluster (get/list)
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<EndpointsObject, DiscoveryError>;
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<PodList, DiscoveryError>;
}

/// Client REST minimal vers l'API server
pub struct KubeClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl KubeClient {
    /// URL explicite (proxy, stub de test) ou configuration in-cluster
    pub async fn from_config(conf: &DiscoveryConf) -> Result<Self, DiscoveryError> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(10));

        let base_url = match &conf.api_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
                    DiscoveryError::NotConfigured("KUBERNETES_SERVICE_HOST not set".into())
                })?;
                let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
                format!("https://{host}:{port}")
            }
        };

        let token = match tokio::fs::read_to_string(&conf.token_path).await {
            Ok(t) => Some(t.trim().to_string()),
            Err(_) if conf.api_url.is_some() => None,
            Err(e) => {
                return Err(DiscoveryError::NotConfigured(format!(
                    "service account token {}: {e}",
                    conf.token_path.display()
                )))
            }
        };

        if let Ok(pem) = tokio::fs::read(&conf.ca_path).await {
            let cert = reqwest::Certificate::from_pem(&pem)?;
            builder = builder.add_root_certificate(cert);
        }

        Ok(Self { http: builder.build()?, base_url, token })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        resource: &str,
    ) -> Result<T, DiscoveryError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("[discovery] GET {url} {query:?}");
        let mut req = self.http.get(&url).query(query);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(DiscoveryError::NotFound(resource.to_string())),
            s if !s.is_success() => Err(DiscoveryError::Status {
                status: s.as_u16(),
                resource: resource.to_string(),
            }),
            _ => Ok(resp.json::<T>().await?),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClient {
    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<EndpointsObject, DiscoveryError> {
        let path = format!("/api/v1/namespaces/{namespace}/endpoints/{name}");
        self.get_json(&path, &[], &format!("endpoints/{name}")).await
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<PodList, DiscoveryError> {
        let path = format!("/api/v1/namespaces/{namespace}/pods");
        self.get_json(&path, &[("labelSelector", label_selector)], &format!("pods[{label_selector}]"))
            .await
    }
}
