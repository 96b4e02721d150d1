//! Actions de récupération et leur exécution sur l'agent de contrôle de l'instance.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::models::Instance;
use crate::quality::Classification;

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("unknown instance {0}")]
    UnknownInstance(String),
    #[error("instance {0} exposes no control port")]
    NoControlPort(String),
    #[error("{action} timed out after {after:?}")]
    Timeout { action: &'static str, after: Duration },
    #[error("{action} failed: {reason}")]
    ActionFailed { action: &'static str, reason: String },
    #[error("control request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryAction {
    /// Remise à zéro de l'interface réseau invitée
    NetworkReset,
    /// Redémarrage du processus de virtualisation
    ProcessRestart,
    /// Redémarrage de la seule session côté client (affichage, audio)
    SessionRestart,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::NetworkReset => "network-reset",
            RecoveryAction::ProcessRestart => "process-restart",
            RecoveryAction::SessionRestart => "session-restart",
        }
    }
}

/// Plan d'actions séquentiel selon la dernière classification connue
pub fn plan_for(classification: Option<Classification>) -> Vec<RecoveryAction> {
    match classification {
        Some(Classification::Network) => vec![RecoveryAction::NetworkReset],
        Some(Classification::Client) => vec![RecoveryAction::SessionRestart],
        Some(Classification::Mixed) => vec![RecoveryAction::NetworkReset, RecoveryAction::ProcessRestart],
        Some(Classification::Process) | Some(Classification::None) | None => vec![RecoveryAction::ProcessRestart],
    }
}

#[async_trait]
pub trait RecoveryExecutor: Send + Sync {
    async fn execute(&self, instance: &Instance, action: RecoveryAction) -> Result<(), RecoveryError>;
}

/// POST http://<hôte>:<port contrôle>/recover/<action>
pub struct HttpRecoveryExecutor {
    client: reqwest::Client,
}

impl HttpRecoveryExecutor {
    pub fn new(timeout: Duration) -> Result<Self, RecoveryError> {
        Ok(Self { client: reqwest::Client::builder().timeout(timeout).build()? })
    }
}

#[async_trait]
impl RecoveryExecutor for HttpRecoveryExecutor {
    async fn execute(&self, instance: &Instance, action: RecoveryAction) -> Result<(), RecoveryError> {
        let url = instance
            .control_url(&format!("/recover/{}", action.as_str()))
            .ok_or_else(|| RecoveryError::NoControlPort(instance.id.clone()))?;
        debug!("[recovery] POST {url}");
        let resp = self.client.post(&url).send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(RecoveryError::ActionFailed {
                action: action.as_str(),
                reason: format!("HTTP {status}: {}", body.trim()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_by_classification() {
        assert_eq!(plan_for(Some(Classification::Network)), vec![RecoveryAction::NetworkReset]);
        assert_eq!(plan_for(Some(Classification::Client)), vec![RecoveryAction::SessionRestart]);
        assert_eq!(
            plan_for(Some(Classification::Mixed)),
            vec![RecoveryAction::NetworkReset, RecoveryAction::ProcessRestart]
        );
        assert_eq!(plan_for(None), vec![RecoveryAction::ProcessRestart]);
        assert_eq!(plan_for(Some(Classification::None)), vec![RecoveryAction::ProcessRestart]);
    }

    #[test]
    fn test_action_names() {
        assert_eq!(RecoveryAction::SessionRestart.as_str(), "session-restart");
        assert_eq!(serde_json::to_value(RecoveryAction::NetworkReset).unwrap(), "network-reset");
    }
}
