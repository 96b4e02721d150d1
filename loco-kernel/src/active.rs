/**
 * ACTIVE INSTANCE COORDINATOR - Source unique du focus de la flotte
 *
 * RÔLE : Tenir la liste ordonnée des instances focalisées et son numéro de
 * version, la persister et la diffuser à tous les abonnés.
 *
 * FONCTIONNEMENT :
 * - Un seul écrivain à la fois (mutex async), les appels concurrents sont mis en file
 * - Chaque appel incrémente la version, même si la liste ne change pas
 * - Persistance (fichier temporaire + rename) AVANT diffusion
 * - Diffusion non bloquante : un abonné dont le buffer est plein est déconnecté
 * - Notification de scaling best-effort, son échec n'est que loggé
 */

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ActiveError {
    #[error("active set storage: {0}")]
    Io(#[from] std::io::Error),
    #[error("active set encoding: {0}")]
    Json(#[from] serde_json::Error),
}

/// Ensemble persisté
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSet {
    pub ids: Vec<String>,
    pub version: u64,
}

/// Message diffusé aux abonnés
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveUpdate {
    pub active: Vec<String>,
    pub version: u64,
}

impl From<&ActiveSet> for ActiveUpdate {
    fn from(set: &ActiveSet) -> Self {
        Self { active: set.ids.clone(), version: set.version }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SetActiveOutcome {
    pub active: Vec<String>,
    pub version: u64,
    pub changed: bool,
}

/// Collaborateur externe qui ajuste l'allocation de ressources
#[async_trait]
pub trait ScalingNotifier: Send + Sync {
    async fn notify(&self, update: &ActiveUpdate) -> anyhow::Result<()>;
}

pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<ActiveUpdate>,
}

pub struct ActiveCoordinator {
    path: PathBuf,
    buffer: usize,
    current: RwLock<ActiveSet>,
    writer: tokio::sync::Mutex<()>,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<ActiveUpdate>>>,
    next_subscriber: AtomicU64,
    notifier: Option<Arc<dyn ScalingNotifier>>,
}

pub type SharedActive = Arc<ActiveCoordinator>;

impl ActiveCoordinator {
    /// Recharge le dernier focus persisté (ensemble vide si absent ou illisible)
    pub async fn load(path: impl Into<PathBuf>, buffer: usize) -> Result<Self, ActiveError> {
        let path = path.into();
        let current = match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<ActiveSet>(&content) {
                Ok(set) => {
                    info!("[active] restored {} active ids at version {}", set.ids.len(), set.version);
                    set
                }
                Err(e) => {
                    warn!("[active] unreadable {}: {e}, starting empty", path.display());
                    ActiveSet::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ActiveSet::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            buffer: buffer.max(1),
            current: RwLock::new(current),
            writer: tokio::sync::Mutex::new(()),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
            notifier: None,
        })
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ScalingNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn get(&self) -> ActiveSet {
        self.current.read().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Remplace le focus. La version est toujours incrémentée.
    pub async fn set_active(&self, ids: Vec<String>) -> Result<SetActiveOutcome, ActiveError> {
        let _writer = self.writer.lock().await;

        let mut unique: Vec<String> = Vec::with_capacity(ids.len());
        for id in ids.into_iter().map(|s| s.trim().to_string()) {
            if !id.is_empty() && !unique.contains(&id) {
                unique.push(id);
            }
        }

        let previous = self.get();
        let next = ActiveSet { ids: unique, version: previous.version + 1 };
        persist(&self.path, &next).await?;

        let update = ActiveUpdate::from(&next);
        {
            let mut subscribers = self.subscribers.lock();
            *self.current.write() = next.clone();
            subscribers.retain(|sub_id, tx| match tx.try_send(update.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!("[active] subscriber {sub_id} too slow, disconnecting");
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("[active] subscriber {sub_id} gone");
                    false
                }
            });
        }
        info!("[active] version {} -> {:?}", next.version, next.ids);

        if let Some(notifier) = &self.notifier {
            let notifier = Arc::clone(notifier);
            let update = update.clone();
            tokio::spawn(async move {
                if let Err(e) = notifier.notify(&update).await {
                    warn!("[active] scaling notification failed: {e}");
                }
            });
        }

        Ok(SetActiveOutcome { changed: previous.ids != next.ids, active: next.ids, version: next.version })
    }

    /// Nouvel abonné : reçoit immédiatement l'état courant
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.lock();
        let initial = ActiveUpdate::from(&*self.current.read());
        // buffer neuf, ne peut pas être plein
        let _ = tx.try_send(initial);
        subscribers.insert(id, tx);
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().remove(&id);
    }
}

async fn persist(path: &Path, set: &ActiveSet) -> Result<(), ActiveError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(set)?).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
