/**
 * SIGNALING RELAY - Routage des messages de négociation média entre pairs
 *
 * RÔLE : Chaque client s'enregistre sous une clé (client ou instance), puis
 * envoie `{type: signal, target, payload}` ; le relais transmet `payload` tel
 * quel à la connexion enregistrée sous `target`, annoté de `from`.
 *
 * FONCTIONNEMENT :
 * - Aucune inspection du payload (RawValue recopié octet pour octet)
 * - Dernier enregistrement gagnant : l'ancienne connexion ne reçoit plus rien
 * - Cible absente ou fermée : message abandonné et loggé, l'émetteur n'est jamais bloqué
 * - Une task d'écriture par connexion, alimentée par un canal borné
 */

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::session::{Connection, ConnectionKind, ConnectionState};

/// Message client, lu sans interpréter `payload`
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "clientId")]
    client_id: Option<String>,
    #[serde(default, rename = "instanceId")]
    instance_id: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    payload: Option<Box<RawValue>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerMessage<'a> {
    Registered { id: &'a str },
    Signal { from: &'a str, payload: &'a RawValue },
    Error { reason: String },
}

impl ServerMessage<'_> {
    fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!(r#"{{"type":"error","reason":"{e}"}}"#))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    UnknownTarget,
    /// La connexion cible est fermée, l'entrée a été retirée
    TargetGone,
    /// Buffer sortant de la cible plein, message abandonné
    TargetBusy,
}

struct Peer {
    conn_id: Uuid,
    tx: mpsc::Sender<String>,
}

pub struct SignalingHub {
    routes: Mutex<HashMap<String, Peer>>,
    buffer: usize,
}

pub type SharedSignaling = Arc<SignalingHub>;

impl SignalingHub {
    pub fn new(buffer: usize) -> Self {
        Self { routes: Mutex::new(HashMap::new()), buffer: buffer.max(1) }
    }

    pub fn registered(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.routes.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Enregistre `key` ; retourne la connexion déplacée, s'il y en avait une
    pub fn register(&self, key: &str, conn_id: Uuid, tx: mpsc::Sender<String>) -> Option<Uuid> {
        let displaced = self
            .routes
            .lock()
            .insert(key.to_string(), Peer { conn_id, tx })
            .map(|old| old.conn_id)
            .filter(|old| *old != conn_id);
        if let Some(old) = displaced {
            info!("[signaling] {key} re-registered, connection {old} displaced");
        }
        displaced
    }

    /// Ne retire l'entrée que si elle appartient encore à cette connexion
    pub fn unregister(&self, key: &str, conn_id: Uuid) -> bool {
        let mut routes = self.routes.lock();
        match routes.get(key) {
            Some(peer) if peer.conn_id == conn_id => {
                routes.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn route(&self, from: &str, target: &str, payload: &RawValue) -> RouteOutcome {
        let text = ServerMessage::Signal { from, payload }.to_text();
        let mut routes = self.routes.lock();
        let Some(peer) = routes.get(target) else {
            debug!("[signaling] {from} -> {target}: target not registered, dropped");
            return RouteOutcome::UnknownTarget;
        };
        match peer.tx.try_send(text) {
            Ok(()) => RouteOutcome::Delivered,
            Err(TrySendError::Full(_)) => {
                warn!("[signaling] {from} -> {target}: outbound buffer full, dropped");
                RouteOutcome::TargetBusy
            }
            Err(TrySendError::Closed(_)) => {
                debug!("[signaling] {from} -> {target}: connection closed, dropped");
                routes.remove(target);
                RouteOutcome::TargetGone
            }
        }
    }

    /// Traite un message texte d'une connexion
    fn handle_text(&self, conn_id: Uuid, tx: &mpsc::Sender<String>, key: &mut Option<String>, text: &str) {
        let reply = |msg: ServerMessage<'_>| {
            let _ = tx.try_send(msg.to_text());
        };
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(e) => return reply(ServerMessage::Error { reason: format!("invalid message: {e}") }),
        };

        match envelope.kind.as_str() {
            "register" => {
                // priorité : id, puis clientId, puis instanceId
                let id = [envelope.id, envelope.client_id, envelope.instance_id]
                    .into_iter()
                    .flatten()
                    .find(|id| !id.is_empty());
                let Some(id) = id else {
                    return reply(ServerMessage::Error { reason: "register requires an id".into() });
                };
                if let Some(previous) = key.take().filter(|k| *k != id) {
                    self.unregister(&previous, conn_id);
                }
                self.register(&id, conn_id, tx.clone());
                reply(ServerMessage::Registered { id: &id });
                *key = Some(id);
            }
            "signal" => {
                let Some(from) = key.as_deref() else {
                    return reply(ServerMessage::Error { reason: "not registered".into() });
                };
                match (envelope.target, envelope.payload) {
                    (Some(target), Some(payload)) => {
                        self.route(from, &target, &payload);
                    }
                    _ => reply(ServerMessage::Error { reason: "signal requires target and payload".into() }),
                }
            }
            other => reply(ServerMessage::Error { reason: format!("unknown message type {other}") }),
        }
    }
}

/// Une connexion WebSocket de signalisation, jusqu'à sa fermeture
pub async fn handle_socket(socket: WebSocket, hub: SharedSignaling) {
    let mut conn = Connection::new(ConnectionKind::Signaling);
    let _ = conn.advance(ConnectionState::Connecting);
    let _ = conn.advance(ConnectionState::Open);

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(hub.buffer);

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut key: Option<String> = None;
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => hub.handle_text(conn.id, &tx, &mut key, text.as_str()),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("[signaling] connection {} error: {e}", conn.id);
                break;
            }
        }
    }

    let _ = conn.advance(ConnectionState::Closing);
    if let Some(k) = key {
        hub.unregister(&k, conn.id);
    }
    drop(tx);
    writer.abort();
    conn.close();
}
