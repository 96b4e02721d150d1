/**
 * TUNNEL RELAY - Tunnel d'octets opaque client <-> framebuffer distant
 *
 * RÔLE : Pour chaque connexion WebSocket vers /ws/tunnel/{id}, résoudre le port
 * d'affichage de l'instance, ouvrir la connexion TCP sortante et relayer les
 * octets dans les deux sens sans interprétation.
 *
 * FONCTIONNEMENT :
 * - Instance inconnue ou non prête : refus, close frame avec la raison
 * - Connexion backend bornée par `connect_timeout` ; échec = close frame explicite
 * - Une session ouverte survit au passage not-ready de l'instance
 * - Backpressure : chaque sens attend l'écriture avant de relire
 * - La fin d'un sens (fermeture ou erreur) termine l'autre et libère les deux sockets
 */

use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::{SinkExt, StreamExt};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::TunnelConf;
use crate::discovery::SharedDiscovery;
use crate::session::{Connection, ConnectionKind, ConnectionState};

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("unknown instance {0}")]
    UnknownInstance(String),
    #[error("instance {0} is not ready")]
    NotReady(String),
    #[error("instance {0} exposes no display port")]
    NoDisplayPort(String),
    #[error("backend {addr} connect timeout after {after:?}")]
    ConnectTimeout { addr: String, after: Duration },
    #[error("backend {addr} unreachable: {source}")]
    Connect { addr: String, source: io::Error },
}

impl TunnelError {
    pub fn close_code(&self) -> u16 {
        match self {
            TunnelError::UnknownInstance(_) | TunnelError::NotReady(_) | TunnelError::NoDisplayPort(_) => {
                close_code::POLICY
            }
            TunnelError::ConnectTimeout { .. } | TunnelError::Connect { .. } => close_code::ERROR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PumpEnd {
    ClientClosed,
    BackendClosed,
    ClientError(String),
    BackendError(String),
}

pub struct TunnelRelay {
    discovery: SharedDiscovery,
    conf: TunnelConf,
    active_sessions: AtomicUsize,
}

pub type SharedTunnel = Arc<TunnelRelay>;

impl TunnelRelay {
    pub fn new(discovery: SharedDiscovery, conf: TunnelConf) -> Self {
        Self { discovery, conf, active_sessions: AtomicUsize::new(0) }
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Adresse d'affichage d'une instance prête du snapshot courant
    pub fn resolve(&self, id: &str) -> Result<(String, u16), TunnelError> {
        let inst = self
            .discovery
            .resolve(id)
            .ok_or_else(|| TunnelError::UnknownInstance(id.to_string()))?;
        if !inst.is_ready() {
            return Err(TunnelError::NotReady(id.to_string()));
        }
        inst.display_endpoint().ok_or_else(|| TunnelError::NoDisplayPort(id.to_string()))
    }

    pub async fn connect_backend(&self, host: &str, port: u16) -> Result<TcpStream, TunnelError> {
        let addr = format!("{host}:{port}");
        let after = self.conf.connect_timeout();
        match tokio::time::timeout(after, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(source)) => Err(TunnelError::Connect { addr, source }),
            Err(_) => Err(TunnelError::ConnectTimeout { addr, after }),
        }
    }

    /// Une session de tunnel, de l'upgrade à la fermeture des deux sockets
    pub async fn handle_socket(self: Arc<Self>, mut socket: WebSocket, id: String) {
        let mut conn = Connection::new(ConnectionKind::Tunnel);
        let _ = conn.advance(ConnectionState::Connecting);

        let backend = match self.resolve(&id) {
            Ok((host, port)) => self.connect_backend(&host, port).await,
            Err(e) => Err(e),
        };
        let backend = match backend {
            Ok(stream) => stream,
            Err(e) => {
                warn!("[tunnel] {id}: {e}");
                let _ = conn.advance(ConnectionState::Closing);
                let frame = CloseFrame { code: e.close_code(), reason: close_reason(&e.to_string()) };
                let _ = socket.send(Message::Close(Some(frame))).await;
                conn.close();
                return;
            }
        };

        let _ = conn.advance(ConnectionState::Open);
        let sessions = self.active_sessions.fetch_add(1, Ordering::Relaxed) + 1;
        info!("[tunnel] {id}: session {} open ({sessions} active)", conn.id);

        let end = pump(socket, backend, self.conf.buffer_size.max(1024), &mut conn).await;

        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
        conn.close();
        info!("[tunnel] {id}: session {} closed ({end:?})", conn.id);
    }
}

/// Raison de close frame : 123 octets maximum, coupée sur une frontière UTF-8
fn close_reason(text: &str) -> Utf8Bytes {
    let mut end = text.len().min(123);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    Utf8Bytes::from(text[..end].to_string())
}

async fn pump(socket: WebSocket, backend: TcpStream, buffer_size: usize, conn: &mut Connection) -> PumpEnd {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (mut tcp_rx, mut tcp_tx) = backend.into_split();

    let upstream = async {
        while let Some(msg) = ws_rx.next().await {
            let data = match msg {
                Ok(Message::Binary(data)) => data,
                Ok(Message::Text(text)) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => return PumpEnd::ClientError(e.to_string()),
            };
            if let Err(e) = tcp_tx.write_all(&data).await {
                return PumpEnd::BackendError(e.to_string());
            }
        }
        let _ = tcp_tx.shutdown().await;
        PumpEnd::ClientClosed
    };

    let downstream = async {
        let mut buf = vec![0u8; buffer_size];
        loop {
            match tcp_rx.read(&mut buf).await {
                Ok(0) => return PumpEnd::BackendClosed,
                Ok(n) => {
                    if let Err(e) = ws_tx.send(Message::Binary(Bytes::copy_from_slice(&buf[..n]))).await {
                        return PumpEnd::ClientError(e.to_string());
                    }
                }
                Err(e) => return PumpEnd::BackendError(e.to_string()),
            }
        }
    };

    let end = tokio::select! {
        end = upstream => end,
        end = downstream => end,
    };
    let _ = conn.advance(ConnectionState::Closing);

    let frame = match &end {
        PumpEnd::ClientClosed | PumpEnd::ClientError(_) => None,
        PumpEnd::BackendClosed => Some(CloseFrame { code: close_code::NORMAL, reason: close_reason("backend closed") }),
        PumpEnd::BackendError(e) => Some(CloseFrame { code: close_code::ERROR, reason: close_reason(&format!("backend error: {e}")) }),
    };
    if let Some(frame) = frame {
        let _ = ws_tx.send(Message::Close(Some(frame))).await;
    }
    let _ = ws_tx.close().await;
    debug!("[tunnel] pump finished: {end:?}");
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiscoveryConf, StaticInstanceConf};
    use crate::discovery::FleetDiscovery;

    async fn relay(ready: bool) -> TunnelRelay {
        let conf = DiscoveryConf {
            static_instances: vec![StaticInstanceConf {
                host: "127.0.0.1".into(),
                display_port: Some(1),
                health_port: None,
                control_port: None,
                ready,
            }],
            ..DiscoveryConf::default()
        };
        let discovery = Arc::new(FleetDiscovery::without_cluster(conf, "test"));
        discovery.discover().await;
        TunnelRelay::new(discovery, TunnelConf::default())
    }

    #[tokio::test]
    async fn test_resolve_requires_ready_instance() {
        assert_eq!(relay(true).await.resolve("instance-0").unwrap(), ("127.0.0.1".to_string(), 1));
        assert!(matches!(relay(false).await.resolve("instance-0"), Err(TunnelError::NotReady(_))));
        assert!(matches!(relay(true).await.resolve("instance-7"), Err(TunnelError::UnknownInstance(_))));
    }

    #[tokio::test]
    async fn test_refused_backend_is_reported() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let relay = relay(true).await;
        let err = relay.connect_backend("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, TunnelError::Connect { .. }));
        assert_eq!(err.close_code(), close_code::ERROR);
    }

    #[test]
    fn test_close_reason_is_bounded() {
        let long = "é".repeat(100);
        let reason = close_reason(&long);
        assert!(reason.as_str().len() <= 123);
        assert!(reason.as_str().chars().all(|c| c == 'é'));
    }
}
