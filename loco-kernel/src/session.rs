//! Machine à états d'une connexion client (relais de signalisation, tunnel).
//!
//! uninitialized -> connecting -> open -> closing -> closed
//! Une connexion peut être fermée avant d'être ouverte ; aucun retour arrière.

use serde::Serialize;
use std::fmt;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn can_advance_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Uninitialized, Connecting)
                | (Uninitialized, Closing)
                | (Connecting, Open)
                | (Connecting, Closing)
                | (Open, Closing)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {from} -> {to}")]
pub struct TransitionError {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Signaling,
    Tunnel,
    Active,
}

#[derive(Debug)]
pub struct Connection {
    pub id: Uuid,
    pub kind: ConnectionKind,
    state: ConnectionState,
}

impl Connection {
    pub fn new(kind: ConnectionKind) -> Self {
        Self { id: Uuid::new_v4(), kind, state: ConnectionState::Uninitialized }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn advance(&mut self, next: ConnectionState) -> Result<(), TransitionError> {
        if !self.state.can_advance_to(next) {
            return Err(TransitionError { from: self.state, to: next });
        }
        debug!("[session] {:?} {} {} -> {}", self.kind, self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Ferme depuis n'importe quel état ; idempotent
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        debug!("[session] {:?} {} closed", self.kind, self.id);
    }
}
