//! Transport negotiation state machine
//!
//! One instance per (peer, direction):
//!
//! ```text
//! Created ──connect──> Connecting ──dtls connected──> Connected
//!    │                     │                              │
//!    └─────────────────────┴──────────── close ───────────┴──> Closed
//! ```
//!
//! `Closed` is terminal. Producing and consuming are allowed as soon as the
//! transport is `Connecting`; the handshake may finish after media setup.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

use crate::engine::{Direction, DtlsParameters};
use crate::error::{AppError, Result};
use crate::ids::{PeerId, TransportId};

/// Negotiation state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    /// Engine transport exists, parameters handed to the remote peer
    Created,
    /// Remote DTLS parameters received and passed to the engine
    Connecting,
    /// Engine reported the DTLS handshake complete
    Connected,
    Closed,
}

impl TransportState {
    /// Whether producers/consumers may be created on the transport
    pub fn accepts_media(self) -> bool {
        matches!(self, TransportState::Connecting | TransportState::Connected)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportState::Created => write!(f, "created"),
            TransportState::Connecting => write!(f, "connecting"),
            TransportState::Connected => write!(f, "connected"),
            TransportState::Closed => write!(f, "closed"),
        }
    }
}

/// State machine driving a single transport
pub struct TransportNegotiation {
    state: watch::Sender<TransportState>,
}

impl TransportNegotiation {
    pub fn new() -> Self {
        let (state, _) = watch::channel(TransportState::Created);
        Self { state }
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    /// Remote security parameters were accepted by the engine.
    ///
    /// `Created` moves to `Connecting`; a repeated connect keeps the current
    /// state. Fails once closed.
    pub fn begin_connect(&self) -> Result<TransportState> {
        let mut closed = false;
        self.state.send_if_modified(|state| match *state {
            TransportState::Created => {
                *state = TransportState::Connecting;
                true
            }
            TransportState::Closed => {
                closed = true;
                false
            }
            _ => false,
        });
        if closed {
            return Err(AppError::InvalidState("transport closed".to_string()));
        }
        Ok(self.state())
    }

    /// Engine confirmed the handshake. Returns whether the state changed.
    pub fn confirm_connected(&self) -> bool {
        self.state.send_if_modified(|state| match *state {
            TransportState::Created | TransportState::Connecting => {
                *state = TransportState::Connected;
                true
            }
            _ => false,
        })
    }

    /// Move to `Closed`. Returns false when already closed.
    pub fn close(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == TransportState::Closed {
                false
            } else {
                *state = TransportState::Closed;
                true
            }
        })
    }

    /// Fails unless producers/consumers may be created now
    pub fn ensure_accepts_media(&self) -> Result<()> {
        match self.state() {
            TransportState::Created => Err(AppError::InvalidState(
                "transport not connected".to_string(),
            )),
            TransportState::Closed => Err(AppError::InvalidState("transport closed".to_string())),
            _ => Ok(()),
        }
    }

    /// Wait until the transport reaches `target` or closes
    pub async fn wait_for(&self, target: TransportState) -> TransportState {
        let mut rx = self.subscribe();
        let result = rx
            .wait_for(|state| *state == target || *state == TransportState::Closed)
            .await
            .map(|state| *state);
        // The sender lives in self, so the channel cannot close while we wait
        result.unwrap_or(TransportState::Closed)
    }
}

impl Default for TransportNegotiation {
    fn default() -> Self {
        Self::new()
    }
}

/// A negotiated, directional media path owned by one peer
pub struct Transport {
    id: TransportId,
    direction: Direction,
    owner: PeerId,
    negotiation: TransportNegotiation,
    remote_dtls: Mutex<Option<DtlsParameters>>,
}

impl Transport {
    pub fn new(id: TransportId, direction: Direction, owner: PeerId) -> Self {
        Self {
            id,
            direction,
            owner,
            negotiation: TransportNegotiation::new(),
            remote_dtls: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &TransportId {
        &self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn owner(&self) -> &PeerId {
        &self.owner
    }

    pub fn negotiation(&self) -> &TransportNegotiation {
        &self.negotiation
    }

    pub fn state(&self) -> TransportState {
        self.negotiation.state()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == TransportState::Closed
    }

    /// DTLS parameters from the most recent connect
    pub fn remote_dtls(&self) -> Option<DtlsParameters> {
        self.remote_dtls.lock().clone()
    }

    pub(crate) fn set_remote_dtls(&self, params: DtlsParameters) {
        *self.remote_dtls.lock() = Some(params);
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("owner", &self.owner)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let negotiation = TransportNegotiation::new();
        assert_eq!(negotiation.state(), TransportState::Created);
        assert!(negotiation.ensure_accepts_media().is_err());
    }

    #[test]
    fn test_connect_then_confirm() {
        let negotiation = TransportNegotiation::new();
        assert_eq!(negotiation.begin_connect().unwrap(), TransportState::Connecting);
        assert!(negotiation.ensure_accepts_media().is_ok());
        assert!(negotiation.confirm_connected());
        assert_eq!(negotiation.state(), TransportState::Connected);
        assert!(!negotiation.confirm_connected());
    }

    #[test]
    fn test_reconnect_keeps_state() {
        let negotiation = TransportNegotiation::new();
        negotiation.begin_connect().unwrap();
        negotiation.confirm_connected();
        assert_eq!(negotiation.begin_connect().unwrap(), TransportState::Connected);
    }

    #[test]
    fn test_engine_confirmation_before_connect_bookkeeping() {
        // Engine event may overtake the connect call's own transition
        let negotiation = TransportNegotiation::new();
        assert!(negotiation.confirm_connected());
        assert_eq!(negotiation.begin_connect().unwrap(), TransportState::Connected);
    }

    #[test]
    fn test_closed_is_terminal() {
        let negotiation = TransportNegotiation::new();
        negotiation.begin_connect().unwrap();
        assert!(negotiation.close());
        assert!(!negotiation.close());
        assert!(!negotiation.confirm_connected());
        assert!(negotiation.begin_connect().is_err());
        assert_eq!(negotiation.state(), TransportState::Closed);
        assert!(negotiation.ensure_accepts_media().is_err());
    }

    #[tokio::test]
    async fn test_wait_for_connected() {
        let transport = std::sync::Arc::new(Transport::new(
            TransportId::new(),
            Direction::Send,
            PeerId::new(),
        ));
        let waiter = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.negotiation().wait_for(TransportState::Connected).await })
        };
        transport.negotiation().begin_connect().unwrap();
        transport.negotiation().confirm_connected();
        assert_eq!(waiter.await.unwrap(), TransportState::Connected);
    }

    #[tokio::test]
    async fn test_wait_for_returns_on_close() {
        let negotiation = TransportNegotiation::new();
        negotiation.close();
        assert_eq!(
            negotiation.wait_for(TransportState::Connected).await,
            TransportState::Closed
        );
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_string(&TransportState::Connecting).unwrap(),
            "\"connecting\""
        );
        assert!(TransportState::Connected.accepts_media());
        assert!(!TransportState::Created.accepts_media());
    }
}
