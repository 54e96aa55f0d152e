//! Session event types
//!
//! Defines all event types that can be broadcast through the event bus.

use serde::{Deserialize, Serialize};

use crate::engine::{Direction, MediaKind};
use crate::ids::{ConsumerId, PeerId, ProducerId, TransportId};
use crate::session::TransportState;

/// Why an entity was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CloseReason {
    /// The owning peer disconnected
    PeerLeft,
    /// Replaced by a newer entity of the same kind
    Replaced,
    /// The transport it was created on closed
    TransportClosed,
    /// The producer it was bound to closed
    ProducerClosed,
    /// The engine closed it on its own
    Engine,
    /// Explicit close request
    Explicit,
}

/// Session event enumeration
///
/// Serialized as `{"event": "<name>", "data": {...}}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SessionEvent {
    // ============================================================================
    // Peer Events
    // ============================================================================
    #[serde(rename = "peer.connected")]
    PeerConnected { peer_id: PeerId },

    #[serde(rename = "peer.disconnected")]
    PeerDisconnected { peer_id: PeerId },

    // ============================================================================
    // Transport Events
    // ============================================================================
    /// Negotiation state of a transport changed (not emitted for `closed`)
    #[serde(rename = "transport.state_changed")]
    TransportStateChanged {
        peer_id: PeerId,
        transport_id: TransportId,
        direction: Direction,
        state: TransportState,
    },

    #[serde(rename = "transport.closed")]
    TransportClosed {
        peer_id: PeerId,
        transport_id: TransportId,
        direction: Direction,
        reason: CloseReason,
    },

    // ============================================================================
    // Producer / Consumer Events
    // ============================================================================
    #[serde(rename = "producer.created")]
    ProducerCreated {
        peer_id: PeerId,
        producer_id: ProducerId,
        kind: MediaKind,
    },

    #[serde(rename = "producer.closed")]
    ProducerClosed {
        peer_id: PeerId,
        producer_id: ProducerId,
        reason: CloseReason,
    },

    #[serde(rename = "consumer.created")]
    ConsumerCreated {
        peer_id: PeerId,
        consumer_id: ConsumerId,
        producer_id: ProducerId,
        kind: MediaKind,
    },

    #[serde(rename = "consumer.closed")]
    ConsumerClosed {
        peer_id: PeerId,
        consumer_id: ConsumerId,
        producer_id: ProducerId,
        reason: CloseReason,
    },

    // ============================================================================
    // Engine Events
    // ============================================================================
    /// The media engine worker died; the process is going down
    #[serde(rename = "engine.died")]
    EngineDied { reason: String },
}

impl SessionEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::PeerConnected { .. } => "peer.connected",
            Self::PeerDisconnected { .. } => "peer.disconnected",
            Self::TransportStateChanged { .. } => "transport.state_changed",
            Self::TransportClosed { .. } => "transport.closed",
            Self::ProducerCreated { .. } => "producer.created",
            Self::ProducerClosed { .. } => "producer.closed",
            Self::ConsumerCreated { .. } => "consumer.created",
            Self::ConsumerClosed { .. } => "consumer.closed",
            Self::EngineDied { .. } => "engine.died",
        }
    }

    /// Peer the event concerns, `None` for process-wide events
    pub fn peer_id(&self) -> Option<&PeerId> {
        match self {
            Self::PeerConnected { peer_id }
            | Self::PeerDisconnected { peer_id }
            | Self::TransportStateChanged { peer_id, .. }
            | Self::TransportClosed { peer_id, .. }
            | Self::ProducerCreated { peer_id, .. }
            | Self::ProducerClosed { peer_id, .. }
            | Self::ConsumerCreated { peer_id, .. }
            | Self::ConsumerClosed { peer_id, .. } => Some(peer_id),
            Self::EngineDied { .. } => None,
        }
    }
}
