//! Peer session registry
//!
//! Maps connection identities to [`Peer`] records. The registry only holds
//! references; creating and closing engine entities is the gateway's job.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use typeshare::typeshare;

use super::gateway::{ClosedEntities, Consumer, Producer};
use super::transport::{Transport, TransportState};
use crate::engine::{Direction, MediaKind};
use crate::ids::{ConsumerId, PeerId, ProducerId, TransportId};

/// The peer was removed while an operation on it was in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerGone;

/// Per-connection session record
#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    seq: u64,
    connected_at: DateTime<Utc>,
    send_transport: Option<Arc<Transport>>,
    recv_transport: Option<Arc<Transport>>,
    producer: Option<Arc<Producer>>,
    consumer: Option<Arc<Consumer>>,
}

impl Peer {
    fn new(id: PeerId, seq: u64) -> Self {
        Self {
            id,
            seq,
            connected_at: Utc::now(),
            send_transport: None,
            recv_transport: None,
            producer: None,
            consumer: None,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn transport(&self, direction: Direction) -> Option<&Arc<Transport>> {
        match direction {
            Direction::Send => self.send_transport.as_ref(),
            Direction::Receive => self.recv_transport.as_ref(),
        }
    }

    pub fn producer(&self) -> Option<&Arc<Producer>> {
        self.producer.as_ref()
    }

    pub fn consumer(&self) -> Option<&Arc<Consumer>> {
        self.consumer.as_ref()
    }

    fn transport_slot(&mut self, direction: Direction) -> &mut Option<Arc<Transport>> {
        match direction {
            Direction::Send => &mut self.send_transport,
            Direction::Receive => &mut self.recv_transport,
        }
    }

    /// Everything the peer still references
    fn take_all(&mut self) -> PeerResources {
        PeerResources {
            transports: [self.send_transport.take(), self.recv_transport.take()]
                .into_iter()
                .flatten()
                .collect(),
            producer: self.producer.take(),
            consumer: self.consumer.take(),
        }
    }
}

/// Resources detached from a removed peer, to be closed by the caller
#[derive(Debug, Default)]
pub struct PeerResources {
    pub transports: Vec<Arc<Transport>>,
    pub producer: Option<Arc<Producer>>,
    pub consumer: Option<Arc<Consumer>>,
}

/// Serializable view of a peer
#[typeshare]
#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub connected_at: DateTime<Utc>,
    pub send_transport: Option<TransportSnapshot>,
    pub recv_transport: Option<TransportSnapshot>,
    pub producer: Option<ProducerSnapshot>,
    pub consumer: Option<ConsumerSnapshot>,
}

#[typeshare]
#[derive(Debug, Clone, Serialize)]
pub struct TransportSnapshot {
    pub id: TransportId,
    pub state: TransportState,
}

#[typeshare]
#[derive(Debug, Clone, Serialize)]
pub struct ProducerSnapshot {
    pub id: ProducerId,
    pub kind: MediaKind,
}

#[typeshare]
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerSnapshot {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub paused: bool,
}

impl From<&Peer> for PeerSnapshot {
    fn from(peer: &Peer) -> Self {
        let transport = |t: &Option<Arc<Transport>>| {
            t.as_ref().map(|t| TransportSnapshot {
                id: t.id().clone(),
                state: t.state(),
            })
        };
        Self {
            id: peer.id.clone(),
            connected_at: peer.connected_at,
            send_transport: transport(&peer.send_transport),
            recv_transport: transport(&peer.recv_transport),
            producer: peer.producer.as_ref().map(|p| ProducerSnapshot {
                id: p.id().clone(),
                kind: p.kind(),
            }),
            consumer: peer.consumer.as_ref().map(|c| ConsumerSnapshot {
                id: c.id().clone(),
                producer_id: c.producer_id().clone(),
                paused: c.is_paused(),
            }),
        }
    }
}

/// Connection identity → Peer
pub struct SessionRegistry {
    peers: RwLock<HashMap<PeerId, Peer>>,
    next_seq: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Create an empty peer for a new connection
    pub fn register(&self) -> PeerId {
        let id = PeerId::new();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.peers.write().insert(id.clone(), Peer::new(id.clone(), seq));
        id
    }

    /// Remove a peer, handing back what it referenced
    pub fn remove(&self, id: &PeerId) -> Option<PeerResources> {
        self.peers.write().remove(id).map(|mut peer| peer.take_all())
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.read().keys().cloned().collect()
    }

    /// Run `f` against a peer under the read lock
    pub fn with_peer<R>(&self, id: &PeerId, f: impl FnOnce(&Peer) -> R) -> Option<R> {
        self.peers.read().get(id).map(f)
    }

    /// Peers in registration order
    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        let peers = self.peers.read();
        let mut ordered: Vec<&Peer> = peers.values().collect();
        ordered.sort_by_key(|p| p.seq);
        ordered.into_iter().map(PeerSnapshot::from).collect()
    }

    /// Live producers in peer registration order
    pub fn live_producers(&self) -> Vec<Arc<Producer>> {
        let peers = self.peers.read();
        let mut ordered: Vec<&Peer> = peers.values().collect();
        ordered.sort_by_key(|p| p.seq);
        ordered
            .into_iter()
            .filter_map(|p| p.producer.as_ref())
            .filter(|p| p.is_live())
            .cloned()
            .collect()
    }

    /// Store a transport, returning the one it replaces
    pub fn attach_transport(
        &self,
        id: &PeerId,
        transport: Arc<Transport>,
    ) -> Result<Option<Arc<Transport>>, PeerGone> {
        let mut peers = self.peers.write();
        let peer = peers.get_mut(id).ok_or(PeerGone)?;
        Ok(peer.transport_slot(transport.direction()).replace(transport))
    }

    /// Store a producer, returning the one it replaces
    pub fn attach_producer(
        &self,
        id: &PeerId,
        producer: Arc<Producer>,
    ) -> Result<Option<Arc<Producer>>, PeerGone> {
        let mut peers = self.peers.write();
        let peer = peers.get_mut(id).ok_or(PeerGone)?;
        Ok(peer.producer.replace(producer))
    }

    /// Store a consumer, returning the one it replaces
    pub fn attach_consumer(
        &self,
        id: &PeerId,
        consumer: Arc<Consumer>,
    ) -> Result<Option<Arc<Consumer>>, PeerGone> {
        let mut peers = self.peers.write();
        let peer = peers.get_mut(id).ok_or(PeerGone)?;
        Ok(peer.consumer.replace(consumer))
    }

    /// Clear every peer reference to the closed entities
    pub fn detach(&self, closed: &ClosedEntities) {
        if closed.is_empty() {
            return;
        }
        let mut peers = self.peers.write();
        for (transport, _) in &closed.transports {
            if let Some(peer) = peers.get_mut(transport.owner()) {
                let slot = peer.transport_slot(transport.direction());
                if slot.as_ref().is_some_and(|t| t.id() == transport.id()) {
                    *slot = None;
                }
            }
        }
        for (producer, _) in &closed.producers {
            if let Some(peer) = peers.get_mut(producer.owner()) {
                if peer.producer.as_ref().is_some_and(|p| p.id() == producer.id()) {
                    peer.producer = None;
                }
            }
        }
        for (consumer, _) in &closed.consumers {
            if let Some(peer) = peers.get_mut(consumer.owner()) {
                if peer.consumer.as_ref().is_some_and(|c| c.id() == consumer.id()) {
                    peer.consumer = None;
                }
            }
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CloseReason;

    fn transport(owner: &PeerId, direction: Direction) -> Arc<Transport> {
        Arc::new(Transport::new(TransportId::new(), direction, owner.clone()))
    }

    #[test]
    fn test_register_and_remove() {
        let registry = SessionRegistry::new();
        let a = registry.register();
        let b = registry.register();
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);

        let resources = registry.remove(&a).unwrap();
        assert!(resources.transports.is_empty());
        assert!(!registry.contains(&a));
        assert!(registry.remove(&a).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_one_transport_per_direction() {
        let registry = SessionRegistry::new();
        let id = registry.register();

        let first = transport(&id, Direction::Send);
        assert!(registry.attach_transport(&id, first.clone()).unwrap().is_none());
        let second = transport(&id, Direction::Send);
        let replaced = registry.attach_transport(&id, second.clone()).unwrap();
        assert_eq!(replaced.unwrap().id(), first.id());

        let recv = transport(&id, Direction::Receive);
        assert!(registry.attach_transport(&id, recv).unwrap().is_none());

        let resources = registry.remove(&id).unwrap();
        assert_eq!(resources.transports.len(), 2);
    }

    #[test]
    fn test_attach_to_missing_peer() {
        let registry = SessionRegistry::new();
        let ghost = PeerId::new();
        let result = registry.attach_transport(&ghost, transport(&ghost, Direction::Send));
        assert_eq!(result.unwrap_err(), PeerGone);
    }

    #[test]
    fn test_detach_only_matching_ids() {
        let registry = SessionRegistry::new();
        let id = registry.register();
        let old = transport(&id, Direction::Send);
        let current = transport(&id, Direction::Send);
        registry.attach_transport(&id, current.clone()).unwrap();

        // A stale transport closing must not clear the current one
        let closed = ClosedEntities {
            transports: vec![(old, CloseReason::Replaced)],
            ..Default::default()
        };
        registry.detach(&closed);
        let still = registry
            .with_peer(&id, |p| p.transport(Direction::Send).map(|t| t.id().clone()))
            .flatten();
        assert_eq!(still.as_ref(), Some(current.id()));

        let closed = ClosedEntities {
            transports: vec![(current, CloseReason::Engine)],
            ..Default::default()
        };
        registry.detach(&closed);
        assert!(registry
            .with_peer(&id, |p| p.transport(Direction::Send).is_none())
            .unwrap());
    }

    #[test]
    fn test_snapshot_in_registration_order() {
        let registry = SessionRegistry::new();
        let ids: Vec<_> = (0..5).map(|_| registry.register()).collect();
        let snapshot = registry.snapshot();
        let order: Vec<_> = snapshot.iter().map(|p| p.id.clone()).collect();
        assert_eq!(order, ids);
    }
}
