//! Session orchestration
//!
//! [`SessionContext`] ties the media gateway, the peer registry, the routing
//! policy and the event bus together. It is built once at startup and shared
//! by every signaling connection.
//!
//! Peer-scoped operations return `Ok(None)` when the peer disappeared while
//! the operation was in flight; anything the operation created on the engine
//! has been closed again by then and callers treat it as a silent no-op.

pub mod gateway;
pub mod registry;
pub mod routing;
pub mod transport;

pub use gateway::{ClosedEntities, Consumer, MediaGateway, Producer};
pub use registry::{Peer, PeerGone, PeerSnapshot, SessionRegistry};
pub use routing::{FirstProducerWins, RoutingPolicy};
pub use transport::{Transport, TransportNegotiation, TransportState};

use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SignalingConfig;
use crate::engine::{
    Direction, DtlsParameters, DtlsState, EngineEvent, MediaKind, RtpCapabilities, RtpParameters,
    TransportParams,
};
use crate::error::{AppError, Result};
use crate::events::{CloseReason, EventBus, SessionEvent};
use crate::ids::{PeerId, ProducerId};

/// Orchestration context shared by all connections
pub struct SessionContext {
    gateway: MediaGateway,
    registry: SessionRegistry,
    routing: Box<dyn RoutingPolicy>,
    events: Arc<EventBus>,
    consume_paused: bool,
}

impl SessionContext {
    pub fn new(gateway: MediaGateway, events: Arc<EventBus>, config: &SignalingConfig) -> Self {
        Self::with_routing(gateway, events, config, Box::new(FirstProducerWins))
    }

    pub fn with_routing(
        gateway: MediaGateway,
        events: Arc<EventBus>,
        config: &SignalingConfig,
        routing: Box<dyn RoutingPolicy>,
    ) -> Self {
        Self {
            gateway,
            registry: SessionRegistry::new(),
            routing,
            events,
            consume_paused: config.consume_paused,
        }
    }

    pub fn gateway(&self) -> &MediaGateway {
        &self.gateway
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn capabilities(&self) -> &RtpCapabilities {
        self.gateway.capabilities()
    }

    pub fn peers(&self) -> Vec<PeerSnapshot> {
        self.registry.snapshot()
    }

    /// Register a peer for a new connection
    pub fn connect_peer(&self) -> PeerId {
        let peer_id = self.registry.register();
        info!("Peer {} connected ({} total)", peer_id, self.registry.len());
        self.events.publish(SessionEvent::PeerConnected {
            peer_id: peer_id.clone(),
        });
        peer_id
    }

    /// Tear down a peer and everything it owns.
    ///
    /// Consumers of other peers bound to its producer close as well.
    pub async fn disconnect_peer(&self, peer_id: &PeerId) {
        let Some(resources) = self.registry.remove(peer_id) else {
            return;
        };

        let mut closed = ClosedEntities::default();
        if let Some(consumer) = &resources.consumer {
            closed.extend(
                self.gateway
                    .close_consumer(consumer, CloseReason::PeerLeft)
                    .await,
            );
        }
        if let Some(producer) = &resources.producer {
            closed.extend(
                self.gateway
                    .close_producer(producer, CloseReason::PeerLeft)
                    .await,
            );
        }
        for transport in &resources.transports {
            closed.extend(
                self.gateway
                    .close_transport(transport, CloseReason::PeerLeft)
                    .await,
            );
        }
        self.apply_closed(closed);

        info!(
            "Peer {} disconnected ({} remaining)",
            peer_id,
            self.registry.len()
        );
        self.events.publish(SessionEvent::PeerDisconnected {
            peer_id: peer_id.clone(),
        });
    }

    /// Disconnect every peer
    pub async fn shutdown(&self) {
        for peer_id in self.registry.ids() {
            self.disconnect_peer(&peer_id).await;
        }
    }

    /// Create a transport, closing any previous one of the same direction
    pub async fn create_transport(
        &self,
        peer_id: &PeerId,
        direction: Direction,
    ) -> Result<Option<TransportParams>> {
        let Some(prior) = self
            .registry
            .with_peer(peer_id, |p| p.transport(direction).cloned())
        else {
            return Ok(None);
        };
        if let Some(prior) = prior {
            debug!("Peer {} replaces its {} transport", peer_id, direction);
            let closed = self
                .gateway
                .close_transport(&prior, CloseReason::Replaced)
                .await;
            self.apply_closed(closed);
        }

        let Some((transport, params)) = self.peer_scoped(
            peer_id,
            self.gateway.create_transport(peer_id, direction).await,
        )?
        else {
            return Ok(None);
        };
        match self.registry.attach_transport(peer_id, transport.clone()) {
            Ok(replaced) => {
                if let Some(replaced) = replaced {
                    let closed = self
                        .gateway
                        .close_transport(&replaced, CloseReason::Replaced)
                        .await;
                    self.apply_closed(closed);
                }
                Ok(Some(params))
            }
            Err(PeerGone) => {
                self.gateway
                    .close_transport(&transport, CloseReason::PeerLeft)
                    .await;
                Ok(None)
            }
        }
    }

    /// Pass remote DTLS parameters to the peer's transport
    pub async fn connect_transport(
        &self,
        peer_id: &PeerId,
        direction: Direction,
        dtls_parameters: &DtlsParameters,
    ) -> Result<Option<()>> {
        let Some(transport) = self.peer_transport(peer_id, direction)? else {
            return Ok(None);
        };

        let prior = transport.state();
        let Some(state) = self.peer_scoped(
            peer_id,
            self.gateway
                .connect_transport(&transport, dtls_parameters)
                .await,
        )?
        else {
            return Ok(None);
        };
        if state != prior {
            self.publish_state(&transport);
        }
        Ok(Some(()))
    }

    /// Create the peer's producer on its send transport
    pub async fn produce(
        &self,
        peer_id: &PeerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Option<ProducerId>> {
        let Some(transport) = self.peer_transport(peer_id, Direction::Send)? else {
            return Ok(None);
        };

        let Some(producer) = self.peer_scoped(
            peer_id,
            self.gateway.produce(&transport, kind, rtp_parameters).await,
        )?
        else {
            return Ok(None);
        };
        match self.registry.attach_producer(peer_id, producer.clone()) {
            Ok(replaced) => {
                if let Some(replaced) = replaced {
                    let closed = self
                        .gateway
                        .close_producer(&replaced, CloseReason::Replaced)
                        .await;
                    self.apply_closed(closed);
                }
            }
            Err(PeerGone) => {
                self.gateway
                    .close_producer(&producer, CloseReason::PeerLeft)
                    .await;
                return Ok(None);
            }
        }

        info!(
            "Peer {} producing {} ({})",
            peer_id,
            kind,
            producer.id()
        );
        self.events.publish(SessionEvent::ProducerCreated {
            peer_id: peer_id.clone(),
            producer_id: producer.id().clone(),
            kind,
        });
        Ok(Some(producer.id().clone()))
    }

    /// Bind the peer's consumer to the producer chosen by the routing policy
    pub async fn consume(
        &self,
        peer_id: &PeerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<Option<Arc<Consumer>>> {
        let Some(transport) = self.peer_transport(peer_id, Direction::Receive)? else {
            return Ok(None);
        };

        let producer = routing::resolve(
            self.routing.as_ref(),
            &self.registry,
            &self.gateway,
            peer_id,
            rtp_capabilities,
        )
        .ok_or(AppError::CannotConsume)?;

        let Some(consumer) = self.peer_scoped(
            peer_id,
            self.gateway
                .consume(&transport, &producer, rtp_capabilities, self.consume_paused)
                .await,
        )?
        else {
            return Ok(None);
        };
        match self.registry.attach_consumer(peer_id, consumer.clone()) {
            Ok(replaced) => {
                if let Some(replaced) = replaced {
                    let closed = self
                        .gateway
                        .close_consumer(&replaced, CloseReason::Replaced)
                        .await;
                    self.apply_closed(closed);
                }
            }
            Err(PeerGone) => {
                self.gateway
                    .close_consumer(&consumer, CloseReason::PeerLeft)
                    .await;
                return Ok(None);
            }
        }

        info!(
            "Peer {} consuming {} from peer {}",
            peer_id,
            consumer.kind(),
            producer.owner()
        );
        self.events.publish(SessionEvent::ConsumerCreated {
            peer_id: peer_id.clone(),
            consumer_id: consumer.id().clone(),
            producer_id: producer.id().clone(),
            kind: consumer.kind(),
        });
        Ok(Some(consumer))
    }

    /// Resume the peer's consumer; no-op without one
    pub async fn resume_consumer(&self, peer_id: &PeerId) -> Result<()> {
        let consumer = self
            .registry
            .with_peer(peer_id, |p| p.consumer().cloned())
            .flatten();
        match consumer {
            Some(consumer) => self.gateway.resume_consumer(&consumer).await,
            None => {
                debug!("resume-consumer from peer {} without consumer", peer_id);
                Ok(())
            }
        }
    }

    /// Spawn the task that turns engine events into session state changes
    pub fn spawn_engine_observer(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.gateway.engine().subscribe();
        let context: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Engine observer lagged by {} events", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(context) = context.upgrade() else {
                    break;
                };
                context.handle_engine_event(event).await;
            }
            debug!("Engine observer stopped");
        })
    }

    async fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::DtlsStateChanged {
                transport_id,
                state,
            } => match state {
                DtlsState::Connected => {
                    if let Some(transport) = self.gateway.mark_connected(&transport_id) {
                        debug!("Transport {} connected", transport_id);
                        self.publish_state(&transport);
                    }
                }
                DtlsState::Closed | DtlsState::Failed => {
                    if let Some(transport) = self.gateway.transport(&transport_id) {
                        info!("Transport {} DTLS {:?}, closing", transport_id, state);
                        let closed = self
                            .gateway
                            .close_transport(&transport, CloseReason::Engine)
                            .await;
                        self.apply_closed(closed);
                    }
                }
                DtlsState::New | DtlsState::Connecting => {}
            },
            EngineEvent::ProducerClosed { producer_id } => {
                if let Some(producer) = self.gateway.producer(&producer_id) {
                    let closed = self
                        .gateway
                        .close_producer(&producer, CloseReason::Engine)
                        .await;
                    self.apply_closed(closed);
                }
            }
            EngineEvent::ConsumerClosed { consumer_id } => {
                if let Some(consumer) = self.gateway.consumer(&consumer_id) {
                    let closed = self
                        .gateway
                        .close_consumer(&consumer, CloseReason::Engine)
                        .await;
                    self.apply_closed(closed);
                }
            }
            EngineEvent::WorkerDied { reason } => {
                error!("Media engine worker died: {}", reason);
                self.events.publish(SessionEvent::EngineDied { reason });
            }
        }
    }

    /// The peer's transport for `direction`.
    ///
    /// `Ok(None)` when the peer is gone; an error when it has no transport.
    fn peer_transport(
        &self,
        peer_id: &PeerId,
        direction: Direction,
    ) -> Result<Option<Arc<Transport>>> {
        match self
            .registry
            .with_peer(peer_id, |p| p.transport(direction).cloned())
        {
            None => Ok(None),
            Some(Some(transport)) => Ok(Some(transport)),
            Some(None) => Err(AppError::NotFound(format!(
                "no {} transport",
                direction
            ))),
        }
    }

    /// A failed call whose peer was torn down meanwhile is a no-op; the
    /// teardown already closed what the call was working on
    fn peer_scoped<T>(&self, peer_id: &PeerId, result: Result<T>) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if !self.registry.contains(peer_id) => {
                debug!("Dropping result for departed peer {}: {}", peer_id, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn publish_state(&self, transport: &Transport) {
        self.events.publish(SessionEvent::TransportStateChanged {
            peer_id: transport.owner().clone(),
            transport_id: transport.id().clone(),
            direction: transport.direction(),
            state: transport.state(),
        });
    }

    /// Detach closed entities from their peers and announce them
    fn apply_closed(&self, closed: ClosedEntities) {
        if closed.is_empty() {
            return;
        }
        self.registry.detach(&closed);

        for (transport, reason) in closed.transports {
            self.events.publish(SessionEvent::TransportClosed {
                peer_id: transport.owner().clone(),
                transport_id: transport.id().clone(),
                direction: transport.direction(),
                reason,
            });
        }
        for (producer, reason) in closed.producers {
            self.events.publish(SessionEvent::ProducerClosed {
                peer_id: producer.owner().clone(),
                producer_id: producer.id().clone(),
                reason,
            });
        }
        for (consumer, reason) in closed.consumers {
            self.events.publish(SessionEvent::ConsumerClosed {
                peer_id: consumer.owner().clone(),
                consumer_id: consumer.id().clone(),
                producer_id: consumer.producer_id().clone(),
                reason,
            });
        }
    }
}
