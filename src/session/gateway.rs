//! Media engine gateway
//!
//! Owns the engine handle and the single routing context. Every engine-side
//! entity created through the gateway is tracked here until it closes, so
//! close cascades (transport → producers/consumers, producer → consumers)
//! are resolved in one place.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::transport::{Transport, TransportState};
use crate::config::MediaConfig;
use crate::engine::{
    Direction, DtlsParameters, MediaEngine, MediaKind, RtpCapabilities, RtpParameters,
    TransportOptions, TransportParams,
};
use crate::error::{AppError, Result};
use crate::events::CloseReason;
use crate::ids::{ConsumerId, PeerId, ProducerId, TransportId};

/// An inbound media stream from a peer
#[derive(Debug)]
pub struct Producer {
    id: ProducerId,
    kind: MediaKind,
    owner: PeerId,
    transport_id: TransportId,
    rtp_parameters: RtpParameters,
    live: AtomicBool,
}

impl Producer {
    pub fn id(&self) -> &ProducerId {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn owner(&self) -> &PeerId {
        &self.owner
    }

    pub fn transport_id(&self) -> &TransportId {
        &self.transport_id
    }

    pub fn rtp_parameters(&self) -> &RtpParameters {
        &self.rtp_parameters
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Returns true for the caller that actually closed it
    fn mark_closed(&self) -> bool {
        self.live.swap(false, Ordering::AcqRel)
    }
}

/// An outbound media stream to a peer, bound to one producer
#[derive(Debug)]
pub struct Consumer {
    id: ConsumerId,
    producer_id: ProducerId,
    owner: PeerId,
    transport_id: TransportId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    live: AtomicBool,
}

impl Consumer {
    pub fn id(&self) -> &ConsumerId {
        &self.id
    }

    pub fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    pub fn owner(&self) -> &PeerId {
        &self.owner
    }

    pub fn transport_id(&self) -> &TransportId {
        &self.transport_id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn rtp_parameters(&self) -> &RtpParameters {
        &self.rtp_parameters
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn mark_closed(&self) -> bool {
        self.live.swap(false, Ordering::AcqRel)
    }
}

/// Entities that transitioned to closed during one close operation
#[derive(Debug, Default)]
pub struct ClosedEntities {
    pub transports: Vec<(Arc<Transport>, CloseReason)>,
    pub producers: Vec<(Arc<Producer>, CloseReason)>,
    pub consumers: Vec<(Arc<Consumer>, CloseReason)>,
}

impl ClosedEntities {
    pub fn is_empty(&self) -> bool {
        self.transports.is_empty() && self.producers.is_empty() && self.consumers.is_empty()
    }

    pub fn extend(&mut self, other: ClosedEntities) {
        self.transports.extend(other.transports);
        self.producers.extend(other.producers);
        self.consumers.extend(other.consumers);
    }
}

/// Front for the media engine and its entities
pub struct MediaGateway {
    engine: Arc<dyn MediaEngine>,
    capabilities: RtpCapabilities,
    transport_options: TransportOptions,
    transports: RwLock<HashMap<TransportId, Arc<Transport>>>,
    producers: RwLock<HashMap<ProducerId, Arc<Producer>>>,
    consumers: RwLock<HashMap<ConsumerId, Arc<Consumer>>>,
}

impl MediaGateway {
    /// Wrap a started engine. The capability set is captured once here.
    pub fn initialize(engine: Arc<dyn MediaEngine>, config: &MediaConfig) -> Self {
        let capabilities = engine.rtp_capabilities();
        info!(
            "Media gateway ready: engine={}, {} codecs",
            engine.name(),
            capabilities.codecs.len()
        );
        Self {
            engine,
            capabilities,
            transport_options: TransportOptions::from_config(config),
            transports: RwLock::new(HashMap::new()),
            producers: RwLock::new(HashMap::new()),
            consumers: RwLock::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    /// Router capability set
    pub fn capabilities(&self) -> &RtpCapabilities {
        &self.capabilities
    }

    pub fn transport(&self, id: &TransportId) -> Option<Arc<Transport>> {
        self.transports.read().get(id).cloned()
    }

    pub fn producer(&self, id: &ProducerId) -> Option<Arc<Producer>> {
        self.producers.read().get(id).cloned()
    }

    pub fn consumer(&self, id: &ConsumerId) -> Option<Arc<Consumer>> {
        self.consumers.read().get(id).cloned()
    }

    /// (transports, producers, consumers) currently open
    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.transports.read().len(),
            self.producers.read().len(),
            self.consumers.read().len(),
        )
    }

    /// Create an engine transport for `owner`
    pub async fn create_transport(
        &self,
        owner: &PeerId,
        direction: Direction,
    ) -> Result<(Arc<Transport>, TransportParams)> {
        let params = self.engine.create_transport(&self.transport_options).await?;
        let transport = Arc::new(Transport::new(params.id.clone(), direction, owner.clone()));
        self.transports
            .write()
            .insert(params.id.clone(), transport.clone());
        debug!(
            "Transport {} ({}) created for peer {}",
            params.id, direction, owner
        );
        Ok((transport, params))
    }

    /// Hand the remote DTLS parameters to the engine.
    ///
    /// Repeated calls are accepted; the most recent parameters are kept.
    pub async fn connect_transport(
        &self,
        transport: &Transport,
        dtls_parameters: &DtlsParameters,
    ) -> Result<TransportState> {
        let prior = transport.state();
        if prior == TransportState::Closed {
            return Err(AppError::InvalidState("transport closed".to_string()));
        }

        if let Err(e) = self
            .engine
            .connect_transport(transport.id(), dtls_parameters)
            .await
        {
            if prior == TransportState::Created {
                return Err(e);
            }
            warn!(
                "Engine rejected repeated connect on transport {} ({}), keeping {}",
                transport.id(),
                e,
                prior
            );
        }

        transport.set_remote_dtls(dtls_parameters.clone());
        transport.negotiation().begin_connect()
    }

    /// Engine reported the handshake complete
    pub fn mark_connected(&self, transport_id: &TransportId) -> Option<Arc<Transport>> {
        let transport = self.transport(transport_id)?;
        transport
            .negotiation()
            .confirm_connected()
            .then_some(transport)
    }

    /// Create a producer on a send transport
    pub async fn produce(
        &self,
        transport: &Transport,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<Producer>> {
        if transport.direction() != Direction::Send {
            return Err(AppError::BadRequest(
                "produce requires a send transport".to_string(),
            ));
        }
        transport.negotiation().ensure_accepts_media()?;

        let id = self
            .engine
            .produce(transport.id(), kind, &rtp_parameters)
            .await?;

        let producer = Arc::new(Producer {
            id: id.clone(),
            kind,
            owner: transport.owner().clone(),
            transport_id: transport.id().clone(),
            rtp_parameters,
            live: AtomicBool::new(true),
        });
        self.producers.write().insert(id, producer.clone());

        // Checked after the insert: a concurrent close_transport either
        // cascades to this producer or is observed here
        if transport.is_closed() {
            self.close_producer(&producer, CloseReason::TransportClosed)
                .await;
            return Err(AppError::InvalidState("transport closed".to_string()));
        }
        Ok(producer)
    }

    /// Whether `producer` can be received with `rtp_capabilities`
    pub fn can_consume(&self, producer: &Producer, rtp_capabilities: &RtpCapabilities) -> bool {
        producer.is_live() && self.engine.can_consume(producer.id(), rtp_capabilities)
    }

    /// Bind a consumer for `producer` on a receive transport
    pub async fn consume(
        &self,
        transport: &Transport,
        producer: &Producer,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<Consumer>> {
        if transport.direction() != Direction::Receive {
            return Err(AppError::BadRequest(
                "consume requires a receive transport".to_string(),
            ));
        }
        transport.negotiation().ensure_accepts_media()?;
        if !self.can_consume(producer, rtp_capabilities) {
            return Err(AppError::CannotConsume);
        }

        let params = match self
            .engine
            .consume(transport.id(), producer.id(), rtp_capabilities, paused)
            .await
        {
            Ok(params) => params,
            Err(_) if !producer.is_live() => return Err(AppError::CannotConsume),
            Err(e) => return Err(e),
        };

        let consumer = Arc::new(Consumer {
            id: params.id.clone(),
            producer_id: params.producer_id,
            owner: transport.owner().clone(),
            transport_id: transport.id().clone(),
            kind: params.kind,
            rtp_parameters: params.rtp_parameters,
            paused: AtomicBool::new(params.paused),
            live: AtomicBool::new(true),
        });
        self.consumers.write().insert(params.id, consumer.clone());

        // Producer or transport may have closed while the engine was busy.
        // Checked after the insert so a concurrent close either cascades to
        // this consumer or is observed here.
        let transport_closed = transport.is_closed();
        if transport_closed || !producer.is_live() {
            let reason = if transport_closed {
                CloseReason::TransportClosed
            } else {
                CloseReason::ProducerClosed
            };
            self.close_consumer(&consumer, reason).await;
            return Err(if transport_closed {
                AppError::InvalidState("transport closed".to_string())
            } else {
                AppError::CannotConsume
            });
        }
        Ok(consumer)
    }

    /// Resume a paused consumer. No-op once it closed.
    pub async fn resume_consumer(&self, consumer: &Consumer) -> Result<()> {
        if !consumer.is_live() {
            return Ok(());
        }
        self.engine.resume_consumer(consumer.id()).await?;
        consumer.paused.store(false, Ordering::Release);
        Ok(())
    }

    /// Close a transport and everything created on it
    pub async fn close_transport(
        &self,
        transport: &Arc<Transport>,
        reason: CloseReason,
    ) -> ClosedEntities {
        let mut closed = ClosedEntities::default();
        if !transport.negotiation().close() {
            return closed;
        }
        self.transports.write().remove(transport.id());
        self.engine.close_transport(transport.id()).await;
        closed.transports.push((transport.clone(), reason));

        let producers: Vec<_> = self
            .producers
            .read()
            .values()
            .filter(|p| p.transport_id() == transport.id())
            .cloned()
            .collect();
        for producer in producers {
            closed.extend(
                self.close_producer(&producer, CloseReason::TransportClosed)
                    .await,
            );
        }

        let consumers: Vec<_> = self
            .consumers
            .read()
            .values()
            .filter(|c| c.transport_id() == transport.id())
            .cloned()
            .collect();
        for consumer in consumers {
            closed.extend(
                self.close_consumer(&consumer, CloseReason::TransportClosed)
                    .await,
            );
        }

        debug!(
            "Transport {} closed ({:?}): {} producers, {} consumers cascaded",
            transport.id(),
            reason,
            closed.producers.len(),
            closed.consumers.len()
        );
        closed
    }

    /// Close a producer and every consumer bound to it
    pub async fn close_producer(
        &self,
        producer: &Arc<Producer>,
        reason: CloseReason,
    ) -> ClosedEntities {
        let mut closed = ClosedEntities::default();
        if !producer.mark_closed() {
            return closed;
        }
        self.producers.write().remove(producer.id());
        self.engine.close_producer(producer.id()).await;
        closed.producers.push((producer.clone(), reason));

        let consumers: Vec<_> = self
            .consumers
            .read()
            .values()
            .filter(|c| c.producer_id() == producer.id())
            .cloned()
            .collect();
        for consumer in consumers {
            closed.extend(
                self.close_consumer(&consumer, CloseReason::ProducerClosed)
                    .await,
            );
        }
        closed
    }

    pub async fn close_consumer(
        &self,
        consumer: &Arc<Consumer>,
        reason: CloseReason,
    ) -> ClosedEntities {
        let mut closed = ClosedEntities::default();
        if !consumer.mark_closed() {
            return closed;
        }
        self.consumers.write().remove(consumer.id());
        self.engine.close_consumer(consumer.id()).await;
        closed.consumers.push((consumer.clone(), reason));
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{DtlsFingerprint, DtlsRole, RtpCodecParameters, RtpEncodingParameters};
    use crate::engine::{LoopbackEngine, RtpCodecCapability};
    use tokio::sync::Barrier;

    fn gateway() -> (Arc<LoopbackEngine>, MediaGateway) {
        let config = MediaConfig::default();
        let engine = LoopbackEngine::start(&config).unwrap();
        let gateway = MediaGateway::initialize(engine.clone(), &config);
        (engine, gateway)
    }

    fn dtls() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AB:CD".to_string(),
            }],
        }
    }

    fn vp8_parameters() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 96,
                clock_rate: 90000,
                channels: None,
                parameters: Default::default(),
                rtcp_feedback: vec![],
            }],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(1111),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn client_caps() -> RtpCapabilities {
        RtpCapabilities {
            codecs: vec![RtpCodecCapability::opus(), RtpCodecCapability::vp8()],
            header_extensions: vec![],
        }
    }

    async fn connected(gateway: &MediaGateway, direction: Direction) -> Arc<Transport> {
        let (transport, _) = gateway
            .create_transport(&PeerId::new(), direction)
            .await
            .unwrap();
        gateway.connect_transport(&transport, &dtls()).await.unwrap();
        transport
    }

    #[tokio::test]
    async fn test_capabilities_are_stable() {
        let (_, gateway) = gateway();
        let first = gateway.capabilities().clone();
        assert_eq!(&first, gateway.capabilities());
        assert!(first.codecs.iter().any(|c| c.mime_type == "audio/opus"));
        assert!(first.codecs.iter().any(|c| c.mime_type == "video/VP8"));
    }

    #[tokio::test]
    async fn test_produce_requires_connect() {
        let (_, gateway) = gateway();
        let (transport, _) = gateway
            .create_transport(&PeerId::new(), Direction::Send)
            .await
            .unwrap();
        let result = gateway
            .produce(&transport, MediaKind::Video, vp8_parameters())
            .await;
        assert!(matches!(result, Err(AppError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_produce_on_receive_transport_fails() {
        let (_, gateway) = gateway();
        let transport = connected(&gateway, Direction::Receive).await;
        let result = gateway
            .produce(&transport, MediaKind::Video, vp8_parameters())
            .await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_connect_records_last_parameters() {
        let (_, gateway) = gateway();
        let (transport, _) = gateway
            .create_transport(&PeerId::new(), Direction::Send)
            .await
            .unwrap();
        assert_eq!(
            gateway.connect_transport(&transport, &dtls()).await.unwrap(),
            TransportState::Connecting
        );
        let mut second = dtls();
        second.fingerprints[0].value = "EF:01".to_string();
        gateway.connect_transport(&transport, &second).await.unwrap();
        assert_eq!(transport.state(), TransportState::Connecting);
        assert_eq!(transport.remote_dtls().unwrap().fingerprints[0].value, "EF:01");
    }

    #[tokio::test]
    async fn test_connect_closed_transport_fails() {
        let (_, gateway) = gateway();
        let (transport, _) = gateway
            .create_transport(&PeerId::new(), Direction::Send)
            .await
            .unwrap();
        gateway.close_transport(&transport, CloseReason::Explicit).await;
        assert!(gateway.connect_transport(&transport, &dtls()).await.is_err());
    }

    #[tokio::test]
    async fn test_produce_and_consume() {
        let (engine, gateway) = gateway();
        let send = connected(&gateway, Direction::Send).await;
        let recv = connected(&gateway, Direction::Receive).await;

        let producer = gateway
            .produce(&send, MediaKind::Video, vp8_parameters())
            .await
            .unwrap();
        let consumer = gateway
            .consume(&recv, &producer, &client_caps(), true)
            .await
            .unwrap();
        assert_eq!(consumer.producer_id(), producer.id());
        assert_eq!(consumer.kind(), MediaKind::Video);
        assert!(consumer.is_paused());

        gateway.resume_consumer(&consumer).await.unwrap();
        assert!(!consumer.is_paused());
        assert_eq!(engine.is_consumer_paused(consumer.id()), Some(false));
        assert_eq!(gateway.counts(), (2, 1, 1));
    }

    #[tokio::test]
    async fn test_consume_with_incompatible_caps() {
        let (_, gateway) = gateway();
        let send = connected(&gateway, Direction::Send).await;
        let recv = connected(&gateway, Direction::Receive).await;
        let producer = gateway
            .produce(&send, MediaKind::Video, vp8_parameters())
            .await
            .unwrap();

        let audio_only = RtpCapabilities {
            codecs: vec![RtpCodecCapability::opus()],
            header_extensions: vec![],
        };
        let result = gateway.consume(&recv, &producer, &audio_only, false).await;
        assert!(matches!(result, Err(AppError::CannotConsume)));
    }

    #[tokio::test]
    async fn test_closing_producer_cascades_to_consumers() {
        let (_, gateway) = gateway();
        let send = connected(&gateway, Direction::Send).await;
        let recv_a = connected(&gateway, Direction::Receive).await;
        let recv_b = connected(&gateway, Direction::Receive).await;
        let producer = gateway
            .produce(&send, MediaKind::Video, vp8_parameters())
            .await
            .unwrap();
        let a = gateway.consume(&recv_a, &producer, &client_caps(), false).await.unwrap();
        let b = gateway.consume(&recv_b, &producer, &client_caps(), false).await.unwrap();

        let closed = gateway.close_producer(&producer, CloseReason::Explicit).await;
        assert_eq!(closed.producers.len(), 1);
        assert_eq!(closed.consumers.len(), 2);
        assert!(closed
            .consumers
            .iter()
            .all(|(_, reason)| *reason == CloseReason::ProducerClosed));
        assert!(!a.is_live());
        assert!(!b.is_live());

        // Idempotent
        assert!(gateway.close_producer(&producer, CloseReason::Explicit).await.is_empty());

        // Closed producer is never bound again
        let result = gateway.consume(&recv_a, &producer, &client_caps(), false).await;
        assert!(matches!(result, Err(AppError::CannotConsume)));
    }

    #[tokio::test]
    async fn test_closing_transport_cascades() {
        let (_, gateway) = gateway();
        let send = connected(&gateway, Direction::Send).await;
        let recv = connected(&gateway, Direction::Receive).await;
        let producer = gateway
            .produce(&send, MediaKind::Video, vp8_parameters())
            .await
            .unwrap();
        gateway.consume(&recv, &producer, &client_caps(), false).await.unwrap();

        let closed = gateway.close_transport(&send, CloseReason::Engine).await;
        assert_eq!(closed.transports.len(), 1);
        assert_eq!(closed.producers[0].1, CloseReason::TransportClosed);
        assert_eq!(closed.consumers[0].1, CloseReason::ProducerClosed);
        assert!(!recv.is_closed());
        assert_eq!(gateway.counts(), (1, 0, 0));
    }

    #[tokio::test]
    async fn test_mark_connected() {
        let (_, gateway) = gateway();
        let transport = connected(&gateway, Direction::Send).await;
        assert!(gateway.mark_connected(transport.id()).is_some());
        assert_eq!(transport.state(), TransportState::Connected);
        assert!(gateway.mark_connected(transport.id()).is_none());
        assert!(gateway.mark_connected(&TransportId::from("missing")).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_consume_racing_producer_close_leaves_no_live_consumer() {
        for _ in 0..200 {
            let (_, gateway) = gateway();
            let gateway = Arc::new(gateway);
            let send = connected(&gateway, Direction::Send).await;
            let recv = connected(&gateway, Direction::Receive).await;
            let producer = gateway
                .produce(&send, MediaKind::Video, vp8_parameters())
                .await
                .unwrap();
            let barrier = Arc::new(Barrier::new(2));

            let consume = tokio::spawn({
                let gateway = gateway.clone();
                let producer = producer.clone();
                let barrier = barrier.clone();
                async move {
                    barrier.wait().await;
                    gateway.consume(&recv, &producer, &client_caps(), false).await
                }
            });
            let close = tokio::spawn({
                let gateway = gateway.clone();
                let producer = producer.clone();
                async move {
                    barrier.wait().await;
                    gateway.close_producer(&producer, CloseReason::Explicit).await
                }
            });

            let consumed = consume.await.unwrap();
            close.await.unwrap();

            assert!(!producer.is_live());
            match consumed {
                Ok(consumer) => assert!(!consumer.is_live()),
                Err(e) => assert!(matches!(e, AppError::CannotConsume)),
            }
            assert_eq!(gateway.counts().2, 0);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_produce_racing_transport_close_leaves_no_live_producer() {
        for _ in 0..200 {
            let (_, gateway) = gateway();
            let gateway = Arc::new(gateway);
            let send = connected(&gateway, Direction::Send).await;
            let barrier = Arc::new(Barrier::new(2));

            let produce = tokio::spawn({
                let gateway = gateway.clone();
                let send = send.clone();
                let barrier = barrier.clone();
                async move {
                    barrier.wait().await;
                    gateway.produce(&send, MediaKind::Video, vp8_parameters()).await
                }
            });
            let close = tokio::spawn({
                let gateway = gateway.clone();
                let send = send.clone();
                async move {
                    barrier.wait().await;
                    gateway.close_transport(&send, CloseReason::Explicit).await
                }
            });

            let produced = produce.await.unwrap();
            close.await.unwrap();

            if let Ok(producer) = produced {
                assert!(!producer.is_live());
            }
            assert_eq!(gateway.counts(), (0, 0, 0));
        }
    }
}
