//! Media engine abstraction
//!
//! The forwarding engine performs ICE/DTLS handshakes, RTP forwarding and
//! codec negotiation. The orchestration layer only drives it through the
//! [`MediaEngine`] trait and observes its lifecycle through [`EngineEvent`]s.
//!
//! ```text
//! SessionContext ──> MediaGateway ──> dyn MediaEngine
//!        ^                                  │
//!        └──────── EngineEvent (broadcast) ─┘
//! ```

pub mod loopback;
pub mod types;

pub use loopback::LoopbackEngine;
pub use types::{
    ConsumerParams, Direction, DtlsFingerprint, DtlsParameters, DtlsRole, DtlsState,
    IceCandidate, IceParameters, MediaKind, RtcpFeedback, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpParameters, TransportParams, TransportProtocol,
};

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::{EngineKind, MediaConfig};
use crate::error::Result;
use crate::ids::{ConsumerId, ProducerId, TransportId};

/// Lifecycle notification emitted by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// DTLS state of a transport changed
    DtlsStateChanged {
        transport_id: TransportId,
        state: DtlsState,
    },
    /// The engine closed a producer on its own
    ProducerClosed { producer_id: ProducerId },
    /// The engine closed a consumer on its own
    ConsumerClosed { consumer_id: ConsumerId },
    /// The engine worker process died; nothing else will work
    WorkerDied { reason: String },
}

/// Options for a new WebRTC transport
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub listen_ip: String,
    pub announced_address: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

impl TransportOptions {
    pub fn from_config(config: &MediaConfig) -> Self {
        Self {
            listen_ip: config.listen_ip.clone(),
            announced_address: config.announced_address.clone(),
            enable_udp: config.enable_udp,
            enable_tcp: config.enable_tcp,
            prefer_udp: config.prefer_udp,
        }
    }
}

/// Operations the orchestration layer needs from a forwarding engine.
///
/// Close operations are idempotent and never fail; closing an unknown id is
/// a no-op.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Short engine name for logs and health output
    fn name(&self) -> &'static str;

    /// Capability set of the single routing context
    fn rtp_capabilities(&self) -> RtpCapabilities;

    async fn create_transport(&self, options: &TransportOptions) -> Result<TransportParams>;

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<()>;

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerId>;

    /// Whether a consumer with `rtp_capabilities` could receive `producer_id`
    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerParams>;

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<()>;

    async fn close_transport(&self, transport_id: &TransportId);

    async fn close_producer(&self, producer_id: &ProducerId);

    async fn close_consumer(&self, consumer_id: &ConsumerId);

    /// Subscribe to engine lifecycle events
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}

/// Start the configured engine.
///
/// Failure here is fatal for the process; there is no retry.
pub async fn start(config: &MediaConfig) -> Result<Arc<dyn MediaEngine>> {
    match config.engine {
        EngineKind::Loopback => {
            let engine: Arc<dyn MediaEngine> = LoopbackEngine::start(config)?;
            Ok(engine)
        }
    }
}
