//! In-process loopback engine
//!
//! Implements the engine contract without moving RTP: it allocates ports
//! from the configured range, hands out ICE/DTLS parameters, tracks
//! transports, producers and consumers, performs the capability
//! compatibility check and reports DTLS progress through [`EngineEvent`]s.
//! It backs development runs and the test suite.
//!
//! ```rust
//! use sfu_signal::config::MediaConfig;
//! use sfu_signal::engine::{LoopbackEngine, MediaEngine, TransportOptions};
//!
//! # tokio_test::block_on(async {
//! let config = MediaConfig::default();
//! let engine = LoopbackEngine::start(&config).unwrap();
//! let params = engine
//!     .create_transport(&TransportOptions::from_config(&config))
//!     .await
//!     .unwrap();
//! // UDP and TCP host candidates on the same port
//! assert_eq!(params.ice_candidates.len(), 2);
//! # })
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Map;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::types::{
    ConsumerParams, DtlsFingerprint, DtlsParameters, DtlsRole, DtlsState, IceCandidate,
    IceParameters, MediaKind, RtcpFeedback, RtcpParameters, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpEncodingParameters, RtpHeaderExtension, RtpParameters,
    TransportParams, TransportProtocol,
};
use super::{EngineEvent, MediaEngine, TransportOptions};
use crate::config::MediaConfig;
use crate::error::{AppError, Result};
use crate::ids::{ConsumerId, ProducerId, TransportId};

/// Engine event channel capacity
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// First dynamic payload type handed out to router codecs
const FIRST_PAYLOAD_TYPE: u8 = 100;

/// ICE candidate priorities for the preferred and the other protocol
const PRIORITY_HIGH: u32 = 1076558079;
const PRIORITY_LOW: u32 = 1076302079;

struct LoopbackTransport {
    port: u16,
    dtls_state: DtlsState,
    remote_dtls: Option<DtlsParameters>,
}

struct LoopbackProducer {
    transport_id: TransportId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

struct LoopbackConsumer {
    transport_id: TransportId,
    producer_id: ProducerId,
    paused: bool,
}

#[derive(Default)]
struct EngineState {
    free_ports: BTreeSet<u16>,
    transports: HashMap<TransportId, LoopbackTransport>,
    producers: HashMap<ProducerId, LoopbackProducer>,
    consumers: HashMap<ConsumerId, LoopbackConsumer>,
}

impl EngineState {
    fn remove_producer(&mut self, producer_id: &ProducerId) -> bool {
        if self.producers.remove(producer_id).is_none() {
            return false;
        }
        self.consumers.retain(|_, c| &c.producer_id != producer_id);
        true
    }

    fn remove_transport(&mut self, transport_id: &TransportId) -> bool {
        let Some(transport) = self.transports.remove(transport_id) else {
            return false;
        };
        self.free_ports.insert(transport.port);

        let producers: Vec<ProducerId> = self
            .producers
            .iter()
            .filter(|(_, p)| &p.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for producer_id in producers {
            self.remove_producer(&producer_id);
        }
        self.consumers.retain(|_, c| &c.transport_id != transport_id);
        true
    }
}

/// Loopback media engine
pub struct LoopbackEngine {
    capabilities: RtpCapabilities,
    fingerprint: DtlsFingerprint,
    handshake_delay: Duration,
    state: Arc<Mutex<EngineState>>,
    events: broadcast::Sender<EngineEvent>,
    worker_alive: AtomicBool,
    next_mid: AtomicU32,
}

impl LoopbackEngine {
    /// Start the engine with the configured port range and codecs
    pub fn start(config: &MediaConfig) -> Result<Arc<Self>> {
        if config.rtc_min_port == 0 || config.rtc_min_port > config.rtc_max_port {
            return Err(AppError::Engine(format!(
                "Invalid RTC port range {}-{}",
                config.rtc_min_port, config.rtc_max_port
            )));
        }

        let capabilities = build_router_capabilities(&config.codecs)?;

        let state = EngineState {
            free_ports: (config.rtc_min_port..=config.rtc_max_port).collect(),
            ..Default::default()
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(
            "Loopback engine started (ports {}-{}, {} codecs)",
            config.rtc_min_port,
            config.rtc_max_port,
            capabilities.codecs.len()
        );

        Ok(Arc::new(Self {
            capabilities,
            fingerprint: generate_fingerprint(),
            handshake_delay: Duration::from_millis(config.loopback_handshake_ms),
            state: Arc::new(Mutex::new(state)),
            events,
            worker_alive: AtomicBool::new(true),
            next_mid: AtomicU32::new(0),
        }))
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.worker_alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::Engine("Media engine worker is not running".to_string()))
        }
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Report a DTLS state as if the handshake layer had observed it
    pub fn simulate_dtls_state(&self, transport_id: &TransportId, state: DtlsState) {
        {
            let mut engine = self.state.lock();
            match engine.transports.get_mut(transport_id) {
                Some(transport) => transport.dtls_state = state,
                None => return,
            }
        }
        self.emit(EngineEvent::DtlsStateChanged {
            transport_id: transport_id.clone(),
            state,
        });
    }

    /// Close a producer from the engine side (e.g. the remote track ended)
    pub fn simulate_producer_close(&self, producer_id: &ProducerId) {
        if self.state.lock().remove_producer(producer_id) {
            self.emit(EngineEvent::ProducerClosed {
                producer_id: producer_id.clone(),
            });
        }
    }

    /// Close a consumer from the engine side (e.g. the receiving track ended)
    pub fn simulate_consumer_close(&self, consumer_id: &ConsumerId) {
        if self.state.lock().consumers.remove(consumer_id).is_some() {
            self.emit(EngineEvent::ConsumerClosed {
                consumer_id: consumer_id.clone(),
            });
        }
    }

    /// Mark the worker as dead and report it
    pub fn simulate_worker_death(&self, reason: &str) {
        if self.worker_alive.swap(false, Ordering::SeqCst) {
            warn!("Loopback engine worker died: {}", reason);
            self.emit(EngineEvent::WorkerDied {
                reason: reason.to_string(),
            });
        }
    }

    /// Remote DTLS parameters last supplied for a transport
    pub fn remote_dtls_parameters(&self, transport_id: &TransportId) -> Option<DtlsParameters> {
        self.state
            .lock()
            .transports
            .get(transport_id)
            .and_then(|t| t.remote_dtls.clone())
    }

    /// Number of RTC ports still available
    pub fn free_port_count(&self) -> usize {
        self.state.lock().free_ports.len()
    }

    pub fn is_consumer_paused(&self, consumer_id: &ConsumerId) -> Option<bool> {
        self.state.lock().consumers.get(consumer_id).map(|c| c.paused)
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    async fn create_transport(&self, options: &TransportOptions) -> Result<TransportParams> {
        self.ensure_alive()?;

        if !options.enable_udp && !options.enable_tcp {
            return Err(AppError::Engine(
                "Transport needs UDP or TCP enabled".to_string(),
            ));
        }

        let id = TransportId::new();
        let port = {
            let mut engine = self.state.lock();
            let port = engine
                .free_ports
                .pop_first()
                .ok_or_else(|| AppError::Engine("No free RTC ports".to_string()))?;
            engine.transports.insert(
                id.clone(),
                LoopbackTransport {
                    port,
                    dtls_state: DtlsState::New,
                    remote_dtls: None,
                },
            );
            port
        };

        let address = options
            .announced_address
            .clone()
            .unwrap_or_else(|| options.listen_ip.clone());

        let (udp_priority, tcp_priority) = if options.prefer_udp {
            (PRIORITY_HIGH, PRIORITY_LOW)
        } else {
            (PRIORITY_LOW, PRIORITY_HIGH)
        };

        let mut ice_candidates = Vec::new();
        if options.enable_udp {
            ice_candidates.push(IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: udp_priority,
                address: address.clone(),
                protocol: TransportProtocol::Udp,
                port,
                candidate_type: "host".to_string(),
                tcp_type: None,
            });
        }
        if options.enable_tcp {
            ice_candidates.push(IceCandidate {
                foundation: "tcpcandidate".to_string(),
                priority: tcp_priority,
                address,
                protocol: TransportProtocol::Tcp,
                port,
                candidate_type: "host".to_string(),
                tcp_type: Some("passive".to_string()),
            });
        }

        debug!("Loopback transport {} created on port {}", id, port);

        Ok(TransportParams {
            id,
            ice_parameters: IceParameters {
                username_fragment: random_token(16),
                password: random_token(32),
                ice_lite: true,
            },
            ice_candidates,
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![self.fingerprint.clone()],
            },
        })
    }

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<()> {
        self.ensure_alive()?;

        if dtls_parameters.fingerprints.is_empty() {
            return Err(AppError::BadRequest(
                "DTLS parameters carry no fingerprint".to_string(),
            ));
        }

        let started = {
            let mut engine = self.state.lock();
            let transport = engine
                .transports
                .get_mut(transport_id)
                .ok_or_else(|| AppError::NotFound(format!("Transport not found: {}", transport_id)))?;
            transport.remote_dtls = Some(dtls_parameters.clone());
            if transport.dtls_state == DtlsState::New {
                transport.dtls_state = DtlsState::Connecting;
                true
            } else {
                false
            }
        };

        if started {
            self.emit(EngineEvent::DtlsStateChanged {
                transport_id: transport_id.clone(),
                state: DtlsState::Connecting,
            });

            // Handshake completes asynchronously, like a real DTLS exchange
            let state = self.state.clone();
            let events = self.events.clone();
            let delay = self.handshake_delay;
            let transport_id = transport_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let completed = {
                    let mut engine = state.lock();
                    match engine.transports.get_mut(&transport_id) {
                        Some(t) if t.dtls_state == DtlsState::Connecting => {
                            t.dtls_state = DtlsState::Connected;
                            true
                        }
                        _ => false,
                    }
                };
                if completed {
                    let _ = events.send(EngineEvent::DtlsStateChanged {
                        transport_id,
                        state: DtlsState::Connected,
                    });
                }
            });
        }

        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerId> {
        self.ensure_alive()?;

        let mut media_codecs = rtp_parameters.media_codecs().peekable();
        if media_codecs.peek().is_none() {
            return Err(AppError::BadRequest(
                "RTP parameters carry no media codec".to_string(),
            ));
        }
        for codec in media_codecs {
            let supported = self
                .capabilities
                .codecs
                .iter()
                .any(|cap| cap.kind == kind && cap.matches(codec));
            if !supported {
                return Err(AppError::Engine(format!(
                    "Unsupported {} codec: {}/{}",
                    kind, codec.mime_type, codec.clock_rate
                )));
            }
        }

        let id = ProducerId::new();
        let mut engine = self.state.lock();
        if !engine.transports.contains_key(transport_id) {
            return Err(AppError::NotFound(format!(
                "Transport not found: {}",
                transport_id
            )));
        }
        engine.producers.insert(
            id.clone(),
            LoopbackProducer {
                transport_id: transport_id.clone(),
                kind,
                rtp_parameters: rtp_parameters.clone(),
            },
        );
        Ok(id)
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        let engine = self.state.lock();
        let Some(producer) = engine.producers.get(producer_id) else {
            return false;
        };
        let compatible = producer.rtp_parameters.media_codecs().any(|codec| {
            rtp_capabilities
                .codecs
                .iter()
                .any(|cap| cap.kind == producer.kind && cap.matches(codec))
        });
        compatible
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerParams> {
        self.ensure_alive()?;

        let mut engine = self.state.lock();
        if !engine.transports.contains_key(transport_id) {
            return Err(AppError::NotFound(format!(
                "Transport not found: {}",
                transport_id
            )));
        }
        let producer = engine
            .producers
            .get(producer_id)
            .ok_or_else(|| AppError::NotFound(format!("Producer not found: {}", producer_id)))?;
        let kind = producer.kind;

        let codecs: Vec<RtpCodecParameters> = producer
            .rtp_parameters
            .media_codecs()
            .filter_map(|codec| {
                rtp_capabilities
                    .codecs
                    .iter()
                    .find(|cap| cap.kind == kind && cap.matches(codec))
                    .map(|cap| RtpCodecParameters {
                        mime_type: cap.mime_type.clone(),
                        payload_type: cap.preferred_payload_type.unwrap_or(codec.payload_type),
                        clock_rate: cap.clock_rate,
                        channels: cap.channels,
                        parameters: codec.parameters.clone(),
                        rtcp_feedback: cap.rtcp_feedback.clone(),
                    })
            })
            .collect();

        if codecs.is_empty() {
            return Err(AppError::Engine(format!(
                "Capabilities cannot consume producer {}",
                producer_id
            )));
        }

        let mid = self.next_mid.fetch_add(1, Ordering::SeqCst);
        let rtp_parameters = RtpParameters {
            mid: Some(mid.to_string()),
            codecs,
            header_extensions: Vec::new(),
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(rand::thread_rng().gen()),
                ..Default::default()
            }],
            rtcp: RtcpParameters {
                cname: producer.rtp_parameters.rtcp.cname.clone(),
                reduced_size: true,
            },
        };

        let id = ConsumerId::new();
        engine.consumers.insert(
            id.clone(),
            LoopbackConsumer {
                transport_id: transport_id.clone(),
                producer_id: producer_id.clone(),
                paused,
            },
        );

        Ok(ConsumerParams {
            id,
            producer_id: producer_id.clone(),
            kind,
            rtp_parameters,
            paused,
        })
    }

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<()> {
        self.ensure_alive()?;
        let mut engine = self.state.lock();
        let consumer = engine
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| AppError::NotFound(format!("Consumer not found: {}", consumer_id)))?;
        consumer.paused = false;
        Ok(())
    }

    async fn close_transport(&self, transport_id: &TransportId) {
        if self.state.lock().remove_transport(transport_id) {
            debug!("Loopback transport {} closed", transport_id);
        }
    }

    async fn close_producer(&self, producer_id: &ProducerId) {
        self.state.lock().remove_producer(producer_id);
    }

    async fn close_consumer(&self, consumer_id: &ConsumerId) {
        self.state.lock().consumers.remove(consumer_id);
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

/// Build router capabilities from the configured media codecs.
///
/// Payload types are assigned from 100 upwards; every video codec gets an
/// RTX companion.
fn build_router_capabilities(media_codecs: &[RtpCodecCapability]) -> Result<RtpCapabilities> {
    if media_codecs.is_empty() {
        return Err(AppError::Engine("No media codecs configured".to_string()));
    }

    let mut next_pt = FIRST_PAYLOAD_TYPE;
    let mut codecs = Vec::new();

    for codec in media_codecs {
        let prefix = match codec.kind {
            MediaKind::Audio => "audio/",
            MediaKind::Video => "video/",
        };
        if !codec.mime_type.to_ascii_lowercase().starts_with(prefix) {
            return Err(AppError::Engine(format!(
                "Codec {} does not match kind {}",
                codec.mime_type, codec.kind
            )));
        }

        let payload_type = codec.preferred_payload_type.unwrap_or_else(|| {
            let pt = next_pt;
            next_pt = next_pt.saturating_add(1);
            pt
        });

        let mut capability = codec.clone();
        capability.preferred_payload_type = Some(payload_type);
        if capability.rtcp_feedback.is_empty() {
            capability.rtcp_feedback = default_feedback(codec.kind);
        }
        codecs.push(capability);

        if codec.kind == MediaKind::Video {
            let mut parameters = Map::new();
            parameters.insert("apt".to_string(), payload_type.into());
            codecs.push(RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/rtx".to_string(),
                preferred_payload_type: Some(next_pt),
                clock_rate: codec.clock_rate,
                channels: None,
                parameters,
                rtcp_feedback: Vec::new(),
            });
            next_pt = next_pt.saturating_add(1);
        }
    }

    Ok(RtpCapabilities {
        codecs,
        header_extensions: default_header_extensions(),
    })
}

fn default_feedback(kind: MediaKind) -> Vec<RtcpFeedback> {
    match kind {
        MediaKind::Audio => vec![RtcpFeedback::new("transport-cc", "")],
        MediaKind::Video => vec![
            RtcpFeedback::new("nack", ""),
            RtcpFeedback::new("nack", "pli"),
            RtcpFeedback::new("ccm", "fir"),
            RtcpFeedback::new("goog-remb", ""),
            RtcpFeedback::new("transport-cc", ""),
        ],
    }
}

fn default_header_extensions() -> Vec<RtpHeaderExtension> {
    let ext = |kind, uri: &str, preferred_id| RtpHeaderExtension {
        kind,
        uri: uri.to_string(),
        preferred_id,
        preferred_encrypt: false,
        direction: Some("sendrecv".to_string()),
    };
    vec![
        ext(MediaKind::Audio, "urn:ietf:params:rtp-hdrext:sdes:mid", 1),
        ext(MediaKind::Video, "urn:ietf:params:rtp-hdrext:sdes:mid", 1),
        ext(
            MediaKind::Audio,
            "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
            4,
        ),
        ext(
            MediaKind::Video,
            "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
            4,
        ),
        ext(
            MediaKind::Video,
            "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01",
            5,
        ),
        ext(MediaKind::Audio, "urn:ietf:params:rtp-hdrext:ssrc-audio-level", 10),
        ext(MediaKind::Video, "urn:3gpp:video-orientation", 11),
    ]
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// SHA-256 fingerprint in the colon-separated uppercase hex form used in SDP
fn generate_fingerprint() -> DtlsFingerprint {
    let seed: [u8; 32] = rand::thread_rng().gen();
    let digest = Sha256::digest(seed);
    let value = digest
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":");
    DtlsFingerprint {
        algorithm: "sha-256".to_string(),
        value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Arc<LoopbackEngine> {
        LoopbackEngine::start(&MediaConfig::default()).unwrap()
    }

    fn options() -> TransportOptions {
        TransportOptions::from_config(&MediaConfig::default())
    }

    fn remote_dtls() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AA:BB".to_string(),
            }],
        }
    }

    fn vp8_parameters() -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 96,
                clock_rate: 90000,
                channels: None,
                parameters: Map::new(),
                rtcp_feedback: vec![],
            }],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(1234),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_router_capabilities_assign_payload_types() {
        let caps = engine().rtp_capabilities();
        // opus, VP8, VP8 rtx
        assert_eq!(caps.codecs.len(), 3);
        assert_eq!(caps.codecs[0].preferred_payload_type, Some(100));
        assert_eq!(caps.codecs[1].preferred_payload_type, Some(101));
        assert!(caps.codecs[2].is_rtx());
        assert_eq!(caps.codecs[2].parameters["apt"], 101);
        assert!(!caps.header_extensions.is_empty());
    }

    #[test]
    fn test_start_rejects_bad_port_range() {
        let config = MediaConfig {
            rtc_min_port: 3000,
            rtc_max_port: 2000,
            ..Default::default()
        };
        assert!(LoopbackEngine::start(&config).is_err());
    }

    #[test]
    fn test_start_rejects_empty_codecs() {
        let config = MediaConfig {
            codecs: vec![],
            ..Default::default()
        };
        assert!(LoopbackEngine::start(&config).is_err());
    }

    #[tokio::test]
    async fn test_transport_ports_are_recycled() {
        let config = MediaConfig {
            rtc_min_port: 4000,
            rtc_max_port: 4000,
            ..Default::default()
        };
        let engine = LoopbackEngine::start(&config).unwrap();
        let params = engine.create_transport(&options()).await.unwrap();
        assert_eq!(params.ice_candidates[0].port, 4000);
        assert!(engine.create_transport(&options()).await.is_err());

        engine.close_transport(&params.id).await;
        assert_eq!(engine.free_port_count(), 1);
        assert!(engine.create_transport(&options()).await.is_ok());
    }

    #[tokio::test]
    async fn test_candidates_prefer_udp() {
        let params = engine().create_transport(&options()).await.unwrap();
        assert_eq!(params.ice_candidates.len(), 2);
        let udp = &params.ice_candidates[0];
        let tcp = &params.ice_candidates[1];
        assert_eq!(udp.protocol, TransportProtocol::Udp);
        assert_eq!(tcp.tcp_type.as_deref(), Some("passive"));
        assert!(udp.priority > tcp.priority);
        assert_eq!(udp.address, "127.0.0.1");
        assert_eq!(params.dtls_parameters.fingerprints[0].value.len(), 32 * 3 - 1);
    }

    #[tokio::test]
    async fn test_connect_reports_connected() {
        let engine = engine();
        let mut events = engine.subscribe();
        let params = engine.create_transport(&options()).await.unwrap();

        engine.connect_transport(&params.id, &remote_dtls()).await.unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(
            first,
            EngineEvent::DtlsStateChanged {
                transport_id: params.id.clone(),
                state: DtlsState::Connecting
            }
        );
        let second = events.recv().await.unwrap();
        assert_eq!(
            second,
            EngineEvent::DtlsStateChanged {
                transport_id: params.id.clone(),
                state: DtlsState::Connected
            }
        );
    }

    #[tokio::test]
    async fn test_reconnect_last_parameters_win() {
        let engine = engine();
        let params = engine.create_transport(&options()).await.unwrap();
        engine.connect_transport(&params.id, &remote_dtls()).await.unwrap();

        let mut second = remote_dtls();
        second.fingerprints[0].value = "CC:DD".to_string();
        engine.connect_transport(&params.id, &second).await.unwrap();

        assert_eq!(engine.remote_dtls_parameters(&params.id), Some(second));
    }

    #[tokio::test]
    async fn test_connect_requires_fingerprint() {
        let engine = engine();
        let params = engine.create_transport(&options()).await.unwrap();
        let empty = DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![],
        };
        assert!(engine.connect_transport(&params.id, &empty).await.is_err());
    }

    #[tokio::test]
    async fn test_produce_rejects_unsupported_codec() {
        let engine = engine();
        let params = engine.create_transport(&options()).await.unwrap();
        let mut rtp = vp8_parameters();
        rtp.codecs[0].mime_type = "video/H265".to_string();
        assert!(engine
            .produce(&params.id, MediaKind::Video, &rtp)
            .await
            .is_err());
        // Kind must agree with the codec
        assert!(engine
            .produce(&params.id, MediaKind::Audio, &vp8_parameters())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_can_consume_and_consume() {
        let engine = engine();
        let send = engine.create_transport(&options()).await.unwrap();
        let recv = engine.create_transport(&options()).await.unwrap();
        let producer_id = engine
            .produce(&send.id, MediaKind::Video, &vp8_parameters())
            .await
            .unwrap();

        let caps = engine.rtp_capabilities();
        assert!(engine.can_consume(&producer_id, &caps));
        assert!(!engine.can_consume(&producer_id, &RtpCapabilities::default()));
        assert!(!engine.can_consume(&ProducerId::new(), &caps));

        let consumer = engine
            .consume(&recv.id, &producer_id, &caps, true)
            .await
            .unwrap();
        assert_eq!(consumer.kind, MediaKind::Video);
        assert_eq!(consumer.rtp_parameters.codecs[0].payload_type, 101);
        assert_eq!(engine.is_consumer_paused(&consumer.id), Some(true));

        engine.resume_consumer(&consumer.id).await.unwrap();
        assert_eq!(engine.is_consumer_paused(&consumer.id), Some(false));
    }

    #[tokio::test]
    async fn test_closing_transport_drops_dependents() {
        let engine = engine();
        let send = engine.create_transport(&options()).await.unwrap();
        let recv = engine.create_transport(&options()).await.unwrap();
        let producer_id = engine
            .produce(&send.id, MediaKind::Video, &vp8_parameters())
            .await
            .unwrap();
        let consumer = engine
            .consume(&recv.id, &producer_id, &engine.rtp_capabilities(), false)
            .await
            .unwrap();

        engine.close_transport(&send.id).await;
        assert!(!engine.can_consume(&producer_id, &engine.rtp_capabilities()));
        assert_eq!(engine.is_consumer_paused(&consumer.id), None);

        // Idempotent
        engine.close_transport(&send.id).await;
        engine.close_producer(&producer_id).await;
    }

    #[tokio::test]
    async fn test_worker_death_stops_operations() {
        let engine = engine();
        let mut events = engine.subscribe();
        engine.simulate_worker_death("test");
        assert!(matches!(
            events.recv().await.unwrap(),
            EngineEvent::WorkerDied { .. }
        ));
        assert!(engine.create_transport(&options()).await.is_err());
    }
}
