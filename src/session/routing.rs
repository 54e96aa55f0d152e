//! Producer-to-consumer routing
//!
//! Decides which producer a consume request binds to. The shipped policy
//! binds to the first live producer in peer registration order regardless of
//! who asks, which only makes sense for two-party sessions.

use std::sync::Arc;
use tracing::debug;

use super::gateway::{MediaGateway, Producer};
use super::registry::SessionRegistry;
use crate::engine::RtpCapabilities;
use crate::ids::PeerId;

/// Picks a producer for a consume request
pub trait RoutingPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Choose among live producers, given in peer registration order
    fn select(&self, candidates: &[Arc<Producer>], requester: &PeerId) -> Option<Arc<Producer>>;
}

/// First live producer wins, requester included
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstProducerWins;

impl RoutingPolicy for FirstProducerWins {
    fn name(&self) -> &'static str {
        "first-producer"
    }

    fn select(&self, candidates: &[Arc<Producer>], _requester: &PeerId) -> Option<Arc<Producer>> {
        candidates.first().cloned()
    }
}

/// Resolve the producer a consume request binds to.
///
/// Returns `None` ("cannot consume") when no producer is live or the
/// selected one is incompatible with `rtp_capabilities`. Other producers are
/// not tried.
pub fn resolve(
    policy: &dyn RoutingPolicy,
    registry: &SessionRegistry,
    gateway: &MediaGateway,
    requester: &PeerId,
    rtp_capabilities: &RtpCapabilities,
) -> Option<Arc<Producer>> {
    let candidates = registry.live_producers();
    let producer = policy.select(&candidates, requester)?;
    if !gateway.can_consume(&producer, rtp_capabilities) {
        debug!(
            "Producer {} not consumable by peer {} ({} policy)",
            producer.id(),
            requester,
            policy.name()
        );
        return None;
    }
    Some(producer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaConfig;
    use crate::engine::types::{
        DtlsFingerprint, DtlsParameters, DtlsRole, RtpCodecParameters, RtpParameters,
    };
    use crate::engine::{Direction, LoopbackEngine, MediaKind, RtpCodecCapability};

    struct Fixture {
        registry: SessionRegistry,
        gateway: MediaGateway,
    }

    impl Fixture {
        fn new() -> Self {
            let config = MediaConfig::default();
            let engine = LoopbackEngine::start(&config).unwrap();
            Self {
                registry: SessionRegistry::new(),
                gateway: MediaGateway::initialize(engine, &config),
            }
        }

        async fn producing_peer(&self, mime: &str, clock_rate: u32) -> (PeerId, Arc<Producer>) {
            let peer = self.registry.register();
            let (transport, _) = self
                .gateway
                .create_transport(&peer, Direction::Send)
                .await
                .unwrap();
            let dtls = DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: "00".to_string(),
                }],
            };
            self.gateway.connect_transport(&transport, &dtls).await.unwrap();
            let kind = if mime.starts_with("audio") {
                MediaKind::Audio
            } else {
                MediaKind::Video
            };
            let rtp = RtpParameters {
                codecs: vec![RtpCodecParameters {
                    mime_type: mime.to_string(),
                    payload_type: 100,
                    clock_rate,
                    channels: (kind == MediaKind::Audio).then_some(2),
                    parameters: Default::default(),
                    rtcp_feedback: vec![],
                }],
                ..Default::default()
            };
            let producer = self.gateway.produce(&transport, kind, rtp).await.unwrap();
            self.registry.attach_transport(&peer, transport).unwrap();
            self.registry.attach_producer(&peer, producer.clone()).unwrap();
            (peer, producer)
        }
    }

    fn caps(codecs: Vec<RtpCodecCapability>) -> RtpCapabilities {
        RtpCapabilities {
            codecs,
            header_extensions: vec![],
        }
    }

    #[tokio::test]
    async fn test_no_producer_cannot_consume() {
        let fixture = Fixture::new();
        let requester = fixture.registry.register();
        let all = caps(vec![RtpCodecCapability::opus(), RtpCodecCapability::vp8()]);
        assert!(resolve(
            &FirstProducerWins,
            &fixture.registry,
            &fixture.gateway,
            &requester,
            &all
        )
        .is_none());
    }

    #[tokio::test]
    async fn test_first_producer_wins() {
        let fixture = Fixture::new();
        let (_, first) = fixture.producing_peer("video/VP8", 90000).await;
        let (_, _second) = fixture.producing_peer("audio/opus", 48000).await;
        let requester = fixture.registry.register();

        let all = caps(vec![RtpCodecCapability::opus(), RtpCodecCapability::vp8()]);
        let chosen = resolve(
            &FirstProducerWins,
            &fixture.registry,
            &fixture.gateway,
            &requester,
            &all,
        )
        .unwrap();
        assert_eq!(chosen.id(), first.id());
    }

    #[tokio::test]
    async fn test_incompatible_first_producer_is_not_skipped() {
        let fixture = Fixture::new();
        fixture.producing_peer("video/VP8", 90000).await;
        fixture.producing_peer("audio/opus", 48000).await;
        let requester = fixture.registry.register();

        let audio_only = caps(vec![RtpCodecCapability::opus()]);
        assert!(resolve(
            &FirstProducerWins,
            &fixture.registry,
            &fixture.gateway,
            &requester,
            &audio_only
        )
        .is_none());
    }

    #[tokio::test]
    async fn test_requester_own_producer_is_eligible() {
        let fixture = Fixture::new();
        let (peer, producer) = fixture.producing_peer("video/VP8", 90000).await;
        let all = caps(vec![RtpCodecCapability::vp8()]);
        let chosen = resolve(&FirstProducerWins, &fixture.registry, &fixture.gateway, &peer, &all)
            .unwrap();
        assert_eq!(chosen.id(), producer.id());
    }
}
