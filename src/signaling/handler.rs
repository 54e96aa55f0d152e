//! Per-connection request dispatch

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use super::protocol::{
    error_payload, CapabilitiesResponse, ClientFrame, ConsumeResponse, ProduceResponse, Request,
    ServerFrame, ServerNotification,
};
use crate::engine::Direction;
use crate::error::Result;
use crate::events::SessionEvent;
use crate::ids::PeerId;
use crate::session::SessionContext;

/// Dispatches one peer's requests against the shared session context
pub struct SignalingHandler {
    context: Arc<SessionContext>,
    peer_id: PeerId,
}

impl SignalingHandler {
    pub fn new(context: Arc<SessionContext>, peer_id: PeerId) -> Self {
        Self { context, peer_id }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// First frame of every connection
    pub fn connection_success(&self) -> ServerNotification {
        ServerNotification::ConnectionSuccess {
            connection_id: self.peer_id.clone(),
        }
    }

    /// Handle one client frame, returning the response to send.
    ///
    /// Requests are answered exactly once unless the peer was torn down
    /// while the request was running; notifications are never answered.
    pub async fn handle_frame(&self, frame: ClientFrame) -> Option<ServerFrame> {
        match frame {
            ClientFrame::Request { id, method, data } => {
                debug!("Peer {} request #{} {}", self.peer_id, id, method);
                let request = match Request::parse(&method, data) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!("Peer {} sent invalid request #{}: {}", self.peer_id, id, e);
                        return Some(ServerFrame::error(id, e.to_string()));
                    }
                };
                match self.dispatch(request).await {
                    Ok(Some(data)) => Some(ServerFrame::response(id, data)),
                    Ok(None) => {
                        debug!("Peer {} gone, dropping response #{}", self.peer_id, id);
                        None
                    }
                    Err(e) => {
                        debug!("Peer {} request #{} failed: {}", self.peer_id, id, e);
                        Some(ServerFrame::response(
                            id,
                            error_payload(e.signaling_message()),
                        ))
                    }
                }
            }
            ClientFrame::Notification { method, data } => {
                debug!("Peer {} notification {}", self.peer_id, method);
                match Request::parse(&method, data) {
                    Ok(request) => {
                        if let Err(e) = self.dispatch(request).await {
                            warn!("Peer {} notification {} failed: {}", self.peer_id, method, e);
                        }
                    }
                    Err(e) => warn!("Peer {} sent invalid notification: {}", self.peer_id, e),
                }
                None
            }
        }
    }

    /// `Ok(None)` means the peer is gone
    async fn dispatch(&self, request: Request) -> Result<Option<Value>> {
        let context = &self.context;
        let peer_id = &self.peer_id;

        match request {
            Request::GetCapabilities => {
                let response = CapabilitiesResponse {
                    rtp_capabilities: context.capabilities().clone(),
                };
                Ok(Some(serde_json::to_value(response)?))
            }
            Request::CreateTransport(direction) => {
                match context.create_transport(peer_id, direction).await? {
                    Some(params) => Ok(Some(serde_json::to_value(params)?)),
                    None => Ok(None),
                }
            }
            Request::ConnectSendTransport(payload) => Ok(context
                .connect_transport(peer_id, Direction::Send, &payload.dtls_parameters)
                .await?
                .map(|()| json!({}))),
            Request::ConnectReceiveTransport(payload) => Ok(context
                .connect_transport(peer_id, Direction::Receive, &payload.dtls_parameters)
                .await?
                .map(|()| json!({}))),
            Request::Produce(payload) => {
                match context
                    .produce(peer_id, payload.kind, payload.rtp_parameters)
                    .await?
                {
                    Some(producer_id) => Ok(Some(serde_json::to_value(ProduceResponse {
                        producer_id,
                    })?)),
                    None => Ok(None),
                }
            }
            Request::Consume(payload) => {
                match context.consume(peer_id, &payload.rtp_capabilities).await? {
                    Some(consumer) => Ok(Some(serde_json::to_value(ConsumeResponse {
                        producer_id: consumer.producer_id().clone(),
                        consumer_id: consumer.id().clone(),
                        kind: consumer.kind(),
                        rtp_parameters: consumer.rtp_parameters().clone(),
                    })?)),
                    None => Ok(None),
                }
            }
            Request::ResumeConsumer => {
                context.resume_consumer(peer_id).await?;
                Ok(Some(json!({})))
            }
        }
    }

    /// Notification for the client if `event` concerns this peer
    pub fn notification_for(&self, event: &SessionEvent) -> Option<ServerNotification> {
        if event.peer_id() != Some(&self.peer_id) {
            return None;
        }
        match event {
            SessionEvent::TransportClosed {
                transport_id,
                direction,
                ..
            } => Some(ServerNotification::TransportClosed {
                transport_id: transport_id.clone(),
                direction: *direction,
            }),
            SessionEvent::ProducerClosed { producer_id, .. } => {
                Some(ServerNotification::ProducerClosed {
                    producer_id: producer_id.clone(),
                })
            }
            SessionEvent::ConsumerClosed {
                consumer_id,
                producer_id,
                reason,
                ..
            } => Some(ServerNotification::ConsumerClosed {
                consumer_id: consumer_id.clone(),
                producer_id: producer_id.clone(),
                reason: *reason,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MediaConfig, SignalingConfig};
    use crate::engine::LoopbackEngine;
    use crate::events::{CloseReason, EventBus};
    use crate::ids::{ConsumerId, ProducerId};
    use crate::session::MediaGateway;

    fn handler() -> SignalingHandler {
        let config = MediaConfig::default();
        let engine = LoopbackEngine::start(&config).unwrap();
        let context = Arc::new(SessionContext::new(
            MediaGateway::initialize(engine, &config),
            Arc::new(EventBus::new()),
            &SignalingConfig::default(),
        ));
        let peer_id = context.connect_peer();
        SignalingHandler::new(context, peer_id)
    }

    fn request(id: u64, method: &str, data: Value) -> ClientFrame {
        ClientFrame::Request {
            id,
            method: method.to_string(),
            data,
        }
    }

    fn response_data(frame: Option<ServerFrame>, expected_id: u64) -> Value {
        match frame {
            Some(ServerFrame::Response { id, data }) => {
                assert_eq!(id, expected_id);
                data
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_capabilities() {
        let handler = handler();
        let data = response_data(
            handler
                .handle_frame(request(1, "get-capabilities", Value::Null))
                .await,
            1,
        );
        let codecs = data["rtpCapabilities"]["codecs"].as_array().unwrap();
        assert!(codecs.iter().any(|c| c["mimeType"] == "audio/opus"));
    }

    #[tokio::test]
    async fn test_create_transport_response_shape() {
        let handler = handler();
        let data = response_data(
            handler
                .handle_frame(request(2, "create-transport", json!({"direction": "send"})))
                .await,
            2,
        );
        assert!(data["id"].is_string());
        assert!(data["iceParameters"]["usernameFragment"].is_string());
        assert!(data["iceCandidates"].as_array().is_some_and(|c| !c.is_empty()));
        assert!(data["dtlsParameters"]["fingerprints"].is_array());
    }

    #[tokio::test]
    async fn test_consume_without_producer() {
        let handler = handler();
        handler
            .handle_frame(request(1, "create-transport", json!({"direction": "receive"})))
            .await;
        let data = response_data(
            handler
                .handle_frame(request(
                    2,
                    "consume",
                    json!({"rtpCapabilities": {"codecs": [], "headerExtensions": []}}),
                ))
                .await,
            2,
        );
        assert_eq!(data, json!({"error": "cannot consume"}));
    }

    #[tokio::test]
    async fn test_errors_are_structured() {
        let handler = handler();
        let data = response_data(
            handler.handle_frame(request(5, "teleport", json!({}))).await,
            5,
        );
        assert!(data["error"].as_str().unwrap().contains("teleport"));

        let data = response_data(
            handler
                .handle_frame(request(
                    6,
                    "connect-send-transport",
                    json!({"dtlsParameters": {"fingerprints": [{"algorithm": "sha-256", "value": "00"}]}}),
                ))
                .await,
            6,
        );
        assert_eq!(data, json!({"error": "no send transport"}));
    }

    #[tokio::test]
    async fn test_resume_notification_has_no_response() {
        let handler = handler();
        let frame = ClientFrame::Notification {
            method: "resume-consumer".to_string(),
            data: Value::Null,
        };
        assert!(handler.handle_frame(frame).await.is_none());

        let data = response_data(
            handler.handle_frame(request(9, "resume-consumer", json!({}))).await,
            9,
        );
        assert_eq!(data, json!({}));
    }

    #[test]
    fn test_notifications_are_filtered_by_peer() {
        let handler = handler();
        let mine = SessionEvent::ConsumerClosed {
            peer_id: handler.peer_id().clone(),
            consumer_id: ConsumerId::from("c"),
            producer_id: ProducerId::from("p"),
            reason: CloseReason::ProducerClosed,
        };
        assert!(matches!(
            handler.notification_for(&mine),
            Some(ServerNotification::ConsumerClosed { .. })
        ));

        let theirs = SessionEvent::ConsumerClosed {
            peer_id: PeerId::from("someone-else"),
            consumer_id: ConsumerId::from("c"),
            producer_id: ProducerId::from("p"),
            reason: CloseReason::ProducerClosed,
        };
        assert!(handler.notification_for(&theirs).is_none());

        let created = SessionEvent::PeerConnected {
            peer_id: handler.peer_id().clone(),
        };
        assert!(handler.notification_for(&created).is_none());
    }
}
