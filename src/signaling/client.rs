//! Signaling client
//!
//! Speaks the signaling protocol over `tokio-tungstenite`. Used by the
//! end-to-end tests and by tooling that needs to drive a session without a
//! browser.

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::protocol::{
    CapabilitiesResponse, ClientFrame, ConsumeResponse, Method, ProduceResponse, ServerFrame,
    ServerNotification,
};
use crate::engine::{
    Direction, DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, TransportParams,
};
use crate::ids::{PeerId, ProducerId};

/// Signaling client errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection closed")]
    Disconnected,

    #[error("Unexpected handshake: {0}")]
    Handshake(String),

    /// The server answered with `{"error": ...}`
    #[error("Server error: {0}")]
    Remote(String),

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Pending requests; `None` once the connection is gone
type PendingMap = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<Value>>>>>;

pub struct SignalingClient {
    connection_id: PeerId,
    outbound: mpsc::UnboundedSender<Message>,
    pending: PendingMap,
    next_id: AtomicU64,
    notifications: mpsc::UnboundedReceiver<ServerNotification>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SignalingClient {
    /// Connect and wait for `connection-success`
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut sink, mut source) = stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let pending: PendingMap = Arc::new(Mutex::new(Some(HashMap::new())));
        let (notify_tx, mut notifications) = mpsc::unbounded_channel();
        let reader = {
            let pending = pending.clone();
            tokio::spawn(async move {
                while let Some(message) = source.next().await {
                    let text = match message {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            debug!("Signaling client read error: {}", e);
                            break;
                        }
                    };
                    match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(ServerFrame::Response { id, data }) => {
                            let waiter = pending.lock().as_mut().and_then(|p| p.remove(&id));
                            match waiter {
                                Some(waiter) => {
                                    let _ = waiter.send(data);
                                }
                                None => warn!("Response for unknown request #{}", id),
                            }
                        }
                        Ok(ServerFrame::Notification { method, data }) => {
                            match ServerNotification::from_parts(&method, data) {
                                Ok(notification) => {
                                    let _ = notify_tx.send(notification);
                                }
                                Err(e) => debug!("Ignoring notification {}: {}", method, e),
                            }
                        }
                        Err(e) => warn!("Undecodable server frame: {}", e),
                    }
                }
                // Dropping every sender resolves outstanding requests
                pending.lock().take();
            })
        };

        let connection_id = match notifications.recv().await {
            Some(ServerNotification::ConnectionSuccess { connection_id }) => connection_id,
            Some(other) => return Err(ClientError::Handshake(other.method().to_string())),
            None => return Err(ClientError::Disconnected),
        };

        Ok(Self {
            connection_id,
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            notifications,
            reader,
            writer,
        })
    }

    /// Id the server assigned to this connection
    pub fn connection_id(&self) -> &PeerId {
        &self.connection_id
    }

    /// Send a request and wait for its response data
    pub async fn request(&self, method: Method, data: Value) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        match self.pending.lock().as_mut() {
            Some(pending) => {
                pending.insert(id, tx);
            }
            None => return Err(ClientError::Disconnected),
        }

        let frame = ClientFrame::Request {
            id,
            method: method.as_str().to_string(),
            data,
        };
        self.send(&frame)?;

        let data = rx.await.map_err(|_| ClientError::Disconnected)?;
        match data.get("error").and_then(Value::as_str) {
            Some(message) => Err(ClientError::Remote(message.to_string())),
            None => Ok(data),
        }
    }

    /// Send a one-way notification
    pub fn notify(&self, method: Method, data: Value) -> Result<(), ClientError> {
        self.send(&ClientFrame::Notification {
            method: method.as_str().to_string(),
            data,
        })
    }

    /// Send raw text, bypassing frame encoding
    pub fn send_raw(&self, text: impl Into<String>) -> Result<(), ClientError> {
        let text: String = text.into();
        self.outbound
            .send(Message::Text(text.into()))
            .map_err(|_| ClientError::Disconnected)
    }

    fn send(&self, frame: &ClientFrame) -> Result<(), ClientError> {
        self.send_raw(serde_json::to_string(frame)?)
    }

    async fn typed<T: DeserializeOwned>(&self, method: Method, data: Value) -> Result<T, ClientError> {
        let data = self.request(method, data).await?;
        Ok(serde_json::from_value(data)?)
    }

    pub async fn get_capabilities(&self) -> Result<RtpCapabilities, ClientError> {
        let response: CapabilitiesResponse =
            self.typed(Method::GetCapabilities, json!({})).await?;
        Ok(response.rtp_capabilities)
    }

    pub async fn create_transport(&self, direction: Direction) -> Result<TransportParams, ClientError> {
        self.typed(Method::CreateTransport, json!({ "direction": direction }))
            .await
    }

    pub async fn connect_transport(
        &self,
        direction: Direction,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), ClientError> {
        let method = match direction {
            Direction::Send => Method::ConnectSendTransport,
            Direction::Receive => Method::ConnectReceiveTransport,
        };
        self.request(method, json!({ "dtlsParameters": dtls_parameters }))
            .await?;
        Ok(())
    }

    pub async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerId, ClientError> {
        let response: ProduceResponse = self
            .typed(
                Method::Produce,
                json!({ "kind": kind, "rtpParameters": rtp_parameters }),
            )
            .await?;
        Ok(response.producer_id)
    }

    pub async fn consume(
        &self,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumeResponse, ClientError> {
        self.typed(
            Method::Consume,
            json!({ "rtpCapabilities": rtp_capabilities }),
        )
        .await
    }

    /// Fire-and-forget, as browsers send it
    pub fn resume_consumer(&self) -> Result<(), ClientError> {
        self.notify(Method::ResumeConsumer, json!({}))
    }

    /// Next server notification; `None` once disconnected
    pub async fn next_notification(&mut self) -> Option<ServerNotification> {
        self.notifications.recv().await
    }

    /// Close the connection
    pub async fn close(mut self) {
        let _ = self.outbound.send(Message::Close(None));
        let _ = tokio::time::timeout(Duration::from_secs(1), &mut self.reader).await;
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}
