//! Signaling wire protocol
//!
//! JSON text frames over WebSocket. Clients send correlated requests and
//! one-way notifications:
//!
//! ```json
//! {"type": "request", "id": 7, "method": "create-transport", "data": {"direction": "send"}}
//! {"type": "notification", "method": "resume-consumer", "data": {}}
//! ```
//!
//! The server answers every request with exactly one response carrying the
//! same `id`, and pushes its own notifications:
//!
//! ```json
//! {"type": "response", "id": 7, "data": {"id": "..."}}
//! {"type": "notification", "method": "connection-success", "data": {"connectionId": "..."}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

use crate::engine::{
    Direction, DtlsParameters, MediaKind, RtpCapabilities, RtpParameters,
};
use crate::events::CloseReason;
use crate::ids::{ConsumerId, PeerId, ProducerId, TransportId};

/// Frame sent by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Request {
        id: u64,
        method: String,
        #[serde(default)]
        data: Value,
    },
    Notification {
        method: String,
        #[serde(default)]
        data: Value,
    },
}

/// Frame sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Response { id: u64, data: Value },
    Notification { method: String, data: Value },
}

impl ServerFrame {
    pub fn response(id: u64, data: Value) -> Self {
        Self::Response { id, data }
    }

    /// Request-level failure, `{"error": message}`
    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self::Response {
            id,
            data: error_payload(message),
        }
    }
}

pub fn error_payload(message: impl Into<String>) -> Value {
    json!({ "error": message.into() })
}

/// Frame decoding and request validation failures
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {reason}")]
    Malformed { id: Option<u64>, reason: String },

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("invalid {method} payload: {reason}")]
    InvalidPayload { method: Method, reason: String },
}

impl ProtocolError {
    /// Correlation id recovered from a malformed frame, if any
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ProtocolError::Malformed { id, .. } => *id,
            _ => None,
        }
    }
}

/// Decode a client text frame.
///
/// When the frame is malformed but still carries a numeric `id`, the id is
/// kept in the error so the request can be answered.
pub fn decode_client_frame(text: &str) -> Result<ClientFrame, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|e| ProtocolError::Malformed {
        id: None,
        reason: e.to_string(),
    })?;
    let id = value.get("id").and_then(Value::as_u64);
    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
        id,
        reason: e.to_string(),
    })
}

/// Client methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    GetCapabilities,
    CreateTransport,
    ConnectSendTransport,
    Produce,
    ConnectReceiveTransport,
    Consume,
    ResumeConsumer,
}

impl Method {
    pub const ALL: [Method; 7] = [
        Method::GetCapabilities,
        Method::CreateTransport,
        Method::ConnectSendTransport,
        Method::Produce,
        Method::ConnectReceiveTransport,
        Method::Consume,
        Method::ResumeConsumer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Method::GetCapabilities => "get-capabilities",
            Method::CreateTransport => "create-transport",
            Method::ConnectSendTransport => "connect-send-transport",
            Method::Produce => "produce",
            Method::ConnectReceiveTransport => "connect-receive-transport",
            Method::Consume => "consume",
            Method::ResumeConsumer => "resume-consumer",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownMethod(s.to_string()))
    }
}

/// `create-transport` payload.
///
/// `{"sender": true}` is accepted in place of `{"direction": "send"}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateTransportRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<bool>,
}

impl CreateTransportRequest {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction: Some(direction),
            sender: None,
        }
    }

    pub fn direction(&self) -> Option<Direction> {
        self.direction.or(self.sender.map(|sender| {
            if sender {
                Direction::Send
            } else {
                Direction::Receive
            }
        }))
    }
}

/// `connect-send-transport` / `connect-receive-transport` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub rtp_capabilities: RtpCapabilities,
}

/// A validated client request
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    GetCapabilities,
    CreateTransport(Direction),
    ConnectSendTransport(ConnectTransportRequest),
    Produce(ProduceRequest),
    ConnectReceiveTransport(ConnectTransportRequest),
    Consume(ConsumeRequest),
    ResumeConsumer,
}

impl Request {
    /// Validate `data` against the payload shape of `method`
    pub fn parse(method: &str, data: Value) -> Result<Self, ProtocolError> {
        let method: Method = method.parse()?;
        let request = match method {
            Method::GetCapabilities => Request::GetCapabilities,
            Method::CreateTransport => {
                let payload: CreateTransportRequest = payload(method, data)?;
                let direction = payload.direction().ok_or(ProtocolError::InvalidPayload {
                    method,
                    reason: "missing direction".to_string(),
                })?;
                Request::CreateTransport(direction)
            }
            Method::ConnectSendTransport => Request::ConnectSendTransport(payload(method, data)?),
            Method::Produce => Request::Produce(payload(method, data)?),
            Method::ConnectReceiveTransport => {
                Request::ConnectReceiveTransport(payload(method, data)?)
            }
            Method::Consume => Request::Consume(payload(method, data)?),
            Method::ResumeConsumer => Request::ResumeConsumer,
        };
        Ok(request)
    }

    pub fn method(&self) -> Method {
        match self {
            Request::GetCapabilities => Method::GetCapabilities,
            Request::CreateTransport(_) => Method::CreateTransport,
            Request::ConnectSendTransport(_) => Method::ConnectSendTransport,
            Request::Produce(_) => Method::Produce,
            Request::ConnectReceiveTransport(_) => Method::ConnectReceiveTransport,
            Request::Consume(_) => Method::Consume,
            Request::ResumeConsumer => Method::ResumeConsumer,
        }
    }
}

fn payload<T: serde::de::DeserializeOwned>(method: Method, data: Value) -> Result<T, ProtocolError> {
    // Missing data is treated as an empty object
    let data = if data.is_null() { json!({}) } else { data };
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload {
        method,
        reason: e.to_string(),
    })
}

/// `get-capabilities` response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitiesResponse {
    pub rtp_capabilities: RtpCapabilities,
}

/// `produce` response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceResponse {
    pub producer_id: ProducerId,
}

/// `consume` response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResponse {
    pub producer_id: ProducerId,
    pub consumer_id: ConsumerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Server-initiated notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "data", rename_all = "kebab-case")]
pub enum ServerNotification {
    #[serde(rename_all = "camelCase")]
    ConnectionSuccess { connection_id: PeerId },

    #[serde(rename_all = "camelCase")]
    TransportClosed {
        transport_id: TransportId,
        direction: Direction,
    },

    #[serde(rename_all = "camelCase")]
    ProducerClosed { producer_id: ProducerId },

    #[serde(rename_all = "camelCase")]
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
        reason: CloseReason,
    },
}

impl ServerNotification {
    pub fn method(&self) -> &'static str {
        match self {
            ServerNotification::ConnectionSuccess { .. } => "connection-success",
            ServerNotification::TransportClosed { .. } => "transport-closed",
            ServerNotification::ProducerClosed { .. } => "producer-closed",
            ServerNotification::ConsumerClosed { .. } => "consumer-closed",
        }
    }

    pub fn into_frame(self) -> ServerFrame {
        let method = self.method().to_string();
        let data = match serde_json::to_value(&self) {
            Ok(Value::Object(mut map)) => map.remove("data").unwrap_or(Value::Null),
            _ => Value::Null,
        };
        ServerFrame::Notification { method, data }
    }

    /// Rebuild a typed notification from a frame's method and data
    pub fn from_parts(method: &str, data: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(json!({ "method": method, "data": data }))
    }
}
