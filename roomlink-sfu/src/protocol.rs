//! Signaling wire format
//!
//! Every WebSocket text frame is one JSON message: a request
//! (`{"request": true, "id", "method", "data"}`), a response
//! (`{"response": true, "id", "ok", "data" | "errorCode", "errorReason"}`)
//! or a notification (`{"notification": true, "method", "data"}`).
//!
//! Client requests decode into the closed [`Request`] sum type, one variant
//! per method with a typed payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::types::MediaKind;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(default)]
    request: bool,
    #[serde(default)]
    response: bool,
    #[serde(default)]
    notification: bool,
    id: Option<u32>,
    method: Option<String>,
    #[serde(default)]
    data: Value,
    ok: Option<bool>,
    error_code: Option<u16>,
    error_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RequestFrame {
    pub id: u32,
    pub method: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub code: u16,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ResponseFrame {
    pub id: u32,
    pub result: Result<Value, RemoteError>,
}

#[derive(Debug, Clone)]
pub struct NotificationFrame {
    pub method: String,
    pub data: Value,
}

#[derive(Debug, Clone)]
pub enum Message {
    Request(RequestFrame),
    Response(ResponseFrame),
    Notification(NotificationFrame),
}

impl Message {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawMessage = serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        if raw.request {
            let id = raw.id.ok_or_else(|| ProtocolError::Malformed("request without id".to_string()))?;
            let method = raw
                .method
                .ok_or_else(|| ProtocolError::Malformed("request without method".to_string()))?;
            return Ok(Self::Request(RequestFrame {
                id,
                method,
                data: raw.data,
            }));
        }

        if raw.response {
            let id = raw.id.ok_or_else(|| ProtocolError::Malformed("response without id".to_string()))?;
            let result = if raw.ok.unwrap_or(false) {
                Ok(raw.data)
            } else {
                Err(RemoteError {
                    code: raw.error_code.unwrap_or(500),
                    reason: raw.error_reason.unwrap_or_default(),
                })
            };
            return Ok(Self::Response(ResponseFrame { id, result }));
        }

        if raw.notification {
            let method = raw
                .method
                .ok_or_else(|| ProtocolError::Malformed("notification without method".to_string()))?;
            return Ok(Self::Notification(NotificationFrame {
                method,
                data: raw.data,
            }));
        }

        Err(ProtocolError::Malformed(
            "message is neither request, response nor notification".to_string(),
        ))
    }
}

#[derive(Serialize)]
struct OutgoingRequest<'a, T: Serialize> {
    request: bool,
    id: u32,
    #[serde(flatten)]
    body: &'a T,
}

#[derive(Serialize)]
struct OutgoingNotification<'a> {
    notification: bool,
    #[serde(flatten)]
    body: &'a Notification,
}

#[derive(Serialize)]
struct OutgoingSuccess<'a> {
    response: bool,
    id: u32,
    ok: bool,
    data: &'a Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingError<'a> {
    response: bool,
    id: u32,
    ok: bool,
    error_code: u16,
    error_reason: &'a str,
}

pub fn encode_request(id: u32, request: &ServerRequest) -> Result<String, serde_json::Error> {
    serde_json::to_string(&OutgoingRequest {
        request: true,
        id,
        body: request,
    })
}

pub fn encode_notification(notification: &Notification) -> Result<String, serde_json::Error> {
    serde_json::to_string(&OutgoingNotification {
        notification: true,
        body: notification,
    })
}

pub fn encode_success(id: u32, data: &Value) -> Result<String, serde_json::Error> {
    serde_json::to_string(&OutgoingSuccess {
        response: true,
        id,
        ok: true,
        data,
    })
}

pub fn encode_error(id: u32, code: u16, reason: &str) -> Result<String, serde_json::Error> {
    serde_json::to_string(&OutgoingError {
        response: true,
        id,
        ok: false,
        error_code: code,
        error_reason: reason,
    })
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub display_name: Option<String>,
    #[serde(default)]
    pub device: Value,
    pub rtp_capabilities: Option<Value>,
    pub sctp_capabilities: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWebRtcTransportRequest {
    #[serde(default)]
    pub force_tcp: bool,
    #[serde(default)]
    pub producing: bool,
    #[serde(default)]
    pub consuming: bool,
    pub sctp_capabilities: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectWebRtcTransportRequest {
    pub transport_id: String,
    pub dtls_parameters: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportRef {
    pub transport_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    #[serde(default)]
    pub app_data: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerRef {
    pub producer_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRef {
    pub consumer_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetConsumerPreferredLayersRequest {
    pub consumer_id: String,
    pub spatial_layer: u8,
    pub temporal_layer: Option<u8>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetConsumerPriorityRequest {
    pub consumer_id: String,
    pub priority: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceDataRequest {
    pub transport_id: String,
    pub sctp_stream_parameters: Option<Value>,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub app_data: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeDisplayNameRequest {
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataProducerRef {
    pub data_producer_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataConsumerRef {
    pub data_consumer_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyNetworkThrottleRequest {
    pub secret: Option<String>,
    pub uplink: Option<u64>,
    pub downlink: Option<u64>,
    pub rtt: Option<u64>,
    pub packet_loss: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResetNetworkThrottleRequest {
    pub secret: Option<String>,
}

/// Client-to-server request methods
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "method", content = "data", rename_all = "camelCase")]
pub enum Request {
    GetRouterRtpCapabilities(Empty),
    Join(JoinRequest),
    CreateWebRtcTransport(CreateWebRtcTransportRequest),
    ConnectWebRtcTransport(ConnectWebRtcTransportRequest),
    RestartIce(TransportRef),
    Produce(ProduceRequest),
    CloseProducer(ProducerRef),
    PauseProducer(ProducerRef),
    ResumeProducer(ProducerRef),
    PauseConsumer(ConsumerRef),
    ResumeConsumer(ConsumerRef),
    SetConsumerPreferredLayers(SetConsumerPreferredLayersRequest),
    SetConsumerPriority(SetConsumerPriorityRequest),
    RequestConsumerKeyFrame(ConsumerRef),
    ProduceData(ProduceDataRequest),
    ChangeDisplayName(ChangeDisplayNameRequest),
    GetTransportStats(TransportRef),
    GetProducerStats(ProducerRef),
    GetConsumerStats(ConsumerRef),
    GetDataProducerStats(DataProducerRef),
    GetDataConsumerStats(DataConsumerRef),
    ApplyNetworkThrottle(ApplyNetworkThrottleRequest),
    ResetNetworkThrottle(ResetNetworkThrottleRequest),
    LeaveRoom(Empty),
}

impl Request {
    pub const METHODS: &'static [&'static str] = &[
        "getRouterRtpCapabilities",
        "join",
        "createWebRtcTransport",
        "connectWebRtcTransport",
        "restartIce",
        "produce",
        "closeProducer",
        "pauseProducer",
        "resumeProducer",
        "pauseConsumer",
        "resumeConsumer",
        "setConsumerPreferredLayers",
        "setConsumerPriority",
        "requestConsumerKeyFrame",
        "produceData",
        "changeDisplayName",
        "getTransportStats",
        "getProducerStats",
        "getConsumerStats",
        "getDataProducerStats",
        "getDataConsumerStats",
        "applyNetworkThrottle",
        "resetNetworkThrottle",
        "leaveRoom",
    ];

    /// Decode a request frame into its typed method
    ///
    /// Missing or null `data` is treated as an empty object.
    pub fn from_frame(frame: &RequestFrame) -> Result<Self, ProtocolError> {
        if !Self::METHODS.contains(&frame.method.as_str()) {
            return Err(ProtocolError::UnknownMethod(frame.method.clone()));
        }

        let data = if frame.data.is_null() {
            Value::Object(Map::new())
        } else {
            frame.data.clone()
        };

        let mut envelope = Map::new();
        envelope.insert("method".to_string(), Value::String(frame.method.clone()));
        envelope.insert("data".to_string(), data);

        serde_json::from_value(Value::Object(envelope))
            .map_err(|e| ProtocolError::InvalidRequest(format!("{}: {e}", frame.method)))
    }
}

/// Public view of a participant, as listed to other peers
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: String,
    pub display_name: Option<String>,
    pub device: Value,
}

/// Server-to-client notifications
#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "method",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Notification {
    NewPeer(PeerInfo),
    PeerClosed {
        peer_id: String,
    },
    PeerLeft {
        peer_id: String,
    },
    PeerDisplayNameChanged {
        peer_id: String,
        display_name: String,
        old_display_name: Option<String>,
    },
    DownlinkBwe {
        desired_bitrate: Value,
        effective_desired_bitrate: Value,
        available_bitrate: Value,
    },
    ProducerScore {
        producer_id: String,
        score: Value,
    },
    ConsumerClosed {
        consumer_id: String,
    },
    ConsumerPaused {
        consumer_id: String,
    },
    ConsumerResumed {
        consumer_id: String,
    },
    ConsumerScore {
        consumer_id: String,
        score: Value,
    },
    ConsumerLayersChanged {
        consumer_id: String,
        spatial_layer: Option<u8>,
        temporal_layer: Option<u8>,
    },
    DataConsumerClosed {
        data_consumer_id: String,
    },
    ActiveSpeaker {
        peer_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        volume: Option<i8>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConsumer {
    pub peer_id: String,
    pub producer_id: String,
    pub id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    #[serde(rename = "type")]
    pub consumer_type: String,
    pub app_data: Value,
    pub producer_paused: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDataConsumer {
    /// Absent when the data producer belongs to the server itself
    pub peer_id: Option<String>,
    pub data_producer_id: String,
    pub id: String,
    pub sctp_stream_parameters: Option<Value>,
    pub label: String,
    pub protocol: String,
    pub app_data: Value,
}

/// Server-to-client requests; both expect an acknowledgement
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "method", content = "data", rename_all = "camelCase")]
pub enum ServerRequest {
    NewConsumer(NewConsumer),
    NewDataConsumer(NewDataConsumer),
}
