//! Server-side participants driven over HTTP instead of a WebSocket

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

use crate::engine::{
    dispatch, ConsumeDataOptions, ConsumeOptions, ConsumerEvent, PlainTransportOptions, ProduceDataOptions, ProduceOptions,
    ProducerEvent, Transport, TransportAppData, TransportKind, WebRtcTransportOptions,
};
use crate::error::{ProtocolError, SessionError, SessionResult};
use crate::media::MediaSet;
use crate::peer::PeerProfile;
use crate::protocol::{Notification, PeerInfo};
use crate::session::{transport_reply, Session};
use crate::types::{BroadcasterId, MediaKind};

pub struct Broadcaster {
    id: BroadcasterId,
    profile: PeerProfile,
    pub(crate) media: MediaSet,
}

impl Broadcaster {
    #[must_use]
    pub fn id(&self) -> &BroadcasterId {
        &self.id
    }

    #[must_use]
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id.to_string(),
            display_name: self.profile.display_name.clone(),
            device: self.profile.device.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BroadcasterDevice {
    pub name: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBroadcasterRequest {
    pub id: BroadcasterId,
    pub display_name: String,
    #[serde(default)]
    pub device: BroadcasterDevice,
    pub rtp_capabilities: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBroadcasterTransportRequest {
    #[serde(rename = "type")]
    pub kind: TransportKind,
    #[serde(default)]
    pub rtcp_mux: bool,
    #[serde(default = "default_comedia")]
    pub comedia: bool,
    pub sctp_capabilities: Option<Value>,
}

const fn default_comedia() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectBroadcasterTransportRequest {
    pub dtls_parameters: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBroadcasterProducerRequest {
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBroadcasterConsumerQuery {
    pub producer_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBroadcasterDataConsumerRequest {
    pub data_producer_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBroadcasterDataProducerRequest {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub protocol: String,
    pub sctp_stream_parameters: Option<Value>,
    #[serde(default)]
    pub app_data: Value,
}

impl Session {
    fn broadcaster(&self, broadcaster_id: &BroadcasterId) -> SessionResult<Arc<Broadcaster>> {
        self.broadcasters
            .read()
            .get(broadcaster_id)
            .cloned()
            .ok_or_else(|| SessionError::BroadcasterNotFound(broadcaster_id.to_string()))
    }

    fn broadcaster_transport(
        &self,
        broadcaster_id: &BroadcasterId,
        transport_id: &str,
    ) -> SessionResult<(Arc<Broadcaster>, Arc<dyn Transport>)> {
        let broadcaster = self.broadcaster(broadcaster_id)?;
        let transport = broadcaster
            .media
            .transport(transport_id)
            .ok_or_else(|| ProtocolError::TransportNotFound(transport_id.to_string()))?;
        Ok((broadcaster, transport))
    }

    fn ensure_open(&self) -> SessionResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(SessionError::RoomClosed(self.id().to_string()))
        }
    }

    /// Register a broadcaster and list the peers it could consume
    pub fn create_broadcaster(&self, req: CreateBroadcasterRequest) -> SessionResult<Value> {
        self.ensure_open()?;

        let broadcaster = Arc::new(Broadcaster {
            id: req.id.clone(),
            profile: PeerProfile {
                display_name: Some(req.display_name),
                device: json!({
                    "flag": "broadcaster",
                    "name": req.device.name.unwrap_or_else(|| "Unknown device".to_string()),
                    "version": req.device.version,
                }),
                rtp_capabilities: req.rtp_capabilities.clone(),
                sctp_capabilities: None,
            },
            media: MediaSet::default(),
        });

        {
            let mut broadcasters = self.broadcasters.write();
            if broadcasters.contains_key(&req.id) {
                return Err(SessionError::BroadcasterAlreadyExists(req.id.to_string()));
            }
            broadcasters.insert(req.id.clone(), broadcaster.clone());
        }

        self.broadcast(&Notification::NewPeer(broadcaster.info()), None);
        info!(room_id = %self.id(), broadcaster_id = %req.id, "Broadcaster created");

        let Some(rtp_capabilities) = req.rtp_capabilities else {
            return Ok(json!({ "peers": [] }));
        };

        let peers: Vec<Value> = self
            .joined_peers(None)
            .iter()
            .map(|peer| {
                let producers: Vec<Value> = peer
                    .media
                    .producers()
                    .iter()
                    .filter(|p| self.router.can_consume(p.id(), &rtp_capabilities))
                    .map(|p| json!({ "id": p.id(), "kind": p.kind() }))
                    .collect();
                let info = peer.info();
                json!({
                    "id": info.id,
                    "displayName": info.display_name,
                    "device": info.device,
                    "producers": producers,
                })
            })
            .collect();

        Ok(json!({ "peers": peers }))
    }

    pub fn delete_broadcaster(&self, broadcaster_id: &BroadcasterId) -> SessionResult<()> {
        let broadcaster = self
            .broadcasters
            .write()
            .remove(broadcaster_id)
            .ok_or_else(|| SessionError::BroadcasterNotFound(broadcaster_id.to_string()))?;

        broadcaster.media.close_all();
        self.broadcast(
            &Notification::PeerClosed {
                peer_id: broadcaster_id.to_string(),
            },
            None,
        );
        info!(room_id = %self.id(), broadcaster_id = %broadcaster_id, "Broadcaster deleted");
        Ok(())
    }

    pub async fn create_broadcaster_transport(
        &self,
        broadcaster_id: &BroadcasterId,
        req: CreateBroadcasterTransportRequest,
    ) -> SessionResult<Value> {
        self.ensure_open()?;
        let broadcaster = self.broadcaster(broadcaster_id)?;
        let config = self.config();

        let transport = match req.kind {
            TransportKind::WebRtc => self
                .router
                .create_webrtc_transport(WebRtcTransportOptions {
                    listen_ip: config.listen_ip.clone(),
                    announced_ip: config.announced_ip.clone(),
                    prefer_tcp: false,
                    initial_available_outgoing_bitrate: config.initial_available_outgoing_bitrate,
                    enable_sctp: req.sctp_capabilities.is_some(),
                    num_sctp_streams: req
                        .sctp_capabilities
                        .as_ref()
                        .and_then(|c| c.get("numStreams").cloned()),
                    app_data: TransportAppData::default(),
                })
                .await
                .map_err(SessionError::engine("Failed to create WebRTC transport"))?,
            TransportKind::Plain => self
                .router
                .create_plain_transport(PlainTransportOptions {
                    listen_ip: config.listen_ip.clone(),
                    announced_ip: config.announced_ip.clone(),
                    rtcp_mux: req.rtcp_mux,
                    comedia: req.comedia,
                    enable_sctp: req.sctp_capabilities.is_some(),
                })
                .await
                .map_err(SessionError::engine("Failed to create plain transport"))?,
        };

        if !broadcaster.media.add_transport(transport.clone(), None) {
            return Err(SessionError::BroadcasterNotFound(broadcaster_id.to_string()));
        }
        debug!(
            room_id = %self.id(),
            broadcaster_id = %broadcaster_id,
            transport_id = transport.id(),
            kind = ?req.kind,
            "Broadcaster transport created"
        );
        Ok(transport_reply(transport.as_ref(), None))
    }

    pub async fn connect_broadcaster_transport(
        &self,
        broadcaster_id: &BroadcasterId,
        transport_id: &str,
        req: ConnectBroadcasterTransportRequest,
    ) -> SessionResult<()> {
        let (_, transport) = self.broadcaster_transport(broadcaster_id, transport_id)?;
        if transport.kind() != TransportKind::WebRtc {
            return Err(SessionError::InvalidInput(format!(
                "transport \"{transport_id}\" is not a WebRTC transport"
            )));
        }
        transport
            .connect(req.dtls_parameters)
            .await
            .map_err(SessionError::engine(format!("Failed to connect transport \"{transport_id}\"")))
    }

    pub async fn create_broadcaster_producer(
        self: &Arc<Self>,
        broadcaster_id: &BroadcasterId,
        transport_id: &str,
        req: CreateBroadcasterProducerRequest,
    ) -> SessionResult<Value> {
        self.ensure_open()?;
        let (broadcaster, transport) = self.broadcaster_transport(broadcaster_id, transport_id)?;

        let producer = transport
            .produce(ProduceOptions {
                kind: req.kind,
                rtp_parameters: req.rtp_parameters,
                app_data: json!({ "peerId": broadcaster_id.as_str() }),
            })
            .await
            .map_err(SessionError::engine("Failed to produce"))?;

        let owner = Arc::downgrade(&broadcaster);
        let producer_id = producer.id().to_string();
        let events = dispatch(producer.subscribe(), move |event| match event {
            ProducerEvent::VideoOrientationChange(orientation) => {
                debug!(producer_id = %producer_id, orientation = %orientation, "Broadcaster video orientation changed");
            }
            ProducerEvent::TransportClosed => {
                if let Some(broadcaster) = owner.upgrade() {
                    broadcaster.media.remove_producer(&producer_id);
                }
            }
            ProducerEvent::Score(_) | ProducerEvent::Trace(_) => {}
        });
        let recipients = {
            let _gate = self.fanout_gate.lock();
            if !broadcaster.media.add_producer(producer.clone(), Some(events)) {
                return Err(SessionError::BroadcasterNotFound(broadcaster_id.to_string()));
            }
            self.joined_peers(None)
        };

        info!(
            room_id = %self.id(),
            broadcaster_id = %broadcaster_id,
            producer_id = producer.id(),
            kind = %producer.kind(),
            "Broadcaster producer created"
        );
        self.fan_out_producer(broadcaster_id.as_str(), recipients, &producer);

        Ok(json!({ "id": producer.id() }))
    }

    pub async fn create_broadcaster_consumer(
        &self,
        broadcaster_id: &BroadcasterId,
        transport_id: &str,
        query: CreateBroadcasterConsumerQuery,
    ) -> SessionResult<Value> {
        let (broadcaster, transport) = self.broadcaster_transport(broadcaster_id, transport_id)?;
        let rtp_capabilities = broadcaster
            .profile
            .rtp_capabilities
            .clone()
            .ok_or_else(|| SessionError::InvalidInput("broadcaster does not have rtpCapabilities".to_string()))?;

        let consumer = transport
            .consume(ConsumeOptions {
                producer_id: query.producer_id,
                rtp_capabilities,
                paused: false,
                enable_rtx: true,
            })
            .await
            .map_err(SessionError::engine("Failed to consume"))?;

        let owner = Arc::downgrade(&broadcaster);
        let consumer_id = consumer.id().to_string();
        let events = dispatch(consumer.subscribe(), move |event| {
            if matches!(event, ConsumerEvent::TransportClosed | ConsumerEvent::ProducerClosed) {
                if let Some(broadcaster) = owner.upgrade() {
                    broadcaster.media.remove_consumer(&consumer_id);
                }
            }
        });
        if !broadcaster.media.add_consumer(consumer.clone(), Some(events)) {
            return Err(SessionError::BroadcasterNotFound(broadcaster_id.to_string()));
        }

        Ok(json!({
            "id": consumer.id(),
            "producerId": consumer.producer_id(),
            "kind": consumer.kind(),
            "rtpParameters": consumer.rtp_parameters(),
            "type": consumer.consumer_type(),
        }))
    }

    pub async fn create_broadcaster_data_consumer(
        &self,
        broadcaster_id: &BroadcasterId,
        transport_id: &str,
        req: CreateBroadcasterDataConsumerRequest,
    ) -> SessionResult<Value> {
        let (broadcaster, transport) = self.broadcaster_transport(broadcaster_id, transport_id)?;

        let data_consumer = transport
            .consume_data(ConsumeDataOptions {
                data_producer_id: req.data_producer_id,
            })
            .await
            .map_err(SessionError::engine("Failed to consume data"))?;

        let owner = Arc::downgrade(&broadcaster);
        let data_consumer_id = data_consumer.id().to_string();
        let events = dispatch(data_consumer.subscribe(), move |_closed| {
            if let Some(broadcaster) = owner.upgrade() {
                broadcaster.media.remove_data_consumer(&data_consumer_id);
            }
        });
        if !broadcaster.media.add_data_consumer(data_consumer.clone(), Some(events)) {
            return Err(SessionError::BroadcasterNotFound(broadcaster_id.to_string()));
        }

        let stream_id = data_consumer
            .sctp_stream_parameters()
            .and_then(|p| p.get("streamId").cloned())
            .unwrap_or(Value::Null);
        Ok(json!({ "id": data_consumer.id(), "streamId": stream_id }))
    }

    pub async fn create_broadcaster_data_producer(
        &self,
        broadcaster_id: &BroadcasterId,
        transport_id: &str,
        req: CreateBroadcasterDataProducerRequest,
    ) -> SessionResult<Value> {
        self.ensure_open()?;
        let (broadcaster, transport) = self.broadcaster_transport(broadcaster_id, transport_id)?;

        let data_producer = transport
            .produce_data(ProduceDataOptions {
                sctp_stream_parameters: req.sctp_stream_parameters,
                label: req.label,
                protocol: req.protocol,
                app_data: req.app_data,
            })
            .await
            .map_err(SessionError::engine("Failed to produce data"))?;

        let owner = Arc::downgrade(&broadcaster);
        let data_producer_id = data_producer.id().to_string();
        let events = dispatch(data_producer.subscribe(), move |_transport_closed| {
            if let Some(broadcaster) = owner.upgrade() {
                broadcaster.media.remove_data_producer(&data_producer_id);
            }
        });
        if !broadcaster.media.add_data_producer(data_producer.clone(), Some(events)) {
            return Err(SessionError::BroadcasterNotFound(broadcaster_id.to_string()));
        }

        Ok(json!({ "id": data_producer.id() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Consumer;
    use crate::session::tests::{call, connect, join_with_transports, session};
    use std::time::Duration;

    fn create_request(id: &str, rtp_capabilities: Option<Value>) -> CreateBroadcasterRequest {
        serde_json::from_value(json!({
            "id": id,
            "displayName": "Stream",
            "device": { "name": "ffmpeg" },
            "rtpCapabilities": rtp_capabilities,
        }))
        .unwrap()
    }

    fn transport_request(kind: &str) -> CreateBroadcasterTransportRequest {
        serde_json::from_value(json!({ "type": kind })).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_delete_broadcaster() {
        let (session, _worker) = session(2, 0).await;
        let mut a = connect(&session, "a").unwrap();
        call(&session, &a.peer, "join", json!({ "displayName": "A" })).await.unwrap();

        let reply = session.create_broadcaster(create_request("bc", None)).unwrap();
        assert_eq!(reply, json!({ "peers": [] }));

        let announced = a.notification("newPeer").await;
        assert_eq!(announced["id"], "bc");
        assert_eq!(announced["device"]["flag"], "broadcaster");
        assert_eq!(announced["device"]["name"], "ffmpeg");

        assert!(matches!(
            session.create_broadcaster(create_request("bc", None)),
            Err(SessionError::BroadcasterAlreadyExists(_))
        ));

        session.delete_broadcaster(&BroadcasterId::from("bc")).unwrap();
        assert_eq!(a.notification("peerClosed").await["peerId"], "bc");
        assert!(matches!(
            session.delete_broadcaster(&BroadcasterId::from("bc")),
            Err(SessionError::BroadcasterNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_broadcaster_lists_consumable_producers() {
        let (session, _worker) = session(2, 0).await;
        let a = connect(&session, "a").unwrap();
        let send = join_with_transports(&session, &a.peer, "A").await;
        call(
            &session,
            &a.peer,
            "produce",
            json!({ "transportId": send, "kind": "video", "rtpParameters": {} }),
        )
        .await
        .unwrap();

        // Audio-only capabilities cannot consume the video producer
        let reply = session
            .create_broadcaster(create_request("bc", Some(json!({ "codecs": [{ "kind": "audio" }] }))))
            .unwrap();
        assert_eq!(reply["peers"][0]["id"], "a");
        assert_eq!(reply["peers"][0]["producers"], json!([]));

        let reply = session
            .create_broadcaster(create_request("bc2", Some(json!({ "codecs": [{ "kind": "video" }] }))))
            .unwrap();
        assert_eq!(reply["peers"][0]["producers"][0]["kind"], "video");
    }

    #[tokio::test]
    async fn test_broadcaster_producer_reaches_peers() {
        let (session, _worker) = session(2, 0).await;
        let mut a = connect(&session, "a").unwrap();
        join_with_transports(&session, &a.peer, "A").await;

        let bc = BroadcasterId::from("bc");
        session.create_broadcaster(create_request("bc", None)).unwrap();
        let transport = session
            .create_broadcaster_transport(&bc, transport_request("plain"))
            .await
            .unwrap();
        assert!(transport["port"].is_u64());
        assert!(transport["rtcpPort"].is_u64());
        let transport_id = transport["id"].as_str().unwrap().to_string();

        let err = session
            .connect_broadcaster_transport(
                &bc,
                &transport_id,
                ConnectBroadcasterTransportRequest {
                    dtls_parameters: json!({}),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidInput(_)));

        let produced = session
            .create_broadcaster_producer(
                &bc,
                &transport_id,
                CreateBroadcasterProducerRequest {
                    kind: MediaKind::Video,
                    rtp_parameters: json!({}),
                },
            )
            .await
            .unwrap();

        let offer = a.accept("newConsumer").await;
        assert_eq!(offer["peerId"], "bc");
        assert_eq!(offer["producerId"], produced["id"]);
        assert_eq!(session.producer_owner(produced["id"].as_str().unwrap()).as_deref(), Some("bc"));
    }

    #[tokio::test]
    async fn test_late_joiner_consumes_broadcaster() {
        let (session, _worker) = session(2, 0).await;
        let bc = BroadcasterId::from("bc");
        session.create_broadcaster(create_request("bc", None)).unwrap();
        let transport = session
            .create_broadcaster_transport(&bc, transport_request("plain"))
            .await
            .unwrap();
        session
            .create_broadcaster_producer(
                &bc,
                transport["id"].as_str().unwrap(),
                CreateBroadcasterProducerRequest {
                    kind: MediaKind::Audio,
                    rtp_parameters: json!({}),
                },
            )
            .await
            .unwrap();

        let mut a = connect(&session, "a").unwrap();
        call(&session, &a.peer, "createWebRtcTransport", json!({ "consuming": true }))
            .await
            .unwrap();
        let reply = call(
            &session,
            &a.peer,
            "join",
            json!({ "rtpCapabilities": crate::session::tests::caps() }),
        )
        .await
        .unwrap();
        assert_eq!(reply["peers"][0]["id"], "bc");

        let offer = a.accept("newConsumer").await;
        assert_eq!(offer["peerId"], "bc");
        assert_eq!(offer["kind"], "audio");
    }

    #[tokio::test]
    async fn test_broadcaster_consumes_peer_media() {
        let (session, _worker) = session(2, 0).await;
        let a = connect(&session, "a").unwrap();
        let send = join_with_transports(&session, &a.peer, "A").await;
        let produced = call(
            &session,
            &a.peer,
            "produce",
            json!({ "transportId": send, "kind": "audio", "rtpParameters": {} }),
        )
        .await
        .unwrap();
        let chat = call(
            &session,
            &a.peer,
            "produceData",
            json!({ "transportId": send, "sctpStreamParameters": { "streamId": 3 }, "label": "chat" }),
        )
        .await
        .unwrap();

        let bc = BroadcasterId::from("bc");
        session
            .create_broadcaster(create_request("bc", Some(crate::session::tests::caps())))
            .unwrap();
        let transport: CreateBroadcasterTransportRequest =
            serde_json::from_value(json!({ "type": "webrtc", "sctpCapabilities": { "numStreams": { "OS": 1024, "MIS": 1024 } } }))
                .unwrap();
        let transport = session.create_broadcaster_transport(&bc, transport).await.unwrap();
        let transport_id = transport["id"].as_str().unwrap().to_string();
        assert!(transport["sctpParameters"].is_object());

        let consumer = session
            .create_broadcaster_consumer(
                &bc,
                &transport_id,
                CreateBroadcasterConsumerQuery {
                    producer_id: produced["id"].as_str().unwrap().to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(consumer["producerId"], produced["id"]);
        assert_eq!(consumer["type"], "simple");

        let data_consumer = session
            .create_broadcaster_data_consumer(
                &bc,
                &transport_id,
                CreateBroadcasterDataConsumerRequest {
                    data_producer_id: chat["id"].as_str().unwrap().to_string(),
                },
            )
            .await
            .unwrap();
        assert!(data_consumer["streamId"].is_u64());

        let broadcaster = session.broadcaster(&bc).unwrap();
        let consumer = broadcaster.media.consumers().pop().unwrap();
        assert!(!consumer.paused());
    }

    #[tokio::test]
    async fn test_broadcaster_data_producer_is_not_fanned_out() {
        let (session, _worker) = session(2, 0).await;
        let mut a = connect(&session, "a").unwrap();
        join_with_transports(&session, &a.peer, "A").await;

        let bc = BroadcasterId::from("bc");
        session.create_broadcaster(create_request("bc", None)).unwrap();
        let transport: CreateBroadcasterTransportRequest =
            serde_json::from_value(json!({ "type": "webrtc", "sctpCapabilities": {} })).unwrap();
        let transport = session.create_broadcaster_transport(&bc, transport).await.unwrap();

        let produced = session
            .create_broadcaster_data_producer(
                &bc,
                transport["id"].as_str().unwrap(),
                serde_json::from_value(json!({ "label": "chat", "sctpStreamParameters": { "streamId": 1 } })).unwrap(),
            )
            .await
            .unwrap();
        assert!(produced["id"].is_string());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!a.drain().iter().any(|m| matches!(m, crate::protocol::Message::Request(_))));
    }

    #[tokio::test]
    async fn test_unknown_broadcaster_or_transport() {
        let (session, _worker) = session(2, 0).await;
        let bc = BroadcasterId::from("bc");
        let err = session
            .create_broadcaster_transport(&bc, transport_request("webrtc"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::BroadcasterNotFound(_)));

        session.create_broadcaster(create_request("bc", None)).unwrap();
        let err = session
            .create_broadcaster_consumer(
                &bc,
                "missing",
                CreateBroadcasterConsumerQuery {
                    producer_id: "p".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Protocol(ProtocolError::TransportNotFound(_))));
    }
}
