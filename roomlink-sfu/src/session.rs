//! A room: one routing context plus its peers and broadcasters
//!
//! Lifecycle is `open -> closing -> closed`, one way. Peer, broadcaster and
//! state maps sit behind short synchronous locks that are never held across
//! an await point. Engine events arrive through per-object dispatcher tasks
//! that hold only weak references back into the session.

use parking_lot::{Mutex, RwLock};
use roomlink_core::{NotificationSink, PeerEvent, PeerEventKind};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcaster::Broadcaster;
use crate::channel::PeerChannel;
use crate::config::SfuConfig;
use crate::engine::{
    dispatch, AudioLevelObserverOptions, DataProducer, EngineError, MediaWorker, ProduceDataOptions,
    ProduceOptions, Producer, ProducerEvent, Router, SpeakerEvent, SpeakerObserver, Subscription, TraceDirection,
    Transport, TransportAppData, TransportEvent, TransportInfo, WebRtcTransportOptions,
};
use crate::error::{AdmissionError, ProtocolError};
use crate::fanout::Offers;
use crate::peer::{Peer, PeerProfile};
use crate::protocol::{
    CreateWebRtcTransportRequest, JoinRequest, Notification, PeerInfo, ProduceDataRequest, ProduceRequest, Request,
};
use crate::throttle::{NetworkThrottle, ThrottleParams};
use crate::types::{BroadcasterId, PeerId, RoomId};

/// Data producers with this label are fanned out to every peer
pub const CHAT_LABEL: &str = "chat";
/// Data producers with this label are not offered to late joiners
pub const BOT_LABEL: &str = "bot";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub max_peer_count: u32,
    pub consumer_replicas: u32,
    pub event_notification_uri: Option<String>,
}

/// Process-wide collaborators every session shares
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<SfuConfig>,
    pub notifier: NotificationSink,
    pub throttle: Arc<NetworkThrottle>,
}

/// Work that must only start after the reply went out
///
/// Fan-out recipients and catch-up offers are decided when the request is
/// handled, under the session's fan-out gate.
pub(crate) enum FollowUp {
    Join(Offers),
    Produced {
        producer: Arc<dyn Producer>,
        recipients: Vec<Arc<Peer>>,
    },
    ProducedData {
        data_producer: Arc<dyn DataProducer>,
        recipients: Vec<Arc<Peer>>,
    },
    LimitIncomingBitrate(Arc<dyn Transport>),
    Leave,
}

pub(crate) struct Outcome {
    pub(crate) response: Value,
    pub(crate) follow_up: Option<FollowUp>,
}

impl Outcome {
    fn reply(response: Value) -> Self {
        Self {
            response,
            follow_up: None,
        }
    }

    fn empty() -> Self {
        Self::reply(json!({}))
    }

    fn then(response: Value, follow_up: FollowUp) -> Self {
        Self {
            response,
            follow_up: Some(follow_up),
        }
    }
}

pub struct Session {
    id: RoomId,
    options: SessionOptions,
    context: SessionContext,
    pub(crate) router: Arc<dyn Router>,
    pub(crate) audio_level_observer: Arc<dyn SpeakerObserver>,
    pub(crate) active_speaker_observer: Arc<dyn SpeakerObserver>,
    observer_events: Mutex<Vec<Subscription>>,
    state: Mutex<SessionState>,
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    pub(crate) broadcasters: RwLock<HashMap<BroadcasterId, Arc<Broadcaster>>>,
    /// Held while a peer joins or a producer is registered, so each
    /// (producer, peer) pair is offered by exactly one of the two
    pub(crate) fanout_gate: Mutex<()>,
    closed: CancellationToken,
}

impl Session {
    /// Create the routing context and speaker observers on `worker`
    pub async fn create(
        id: RoomId,
        options: SessionOptions,
        worker: &dyn MediaWorker,
        context: SessionContext,
    ) -> Result<Arc<Self>, EngineError> {
        let router = worker.create_router(&context.config.router_codecs).await?;

        let observers = async {
            let levels = router
                .create_audio_level_observer(AudioLevelObserverOptions {
                    max_entries: 1,
                    threshold: -80,
                    interval_ms: 800,
                })
                .await?;
            let speakers = router.create_active_speaker_observer().await?;
            Ok::<_, EngineError>((levels, speakers))
        };
        let (audio_level_observer, active_speaker_observer) = match observers.await {
            Ok(observers) => observers,
            Err(e) => {
                router.close();
                return Err(e);
            }
        };

        let session = Arc::new(Self {
            id,
            options,
            context,
            router,
            audio_level_observer,
            active_speaker_observer,
            observer_events: Mutex::new(Vec::new()),
            state: Mutex::new(SessionState::Open),
            peers: RwLock::new(HashMap::new()),
            broadcasters: RwLock::new(HashMap::new()),
            fanout_gate: Mutex::new(()),
            closed: CancellationToken::new(),
        });
        session.watch_observers();

        info!(
            room_id = %session.id,
            worker_id = worker.id(),
            max_peer_count = session.options.max_peer_count,
            consumer_replicas = session.options.consumer_replicas,
            "Session created"
        );
        Ok(session)
    }

    #[must_use]
    pub fn id(&self) -> &RoomId {
        &self.id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    #[must_use]
    pub fn max_peer_count(&self) -> u32 {
        self.options.max_peer_count
    }

    #[must_use]
    pub fn consumer_replicas(&self) -> u32 {
        self.options.consumer_replicas
    }

    #[must_use]
    pub fn rtp_capabilities(&self) -> Value {
        self.router.rtp_capabilities()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    #[must_use]
    pub fn peer(&self, peer_id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.read().get(peer_id).cloned()
    }

    /// Cancelled once the session reaches `closed`
    #[must_use]
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub(crate) fn config(&self) -> &SfuConfig {
        &self.context.config
    }

    /// Joined peers, optionally without `exclude`
    pub(crate) fn joined_peers(&self, exclude: Option<&Arc<Peer>>) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .values()
            .filter(|p| p.is_joined() && !exclude.is_some_and(|e| Arc::ptr_eq(e, p)))
            .cloned()
            .collect()
    }

    pub(crate) fn broadcast(&self, notification: &Notification, exclude: Option<&Arc<Peer>>) {
        for peer in self.joined_peers(exclude) {
            peer.notify(notification);
        }
    }

    /// Id of the peer or broadcaster owning `producer_id`
    pub(crate) fn producer_owner(&self, producer_id: &str) -> Option<String> {
        if let Some(peer) = self
            .peers
            .read()
            .values()
            .find(|p| p.media.producer(producer_id).is_some())
        {
            return Some(peer.id().to_string());
        }
        self.broadcasters
            .read()
            .values()
            .find(|b| b.media.producer(producer_id).is_some())
            .map(|b| b.id().to_string())
    }

    /// Admit a freshly connected channel as a peer
    ///
    /// A peer reconnecting with a known id takes over the slot; the stale
    /// instance is then torn down without closing the session.
    pub fn admit(self: &Arc<Self>, peer_id: PeerId, channel: PeerChannel) -> Result<Arc<Peer>, AdmissionError> {
        let peer = Arc::new(Peer::new(peer_id.clone(), channel));

        let stale = {
            let state = self.state.lock();
            if *state != SessionState::Open {
                return Err(AdmissionError::RoomClosed(self.id.to_string()));
            }

            let mut peers = self.peers.write();
            let others = peers.len() - usize::from(peers.contains_key(&peer_id));
            if others >= self.options.max_peer_count as usize {
                return Err(AdmissionError::RoomFull {
                    room_id: self.id.to_string(),
                    max_peers: self.options.max_peer_count,
                });
            }
            peers.insert(peer_id.clone(), peer.clone())
        };

        if let Some(stale) = stale {
            info!(room_id = %self.id, peer_id = %peer_id, "Replacing stale peer connection");
            self.close_peer(&stale);
        }

        info!(room_id = %self.id, peer_id = %peer_id, "Peer admitted");
        self.send_peer_event(&peer_id, PeerEventKind::PeerJoined);
        Ok(peer)
    }

    fn send_peer_event(&self, peer_id: &PeerId, event: PeerEventKind) {
        if let Some(uri) = &self.options.event_notification_uri {
            self.context.notifier.notify_peer_event(
                uri,
                PeerEvent {
                    room_id: self.id.to_string(),
                    peer_id: peer_id.to_string(),
                    event,
                },
            );
        }
    }

    /// Tear down a peer whose channel closed; idempotent
    pub fn close_peer(self: &Arc<Self>, peer: &Arc<Peer>) {
        if !peer.mark_closed() {
            return;
        }
        peer.channel().close();

        // A closing session tears everything down itself
        if !self.is_open() {
            return;
        }

        let (registered, remaining) = {
            let mut peers = self.peers.write();
            let registered = peers.get(peer.id()).is_some_and(|p| Arc::ptr_eq(p, peer));
            if registered {
                peers.remove(peer.id());
            }
            (registered, peers.len())
        };

        info!(
            room_id = %self.id,
            peer_id = %peer.id(),
            replaced = !registered,
            "Peer closed"
        );

        if registered {
            self.send_peer_event(peer.id(), PeerEventKind::PeerLeft);
        }
        if peer.is_joined() {
            self.broadcast(
                &Notification::PeerClosed {
                    peer_id: peer.id().to_string(),
                },
                Some(peer),
            );
        }
        peer.media.close_all();

        if registered && remaining == 0 {
            info!(room_id = %self.id, "Last peer left, closing session");
            self.close();
        }
    }

    /// Close the session and release everything it owns
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Open {
                return;
            }
            *state = SessionState::Closing;
        }
        info!(room_id = %self.id, "Closing session");

        let peers: Vec<_> = self.peers.write().drain().map(|(_, p)| p).collect();
        for peer in peers {
            peer.mark_closed();
            peer.channel().close();
            peer.media.close_all();
        }

        let broadcasters: Vec<_> = self.broadcasters.write().drain().map(|(_, b)| b).collect();
        for broadcaster in broadcasters {
            broadcaster.media.close_all();
        }

        self.observer_events.lock().clear();
        self.audio_level_observer.close();
        self.active_speaker_observer.close();
        self.router.close();

        self.context.throttle.release(&self.id);

        if let Some(balancer_url) = &self.context.config.balancer_url {
            self.context
                .notifier
                .notify_room_closed(balancer_url, &self.context.config.server_id, self.id.as_str());
        }

        *self.state.lock() = SessionState::Closed;
        self.closed.cancel();
        info!(room_id = %self.id, "Session closed");
    }

    fn watch_observers(self: &Arc<Self>) {
        let session = Arc::downgrade(self);
        let levels = dispatch(self.audio_level_observer.subscribe(), move |event| {
            if let Some(session) = session.upgrade() {
                session.on_audio_levels(event);
            }
        });

        let session = Arc::downgrade(self);
        let dominant = dispatch(self.active_speaker_observer.subscribe(), move |event| {
            if let (SpeakerEvent::DominantSpeaker { producer_id }, Some(session)) = (event, session.upgrade()) {
                debug!(
                    room_id = %session.id,
                    producer_id = %producer_id,
                    peer_id = ?session.producer_owner(&producer_id),
                    "Dominant speaker changed"
                );
            }
        });

        self.observer_events.lock().extend([levels, dominant]);
    }

    fn on_audio_levels(&self, event: SpeakerEvent) {
        let notification = match event {
            SpeakerEvent::Volumes(volumes) => {
                let Some(loudest) = volumes.first() else {
                    return;
                };
                Notification::ActiveSpeaker {
                    peer_id: self.producer_owner(&loudest.producer_id),
                    volume: Some(loudest.volume),
                }
            }
            SpeakerEvent::Silence => Notification::ActiveSpeaker {
                peer_id: None,
                volume: None,
            },
            SpeakerEvent::DominantSpeaker { .. } => return,
        };
        self.broadcast(&notification, None);
    }

    pub(crate) async fn handle_request(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        request: Request,
    ) -> Result<Outcome, ProtocolError> {
        match request {
            Request::GetRouterRtpCapabilities(_) => Ok(Outcome::reply(self.router.rtp_capabilities())),

            Request::Join(join) => self.join(peer, join),

            Request::CreateWebRtcTransport(req) => self.create_webrtc_transport(peer, req).await,

            Request::ConnectWebRtcTransport(req) => {
                let transport = transport_of(peer, &req.transport_id)?;
                transport
                    .connect(req.dtls_parameters)
                    .await
                    .map_err(ProtocolError::engine(format!(
                        "Failed to connect transport \"{}\"",
                        req.transport_id
                    )))?;
                Ok(Outcome::empty())
            }

            Request::RestartIce(req) => {
                let transport = transport_of(peer, &req.transport_id)?;
                let ice_parameters = transport.restart_ice().await.map_err(ProtocolError::engine(format!(
                    "Failed to restart ICE on transport \"{}\"",
                    req.transport_id
                )))?;
                Ok(Outcome::reply(ice_parameters))
            }

            Request::Produce(req) => self.produce(peer, req).await,

            Request::CloseProducer(req) => {
                ensure_joined(peer)?;
                let producer = peer
                    .media
                    .remove_producer(&req.producer_id)
                    .ok_or_else(|| ProtocolError::ProducerNotFound(req.producer_id.clone()))?;
                producer.close();
                Ok(Outcome::empty())
            }

            Request::PauseProducer(req) => {
                ensure_joined(peer)?;
                let producer = producer_of(peer, &req.producer_id)?;
                producer.pause().await.map_err(ProtocolError::engine(format!(
                    "Failed to pause producer \"{}\"",
                    req.producer_id
                )))?;
                Ok(Outcome::empty())
            }

            Request::ResumeProducer(req) => {
                ensure_joined(peer)?;
                let producer = producer_of(peer, &req.producer_id)?;
                producer.resume().await.map_err(ProtocolError::engine(format!(
                    "Failed to resume producer \"{}\"",
                    req.producer_id
                )))?;
                Ok(Outcome::empty())
            }

            Request::PauseConsumer(req) => {
                ensure_joined(peer)?;
                let consumer = consumer_of(peer, &req.consumer_id)?;
                consumer.pause().await.map_err(ProtocolError::engine(format!(
                    "Failed to pause consumer \"{}\"",
                    req.consumer_id
                )))?;
                Ok(Outcome::empty())
            }

            Request::ResumeConsumer(req) => {
                ensure_joined(peer)?;
                let consumer = consumer_of(peer, &req.consumer_id)?;
                consumer.resume().await.map_err(ProtocolError::engine(format!(
                    "Failed to resume consumer \"{}\"",
                    req.consumer_id
                )))?;
                Ok(Outcome::empty())
            }

            Request::SetConsumerPreferredLayers(req) => {
                ensure_joined(peer)?;
                let consumer = consumer_of(peer, &req.consumer_id)?;
                consumer
                    .set_preferred_layers(req.spatial_layer, req.temporal_layer)
                    .await
                    .map_err(ProtocolError::engine(format!(
                        "Failed to set preferred layers of consumer \"{}\"",
                        req.consumer_id
                    )))?;
                Ok(Outcome::empty())
            }

            Request::SetConsumerPriority(req) => {
                ensure_joined(peer)?;
                let consumer = consumer_of(peer, &req.consumer_id)?;
                consumer
                    .set_priority(req.priority)
                    .await
                    .map_err(ProtocolError::engine(format!(
                        "Failed to set priority of consumer \"{}\"",
                        req.consumer_id
                    )))?;
                Ok(Outcome::empty())
            }

            Request::RequestConsumerKeyFrame(req) => {
                ensure_joined(peer)?;
                let consumer = consumer_of(peer, &req.consumer_id)?;
                consumer.request_key_frame().await.map_err(ProtocolError::engine(format!(
                    "Failed to request key frame for consumer \"{}\"",
                    req.consumer_id
                )))?;
                Ok(Outcome::empty())
            }

            Request::ProduceData(req) => self.produce_data(peer, req).await,

            Request::ChangeDisplayName(req) => {
                ensure_joined(peer)?;
                let old_display_name = peer.set_display_name(req.display_name.clone());
                self.broadcast(
                    &Notification::PeerDisplayNameChanged {
                        peer_id: peer.id().to_string(),
                        display_name: req.display_name,
                        old_display_name,
                    },
                    Some(peer),
                );
                Ok(Outcome::empty())
            }

            Request::GetTransportStats(req) => {
                let transport = transport_of(peer, &req.transport_id)?;
                let stats = transport
                    .get_stats()
                    .await
                    .map_err(ProtocolError::engine("Failed to read transport stats"))?;
                Ok(Outcome::reply(stats))
            }

            Request::GetProducerStats(req) => {
                let producer = producer_of(peer, &req.producer_id)?;
                let stats = producer
                    .get_stats()
                    .await
                    .map_err(ProtocolError::engine("Failed to read producer stats"))?;
                Ok(Outcome::reply(stats))
            }

            Request::GetConsumerStats(req) => {
                let consumer = consumer_of(peer, &req.consumer_id)?;
                let stats = consumer
                    .get_stats()
                    .await
                    .map_err(ProtocolError::engine("Failed to read consumer stats"))?;
                Ok(Outcome::reply(stats))
            }

            Request::GetDataProducerStats(req) => {
                let data_producer = peer
                    .media
                    .data_producer(&req.data_producer_id)
                    .ok_or_else(|| ProtocolError::DataProducerNotFound(req.data_producer_id.clone()))?;
                let stats = data_producer
                    .get_stats()
                    .await
                    .map_err(ProtocolError::engine("Failed to read data producer stats"))?;
                Ok(Outcome::reply(stats))
            }

            Request::GetDataConsumerStats(req) => {
                let data_consumer = peer
                    .media
                    .data_consumer(&req.data_consumer_id)
                    .ok_or_else(|| ProtocolError::DataConsumerNotFound(req.data_consumer_id.clone()))?;
                let stats = data_consumer
                    .get_stats()
                    .await
                    .map_err(ProtocolError::engine("Failed to read data consumer stats"))?;
                Ok(Outcome::reply(stats))
            }

            Request::ApplyNetworkThrottle(req) => {
                let params = ThrottleParams::with_defaults(req.uplink, req.downlink, req.rtt, req.packet_loss);
                self.context
                    .throttle
                    .apply(&self.id, req.secret.as_deref(), params)
                    .await?;
                Ok(Outcome::empty())
            }

            Request::ResetNetworkThrottle(req) => {
                self.context.throttle.reset(req.secret.as_deref()).await?;
                Ok(Outcome::empty())
            }

            Request::LeaveRoom(_) => {
                ensure_joined(peer)?;
                self.broadcast(
                    &Notification::PeerLeft {
                        peer_id: peer.id().to_string(),
                    },
                    Some(peer),
                );
                Ok(Outcome::then(json!({}), FollowUp::Leave))
            }
        }
    }

    /// Run what a request deferred until after its reply
    pub(crate) fn follow_up(self: &Arc<Self>, peer: &Arc<Peer>, follow_up: FollowUp) {
        match follow_up {
            FollowUp::Join(offers) => self.catch_up(peer, offers),
            FollowUp::Produced { producer, recipients } => {
                self.fan_out_producer(peer.id().as_str(), recipients, &producer);
            }
            FollowUp::ProducedData {
                data_producer,
                recipients,
            } => {
                self.fan_out_data_producer(Some(peer.id().as_str()), recipients, &data_producer);
            }
            FollowUp::LimitIncomingBitrate(transport) => {
                let bitrate = self.context.config.max_incoming_bitrate;
                if bitrate == 0 {
                    return;
                }
                tokio::spawn(async move {
                    if let Err(e) = transport.set_max_incoming_bitrate(bitrate).await {
                        warn!(transport_id = transport.id(), error = %e, "Failed to set max incoming bitrate");
                    }
                });
            }
            FollowUp::Leave => self.close_peer(peer),
        }
    }

    fn join(self: &Arc<Self>, peer: &Arc<Peer>, join: JoinRequest) -> Result<Outcome, ProtocolError> {
        let profile = PeerProfile {
            display_name: join.display_name,
            device: join.device,
            rtp_capabilities: join.rtp_capabilities,
            sctp_capabilities: join.sctp_capabilities,
        };

        let (peers, offers) = {
            let _gate = self.fanout_gate.lock();
            if !peer.join(profile) {
                return Err(ProtocolError::AlreadyJoined);
            }
            let others = self.joined_peers(Some(peer));
            let broadcasters: Vec<_> = self.broadcasters.read().values().cloned().collect();

            let peers: Vec<PeerInfo> = others
                .iter()
                .map(|p| p.info())
                .chain(broadcasters.iter().map(|b| b.info()))
                .collect();
            (peers, Offers::collect(&others, &broadcasters))
        };

        info!(room_id = %self.id, peer_id = %peer.id(), existing = peers.len(), "Peer joined");
        Ok(Outcome::then(json!({ "peers": peers }), FollowUp::Join(offers)))
    }

    async fn create_webrtc_transport(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        req: CreateWebRtcTransportRequest,
    ) -> Result<Outcome, ProtocolError> {
        let config = &self.context.config;
        let options = WebRtcTransportOptions {
            listen_ip: config.listen_ip.clone(),
            announced_ip: config.announced_ip.clone(),
            prefer_tcp: req.force_tcp,
            initial_available_outgoing_bitrate: config.initial_available_outgoing_bitrate,
            enable_sctp: req.sctp_capabilities.is_some(),
            num_sctp_streams: req
                .sctp_capabilities
                .as_ref()
                .and_then(|c| c.get("numStreams").cloned()),
            app_data: TransportAppData {
                producing: req.producing,
                consuming: req.consuming,
            },
        };

        let transport = self
            .router
            .create_webrtc_transport(options)
            .await
            .map_err(ProtocolError::engine("Failed to create WebRTC transport"))?;

        if let Err(e) = transport.enable_trace_event(vec!["bwe".to_string()]).await {
            debug!(transport_id = transport.id(), error = %e, "Bandwidth trace unavailable");
        }

        let events = watch_transport(peer, &transport);
        if !peer.media.add_transport(transport.clone(), Some(events)) {
            return Err(ProtocolError::PeerClosed);
        }

        debug!(
            room_id = %self.id,
            peer_id = %peer.id(),
            transport_id = transport.id(),
            producing = req.producing,
            consuming = req.consuming,
            "WebRTC transport created"
        );

        let response = transport_reply(transport.as_ref(), Some(config.ice_servers.as_slice()));
        Ok(Outcome::then(response, FollowUp::LimitIncomingBitrate(transport)))
    }

    async fn produce(self: &Arc<Self>, peer: &Arc<Peer>, req: ProduceRequest) -> Result<Outcome, ProtocolError> {
        ensure_joined(peer)?;
        let transport = transport_of(peer, &req.transport_id)?;

        let mut app_data = match req.app_data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        app_data.insert("peerId".to_string(), Value::String(peer.id().to_string()));

        let producer = transport
            .produce(ProduceOptions {
                kind: req.kind,
                rtp_parameters: req.rtp_parameters,
                app_data: Value::Object(app_data),
            })
            .await
            .map_err(ProtocolError::engine("Failed to produce"))?;

        let events = watch_producer(peer, &producer);
        let recipients = {
            let _gate = self.fanout_gate.lock();
            if !peer.media.add_producer(producer.clone(), Some(events)) {
                return Err(ProtocolError::PeerClosed);
            }
            self.joined_peers(Some(peer))
        };

        info!(
            room_id = %self.id,
            peer_id = %peer.id(),
            producer_id = producer.id(),
            kind = %producer.kind(),
            "Producer created"
        );
        Ok(Outcome::then(
            json!({ "id": producer.id() }),
            FollowUp::Produced { producer, recipients },
        ))
    }

    async fn produce_data(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        req: ProduceDataRequest,
    ) -> Result<Outcome, ProtocolError> {
        ensure_joined(peer)?;
        let transport = transport_of(peer, &req.transport_id)?;

        let data_producer = transport
            .produce_data(ProduceDataOptions {
                sctp_stream_parameters: req.sctp_stream_parameters,
                label: req.label,
                protocol: req.protocol,
                app_data: req.app_data,
            })
            .await
            .map_err(ProtocolError::engine("Failed to produce data"))?;

        let owner = Arc::downgrade(peer);
        let data_producer_id = data_producer.id().to_string();
        let events = dispatch(data_producer.subscribe(), move |_transport_closed| {
            if let Some(peer) = owner.upgrade() {
                peer.media.remove_data_producer(&data_producer_id);
            }
        });
        let recipients = {
            let _gate = self.fanout_gate.lock();
            if !peer.media.add_data_producer(data_producer.clone(), Some(events)) {
                return Err(ProtocolError::PeerClosed);
            }
            self.joined_peers(Some(peer))
        };

        debug!(
            room_id = %self.id,
            peer_id = %peer.id(),
            data_producer_id = data_producer.id(),
            label = data_producer.label(),
            "Data producer created"
        );
        Ok(Outcome::then(
            json!({ "id": data_producer.id() }),
            FollowUp::ProducedData {
                data_producer,
                recipients,
            },
        ))
    }
}

/// Reply body describing how to connect to a transport
pub(crate) fn transport_reply(transport: &dyn Transport, ice_servers: Option<&[Value]>) -> Value {
    match transport.info() {
        TransportInfo::WebRtc {
            ice_parameters,
            ice_candidates,
            dtls_parameters,
            sctp_parameters,
        } => {
            let mut reply = json!({
                "id": transport.id(),
                "iceParameters": ice_parameters,
                "iceCandidates": ice_candidates,
                "dtlsParameters": dtls_parameters,
                "sctpParameters": sctp_parameters,
            });
            if let Some(servers) = ice_servers {
                reply["iceServers"] = Value::Array(servers.to_vec());
            }
            reply
        }
        TransportInfo::Plain { ip, port, rtcp_port } => json!({
            "id": transport.id(),
            "ip": ip,
            "port": port,
            "rtcpPort": rtcp_port,
        }),
    }
}

fn ensure_joined(peer: &Peer) -> Result<(), ProtocolError> {
    if peer.is_joined() {
        Ok(())
    } else {
        Err(ProtocolError::NotJoined)
    }
}

fn transport_of(peer: &Peer, transport_id: &str) -> Result<Arc<dyn Transport>, ProtocolError> {
    peer.media
        .transport(transport_id)
        .ok_or_else(|| ProtocolError::TransportNotFound(transport_id.to_string()))
}

fn producer_of(peer: &Peer, producer_id: &str) -> Result<Arc<dyn Producer>, ProtocolError> {
    peer.media
        .producer(producer_id)
        .ok_or_else(|| ProtocolError::ProducerNotFound(producer_id.to_string()))
}

fn consumer_of(peer: &Peer, consumer_id: &str) -> Result<Arc<dyn crate::engine::Consumer>, ProtocolError> {
    peer.media
        .consumer(consumer_id)
        .ok_or_else(|| ProtocolError::ConsumerNotFound(consumer_id.to_string()))
}

fn watch_transport(peer: &Arc<Peer>, transport: &Arc<dyn Transport>) -> Subscription {
    let peer = Arc::downgrade(peer);
    let transport_id = transport.id().to_string();

    dispatch(transport.subscribe(), move |event| match event {
        TransportEvent::Trace(trace) if trace.kind == "bwe" && trace.direction == TraceDirection::Out => {
            if let Some(peer) = peer.upgrade() {
                peer.notify(&Notification::DownlinkBwe {
                    desired_bitrate: trace.info["desiredBitrate"].clone(),
                    effective_desired_bitrate: trace.info["effectiveDesiredBitrate"].clone(),
                    available_bitrate: trace.info["availableBitrate"].clone(),
                });
            }
        }
        TransportEvent::Trace(trace) => {
            debug!(transport_id = %transport_id, trace = %trace.kind, "Transport trace event");
        }
        TransportEvent::DtlsStateChange(state) if state == "failed" || state == "closed" => {
            warn!(transport_id = %transport_id, dtls_state = %state, "Transport DTLS state changed");
        }
        TransportEvent::DtlsStateChange(_) => {}
        TransportEvent::SctpStateChange(state) => {
            debug!(transport_id = %transport_id, sctp_state = %state, "Transport SCTP state changed");
        }
    })
}

fn watch_producer(peer: &Arc<Peer>, producer: &Arc<dyn Producer>) -> Subscription {
    let owner = Arc::downgrade(peer);
    let producer_id = producer.id().to_string();

    dispatch(producer.subscribe(), move |event| match event {
        ProducerEvent::Score(score) => {
            if let Some(peer) = owner.upgrade() {
                peer.notify(&Notification::ProducerScore {
                    producer_id: producer_id.clone(),
                    score,
                });
            }
        }
        ProducerEvent::VideoOrientationChange(orientation) => {
            debug!(producer_id = %producer_id, orientation = %orientation, "Producer video orientation changed");
        }
        ProducerEvent::Trace(trace) => {
            debug!(producer_id = %producer_id, trace = %trace.kind, "Producer trace event");
        }
        ProducerEvent::TransportClosed => {
            if let Some(peer) = owner.upgrade() {
                peer.media.remove_producer(&producer_id);
            }
        }
    })
}
