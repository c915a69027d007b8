//! In-process engine without media I/O
//!
//! Keeps the object graph a real engine maintains (routers, transports,
//! producers, consumers, data channels, speaker observers) together with its
//! close cascades, and lets callers inject engine events. The server binary
//! runs on it when no external engine is wired in; tests drive it directly.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    AudioLevelObserverOptions, ConsumeDataOptions, ConsumeOptions, Consumer, ConsumerEvent, ConsumerLayers,
    DataConsumer, DataConsumerEvent, DataProducer, DataProducerEvent, EngineError, EngineResult, MediaWorker,
    PlainTransportOptions, ProduceDataOptions, ProduceOptions, Producer, ProducerEvent, Router, SpeakerEvent,
    SpeakerObserver, Transport, TransportAppData, TransportEvent, TransportInfo, TransportKind,
    WebRtcTransportOptions,
};
use crate::types::MediaKind;

const EVENT_CAPACITY: usize = 64;
const PORT_RANGE_START: u32 = 40_000;
const PORT_RANGE_SIZE: u32 = 10_000;

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn ice_parameters() -> Value {
    let token = Uuid::new_v4().simple().to_string();
    json!({
        "usernameFragment": &token[..16],
        "password": Uuid::new_v4().simple().to_string(),
        "iceLite": true,
    })
}

/// Whether a capabilities object lists at least one codec of `kind`
fn supports_kind(rtp_capabilities: &Value, kind: MediaKind) -> bool {
    rtp_capabilities
        .get("codecs")
        .and_then(Value::as_array)
        .is_some_and(|codecs| {
            codecs
                .iter()
                .any(|codec| codec.get("kind").and_then(Value::as_str) == Some(kind.as_str()))
        })
}

#[derive(Default)]
struct Registry {
    producers: HashMap<String, Arc<LoopbackProducer>>,
    data_producers: HashMap<String, Arc<LoopbackDataProducer>>,
}

type SharedRegistry = Arc<Mutex<Registry>>;

pub struct LoopbackWorker {
    id: String,
    ports: Arc<AtomicU32>,
    routers: Mutex<Vec<Arc<LoopbackRouter>>>,
    died: CancellationToken,
    death_reason: Mutex<Option<String>>,
}

impl LoopbackWorker {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            ports: Arc::new(AtomicU32::new(0)),
            routers: Mutex::new(Vec::new()),
            died: CancellationToken::new(),
            death_reason: Mutex::new(None),
        })
    }

    /// Simulate a worker crash
    pub fn kill(&self, reason: &str) {
        *self.death_reason.lock() = Some(reason.to_string());
        self.died.cancel();
        for router in std::mem::take(&mut *self.routers.lock()) {
            router.close();
        }
    }

    /// Routers that are still open
    #[must_use]
    pub fn routers(&self) -> Vec<Arc<LoopbackRouter>> {
        self.routers.lock().iter().filter(|r| !r.is_closed()).cloned().collect()
    }
}

#[async_trait]
impl MediaWorker for LoopbackWorker {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_router(&self, media_codecs: &[Value]) -> EngineResult<Arc<dyn Router>> {
        if self.died.is_cancelled() {
            return Err(EngineError::Worker(format!("worker {} has died", self.id)));
        }

        let router = Arc::new(LoopbackRouter {
            id: new_id(),
            rtp_capabilities: json!({ "codecs": media_codecs, "headerExtensions": [] }),
            ports: self.ports.clone(),
            registry: SharedRegistry::default(),
            transports: Mutex::new(Vec::new()),
            observers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let mut routers = self.routers.lock();
        routers.retain(|r| !r.is_closed());
        routers.push(router.clone());
        Ok(router)
    }

    async fn died(&self) -> String {
        self.died.cancelled().await;
        self.death_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "unknown".to_string())
    }
}

pub struct LoopbackRouter {
    id: String,
    rtp_capabilities: Value,
    ports: Arc<AtomicU32>,
    registry: SharedRegistry,
    transports: Mutex<Vec<Arc<LoopbackTransport>>>,
    observers: Mutex<Vec<Arc<LoopbackObserver>>>,
    closed: AtomicBool,
}

impl LoopbackRouter {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn transports(&self) -> Vec<Arc<LoopbackTransport>> {
        self.transports.lock().iter().filter(|t| !t.is_closed()).cloned().collect()
    }

    #[must_use]
    pub fn observers(&self) -> Vec<Arc<LoopbackObserver>> {
        self.observers.lock().clone()
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.is_closed() {
            return Err(EngineError::Closed("Router"));
        }
        Ok(())
    }

    fn allocate_ports(&self, count: u32) -> u16 {
        let offset = self.ports.fetch_add(count, Ordering::Relaxed) % PORT_RANGE_SIZE;
        u16::try_from(PORT_RANGE_START + offset).unwrap_or(u16::MAX)
    }

    fn add_observer(&self) -> EngineResult<Arc<dyn SpeakerObserver>> {
        self.ensure_open()?;
        let observer = Arc::new(LoopbackObserver {
            id: new_id(),
            producers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            events: broadcast::channel(EVENT_CAPACITY).0,
        });
        self.observers.lock().push(observer.clone());
        Ok(observer)
    }
}

#[async_trait]
impl Router for LoopbackRouter {
    fn id(&self) -> &str {
        &self.id
    }

    fn rtp_capabilities(&self) -> Value {
        self.rtp_capabilities.clone()
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        self.registry
            .lock()
            .producers
            .get(producer_id)
            .is_some_and(|producer| supports_kind(rtp_capabilities, producer.kind))
    }

    async fn create_webrtc_transport(&self, options: WebRtcTransportOptions) -> EngineResult<Arc<dyn Transport>> {
        self.ensure_open()?;

        let ip = options.announced_ip.clone().unwrap_or_else(|| options.listen_ip.clone());
        let port = self.allocate_ports(1);
        let max_streams = options
            .num_sctp_streams
            .as_ref()
            .and_then(|s| s.get("MIS"))
            .and_then(Value::as_u64)
            .unwrap_or(1024);

        let info = TransportInfo::WebRtc {
            ice_parameters: ice_parameters(),
            ice_candidates: json!([{
                "foundation": "hostcandidate",
                "ip": ip,
                "port": port,
                "priority": 1_076_302_079_u32,
                "protocol": if options.prefer_tcp { "tcp" } else { "udp" },
                "type": "host",
            }]),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{
                    "algorithm": "sha-256",
                    "value": Uuid::new_v4().simple().to_string(),
                }],
            }),
            sctp_parameters: options.enable_sctp.then(|| {
                json!({ "port": 5000, "OS": 1024, "MIS": max_streams, "maxMessageSize": 262_144 })
            }),
        };

        let transport = LoopbackTransport::new(
            TransportKind::WebRtc,
            options.app_data,
            info,
            options.enable_sctp,
            self.registry.clone(),
        );
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }

    async fn create_plain_transport(&self, options: PlainTransportOptions) -> EngineResult<Arc<dyn Transport>> {
        self.ensure_open()?;

        let ip = options.announced_ip.clone().unwrap_or_else(|| options.listen_ip.clone());
        let port = self.allocate_ports(2);
        let info = TransportInfo::Plain {
            ip,
            port,
            rtcp_port: (!options.rtcp_mux).then(|| port.saturating_add(1)),
        };

        let transport = LoopbackTransport::new(
            TransportKind::Plain,
            TransportAppData::default(),
            info,
            options.enable_sctp,
            self.registry.clone(),
        );
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }

    async fn create_audio_level_observer(
        &self,
        _options: AudioLevelObserverOptions,
    ) -> EngineResult<Arc<dyn SpeakerObserver>> {
        self.add_observer()
    }

    async fn create_active_speaker_observer(&self) -> EngineResult<Arc<dyn SpeakerObserver>> {
        self.add_observer()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for transport in std::mem::take(&mut *self.transports.lock()) {
            transport.close();
        }
        for observer in std::mem::take(&mut *self.observers.lock()) {
            observer.close();
        }
    }
}

pub struct LoopbackTransport {
    id: String,
    kind: TransportKind,
    app_data: TransportAppData,
    info: Mutex<TransportInfo>,
    sctp_enabled: bool,
    registry: SharedRegistry,
    connected: AtomicBool,
    closed: AtomicBool,
    max_incoming_bitrate: AtomicU32,
    next_stream_id: AtomicU16,
    producers: Mutex<Vec<Arc<LoopbackProducer>>>,
    consumers: Mutex<Vec<Arc<LoopbackConsumer>>>,
    data_producers: Mutex<Vec<Arc<LoopbackDataProducer>>>,
    data_consumers: Mutex<Vec<Arc<LoopbackDataConsumer>>>,
    events: broadcast::Sender<TransportEvent>,
}

impl LoopbackTransport {
    fn new(
        kind: TransportKind,
        app_data: TransportAppData,
        info: TransportInfo,
        sctp_enabled: bool,
        registry: SharedRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: new_id(),
            kind,
            app_data,
            info: Mutex::new(info),
            sctp_enabled,
            registry,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            max_incoming_bitrate: AtomicU32::new(0),
            next_stream_id: AtomicU16::new(0),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            data_producers: Mutex::new(Vec::new()),
            data_consumers: Mutex::new(Vec::new()),
            events: broadcast::channel(EVENT_CAPACITY).0,
        })
    }

    /// Inject an engine event
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn max_incoming_bitrate(&self) -> u32 {
        self.max_incoming_bitrate.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn consumers(&self) -> Vec<Arc<LoopbackConsumer>> {
        self.consumers.lock().iter().filter(|c| !c.is_closed()).cloned().collect()
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.is_closed() {
            return Err(EngineError::Closed("Transport"));
        }
        Ok(())
    }

    fn ensure_sctp(&self) -> EngineResult<()> {
        if !self.sctp_enabled {
            return Err(EngineError::InvalidState("SCTP not enabled on this transport".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn app_data(&self) -> TransportAppData {
        self.app_data
    }

    fn info(&self) -> TransportInfo {
        self.info.lock().clone()
    }

    async fn connect(&self, dtls_parameters: Value) -> EngineResult<()> {
        self.ensure_open()?;
        if dtls_parameters.get("fingerprints").and_then(Value::as_array).is_none() {
            return Err(EngineError::InvalidParameters("missing dtlsParameters.fingerprints".to_string()));
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(EngineError::InvalidState("connect() already called".to_string()));
        }
        self.emit(TransportEvent::DtlsStateChange("connected".to_string()));
        Ok(())
    }

    async fn restart_ice(&self) -> EngineResult<Value> {
        self.ensure_open()?;
        let fresh = ice_parameters();
        if let TransportInfo::WebRtc { ice_parameters, .. } = &mut *self.info.lock() {
            *ice_parameters = fresh.clone();
        } else {
            return Err(EngineError::InvalidState("not a WebRTC transport".to_string()));
        }
        Ok(fresh)
    }

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> EngineResult<()> {
        self.ensure_open()?;
        self.max_incoming_bitrate.store(bitrate, Ordering::SeqCst);
        Ok(())
    }

    async fn enable_trace_event(&self, _types: Vec<String>) -> EngineResult<()> {
        self.ensure_open()
    }

    async fn produce(&self, options: ProduceOptions) -> EngineResult<Arc<dyn Producer>> {
        self.ensure_open()?;
        if !options.rtp_parameters.is_object() {
            return Err(EngineError::InvalidParameters("rtpParameters must be an object".to_string()));
        }

        let producer = Arc::new(LoopbackProducer {
            id: new_id(),
            kind: options.kind,
            rtp_parameters: options.rtp_parameters,
            app_data: options.app_data,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            registry: Arc::downgrade(&self.registry),
            consumers: Mutex::new(Vec::new()),
            events: broadcast::channel(EVENT_CAPACITY).0,
        });

        self.registry
            .lock()
            .producers
            .insert(producer.id.clone(), producer.clone());
        self.producers.lock().push(producer.clone());
        Ok(producer)
    }

    async fn consume(&self, options: ConsumeOptions) -> EngineResult<Arc<dyn Consumer>> {
        self.ensure_open()?;

        let producer = self
            .registry
            .lock()
            .producers
            .get(&options.producer_id)
            .cloned()
            .ok_or_else(|| EngineError::ProducerNotFound(options.producer_id.clone()))?;
        if !supports_kind(&options.rtp_capabilities, producer.kind) {
            return Err(EngineError::CannotConsume(options.producer_id));
        }

        let simulcast = producer
            .rtp_parameters
            .get("encodings")
            .and_then(Value::as_array)
            .is_some_and(|encodings| encodings.len() > 1);

        let consumer = Arc::new(LoopbackConsumer {
            id: new_id(),
            producer_id: producer.id.clone(),
            kind: producer.kind,
            rtp_parameters: producer.rtp_parameters.clone(),
            consumer_type: if simulcast { "simulcast" } else { "simple" }.to_string(),
            paused: AtomicBool::new(options.paused),
            producer_paused: AtomicBool::new(producer.paused.load(Ordering::SeqCst)),
            closed: AtomicBool::new(false),
            preferred_layers: Mutex::new(None),
            priority: AtomicU8::new(1),
            events: broadcast::channel(EVENT_CAPACITY).0,
        });

        producer.consumers.lock().push(Arc::downgrade(&consumer));
        self.consumers.lock().push(consumer.clone());
        Ok(consumer)
    }

    async fn produce_data(&self, options: ProduceDataOptions) -> EngineResult<Arc<dyn DataProducer>> {
        self.ensure_open()?;
        self.ensure_sctp()?;

        let data_producer = Arc::new(LoopbackDataProducer {
            id: new_id(),
            label: options.label,
            protocol: options.protocol,
            sctp_stream_parameters: options.sctp_stream_parameters,
            app_data: options.app_data,
            closed: AtomicBool::new(false),
            registry: Arc::downgrade(&self.registry),
            consumers: Mutex::new(Vec::new()),
            events: broadcast::channel(EVENT_CAPACITY).0,
        });

        self.registry
            .lock()
            .data_producers
            .insert(data_producer.id.clone(), data_producer.clone());
        self.data_producers.lock().push(data_producer.clone());
        Ok(data_producer)
    }

    async fn consume_data(&self, options: ConsumeDataOptions) -> EngineResult<Arc<dyn DataConsumer>> {
        self.ensure_open()?;
        self.ensure_sctp()?;

        let data_producer = self
            .registry
            .lock()
            .data_producers
            .get(&options.data_producer_id)
            .cloned()
            .ok_or_else(|| EngineError::DataProducerNotFound(options.data_producer_id.clone()))?;

        let stream_id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let data_consumer = Arc::new(LoopbackDataConsumer {
            id: new_id(),
            data_producer_id: data_producer.id.clone(),
            label: data_producer.label.clone(),
            protocol: data_producer.protocol.clone(),
            sctp_stream_parameters: json!({ "streamId": stream_id, "ordered": true }),
            closed: AtomicBool::new(false),
            events: broadcast::channel(EVENT_CAPACITY).0,
        });

        data_producer.consumers.lock().push(Arc::downgrade(&data_consumer));
        self.data_consumers.lock().push(data_consumer.clone());
        Ok(data_consumer)
    }

    async fn get_stats(&self) -> EngineResult<Value> {
        self.ensure_open()?;
        Ok(json!([{
            "type": match self.kind {
                TransportKind::WebRtc => "webrtc-transport",
                TransportKind::Plain => "plain-rtp-transport",
            },
            "transportId": self.id,
            "maxIncomingBitrate": self.max_incoming_bitrate(),
        }]))
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for producer in std::mem::take(&mut *self.producers.lock()) {
            producer.shutdown(Some(ProducerEvent::TransportClosed));
        }
        for consumer in std::mem::take(&mut *self.consumers.lock()) {
            consumer.close_with(ConsumerEvent::TransportClosed);
        }
        for data_producer in std::mem::take(&mut *self.data_producers.lock()) {
            data_producer.shutdown(Some(DataProducerEvent::TransportClosed));
        }
        for data_consumer in std::mem::take(&mut *self.data_consumers.lock()) {
            data_consumer.close_with(DataConsumerEvent::TransportClosed);
        }
    }
}

pub struct LoopbackProducer {
    id: String,
    kind: MediaKind,
    rtp_parameters: Value,
    app_data: Value,
    paused: AtomicBool,
    closed: AtomicBool,
    registry: Weak<Mutex<Registry>>,
    consumers: Mutex<Vec<Weak<LoopbackConsumer>>>,
    events: broadcast::Sender<ProducerEvent>,
}

impl LoopbackProducer {
    pub fn emit(&self, event: ProducerEvent) {
        let _ = self.events.send(event);
    }

    fn live_consumers(&self) -> Vec<Arc<LoopbackConsumer>> {
        self.consumers.lock().iter().filter_map(Weak::upgrade).collect()
    }

    /// Close once; consumers of this producer learn about it
    fn shutdown(&self, reason: Option<ProducerEvent>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().producers.remove(&self.id);
        }
        for consumer in std::mem::take(&mut *self.consumers.lock()) {
            if let Some(consumer) = consumer.upgrade() {
                consumer.close_with(ConsumerEvent::ProducerClosed);
            }
        }
        if let Some(event) = reason {
            self.emit(event);
        }
    }
}

#[async_trait]
impl Producer for LoopbackProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn app_data(&self) -> Value {
        self.app_data.clone()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn pause(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed("Producer"));
        }
        if !self.paused.swap(true, Ordering::SeqCst) {
            for consumer in self.live_consumers() {
                consumer.producer_paused.store(true, Ordering::SeqCst);
                consumer.emit(ConsumerEvent::ProducerPaused);
            }
        }
        Ok(())
    }

    async fn resume(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed("Producer"));
        }
        if self.paused.swap(false, Ordering::SeqCst) {
            for consumer in self.live_consumers() {
                consumer.producer_paused.store(false, Ordering::SeqCst);
                consumer.emit(ConsumerEvent::ProducerResumed);
            }
        }
        Ok(())
    }

    async fn get_stats(&self) -> EngineResult<Value> {
        Ok(json!([{ "type": "inbound-rtp", "kind": self.kind, "producerId": self.id }]))
    }

    fn subscribe(&self) -> broadcast::Receiver<ProducerEvent> {
        self.events.subscribe()
    }

    fn close(&self) {
        self.shutdown(None);
    }
}

pub struct LoopbackConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: Value,
    consumer_type: String,
    paused: AtomicBool,
    producer_paused: AtomicBool,
    closed: AtomicBool,
    preferred_layers: Mutex<Option<ConsumerLayers>>,
    priority: AtomicU8,
    events: broadcast::Sender<ConsumerEvent>,
}

impl LoopbackConsumer {
    pub fn emit(&self, event: ConsumerEvent) {
        let _ = self.events.send(event);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn preferred_layers(&self) -> Option<ConsumerLayers> {
        *self.preferred_layers.lock()
    }

    #[must_use]
    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::SeqCst)
    }

    fn close_with(&self, event: ConsumerEvent) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.emit(event);
        }
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.is_closed() {
            return Err(EngineError::Closed("Consumer"));
        }
        Ok(())
    }
}

#[async_trait]
impl Consumer for LoopbackConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> Value {
        self.rtp_parameters.clone()
    }

    fn consumer_type(&self) -> String {
        self.consumer_type.clone()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn producer_paused(&self) -> bool {
        self.producer_paused.load(Ordering::SeqCst)
    }

    fn score(&self) -> Value {
        json!({ "score": 10, "producerScore": 10, "producerScores": [10] })
    }

    async fn pause(&self) -> EngineResult<()> {
        self.ensure_open()?;
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> EngineResult<()> {
        self.ensure_open()?;
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn set_preferred_layers(&self, spatial_layer: u8, temporal_layer: Option<u8>) -> EngineResult<()> {
        self.ensure_open()?;
        *self.preferred_layers.lock() = Some(ConsumerLayers {
            spatial_layer,
            temporal_layer,
        });
        Ok(())
    }

    async fn set_priority(&self, priority: u8) -> EngineResult<()> {
        self.ensure_open()?;
        if priority == 0 {
            return Err(EngineError::InvalidParameters("priority must be at least 1".to_string()));
        }
        self.priority.store(priority, Ordering::SeqCst);
        Ok(())
    }

    async fn request_key_frame(&self) -> EngineResult<()> {
        self.ensure_open()
    }

    async fn get_stats(&self) -> EngineResult<Value> {
        self.ensure_open()?;
        Ok(json!([{ "type": "outbound-rtp", "kind": self.kind, "consumerId": self.id }]))
    }

    fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.events.subscribe()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct LoopbackDataProducer {
    id: String,
    label: String,
    protocol: String,
    sctp_stream_parameters: Option<Value>,
    app_data: Value,
    closed: AtomicBool,
    registry: Weak<Mutex<Registry>>,
    consumers: Mutex<Vec<Weak<LoopbackDataConsumer>>>,
    events: broadcast::Sender<DataProducerEvent>,
}

impl LoopbackDataProducer {
    fn shutdown(&self, reason: Option<DataProducerEvent>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().data_producers.remove(&self.id);
        }
        for consumer in std::mem::take(&mut *self.consumers.lock()) {
            if let Some(consumer) = consumer.upgrade() {
                consumer.close_with(DataConsumerEvent::DataProducerClosed);
            }
        }
        if let Some(event) = reason {
            let _ = self.events.send(event);
        }
    }
}

#[async_trait]
impl DataProducer for LoopbackDataProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn sctp_stream_parameters(&self) -> Option<Value> {
        self.sctp_stream_parameters.clone()
    }

    fn app_data(&self) -> Value {
        self.app_data.clone()
    }

    async fn get_stats(&self) -> EngineResult<Value> {
        Ok(json!([{ "type": "data-producer", "dataProducerId": self.id, "label": self.label }]))
    }

    fn subscribe(&self) -> broadcast::Receiver<DataProducerEvent> {
        self.events.subscribe()
    }

    fn close(&self) {
        self.shutdown(None);
    }
}

pub struct LoopbackDataConsumer {
    id: String,
    data_producer_id: String,
    label: String,
    protocol: String,
    sctp_stream_parameters: Value,
    closed: AtomicBool,
    events: broadcast::Sender<DataConsumerEvent>,
}

impl LoopbackDataConsumer {
    fn close_with(&self, event: DataConsumerEvent) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(event);
        }
    }
}

#[async_trait]
impl DataConsumer for LoopbackDataConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn data_producer_id(&self) -> &str {
        &self.data_producer_id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn sctp_stream_parameters(&self) -> Option<Value> {
        Some(self.sctp_stream_parameters.clone())
    }

    async fn get_stats(&self) -> EngineResult<Value> {
        Ok(json!([{ "type": "data-consumer", "dataConsumerId": self.id, "label": self.label }]))
    }

    fn subscribe(&self) -> broadcast::Receiver<DataConsumerEvent> {
        self.events.subscribe()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct LoopbackObserver {
    id: String,
    producers: Mutex<Vec<String>>,
    closed: AtomicBool,
    events: broadcast::Sender<SpeakerEvent>,
}

impl LoopbackObserver {
    pub fn emit(&self, event: SpeakerEvent) {
        let _ = self.events.send(event);
    }

    #[must_use]
    pub fn producer_ids(&self) -> Vec<String> {
        self.producers.lock().clone()
    }
}

#[async_trait]
impl SpeakerObserver for LoopbackObserver {
    fn id(&self) -> &str {
        &self.id
    }

    async fn add_producer(&self, producer_id: &str) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed("Observer"));
        }
        let mut producers = self.producers.lock();
        if !producers.iter().any(|p| p == producer_id) {
            producers.push(producer_id.to_string());
        }
        Ok(())
    }

    async fn remove_producer(&self, producer_id: &str) -> EngineResult<()> {
        self.producers.lock().retain(|p| p != producer_id);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SpeakerEvent> {
        self.events.subscribe()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(kinds: &[&str]) -> Value {
        json!({ "codecs": kinds.iter().map(|k| json!({ "kind": k })).collect::<Vec<_>>() })
    }

    async fn router() -> (Arc<LoopbackWorker>, Arc<dyn Router>) {
        let worker = LoopbackWorker::new("w1");
        let router = worker.create_router(&[json!({"kind": "audio"})]).await.unwrap();
        (worker, router)
    }

    fn webrtc_options(enable_sctp: bool) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: "127.0.0.1".to_string(),
            announced_ip: None,
            prefer_tcp: false,
            initial_available_outgoing_bitrate: 1_000_000,
            enable_sctp,
            num_sctp_streams: None,
            app_data: TransportAppData::default(),
        }
    }

    async fn audio_producer(transport: &Arc<dyn Transport>) -> Arc<dyn Producer> {
        transport
            .produce(ProduceOptions {
                kind: MediaKind::Audio,
                rtp_parameters: json!({ "codecs": [] }),
                app_data: json!({}),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_can_consume_checks_kind() {
        let (_worker, router) = router().await;
        let transport = router.create_webrtc_transport(webrtc_options(false)).await.unwrap();
        let producer = audio_producer(&transport).await;

        assert!(router.can_consume(producer.id(), &caps(&["audio"])));
        assert!(!router.can_consume(producer.id(), &caps(&["video"])));
        assert!(!router.can_consume("missing", &caps(&["audio"])));
    }

    #[tokio::test]
    async fn test_closing_producer_closes_consumers() {
        let (_worker, router) = router().await;
        let send = router.create_webrtc_transport(webrtc_options(false)).await.unwrap();
        let recv = router.create_webrtc_transport(webrtc_options(false)).await.unwrap();
        let producer = audio_producer(&send).await;

        let consumer = recv
            .consume(ConsumeOptions {
                producer_id: producer.id().to_string(),
                rtp_capabilities: caps(&["audio"]),
                paused: true,
                enable_rtx: true,
            })
            .await
            .unwrap();
        assert!(consumer.paused());
        let mut events = consumer.subscribe();

        producer.close();

        assert!(matches!(events.recv().await.unwrap(), ConsumerEvent::ProducerClosed));
        assert!(!router.can_consume(producer.id(), &caps(&["audio"])));
    }

    #[tokio::test]
    async fn test_transport_close_cascades() {
        let (_worker, router) = router().await;
        let transport = router.create_webrtc_transport(webrtc_options(true)).await.unwrap();
        let producer = audio_producer(&transport).await;
        let mut producer_events = producer.subscribe();

        transport.close();

        assert!(matches!(producer_events.recv().await.unwrap(), ProducerEvent::TransportClosed));
        assert!(transport.get_stats().await.is_err());
    }

    #[tokio::test]
    async fn test_data_channels_require_sctp() {
        let (_worker, router) = router().await;
        let plain_rtp = router.create_webrtc_transport(webrtc_options(false)).await.unwrap();
        let options = ProduceDataOptions {
            sctp_stream_parameters: None,
            label: "chat".to_string(),
            protocol: String::new(),
            app_data: json!({}),
        };
        assert!(plain_rtp.produce_data(options.clone()).await.is_err());

        let sctp = router.create_webrtc_transport(webrtc_options(true)).await.unwrap();
        let data_producer = sctp.produce_data(options).await.unwrap();
        let data_consumer = sctp
            .consume_data(ConsumeDataOptions {
                data_producer_id: data_producer.id().to_string(),
            })
            .await
            .unwrap();
        assert_eq!(data_consumer.label(), "chat");
        assert_eq!(data_consumer.sctp_stream_parameters().unwrap()["streamId"], 0);
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let (_worker, router) = router().await;
        let transport = router.create_webrtc_transport(webrtc_options(false)).await.unwrap();
        let dtls = json!({ "role": "client", "fingerprints": [] });

        transport.connect(dtls.clone()).await.unwrap();
        assert!(transport.connect(dtls).await.is_err());
    }

    #[tokio::test]
    async fn test_killed_worker_reports_death() {
        let (worker, router) = router().await;
        worker.kill("crashed");

        assert_eq!(worker.died().await, "crashed");
        assert!(worker.create_router(&[]).await.is_err());
        assert!(router.create_audio_level_observer(AudioLevelObserverOptions {
            max_entries: 1,
            threshold: -80,
            interval_ms: 800,
        })
        .await
        .is_err());
    }
}
