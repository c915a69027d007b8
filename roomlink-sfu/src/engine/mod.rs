//! Media-routing engine boundary
//!
//! The session layer never touches media bytes. It drives engine objects
//! (routers, transports, producers, consumers, data channels, speaker
//! observers) through these traits and reacts to their events.
//!
//! Events are delivered through explicit subscriptions: every engine object
//! exposes a broadcast stream, and [`dispatch`] spawns one task per object
//! that feeds events to a handler until the returned [`Subscription`] is
//! dropped or the object goes away.

pub mod loopback;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::types::MediaKind;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("Producer with id \"{0}\" not found")]
    ProducerNotFound(String),

    #[error("DataProducer with id \"{0}\" not found")]
    DataProducerNotFound(String),

    #[error("Cannot consume producer \"{0}\" with the given capabilities")]
    CannotConsume(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Worker error: {0}")]
    Worker(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Transport flags chosen by the client at creation time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportAppData {
    pub producing: bool,
    pub consuming: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    WebRtc,
    Plain,
}

/// Negotiation data a client needs to connect to a transport
#[derive(Debug, Clone)]
pub enum TransportInfo {
    WebRtc {
        ice_parameters: Value,
        ice_candidates: Value,
        dtls_parameters: Value,
        sctp_parameters: Option<Value>,
    },
    Plain {
        ip: String,
        port: u16,
        rtcp_port: Option<u16>,
    },
}

#[derive(Debug, Clone)]
pub struct WebRtcTransportOptions {
    pub listen_ip: String,
    pub announced_ip: Option<String>,
    pub prefer_tcp: bool,
    pub initial_available_outgoing_bitrate: u32,
    pub enable_sctp: bool,
    pub num_sctp_streams: Option<Value>,
    pub app_data: TransportAppData,
}

#[derive(Debug, Clone)]
pub struct PlainTransportOptions {
    pub listen_ip: String,
    pub announced_ip: Option<String>,
    pub rtcp_mux: bool,
    pub comedia: bool,
    pub enable_sctp: bool,
}

#[derive(Debug, Clone)]
pub struct ProduceOptions {
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub app_data: Value,
}

#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub producer_id: String,
    pub rtp_capabilities: Value,
    pub paused: bool,
    pub enable_rtx: bool,
}

#[derive(Debug, Clone)]
pub struct ProduceDataOptions {
    pub sctp_stream_parameters: Option<Value>,
    pub label: String,
    pub protocol: String,
    pub app_data: Value,
}

#[derive(Debug, Clone)]
pub struct ConsumeDataOptions {
    pub data_producer_id: String,
}

#[derive(Debug, Clone, Copy)]
pub struct AudioLevelObserverOptions {
    pub max_entries: u16,
    pub threshold: i8,
    pub interval_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceDirection {
    In,
    Out,
}

#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub kind: String,
    pub direction: TraceDirection,
    pub info: Value,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Trace(TraceEvent),
    DtlsStateChange(String),
    SctpStateChange(String),
}

#[derive(Debug, Clone)]
pub enum ProducerEvent {
    Score(Value),
    VideoOrientationChange(Value),
    Trace(TraceEvent),
    TransportClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerLayers {
    pub spatial_layer: u8,
    pub temporal_layer: Option<u8>,
}

#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    TransportClosed,
    ProducerClosed,
    ProducerPaused,
    ProducerResumed,
    Score(Value),
    LayersChange(Option<ConsumerLayers>),
    Trace(TraceEvent),
}

#[derive(Debug, Clone)]
pub enum DataProducerEvent {
    TransportClosed,
}

#[derive(Debug, Clone)]
pub enum DataConsumerEvent {
    TransportClosed,
    DataProducerClosed,
}

#[derive(Debug, Clone)]
pub struct AudioVolume {
    pub producer_id: String,
    pub volume: i8,
}

#[derive(Debug, Clone)]
pub enum SpeakerEvent {
    /// Loudest producers first
    Volumes(Vec<AudioVolume>),
    Silence,
    DominantSpeaker { producer_id: String },
}

/// A media engine worker process; each new router is placed on one
#[async_trait]
pub trait MediaWorker: Send + Sync {
    fn id(&self) -> &str;

    async fn create_router(&self, media_codecs: &[Value]) -> EngineResult<Arc<dyn Router>>;

    /// Resolves with a reason once the worker has died
    async fn died(&self) -> String;
}

#[async_trait]
pub trait Router: Send + Sync {
    fn id(&self) -> &str;

    fn rtp_capabilities(&self) -> Value;

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool;

    async fn create_webrtc_transport(&self, options: WebRtcTransportOptions) -> EngineResult<Arc<dyn Transport>>;

    async fn create_plain_transport(&self, options: PlainTransportOptions) -> EngineResult<Arc<dyn Transport>>;

    async fn create_audio_level_observer(
        &self,
        options: AudioLevelObserverOptions,
    ) -> EngineResult<Arc<dyn SpeakerObserver>>;

    async fn create_active_speaker_observer(&self) -> EngineResult<Arc<dyn SpeakerObserver>>;

    /// Closes every transport and observer created on this router
    fn close(&self);
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> TransportKind;

    fn app_data(&self) -> TransportAppData;

    fn info(&self) -> TransportInfo;

    async fn connect(&self, dtls_parameters: Value) -> EngineResult<()>;

    async fn restart_ice(&self) -> EngineResult<Value>;

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> EngineResult<()>;

    async fn enable_trace_event(&self, types: Vec<String>) -> EngineResult<()>;

    async fn produce(&self, options: ProduceOptions) -> EngineResult<Arc<dyn Producer>>;

    async fn consume(&self, options: ConsumeOptions) -> EngineResult<Arc<dyn Consumer>>;

    async fn produce_data(&self, options: ProduceDataOptions) -> EngineResult<Arc<dyn DataProducer>>;

    async fn consume_data(&self, options: ConsumeDataOptions) -> EngineResult<Arc<dyn DataConsumer>>;

    async fn get_stats(&self) -> EngineResult<Value>;

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Closes the transport and everything produced or consumed on it
    fn close(&self);
}

#[async_trait]
pub trait Producer: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn app_data(&self) -> Value;

    fn paused(&self) -> bool;

    async fn pause(&self) -> EngineResult<()>;

    async fn resume(&self) -> EngineResult<()>;

    async fn get_stats(&self) -> EngineResult<Value>;

    fn subscribe(&self) -> broadcast::Receiver<ProducerEvent>;

    fn close(&self);
}

#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> &str;

    fn producer_id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> Value;

    /// "simple", "simulcast" or "svc"
    fn consumer_type(&self) -> String;

    fn paused(&self) -> bool;

    fn producer_paused(&self) -> bool;

    fn score(&self) -> Value;

    async fn pause(&self) -> EngineResult<()>;

    async fn resume(&self) -> EngineResult<()>;

    async fn set_preferred_layers(&self, spatial_layer: u8, temporal_layer: Option<u8>) -> EngineResult<()>;

    async fn set_priority(&self, priority: u8) -> EngineResult<()>;

    async fn request_key_frame(&self) -> EngineResult<()>;

    async fn get_stats(&self) -> EngineResult<Value>;

    fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent>;

    fn close(&self);
}

#[async_trait]
pub trait DataProducer: Send + Sync {
    fn id(&self) -> &str;

    fn label(&self) -> &str;

    fn protocol(&self) -> &str;

    fn sctp_stream_parameters(&self) -> Option<Value>;

    fn app_data(&self) -> Value;

    async fn get_stats(&self) -> EngineResult<Value>;

    fn subscribe(&self) -> broadcast::Receiver<DataProducerEvent>;

    fn close(&self);
}

#[async_trait]
pub trait DataConsumer: Send + Sync {
    fn id(&self) -> &str;

    fn data_producer_id(&self) -> &str;

    fn label(&self) -> &str;

    fn protocol(&self) -> &str;

    fn sctp_stream_parameters(&self) -> Option<Value>;

    async fn get_stats(&self) -> EngineResult<Value>;

    fn subscribe(&self) -> broadcast::Receiver<DataConsumerEvent>;

    fn close(&self);
}

/// Audio-level or active-speaker observer attached to a router
#[async_trait]
pub trait SpeakerObserver: Send + Sync {
    fn id(&self) -> &str;

    async fn add_producer(&self, producer_id: &str) -> EngineResult<()>;

    async fn remove_producer(&self, producer_id: &str) -> EngineResult<()>;

    fn subscribe(&self) -> broadcast::Receiver<SpeakerEvent>;

    fn close(&self);
}

/// Cancellation handle for an event dispatcher task
///
/// Dropping it stops the dispatcher.
#[derive(Debug)]
pub struct Subscription {
    token: CancellationToken,
}

impl Subscription {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Spawn the single dispatcher task for one engine object's events
///
/// The handler runs on the dispatcher task, one event at a time, so it
/// never re-enters the request path of the peer that owns the object.
pub fn dispatch<E, F>(mut events: broadcast::Receiver<E>, mut handler: F) -> Subscription
where
    E: Clone + Send + 'static,
    F: FnMut(E) + Send + 'static,
{
    let token = CancellationToken::new();
    let cancelled = token.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancelled.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => handler(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Engine event dispatcher lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });

    Subscription { token }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_dispatch_delivers_events_in_order() {
        let (tx, rx) = broadcast::channel(16);
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();

        let _subscription = dispatch(rx, move |n: u32| {
            let _ = seen_tx.send(n);
        });

        for n in 0..3 {
            tx.send(n).unwrap();
        }

        for expected in 0..3 {
            assert_eq!(seen_rx.recv().await, Some(expected));
        }
    }

    #[tokio::test]
    async fn test_dropping_subscription_stops_dispatch() {
        let (tx, rx) = broadcast::channel(16);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();

        let subscription = dispatch(rx, move |_: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(subscription);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _ = tx.send(1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
