//! Consumer fan-out
//!
//! Every new producer is offered to every other joined peer, and a peer that
//! just joined is offered everything already being produced. Each offer is a
//! server request the client must accept before the consumer is resumed.

use futures::future::join_all;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::engine::{
    dispatch, ConsumeDataOptions, ConsumeOptions, Consumer, ConsumerEvent, DataConsumerEvent, DataProducer, Producer,
    Subscription,
};
use crate::broadcaster::Broadcaster;
use crate::peer::Peer;
use crate::protocol::{NewConsumer, NewDataConsumer, Notification, ServerRequest};
use crate::session::{Session, BOT_LABEL, CHAT_LABEL};
use crate::types::MediaKind;

/// What a peer that just joined must be offered
#[derive(Default)]
pub(crate) struct Offers {
    producers: Vec<(String, Arc<dyn Producer>)>,
    data_producers: Vec<(String, Arc<dyn DataProducer>)>,
}

impl Offers {
    /// Everything the other joined peers and the broadcasters produce
    pub(crate) fn collect(peers: &[Arc<Peer>], broadcasters: &[Arc<Broadcaster>]) -> Self {
        let mut offers = Self::default();
        for other in peers {
            let owner = other.id().to_string();
            for producer in other.media.producers() {
                offers.producers.push((owner.clone(), producer));
            }
            for data_producer in other.media.data_producers() {
                if data_producer.label() != BOT_LABEL {
                    offers.data_producers.push((owner.clone(), data_producer));
                }
            }
        }
        for broadcaster in broadcasters {
            let owner = broadcaster.id().to_string();
            for producer in broadcaster.media.producers() {
                offers.producers.push((owner.clone(), producer));
            }
        }
        offers
    }
}

impl Session {
    /// Bring a freshly joined peer up to date, then announce it
    pub(crate) fn catch_up(self: &Arc<Self>, peer: &Arc<Peer>, offers: Offers) {
        for (owner, producer) in offers.producers {
            self.spawn_consumers(peer, &owner, producer);
        }
        for (owner, data_producer) in offers.data_producers {
            self.spawn_data_consumer(peer, Some(owner), data_producer);
        }

        self.broadcast(&Notification::NewPeer(peer.info()), Some(peer));
    }

    /// Offer a new producer to `recipients` and feed audio to the observers
    pub(crate) fn fan_out_producer(
        self: &Arc<Self>,
        owner_id: &str,
        recipients: Vec<Arc<Peer>>,
        producer: &Arc<dyn Producer>,
    ) {
        for peer in recipients {
            self.spawn_consumers(&peer, owner_id, producer.clone());
        }

        if producer.kind() == MediaKind::Audio {
            let observers = [
                self.audio_level_observer.clone(),
                self.active_speaker_observer.clone(),
            ];
            let producer_id = producer.id().to_string();
            tokio::spawn(async move {
                for observer in observers {
                    if let Err(e) = observer.add_producer(&producer_id).await {
                        warn!(producer_id = %producer_id, observer_id = observer.id(), error = %e, "Failed to observe audio producer");
                    }
                }
            });
        }
    }

    /// Only chat channels are offered to the other peers
    pub(crate) fn fan_out_data_producer(
        self: &Arc<Self>,
        owner_id: Option<&str>,
        recipients: Vec<Arc<Peer>>,
        data_producer: &Arc<dyn DataProducer>,
    ) {
        if data_producer.label() != CHAT_LABEL {
            return;
        }
        for peer in recipients {
            self.spawn_data_consumer(&peer, owner_id.map(str::to_string), data_producer.clone());
        }
    }

    fn spawn_consumers(self: &Arc<Self>, consumer_peer: &Arc<Peer>, producer_peer_id: &str, producer: Arc<dyn Producer>) {
        let session = self.clone();
        let consumer_peer = consumer_peer.clone();
        let producer_peer_id = producer_peer_id.to_string();
        tokio::spawn(async move {
            session
                .create_consumers(&consumer_peer, &producer_peer_id, producer)
                .await;
        });
    }

    fn spawn_data_consumer(
        self: &Arc<Self>,
        consumer_peer: &Arc<Peer>,
        producer_peer_id: Option<String>,
        data_producer: Arc<dyn DataProducer>,
    ) {
        let consumer_peer = consumer_peer.clone();
        tokio::spawn(async move {
            create_data_consumer(&consumer_peer, producer_peer_id, data_producer).await;
        });
    }

    /// One consumer per configured replica, plus the primary
    async fn create_consumers(&self, consumer_peer: &Arc<Peer>, producer_peer_id: &str, producer: Arc<dyn Producer>) {
        let Some(rtp_capabilities) = consumer_peer.rtp_capabilities() else {
            return;
        };
        if !self.router.can_consume(producer.id(), &rtp_capabilities) {
            return;
        }
        let Some(transport) = consumer_peer.media.consuming_transport() else {
            warn!(
                room_id = %self.id(),
                peer_id = %consumer_peer.id(),
                "No consuming transport, skipping consumer creation"
            );
            return;
        };

        let copies = 1 + self.consumer_replicas() as usize;
        let attempts = (0..copies).map(|_| {
            let transport = transport.clone();
            let producer = producer.clone();
            let rtp_capabilities = rtp_capabilities.clone();
            async move {
                let consumer = transport
                    .consume(ConsumeOptions {
                        producer_id: producer.id().to_string(),
                        rtp_capabilities,
                        paused: true,
                        enable_rtx: true,
                    })
                    .await
                    .map_err(|e| e.to_string())?;

                let events = watch_consumer(consumer_peer, &consumer);
                if !consumer_peer.media.add_consumer(consumer.clone(), Some(events)) {
                    return Err("peer closed".to_string());
                }

                let offer = ServerRequest::NewConsumer(NewConsumer {
                    peer_id: producer_peer_id.to_string(),
                    producer_id: producer.id().to_string(),
                    id: consumer.id().to_string(),
                    kind: consumer.kind(),
                    rtp_parameters: consumer.rtp_parameters(),
                    consumer_type: consumer.consumer_type(),
                    app_data: producer.app_data(),
                    producer_paused: consumer.producer_paused(),
                });
                consumer_peer.channel().request(&offer).await.map_err(|e| e.to_string())?;

                // The client is ready for media now
                consumer.resume().await.map_err(|e| e.to_string())?;
                consumer_peer.notify(&Notification::ConsumerScore {
                    consumer_id: consumer.id().to_string(),
                    score: consumer.score(),
                });
                Ok::<_, String>(())
            }
        });

        for result in join_all(attempts).await {
            if let Err(e) = result {
                warn!(
                    room_id = %self.id(),
                    peer_id = %consumer_peer.id(),
                    producer_id = producer.id(),
                    error = %e,
                    "Failed to create consumer"
                );
            }
        }
    }
}

async fn create_data_consumer(
    consumer_peer: &Arc<Peer>,
    producer_peer_id: Option<String>,
    data_producer: Arc<dyn DataProducer>,
) {
    if !consumer_peer.has_sctp_capabilities() {
        return;
    }
    let Some(transport) = consumer_peer.media.consuming_transport() else {
        warn!(peer_id = %consumer_peer.id(), "No consuming transport, skipping data consumer creation");
        return;
    };

    let data_consumer = match transport
        .consume_data(ConsumeDataOptions {
            data_producer_id: data_producer.id().to_string(),
        })
        .await
    {
        Ok(data_consumer) => data_consumer,
        Err(e) => {
            warn!(peer_id = %consumer_peer.id(), error = %e, "Failed to create data consumer");
            return;
        }
    };

    let owner = Arc::downgrade(consumer_peer);
    let data_consumer_id = data_consumer.id().to_string();
    let events = dispatch(data_consumer.subscribe(), move |event| {
        let Some(peer) = owner.upgrade() else {
            return;
        };
        peer.media.remove_data_consumer(&data_consumer_id);
        if let DataConsumerEvent::DataProducerClosed = event {
            peer.notify(&Notification::DataConsumerClosed {
                data_consumer_id: data_consumer_id.clone(),
            });
        }
    });
    if !consumer_peer.media.add_data_consumer(data_consumer.clone(), Some(events)) {
        debug!(peer_id = %consumer_peer.id(), "Peer closed, dropping data consumer");
        return;
    }

    let offer = ServerRequest::NewDataConsumer(NewDataConsumer {
        peer_id: producer_peer_id,
        data_producer_id: data_producer.id().to_string(),
        id: data_consumer.id().to_string(),
        sctp_stream_parameters: data_consumer.sctp_stream_parameters(),
        label: data_consumer.label().to_string(),
        protocol: data_consumer.protocol().to_string(),
        app_data: data_producer.app_data(),
    });
    if let Err(e) = consumer_peer.channel().request(&offer).await {
        warn!(
            peer_id = %consumer_peer.id(),
            data_consumer_id = data_consumer.id(),
            error = %e,
            "newDataConsumer request failed"
        );
    }
}

fn watch_consumer(peer: &Arc<Peer>, consumer: &Arc<dyn Consumer>) -> Subscription {
    let owner: Weak<Peer> = Arc::downgrade(peer);
    let consumer_id = consumer.id().to_string();

    dispatch(consumer.subscribe(), move |event| {
        let Some(peer) = owner.upgrade() else {
            return;
        };
        let consumer_id = consumer_id.clone();
        match event {
            ConsumerEvent::TransportClosed => {
                peer.media.remove_consumer(&consumer_id);
            }
            ConsumerEvent::ProducerClosed => {
                peer.media.remove_consumer(&consumer_id);
                peer.notify(&Notification::ConsumerClosed { consumer_id });
            }
            ConsumerEvent::ProducerPaused => peer.notify(&Notification::ConsumerPaused { consumer_id }),
            ConsumerEvent::ProducerResumed => peer.notify(&Notification::ConsumerResumed { consumer_id }),
            ConsumerEvent::Score(score) => peer.notify(&Notification::ConsumerScore { consumer_id, score }),
            ConsumerEvent::LayersChange(layers) => peer.notify(&Notification::ConsumerLayersChanged {
                consumer_id,
                spatial_layer: layers.map(|l| l.spatial_layer),
                temporal_layer: layers.and_then(|l| l.temporal_layer),
            }),
            ConsumerEvent::Trace(trace) => {
                debug!(consumer_id = %consumer_id, trace = %trace.kind, "Consumer trace event");
            }
        }
    })
}
