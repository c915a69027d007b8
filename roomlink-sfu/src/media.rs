//! Engine objects owned by one participant

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::{Consumer, DataConsumer, DataProducer, Producer, Subscription, Transport};

/// An engine object plus the subscription feeding its events
struct Handle<T: ?Sized> {
    object: Arc<T>,
    _events: Option<Subscription>,
}

impl<T: ?Sized> Handle<T> {
    fn new(object: Arc<T>, events: Option<Subscription>) -> Self {
        Self {
            object,
            _events: events,
        }
    }
}

#[derive(Default)]
struct MediaMaps {
    transports: HashMap<String, Handle<dyn Transport>>,
    producers: HashMap<String, Handle<dyn Producer>>,
    consumers: HashMap<String, Handle<dyn Consumer>>,
    data_producers: HashMap<String, Handle<dyn DataProducer>>,
    data_consumers: HashMap<String, Handle<dyn DataConsumer>>,
    closed: bool,
}

/// Transports, producers and consumers keyed by engine id
///
/// Removing an entry drops its subscription, which stops the matching
/// event dispatcher. Once [`MediaSet::close_all`] ran, every `add_*` closes
/// the object it was handed and returns false.
#[derive(Default)]
pub struct MediaSet {
    maps: Mutex<MediaMaps>,
}

impl MediaSet {
    pub fn add_transport(&self, transport: Arc<dyn Transport>, events: Option<Subscription>) -> bool {
        let mut maps = self.maps.lock();
        if maps.closed {
            drop(maps);
            transport.close();
            return false;
        }
        let id = transport.id().to_string();
        maps.transports.insert(id, Handle::new(transport, events));
        true
    }

    #[must_use]
    pub fn transport(&self, id: &str) -> Option<Arc<dyn Transport>> {
        self.maps.lock().transports.get(id).map(|h| h.object.clone())
    }

    /// Any transport the client flagged for receiving media
    #[must_use]
    pub fn consuming_transport(&self) -> Option<Arc<dyn Transport>> {
        self.maps
            .lock()
            .transports
            .values()
            .find(|h| h.object.app_data().consuming)
            .map(|h| h.object.clone())
    }

    pub fn add_producer(&self, producer: Arc<dyn Producer>, events: Option<Subscription>) -> bool {
        let mut maps = self.maps.lock();
        if maps.closed {
            drop(maps);
            producer.close();
            return false;
        }
        let id = producer.id().to_string();
        maps.producers.insert(id, Handle::new(producer, events));
        true
    }

    #[must_use]
    pub fn producer(&self, id: &str) -> Option<Arc<dyn Producer>> {
        self.maps.lock().producers.get(id).map(|h| h.object.clone())
    }

    pub fn remove_producer(&self, id: &str) -> Option<Arc<dyn Producer>> {
        self.maps.lock().producers.remove(id).map(|h| h.object)
    }

    #[must_use]
    pub fn producers(&self) -> Vec<Arc<dyn Producer>> {
        self.maps.lock().producers.values().map(|h| h.object.clone()).collect()
    }

    pub fn add_consumer(&self, consumer: Arc<dyn Consumer>, events: Option<Subscription>) -> bool {
        let mut maps = self.maps.lock();
        if maps.closed {
            drop(maps);
            consumer.close();
            return false;
        }
        let id = consumer.id().to_string();
        maps.consumers.insert(id, Handle::new(consumer, events));
        true
    }

    #[must_use]
    pub fn consumer(&self, id: &str) -> Option<Arc<dyn Consumer>> {
        self.maps.lock().consumers.get(id).map(|h| h.object.clone())
    }

    pub fn remove_consumer(&self, id: &str) -> Option<Arc<dyn Consumer>> {
        self.maps.lock().consumers.remove(id).map(|h| h.object)
    }

    #[must_use]
    pub fn consumers(&self) -> Vec<Arc<dyn Consumer>> {
        self.maps.lock().consumers.values().map(|h| h.object.clone()).collect()
    }

    pub fn add_data_producer(&self, data_producer: Arc<dyn DataProducer>, events: Option<Subscription>) -> bool {
        let mut maps = self.maps.lock();
        if maps.closed {
            drop(maps);
            data_producer.close();
            return false;
        }
        let id = data_producer.id().to_string();
        maps.data_producers.insert(id, Handle::new(data_producer, events));
        true
    }

    #[must_use]
    pub fn data_producer(&self, id: &str) -> Option<Arc<dyn DataProducer>> {
        self.maps.lock().data_producers.get(id).map(|h| h.object.clone())
    }

    pub fn remove_data_producer(&self, id: &str) -> Option<Arc<dyn DataProducer>> {
        self.maps.lock().data_producers.remove(id).map(|h| h.object)
    }

    #[must_use]
    pub fn data_producers(&self) -> Vec<Arc<dyn DataProducer>> {
        self.maps
            .lock()
            .data_producers
            .values()
            .map(|h| h.object.clone())
            .collect()
    }

    pub fn add_data_consumer(&self, data_consumer: Arc<dyn DataConsumer>, events: Option<Subscription>) -> bool {
        let mut maps = self.maps.lock();
        if maps.closed {
            drop(maps);
            data_consumer.close();
            return false;
        }
        let id = data_consumer.id().to_string();
        maps.data_consumers.insert(id, Handle::new(data_consumer, events));
        true
    }

    #[must_use]
    pub fn data_consumer(&self, id: &str) -> Option<Arc<dyn DataConsumer>> {
        self.maps.lock().data_consumers.get(id).map(|h| h.object.clone())
    }

    pub fn remove_data_consumer(&self, id: &str) -> Option<Arc<dyn DataConsumer>> {
        self.maps.lock().data_consumers.remove(id).map(|h| h.object)
    }

    /// Close every transport (the engine cascades to everything on them)
    /// and forget all objects; later additions are refused
    pub fn close_all(&self) {
        let maps = {
            let mut guard = self.maps.lock();
            let maps = std::mem::take(&mut *guard);
            guard.closed = true;
            maps
        };
        for handle in maps.transports.values() {
            handle.object.close();
        }
    }
}
