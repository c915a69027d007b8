//! Session registry
//!
//! Maps room ids to live sessions, places new sessions on media workers
//! round-robin and forgets a session once it has closed.

use dashmap::DashMap;
use futures::future::select_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::channel::PeerChannel;
use crate::config::SfuConfig;
use crate::engine::MediaWorker;
use crate::error::{AdmissionError, SessionError, SessionResult};
use crate::peer::Peer;
use crate::session::{Session, SessionContext, SessionOptions};
use crate::types::{PeerId, RoomId};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub room_id: Option<RoomId>,
    pub event_notification_uri: Option<String>,
    pub max_peer_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomCreated {
    pub protocol: String,
    pub ws_url: String,
    pub room_id: RoomId,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub active_rooms: usize,
    pub total_peers: usize,
    pub workers: usize,
}

pub struct SessionRegistry {
    config: Arc<SfuConfig>,
    context: SessionContext,
    workers: Vec<Arc<dyn MediaWorker>>,
    next_worker: AtomicUsize,
    sessions: Arc<DashMap<RoomId, Arc<Session>>>,
    /// Serializes session creation so one room id never gets two routers
    creating: Mutex<()>,
}

impl SessionRegistry {
    pub fn new(context: SessionContext, workers: Vec<Arc<dyn MediaWorker>>) -> SessionResult<Arc<Self>> {
        if workers.is_empty() {
            return Err(SessionError::NoWorkers);
        }

        info!(
            server_id = %context.config.server_id,
            workers = workers.len(),
            default_max_peer_count = context.config.default_max_peer_count,
            consumer_replicas = context.config.consumer_replicas,
            "Session registry initialized"
        );

        Ok(Arc::new(Self {
            config: context.config.clone(),
            context,
            workers,
            next_worker: AtomicUsize::new(0),
            sessions: Arc::new(DashMap::new()),
            creating: Mutex::new(()),
        }))
    }

    #[must_use]
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// An open session, if the room exists
    #[must_use]
    pub fn get(&self, room_id: &RoomId) -> Option<Arc<Session>> {
        self.sessions
            .get(room_id)
            .map(|s| Arc::clone(s.value()))
            .filter(|s| s.is_open())
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_rooms: self.sessions.len(),
            total_peers: self.sessions.iter().map(|s| s.value().peer_count()).sum(),
            workers: self.workers.len(),
        }
    }

    /// Explicit room creation from the HTTP surface
    pub async fn create_room(&self, req: CreateRoomRequest) -> SessionResult<RoomCreated> {
        let max_peer_count = req.max_peer_count.unwrap_or(self.config.default_max_peer_count);
        if max_peer_count < 2 {
            return Err(SessionError::InvalidInput(format!(
                "maxPeerCount must be at least 2, got {max_peer_count}"
            )));
        }
        let room_id = req
            .room_id
            .unwrap_or_else(|| RoomId::new(uuid::Uuid::new_v4().to_string()));

        let _creating = self.creating.lock().await;
        if self.get(&room_id).is_some() {
            return Err(SessionError::RoomAlreadyExists(room_id.to_string()));
        }

        self.open_session(
            room_id.clone(),
            SessionOptions {
                max_peer_count,
                consumer_replicas: self.config.consumer_replicas,
                event_notification_uri: req.event_notification_uri,
            },
        )
        .await?;

        Ok(RoomCreated {
            protocol: self.config.protocol.clone(),
            ws_url: self.config.public_ws_url.clone(),
            room_id,
        })
    }

    /// The open session for `room_id`, creating it with defaults if needed
    pub async fn get_or_create(&self, room_id: &RoomId, consumer_replicas: Option<u32>) -> SessionResult<Arc<Session>> {
        if let Some(session) = self.get(room_id) {
            return Ok(session);
        }

        let _creating = self.creating.lock().await;
        if let Some(session) = self.get(room_id) {
            return Ok(session);
        }

        self.open_session(
            room_id.clone(),
            SessionOptions {
                max_peer_count: self.config.default_max_peer_count,
                consumer_replicas: consumer_replicas.unwrap_or(self.config.consumer_replicas),
                event_notification_uri: None,
            },
        )
        .await
    }

    /// Admit a WebSocket channel into its room
    pub async fn connect_peer(
        &self,
        room_id: &RoomId,
        peer_id: PeerId,
        consumer_replicas: Option<u32>,
        channel: PeerChannel,
    ) -> Result<(Arc<Session>, Arc<Peer>), AdmissionError> {
        let session = self.get_or_create(room_id, consumer_replicas).await?;
        let peer = session.admit(peer_id, channel)?;
        Ok((session, peer))
    }

    async fn open_session(&self, room_id: RoomId, options: SessionOptions) -> SessionResult<Arc<Session>> {
        let worker = self.pick_worker();
        let session = Session::create(room_id.clone(), options, worker.as_ref(), self.context.clone())
            .await
            .map_err(SessionError::engine(format!("Failed to create room \"{room_id}\"")))?;

        self.sessions.insert(room_id.clone(), session.clone());

        let sessions = Arc::clone(&self.sessions);
        let closed = session.closed_token();
        let watched = Arc::downgrade(&session);
        tokio::spawn(async move {
            closed.cancelled().await;
            // A newer session may already hold this id
            sessions.remove_if(&room_id, |_, current| {
                watched.upgrade().is_some_and(|s| Arc::ptr_eq(&s, current))
            });
            debug!(room_id = %room_id, "Session removed from registry");
        });

        Ok(session)
    }

    fn pick_worker(&self) -> Arc<dyn MediaWorker> {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        Arc::clone(&self.workers[index])
    }

    /// Resolves with `(worker_id, reason)` as soon as any worker dies
    pub async fn worker_died(&self) -> (String, String) {
        let deaths = self.workers.iter().map(|worker| {
            let worker = Arc::clone(worker);
            Box::pin(async move {
                let reason = worker.died().await;
                (worker.id().to_string(), reason)
            })
        });
        select_all(deaths).await.0
    }

    pub fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.iter().map(|s| Arc::clone(s.value())).collect();
        for session in sessions {
            session.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::loopback::LoopbackWorker;
    use crate::session::tests::context;
    use crate::session::SessionState;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn registry(workers: usize) -> (Arc<SessionRegistry>, Vec<Arc<LoopbackWorker>>) {
        let loopbacks: Vec<_> = (0..workers).map(|i| LoopbackWorker::new(format!("w{i}"))).collect();
        let workers = loopbacks
            .iter()
            .map(|w| Arc::clone(w) as Arc<dyn MediaWorker>)
            .collect();
        let registry = SessionRegistry::new(context(SfuConfig::default(), None), workers).unwrap();
        (registry, loopbacks)
    }

    fn channel() -> (PeerChannel, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(64);
        (PeerChannel::new(tx, Duration::from_secs(1)), rx)
    }

    #[tokio::test]
    async fn test_requires_workers() {
        let result = SessionRegistry::new(context(SfuConfig::default(), None), Vec::new());
        assert!(matches!(result, Err(SessionError::NoWorkers)));
    }

    #[tokio::test]
    async fn test_create_room() {
        let (registry, _workers) = registry(1);

        let created = registry
            .create_room(CreateRoomRequest {
                room_id: Some(RoomId::from("r1")),
                max_peer_count: Some(4),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(created.room_id, RoomId::from("r1"));
        assert_eq!(created.protocol, "protoo");
        assert_eq!(registry.get(&created.room_id).unwrap().max_peer_count(), 4);

        let duplicate = registry
            .create_room(CreateRoomRequest {
                room_id: Some(RoomId::from("r1")),
                ..Default::default()
            })
            .await;
        assert!(matches!(duplicate, Err(SessionError::RoomAlreadyExists(_))));

        let too_small = registry
            .create_room(CreateRoomRequest {
                max_peer_count: Some(1),
                ..Default::default()
            })
            .await;
        assert!(matches!(too_small, Err(SessionError::InvalidInput(_))));

        let generated = registry.create_room(CreateRoomRequest::default()).await.unwrap();
        assert!(!generated.room_id.as_str().is_empty());
        assert_eq!(registry.room_count(), 2);
    }

    #[tokio::test]
    async fn test_sessions_spread_over_workers() {
        let (registry, workers) = registry(2);
        for id in ["a", "b", "c", "d"] {
            registry.get_or_create(&RoomId::from(id), None).await.unwrap();
        }
        assert_eq!(workers[0].routers().len(), 2);
        assert_eq!(workers[1].routers().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_yields_one_session() {
        let (registry, workers) = registry(1);
        let room = RoomId::from("same");

        let (first, second) = tokio::join!(
            registry.get_or_create(&room, None),
            registry.get_or_create(&room, Some(2))
        );
        assert!(Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
        assert_eq!(workers[0].routers().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_peer_uses_requested_replicas() {
        let (registry, _workers) = registry(1);
        let (channel, _rx) = channel();

        let (session, peer) = registry
            .connect_peer(&RoomId::from("r"), PeerId::from("p"), Some(3), channel)
            .await
            .unwrap();
        assert_eq!(session.consumer_replicas(), 3);
        assert_eq!(peer.id().as_str(), "p");
        assert_eq!(registry.stats().total_peers, 1);
    }

    #[tokio::test]
    async fn test_closed_session_is_forgotten() {
        let (registry, _workers) = registry(1);
        let room = RoomId::from("r");
        let (channel, _rx) = channel();
        let (session, peer) = registry
            .connect_peer(&room, PeerId::from("p"), None, channel)
            .await
            .unwrap();

        session.close_peer(&peer);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(registry.get(&room).is_none());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.room_count(), 0);

        // The same id opens a fresh session
        let reopened = registry.get_or_create(&room, None).await.unwrap();
        assert!(!Arc::ptr_eq(&reopened, &session));
        assert!(reopened.is_open());
    }

    #[tokio::test]
    async fn test_room_full_on_connect() {
        let (registry, _workers) = registry(1);
        let room = RoomId::from("r");
        let mut receivers = Vec::new();
        for id in ["a", "b"] {
            let (channel, rx) = channel();
            receivers.push(rx);
            registry
                .connect_peer(&room, PeerId::from(id), None, channel)
                .await
                .unwrap();
        }

        let (channel, _rx) = channel();
        let result = registry.connect_peer(&room, PeerId::from("c"), None, channel).await;
        assert!(matches!(result, Err(AdmissionError::RoomFull { .. })));
    }

    #[tokio::test]
    async fn test_worker_death_is_reported() {
        let (registry, workers) = registry(2);
        let watcher = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.worker_died().await })
        };

        workers[1].kill("segfault");
        let (worker_id, reason) = tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(worker_id, "w1");
        assert_eq!(reason, "segfault");
    }

    #[tokio::test]
    async fn test_close_all() {
        let (registry, _workers) = registry(1);
        let first = registry.get_or_create(&RoomId::from("a"), None).await.unwrap();
        let second = registry.get_or_create(&RoomId::from("b"), None).await.unwrap();

        registry.close_all();
        assert!(!first.is_open());
        assert!(!second.is_open());
    }
}
