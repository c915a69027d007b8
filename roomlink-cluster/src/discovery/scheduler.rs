//! Capacity-aware room placement
//!
//! Picks the healthy server with the most free units, asks it to create the
//! room and bills the room against that server in the ledger.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use roomlink_core::notification::join_url;

use crate::error::{Error, Result};
use crate::ledger::{units, CapacityLedger, Debit, ServerRecord};

/// Room size used when the caller does not ask for one
pub const DEFAULT_MAX_PEER_COUNT: u32 = 2;

/// Placement request as accepted by the balancer
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceRoomRequest {
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub event_notification_uri: Option<String>,
    #[serde(default)]
    pub max_peer_count: Option<u32>,
}

/// Body forwarded to the chosen media server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRoomBody {
    pub event_notification_uri: Option<String>,
    pub max_peer_count: u32,
}

/// Connection details handed back to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    pub protocol: String,
    pub ws_url: String,
    pub room_id: String,
}

/// Creates rooms on media servers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoomForwarder: Send + Sync {
    async fn create_room(&self, base_url: &str, room_id: Option<String>, body: ForwardRoomBody) -> Result<Placement>;
}

/// `RoomForwarder` over HTTP: `POST {baseUrl}/rooms[/{roomId}]`
pub struct HttpRoomForwarder {
    client: reqwest::Client,
}

impl HttpRoomForwarder {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RoomForwarder for HttpRoomForwarder {
    async fn create_room(&self, base_url: &str, room_id: Option<String>, body: ForwardRoomBody) -> Result<Placement> {
        let path = match room_id {
            Some(id) => format!("/rooms/{id}"),
            None => "/rooms".to_string(),
        };
        let url = join_url(base_url, &path);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Forward(format!("{url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Forward(format!("{url} answered {status}: {text}")));
        }

        response
            .json::<Placement>()
            .await
            .map_err(|e| Error::Forward(format!("{url} sent an unreadable reply: {e}")))
    }
}

/// Places rooms onto media servers
pub struct PlacementScheduler {
    ledger: Arc<dyn CapacityLedger>,
    forwarder: Arc<dyn RoomForwarder>,
}

impl PlacementScheduler {
    pub fn new(ledger: Arc<dyn CapacityLedger>, forwarder: Arc<dyn RoomForwarder>) -> Self {
        Self { ledger, forwarder }
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<dyn CapacityLedger> {
        &self.ledger
    }

    /// Healthy server with the most free units; ties go to the first one
    pub async fn select_server(&self) -> Result<ServerRecord> {
        let servers = self.ledger.servers().await?;
        pick_server(servers).ok_or(Error::NoServersAvailable)
    }

    /// Create a room on the best server and bill it
    pub async fn place_room(&self, request: PlaceRoomRequest) -> Result<Placement> {
        let max_peer_count = request.max_peer_count.unwrap_or(DEFAULT_MAX_PEER_COUNT);
        if max_peer_count < 2 {
            return Err(Error::InvalidInput(format!(
                "maxPeerCount must be at least 2, got {max_peer_count}"
            )));
        }

        let server = self.select_server().await?;
        let requested = units(max_peer_count);
        if server.available_units() < requested {
            return Err(Error::InsufficientCapacity {
                server_id: server.server_id.clone(),
                requested,
                available: server.available_units(),
            });
        }

        let body = ForwardRoomBody {
            event_notification_uri: request.event_notification_uri,
            max_peer_count,
        };
        let placement = self
            .forwarder
            .create_room(&server.base_url, request.room_id, body)
            .await?;

        match self
            .ledger
            .debit(&server.server_id, &placement.room_id, max_peer_count)
            .await?
        {
            Debit::Applied => {
                tracing::info!(
                    server_id = %server.server_id,
                    room_id = %placement.room_id,
                    max_peer_count,
                    units = requested,
                    "Room placed"
                );
                Ok(placement)
            }
            Debit::Insufficient { available } => {
                tracing::warn!(
                    server_id = %server.server_id,
                    room_id = %placement.room_id,
                    requested,
                    available,
                    "Room created remotely but capacity was taken concurrently; room is unbilled"
                );
                Err(Error::InsufficientCapacity {
                    server_id: server.server_id,
                    requested,
                    available,
                })
            }
        }
    }

    /// Credit back a closed room; unknown rooms are ignored
    pub async fn reclaim(&self, server_id: &str, room_id: &str) -> Result<()> {
        match self.ledger.reclaim(server_id, room_id).await? {
            Some(credited) => {
                tracing::info!(server_id = %server_id, room_id = %room_id, units = credited, "Room capacity reclaimed");
            }
            None => {
                tracing::debug!(server_id = %server_id, room_id = %room_id, "No ledger entry for closed room");
            }
        }
        Ok(())
    }

    /// Add a server or reset it after a restart
    pub async fn register_server(&self, server_id: &str, base_url: &str, worker_count: u32) -> Result<ServerRecord> {
        if server_id.is_empty() {
            return Err(Error::InvalidInput("serverId must not be empty".to_string()));
        }
        if base_url.is_empty() {
            return Err(Error::InvalidInput("url must not be empty".to_string()));
        }
        if worker_count < 1 {
            return Err(Error::InvalidInput("workerCount must be at least 1".to_string()));
        }

        let record = self.ledger.register_server(server_id, base_url, worker_count).await?;
        tracing::info!(
            server_id = %server_id,
            url = %base_url,
            worker_count,
            capacity_units = record.capacity_units,
            "Server registered"
        );
        Ok(record)
    }

    pub async fn servers(&self) -> Result<Vec<ServerRecord>> {
        self.ledger.servers().await
    }
}

fn pick_server(servers: Vec<ServerRecord>) -> Option<ServerRecord> {
    let mut best: Option<ServerRecord> = None;
    for server in servers {
        if !server.healthy || server.available_units() == 0 {
            continue;
        }
        // Strictly greater keeps the first of equal candidates
        if best
            .as_ref()
            .map_or(true, |b| server.available_units() > b.available_units())
        {
            best = Some(server);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use mockall::predicate::{always, eq};
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn placement(room_id: &str) -> Placement {
        Placement {
            protocol: "protoo".to_string(),
            ws_url: "ws://media".to_string(),
            room_id: room_id.to_string(),
        }
    }

    fn echo_forwarder() -> MockRoomForwarder {
        let mut forwarder = MockRoomForwarder::new();
        forwarder
            .expect_create_room()
            .returning(|_, room_id, _| Ok(placement(&room_id.unwrap_or_else(|| "generated".to_string()))));
        forwarder
    }

    async fn scheduler_with(forwarder: MockRoomForwarder, servers: &[(&str, u32)]) -> PlacementScheduler {
        let ledger = Arc::new(MemoryLedger::new());
        for (id, workers) in servers {
            ledger
                .register_server(id, &format!("http://{id}"), *workers)
                .await
                .unwrap();
        }
        PlacementScheduler::new(ledger, Arc::new(forwarder))
    }

    async fn record(scheduler: &PlacementScheduler, id: &str) -> ServerRecord {
        scheduler
            .servers()
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.server_id == id)
            .unwrap()
    }

    fn request(room_id: &str, max_peer_count: Option<u32>) -> PlaceRoomRequest {
        PlaceRoomRequest {
            room_id: Some(room_id.to_string()),
            event_notification_uri: None,
            max_peer_count,
        }
    }

    #[tokio::test]
    async fn test_single_server_scenario() {
        let scheduler = scheduler_with(echo_forwarder(), &[("s1", 1)]).await;

        let placed = scheduler.place_room(request("r1", Some(4))).await.unwrap();
        assert_eq!(placed.room_id, "r1");
        let s1 = record(&scheduler, "s1").await;
        assert_eq!(s1.capacity_units, 500);
        assert_eq!(s1.consumed_units, 24);
        assert_eq!(s1.active_room_count, 1);

        scheduler.reclaim("s1", "r1").await.unwrap();
        let s1 = record(&scheduler, "s1").await;
        assert_eq!(s1.consumed_units, 0);
        assert_eq!(s1.active_room_count, 0);

        // A second room-closed for the same room changes nothing
        scheduler.reclaim("s1", "r1").await.unwrap();
        assert_eq!(record(&scheduler, "s1").await.consumed_units, 0);
    }

    #[tokio::test]
    async fn test_two_worker_server_scenario() {
        let scheduler = scheduler_with(echo_forwarder(), &[("s1", 2)]).await;
        assert_eq!(record(&scheduler, "s1").await.capacity_units, 1000);

        scheduler.place_room(request("room1", Some(3))).await.unwrap();
        let s1 = record(&scheduler, "s1").await;
        assert_eq!(s1.consumed_units, 12);
        assert_eq!(s1.active_room_count, 1);

        scheduler.place_room(request("room2", Some(3))).await.unwrap();
        let s1 = record(&scheduler, "s1").await;
        assert_eq!(s1.consumed_units, 24);
        assert_eq!(s1.active_room_count, 2);

        scheduler.reclaim("s1", "room1").await.unwrap();
        let s1 = record(&scheduler, "s1").await;
        assert_eq!(s1.consumed_units, 12);
        assert_eq!(s1.active_room_count, 1);
        assert!(scheduler.ledger().room("s1", "room1").await.unwrap().is_none());
        assert_eq!(scheduler.ledger().room("s1", "room2").await.unwrap().unwrap().peer_count, 3);
    }

    #[tokio::test]
    async fn test_forwards_to_greatest_available() {
        let mut forwarder = MockRoomForwarder::new();
        forwarder
            .expect_create_room()
            .with(
                eq("http://big"),
                eq(Some("r1".to_string())),
                eq(ForwardRoomBody {
                    event_notification_uri: Some("http://hook".to_string()),
                    max_peer_count: 2,
                }),
            )
            .times(1)
            .returning(|_, _, _| Ok(placement("r1")));
        let scheduler = scheduler_with(forwarder, &[("small", 1), ("big", 2)]).await;

        let placed = scheduler
            .place_room(PlaceRoomRequest {
                room_id: Some("r1".to_string()),
                event_notification_uri: Some("http://hook".to_string()),
                max_peer_count: None,
            })
            .await
            .unwrap();
        assert_eq!(placed, placement("r1"));
        assert_eq!(record(&scheduler, "big").await.consumed_units, 4);
        assert_eq!(record(&scheduler, "small").await.consumed_units, 0);
    }

    #[tokio::test]
    async fn test_ties_go_to_first_registered() {
        let mut forwarder = MockRoomForwarder::new();
        forwarder
            .expect_create_room()
            .with(eq("http://a"), always(), always())
            .times(1)
            .returning(|_, _, _| Ok(placement("r1")));
        let scheduler = scheduler_with(forwarder, &[("a", 1), ("b", 1)]).await;

        scheduler.place_room(request("r1", None)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unhealthy_and_full_servers_are_skipped() {
        let scheduler = scheduler_with(MockRoomForwarder::new(), &[("a", 4), ("b", 1)]).await;
        scheduler.ledger().set_healthy("a", false).await.unwrap();
        assert_eq!(scheduler.select_server().await.unwrap().server_id, "b");

        scheduler.ledger().set_healthy("b", false).await.unwrap();
        assert!(matches!(
            scheduler.select_server().await,
            Err(Error::NoServersAvailable)
        ));
    }

    #[tokio::test]
    async fn test_no_servers() {
        let scheduler = scheduler_with(MockRoomForwarder::new(), &[]).await;
        assert!(matches!(
            scheduler.place_room(request("r1", None)).await,
            Err(Error::NoServersAvailable)
        ));
    }

    #[tokio::test]
    async fn test_invalid_max_peer_count() {
        let scheduler = scheduler_with(MockRoomForwarder::new(), &[("s1", 1)]).await;
        assert!(matches!(
            scheduler.place_room(request("r1", Some(1))).await,
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(record(&scheduler, "s1").await.consumed_units, 0);
    }

    #[tokio::test]
    async fn test_insufficient_capacity_is_not_forwarded() {
        // No expectations: forwarding would panic
        let scheduler = scheduler_with(MockRoomForwarder::new(), &[("s1", 1)]).await;

        // 17 peers cost 544 units, more than one worker offers
        let result = scheduler.place_room(request("r1", Some(17))).await;
        assert!(matches!(
            result,
            Err(Error::InsufficientCapacity { requested: 544, available: 500, .. })
        ));
    }

    #[tokio::test]
    async fn test_forward_failure_leaves_ledger_untouched() {
        let mut forwarder = MockRoomForwarder::new();
        forwarder
            .expect_create_room()
            .returning(|_, _, _| Err(Error::Forward("boom".to_string())));
        let scheduler = scheduler_with(forwarder, &[("s1", 1)]).await;

        assert!(matches!(
            scheduler.place_room(request("r1", None)).await,
            Err(Error::Forward(_))
        ));
        let s1 = record(&scheduler, "s1").await;
        assert_eq!(s1.consumed_units, 0);
        assert_eq!(s1.active_room_count, 0);
    }

    #[tokio::test]
    async fn test_capacity_is_never_oversubscribed() {
        let scheduler = scheduler_with(echo_forwarder(), &[("s1", 1)]).await;

        let mut placed = 0;
        for i in 0..40 {
            if scheduler.place_room(request(&format!("r{i}"), Some(4))).await.is_ok() {
                placed += 1;
            }
        }
        assert_eq!(placed, 20);
        let s1 = record(&scheduler, "s1").await;
        assert!(s1.consumed_units <= s1.capacity_units);
        assert_eq!(s1.consumed_units, 480);
    }

    #[tokio::test]
    async fn test_placed_room_id_comes_from_server() {
        let scheduler = scheduler_with(echo_forwarder(), &[("s1", 1)]).await;

        let placed = scheduler.place_room(PlaceRoomRequest::default()).await.unwrap();
        assert_eq!(placed.room_id, "generated");
        assert!(scheduler.ledger().room("s1", "generated").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_register_validation() {
        let scheduler = scheduler_with(MockRoomForwarder::new(), &[]).await;
        assert!(matches!(
            scheduler.register_server("s1", "http://s1", 0).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            scheduler.register_server("", "http://s1", 1).await,
            Err(Error::InvalidInput(_))
        ));

        let record = scheduler.register_server("s1", "http://s1", 3).await.unwrap();
        assert_eq!(record.capacity_units, 1500);
    }

    #[tokio::test]
    async fn test_http_forwarder_posts_room() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rooms/r1"))
            .and(body_json(json!({"eventNotificationUri": null, "maxPeerCount": 3})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "protocol": "protoo",
                "wsUrl": "ws://media:3000",
                "roomId": "r1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let forwarder = HttpRoomForwarder::new(Duration::from_secs(2)).unwrap();
        let placed = forwarder
            .create_room(
                &server.uri(),
                Some("r1".to_string()),
                ForwardRoomBody {
                    event_notification_uri: None,
                    max_peer_count: 3,
                },
            )
            .await
            .unwrap();
        assert_eq!(placed.ws_url, "ws://media:3000");
    }

    #[tokio::test]
    async fn test_http_forwarder_rejects_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rooms"))
            .respond_with(ResponseTemplate::new(409).set_body_string("exists"))
            .mount(&server)
            .await;

        let forwarder = HttpRoomForwarder::new(Duration::from_secs(2)).unwrap();
        let result = forwarder
            .create_room(
                &server.uri(),
                None,
                ForwardRoomBody {
                    event_notification_uri: None,
                    max_peer_count: 2,
                },
            )
            .await;
        assert!(matches!(result, Err(Error::Forward(msg)) if msg.contains("409")));
    }
}
