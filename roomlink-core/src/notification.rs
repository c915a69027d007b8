//! Best-effort outbound notifications
//!
//! Webhook calls (peer joined/left), room-closed events and server
//! registration towards the balancer. Fire-and-forget variants run on a
//! spawned task with a bounded HTTP timeout; failures are logged and dropped.

use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Peer lifecycle event kinds reported to a room's webhook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerEventKind {
    PeerJoined,
    PeerLeft,
}

/// Body posted to a room's `eventNotificationUri`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerEvent {
    pub room_id: String,
    pub peer_id: String,
    pub event: PeerEventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct RoomClosed {
    server_id: String,
    room_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Registration {
    server_id: String,
    url: String,
    worker_count: usize,
}

/// Outbound HTTP notifier
#[derive(Clone)]
pub struct NotificationSink {
    client: reqwest::Client,
}

impl NotificationSink {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// POST a JSON body and require a 2xx answer
    pub async fn post_json<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<()> {
        let response = self.client.post(url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::UnexpectedStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    /// Report a peer event to a room webhook without waiting for the outcome
    pub fn notify_peer_event(&self, uri: &str, event: PeerEvent) {
        debug!(
            room_id = %event.room_id,
            peer_id = %event.peer_id,
            event = ?event.event,
            "Sending peer event webhook"
        );
        self.fire(uri.to_string(), event);
    }

    /// Tell the balancer a room closed so its capacity can be reclaimed
    pub fn notify_room_closed(&self, balancer_url: &str, server_id: &str, room_id: &str) {
        let url = join_url(balancer_url, "/room-closed");
        debug!(server_id = %server_id, room_id = %room_id, url = %url, "Sending room-closed event");
        self.fire(
            url,
            RoomClosed {
                server_id: server_id.to_string(),
                room_id: room_id.to_string(),
            },
        );
    }

    /// Register this media server with the balancer
    pub async fn register_server(
        &self,
        balancer_url: &str,
        server_id: &str,
        url: &str,
        worker_count: usize,
    ) -> Result<()> {
        let body = Registration {
            server_id: server_id.to_string(),
            url: url.to_string(),
            worker_count,
        };
        self.post_json(&join_url(balancer_url, "/register"), &body).await
    }

    fn fire<T>(&self, url: String, body: T)
    where
        T: Serialize + Send + Sync + 'static,
    {
        let sink = self.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.post_json(&url, &body).await {
                warn!(url = %url, error = %e, "Notification delivery failed");
            }
        });
    }
}

#[must_use]
pub fn join_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}
