//! Signaling WebSocket
//!
//! `GET /?roomId=&peerId=&consumerReplicas=` with the `protoo` subprotocol.
//! The peer is admitted before the upgrade so a full or closing room is
//! refused with a plain HTTP error. After the upgrade, text frames feed
//! [`serve_peer`] and everything the session sends goes out through a
//! bounded writer queue.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{future, SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use roomlink_sfu::{serve_peer, AdmissionError, Peer, PeerChannel, PeerId, RoomId, Session};

use crate::http::{AppError, MediaState};

/// Subprotocol clients must offer
pub const SIGNALING_PROTOCOL: &str = "protoo";

/// Outbound frames buffered per connection before the slowest ones are dropped
const OUTBOUND_BUFFER: usize = 1000;

/// Query parameters for WebSocket connection
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    pub room_id: Option<String>,
    pub peer_id: Option<String>,
    pub consumer_replicas: Option<u32>,
}

impl WsQuery {
    /// Room and peer ids, both required and non-empty
    pub fn identity(&self) -> Result<(RoomId, PeerId), AdmissionError> {
        let room_id = self
            .room_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(AdmissionError::MissingParameter("roomId"))?;
        let peer_id = self
            .peer_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(AdmissionError::MissingParameter("peerId"))?;
        Ok((RoomId::from(room_id), PeerId::from(peer_id)))
    }
}

/// WebSocket handler for signaling peers
pub async fn websocket_handler(
    State(state): State<MediaState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, AppError> {
    let (room_id, peer_id) = query.identity()?;

    let (tx, rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    let channel = PeerChannel::new(tx, state.registry.config().request_timeout());
    let (session, peer) = state
        .registry
        .connect_peer(&room_id, peer_id, query.consumer_replicas, channel)
        .await?;

    info!(room_id = %room_id, peer_id = %peer.id(), "WebSocket connection accepted");

    let failed_session = session.clone();
    let failed_peer = peer.clone();
    Ok(ws
        .protocols([SIGNALING_PROTOCOL])
        .max_message_size(1024 * 1024)
        .on_failed_upgrade(move |e| {
            warn!(peer_id = %failed_peer.id(), error = %e, "WebSocket upgrade failed");
            failed_session.close_peer(&failed_peer);
        })
        .on_upgrade(move |socket| handle_socket(socket, session, peer, rx)))
}

async fn handle_socket(socket: WebSocket, session: Arc<Session>, peer: Arc<Peer>, mut rx: mpsc::Receiver<String>) {
    let (mut ws_sender, ws_receiver) = socket.split();

    // Session -> WebSocket, flushing what is queued once the peer closes
    let writer_peer = peer.clone();
    let closed = peer.channel().closed_token();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                text = rx.recv() => {
                    let Some(text) = text else {
                        break;
                    };
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        error!(peer_id = %writer_peer.id(), "Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                () = closed.cancelled() => {
                    while let Ok(text) = rx.try_recv() {
                        if ws_sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
        let _ = ws_sender.close().await;
    });

    // WebSocket -> session: text frames until close or error
    let inbound = Box::pin(
        ws_receiver
            .take_while(|msg| future::ready(matches!(msg, Ok(m) if !matches!(m, Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(text.as_str().to_owned()),
                    _ => None,
                })
            }),
    );

    serve_peer(session, peer.clone(), inbound).await;

    // serve_peer closed the peer channel, so the writer flushes and stops
    if let Err(e) = writer.await {
        error!(peer_id = %peer.id(), "WebSocket writer task failed: {}", e);
    }
}
