//! Balancer endpoints
//!
//! Room placement for clients, registration and room-closed events for
//! media servers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use roomlink_cluster::{PlaceRoomRequest, Placement, ServerRecord};

use crate::http::{AppResult, BalancerState};

/// Optional body of a placement request
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceRoomBody {
    #[serde(default)]
    pub event_notification_uri: Option<String>,
    #[serde(default)]
    pub max_peer_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterServerBody {
    pub server_id: String,
    pub url: String,
    pub worker_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomClosedBody {
    pub server_id: String,
    pub room_id: String,
}

/// POST /
pub async fn place_room(
    State(state): State<BalancerState>,
    body: Option<Json<PlaceRoomBody>>,
) -> AppResult<Json<Placement>> {
    place(&state, None, body.map(|Json(b)| b).unwrap_or_default()).await
}

/// POST /{room_id}
pub async fn place_named_room(
    State(state): State<BalancerState>,
    Path(room_id): Path<String>,
    body: Option<Json<PlaceRoomBody>>,
) -> AppResult<Json<Placement>> {
    place(&state, Some(room_id), body.map(|Json(b)| b).unwrap_or_default()).await
}

async fn place(state: &BalancerState, room_id: Option<String>, body: PlaceRoomBody) -> AppResult<Json<Placement>> {
    let placement = state
        .scheduler
        .place_room(PlaceRoomRequest {
            room_id,
            event_notification_uri: body.event_notification_uri,
            max_peer_count: body.max_peer_count,
        })
        .await?;
    Ok(Json(placement))
}

/// POST /register
pub async fn register_server(
    State(state): State<BalancerState>,
    Json(body): Json<RegisterServerBody>,
) -> AppResult<Json<ServerRecord>> {
    let record = state
        .scheduler
        .register_server(&body.server_id, &body.url, body.worker_count)
        .await?;
    Ok(Json(record))
}

/// POST /room-closed
pub async fn room_closed(
    State(state): State<BalancerState>,
    Json(body): Json<RoomClosedBody>,
) -> AppResult<StatusCode> {
    state.scheduler.reclaim(&body.server_id, &body.room_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /servers
pub async fn list_servers(State(state): State<BalancerState>) -> AppResult<Json<Vec<ServerRecord>>> {
    Ok(Json(state.scheduler.servers().await?))
}
