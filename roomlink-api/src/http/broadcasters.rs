//! Broadcaster endpoints
//!
//! Lets an HTTP client (ffmpeg, GStreamer, a bot) take part in a room
//! without a signaling channel.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;

use roomlink_sfu::broadcaster::{
    ConnectBroadcasterTransportRequest, CreateBroadcasterConsumerQuery, CreateBroadcasterDataConsumerRequest,
    CreateBroadcasterDataProducerRequest, CreateBroadcasterProducerRequest, CreateBroadcasterRequest,
    CreateBroadcasterTransportRequest,
};
use roomlink_sfu::{BroadcasterId, RoomId, Session, SessionError};

use crate::http::{AppResult, MediaState};

fn session(state: &MediaState, room_id: &str) -> AppResult<Arc<Session>> {
    state
        .registry
        .get(&RoomId::from(room_id))
        .ok_or_else(|| SessionError::RoomNotFound(room_id.to_string()).into())
}

/// POST /rooms/{room_id}/broadcasters
pub async fn create_broadcaster(
    State(state): State<MediaState>,
    Path(room_id): Path<String>,
    Json(req): Json<CreateBroadcasterRequest>,
) -> AppResult<Json<Value>> {
    let session = session(&state, &room_id)?;
    Ok(Json(session.create_broadcaster(req)?))
}

/// DELETE /rooms/{room_id}/broadcasters/{broadcaster_id}
pub async fn delete_broadcaster(
    State(state): State<MediaState>,
    Path((room_id, broadcaster_id)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    let session = session(&state, &room_id)?;
    session.delete_broadcaster(&BroadcasterId::from(broadcaster_id))?;
    Ok(StatusCode::OK)
}

/// POST /rooms/{room_id}/broadcasters/{broadcaster_id}/transports
pub async fn create_transport(
    State(state): State<MediaState>,
    Path((room_id, broadcaster_id)): Path<(String, String)>,
    Json(req): Json<CreateBroadcasterTransportRequest>,
) -> AppResult<Json<Value>> {
    let session = session(&state, &room_id)?;
    let reply = session
        .create_broadcaster_transport(&BroadcasterId::from(broadcaster_id), req)
        .await?;
    Ok(Json(reply))
}

/// POST .../transports/{transport_id}/connect
pub async fn connect_transport(
    State(state): State<MediaState>,
    Path((room_id, broadcaster_id, transport_id)): Path<(String, String, String)>,
    Json(req): Json<ConnectBroadcasterTransportRequest>,
) -> AppResult<Json<Value>> {
    let session = session(&state, &room_id)?;
    session
        .connect_broadcaster_transport(&BroadcasterId::from(broadcaster_id), &transport_id, req)
        .await?;
    Ok(Json(json!({})))
}

/// POST .../transports/{transport_id}/producers
pub async fn create_producer(
    State(state): State<MediaState>,
    Path((room_id, broadcaster_id, transport_id)): Path<(String, String, String)>,
    Json(req): Json<CreateBroadcasterProducerRequest>,
) -> AppResult<Json<Value>> {
    let session = session(&state, &room_id)?;
    let reply = session
        .create_broadcaster_producer(&BroadcasterId::from(broadcaster_id), &transport_id, req)
        .await?;
    Ok(Json(reply))
}

/// POST .../transports/{transport_id}/consume?producerId=
pub async fn create_consumer(
    State(state): State<MediaState>,
    Path((room_id, broadcaster_id, transport_id)): Path<(String, String, String)>,
    Query(query): Query<CreateBroadcasterConsumerQuery>,
) -> AppResult<Json<Value>> {
    let session = session(&state, &room_id)?;
    let reply = session
        .create_broadcaster_consumer(&BroadcasterId::from(broadcaster_id), &transport_id, query)
        .await?;
    Ok(Json(reply))
}

/// POST .../transports/{transport_id}/consume/data
pub async fn create_data_consumer(
    State(state): State<MediaState>,
    Path((room_id, broadcaster_id, transport_id)): Path<(String, String, String)>,
    Json(req): Json<CreateBroadcasterDataConsumerRequest>,
) -> AppResult<Json<Value>> {
    let session = session(&state, &room_id)?;
    let reply = session
        .create_broadcaster_data_consumer(&BroadcasterId::from(broadcaster_id), &transport_id, req)
        .await?;
    Ok(Json(reply))
}

/// POST .../transports/{transport_id}/produce/data
pub async fn create_data_producer(
    State(state): State<MediaState>,
    Path((room_id, broadcaster_id, transport_id)): Path<(String, String, String)>,
    Json(req): Json<CreateBroadcasterDataProducerRequest>,
) -> AppResult<Json<Value>> {
    let session = session(&state, &room_id)?;
    let reply = session
        .create_broadcaster_data_producer(&BroadcasterId::from(broadcaster_id), &transport_id, req)
        .await?;
    Ok(Json(reply))
}

#[cfg(test)]
mod tests {
    use crate::http::create_media_router;
    use crate::http::tests::{media_registry, send};
    use axum::http::StatusCode;
    use serde_json::json;

    const BASE: &str = "/rooms/r1/broadcasters";

    #[tokio::test]
    async fn test_broadcaster_flow() {
        let (registry, _workers) = media_registry();
        let app = create_media_router(registry);
        send(&app, "POST", "/rooms/r1", None).await;

        let (status, body) = send(
            &app,
            "POST",
            BASE,
            Some(json!({
                "id": "bc",
                "displayName": "Broadcaster",
                "device": { "name": "ffmpeg" },
                "rtpCapabilities": { "codecs": [{ "kind": "audio" }, { "kind": "video" }] }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["peers"], json!([]));

        let (status, transport) = send(
            &app,
            "POST",
            &format!("{BASE}/bc/transports"),
            Some(json!({ "type": "plain", "comedia": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let transport_id = transport["id"].as_str().unwrap().to_string();

        let (status, producer) = send(
            &app,
            "POST",
            &format!("{BASE}/bc/transports/{transport_id}/producers"),
            Some(json!({ "kind": "audio", "rtpParameters": {} })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let producer_id = producer["id"].as_str().unwrap().to_string();

        let (status, consumer) = send(
            &app,
            "POST",
            &format!("{BASE}/bc/transports/{transport_id}/consume?producerId={producer_id}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(consumer["producerId"], producer_id.as_str());
        assert_eq!(consumer["kind"], "audio");

        let (status, _) = send(&app, "DELETE", &format!("{BASE}/bc"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, "DELETE", &format!("{BASE}/bc"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_plain_transport_cannot_be_connected() {
        let (registry, _workers) = media_registry();
        let app = create_media_router(registry);
        send(&app, "POST", "/rooms/r1", None).await;
        send(&app, "POST", BASE, Some(json!({ "id": "bc", "displayName": "B" }))).await;
        let (_, transport) = send(
            &app,
            "POST",
            &format!("{BASE}/bc/transports"),
            Some(json!({ "type": "plain" })),
        )
        .await;
        let transport_id = transport["id"].as_str().unwrap();

        let (status, _) = send(
            &app,
            "POST",
            &format!("{BASE}/bc/transports/{transport_id}/connect"),
            Some(json!({ "dtlsParameters": {} })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_room_and_transport() {
        let (registry, _workers) = media_registry();
        let app = create_media_router(registry);

        let (status, _) = send(&app, "POST", BASE, Some(json!({ "id": "bc", "displayName": "B" }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        send(&app, "POST", "/rooms/r1", None).await;
        send(&app, "POST", BASE, Some(json!({ "id": "bc", "displayName": "B" }))).await;
        let (status, body) = send(
            &app,
            "POST",
            &format!("{BASE}/bc/transports/nope/producers"),
            Some(json!({ "kind": "video", "rtpParameters": {} })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Transport with id \"nope\" not found");
    }
}
