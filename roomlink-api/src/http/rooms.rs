//! Room endpoints of the media server

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::Value;

use roomlink_sfu::{CreateRoomRequest, RoomCreated, RoomId};

use crate::http::{AppError, AppResult, MediaState};

/// Optional body of a room creation request
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomBody {
    #[serde(default)]
    pub event_notification_uri: Option<String>,
    #[serde(default)]
    pub max_peer_count: Option<u32>,
}

/// POST /rooms
pub async fn create_room(
    State(state): State<MediaState>,
    body: Option<Json<CreateRoomBody>>,
) -> AppResult<Json<RoomCreated>> {
    create(&state, None, body.map(|Json(b)| b).unwrap_or_default()).await
}

/// POST /rooms/{room_id}
pub async fn create_named_room(
    State(state): State<MediaState>,
    Path(room_id): Path<String>,
    body: Option<Json<CreateRoomBody>>,
) -> AppResult<Json<RoomCreated>> {
    create(&state, Some(RoomId::from(room_id)), body.map(|Json(b)| b).unwrap_or_default()).await
}

async fn create(state: &MediaState, room_id: Option<RoomId>, body: CreateRoomBody) -> AppResult<Json<RoomCreated>> {
    let created = state
        .registry
        .create_room(CreateRoomRequest {
            room_id,
            event_notification_uri: body.event_notification_uri,
            max_peer_count: body.max_peer_count,
        })
        .await?;

    tracing::info!(room_id = %created.room_id, "Room created");
    Ok(Json(created))
}

/// GET /rooms/{room_id}: the router RTP capabilities
pub async fn get_room(State(state): State<MediaState>, Path(room_id): Path<String>) -> AppResult<Json<Value>> {
    let session = state
        .registry
        .get(&RoomId::from(room_id.as_str()))
        .ok_or_else(|| AppError::not_found(format!("Room with id \"{room_id}\" not found")))?;
    Ok(Json(session.rtp_capabilities()))
}

#[cfg(test)]
mod tests {
    use crate::http::create_media_router;
    use crate::http::tests::{media_registry, send};
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_and_get_room() {
        let (registry, _workers) = media_registry();
        let app = create_media_router(registry.clone());

        let (status, body) = send(
            &app,
            "POST",
            "/rooms/r1",
            Some(json!({ "maxPeerCount": 4, "eventNotificationUri": "http://hook" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["roomId"], "r1");
        assert_eq!(body["protocol"], "protoo");
        assert_eq!(body["wsUrl"], "ws://127.0.0.1:3000");

        let session = registry.get(&"r1".into()).unwrap();
        assert_eq!(session.max_peer_count(), 4);

        let (status, body) = send(&app, "GET", "/rooms/r1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["codecs"].is_array());
    }

    #[tokio::test]
    async fn test_create_room_without_body_generates_id() {
        let (registry, _workers) = media_registry();
        let app = create_media_router(registry.clone());

        let (status, body) = send(&app, "POST", "/rooms", None).await;
        assert_eq!(status, StatusCode::OK);
        let room_id = body["roomId"].as_str().unwrap();
        assert!(!room_id.is_empty());
        assert_eq!(registry.get(&room_id.into()).unwrap().max_peer_count(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_and_invalid_rooms() {
        let (registry, _workers) = media_registry();
        let app = create_media_router(registry);

        let (status, _) = send(&app, "POST", "/rooms/r1", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, "POST", "/rooms/r1", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"], 409);

        let (status, _) = send(&app, "POST", "/rooms/r2", Some(json!({ "maxPeerCount": 1 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_room() {
        let (registry, _workers) = media_registry();
        let app = create_media_router(registry);

        let (status, body) = send(&app, "GET", "/rooms/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Room with id \"nope\" not found");
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let (registry, _workers) = media_registry();
        let app = create_media_router(registry);

        let (status, body) = send(&app, "GET", "/rooms/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, _) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
    }
}
