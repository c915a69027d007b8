// Module: http
// REST and WebSocket surfaces of the media server and the balancer

pub mod balancer;
pub mod broadcasters;
pub mod error;
pub mod health;
pub mod rooms;
pub mod websocket;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use roomlink_cluster::PlacementScheduler;
use roomlink_sfu::SessionRegistry;

pub use error::{AppError, AppResult};

/// Shared state of the media server router
#[derive(Clone)]
pub struct MediaState {
    pub registry: Arc<SessionRegistry>,
}

/// Shared state of the balancer router
#[derive(Clone)]
pub struct BalancerState {
    pub scheduler: Arc<PlacementScheduler>,
}

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Create the media server router
pub fn create_media_router(registry: Arc<SessionRegistry>) -> Router {
    let state = MediaState { registry };

    Router::new()
        .route("/", get(websocket::websocket_handler))
        .merge(health::create_health_router())
        .route("/rooms", post(rooms::create_room))
        .route("/rooms/{room_id}", post(rooms::create_named_room).get(rooms::get_room))
        .route("/rooms/{room_id}/broadcasters", post(broadcasters::create_broadcaster))
        .route(
            "/rooms/{room_id}/broadcasters/{broadcaster_id}",
            delete(broadcasters::delete_broadcaster),
        )
        .route(
            "/rooms/{room_id}/broadcasters/{broadcaster_id}/transports",
            post(broadcasters::create_transport),
        )
        .route(
            "/rooms/{room_id}/broadcasters/{broadcaster_id}/transports/{transport_id}/connect",
            post(broadcasters::connect_transport),
        )
        .route(
            "/rooms/{room_id}/broadcasters/{broadcaster_id}/transports/{transport_id}/producers",
            post(broadcasters::create_producer),
        )
        .route(
            "/rooms/{room_id}/broadcasters/{broadcaster_id}/transports/{transport_id}/consume",
            post(broadcasters::create_consumer),
        )
        .route(
            "/rooms/{room_id}/broadcasters/{broadcaster_id}/transports/{transport_id}/consume/data",
            post(broadcasters::create_data_consumer),
        )
        .route(
            "/rooms/{room_id}/broadcasters/{broadcaster_id}/transports/{transport_id}/produce/data",
            post(broadcasters::create_data_producer),
        )
        .with_state(state)
        .layer(cors())
        .layer(TraceLayer::new_for_http())
}

/// Create the balancer router
pub fn create_balancer_router(scheduler: Arc<PlacementScheduler>) -> Router {
    let state = BalancerState { scheduler };

    Router::new()
        .route("/", post(balancer::place_room))
        .route("/register", post(balancer::register_server))
        .route("/room-closed", post(balancer::room_closed))
        .route("/servers", get(balancer::list_servers))
        .route("/health", get(health::health_check))
        .route("/{room_id}", post(balancer::place_named_room))
        .with_state(state)
        .layer(cors())
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
pub(crate) mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use roomlink_core::NotificationSink;
    use roomlink_sfu::engine::loopback::LoopbackWorker;
    use roomlink_sfu::engine::MediaWorker;
    use roomlink_sfu::throttle::UnavailableBackend;
    use roomlink_sfu::{NetworkThrottle, SessionContext, SessionRegistry, SfuConfig};
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    pub(crate) fn media_registry() -> (Arc<SessionRegistry>, Vec<Arc<LoopbackWorker>>) {
        let loopbacks = vec![LoopbackWorker::new("w0"), LoopbackWorker::new("w1")];
        let workers: Vec<Arc<dyn MediaWorker>> = loopbacks
            .iter()
            .map(|w| Arc::clone(w) as Arc<dyn MediaWorker>)
            .collect();
        let context = SessionContext {
            config: Arc::new(SfuConfig::default()),
            notifier: NotificationSink::new(Duration::from_secs(1)).unwrap(),
            throttle: NetworkThrottle::new(None, Arc::new(UnavailableBackend)),
        };
        (SessionRegistry::new(context, workers).unwrap(), loopbacks)
    }

    /// Send one request; the body is parsed as JSON when possible
    pub(crate) async fn send(
        app: &axum::Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }
}
