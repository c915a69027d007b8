//! HTTP surfaces of roomlink
//!
//! - [`http::create_media_router`]: rooms, broadcasters, health and the
//!   signaling WebSocket of a media server
//! - [`http::create_balancer_router`]: room placement, server registration
//!   and room-closed events of the balancer

pub mod http;
