//! Session-layer configuration

use roomlink_core::Config;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Settings every session on this media server shares
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SfuConfig {
    /// Identifier reported to the balancer
    pub server_id: String,
    /// Signaling protocol name returned on room creation
    pub protocol: String,
    /// WebSocket URL returned on room creation
    pub public_ws_url: String,
    pub router_codecs: Vec<Value>,
    pub listen_ip: String,
    pub announced_ip: Option<String>,
    pub initial_available_outgoing_bitrate: u32,
    /// Applied after transport creation (0 = leave the engine default)
    pub max_incoming_bitrate: u32,
    /// Handed to clients in the WebRTC transport reply
    pub ice_servers: Vec<Value>,
    pub default_max_peer_count: u32,
    /// Extra copies of every consumer (0 = one consumer per producer)
    pub consumer_replicas: u32,
    /// Timeout for server-initiated requests to peers (seconds)
    pub request_timeout_secs: u64,
    /// Balancer to notify when a room closes
    pub balancer_url: Option<String>,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self::from_config(&Config::default(), "local")
    }
}

impl SfuConfig {
    #[must_use]
    pub fn from_config(config: &Config, server_id: &str) -> Self {
        Self {
            server_id: server_id.to_string(),
            protocol: config.server.protocol.clone(),
            public_ws_url: config.server.public_ws_url.clone(),
            router_codecs: config.media.router_codecs.clone(),
            listen_ip: config.media.listen_ip.clone(),
            announced_ip: config.media.announced_ip.clone(),
            initial_available_outgoing_bitrate: config.media.initial_available_outgoing_bitrate,
            max_incoming_bitrate: config.media.max_incoming_bitrate,
            ice_servers: config.media.ice_servers.clone(),
            default_max_peer_count: config.media.default_max_peer_count,
            consumer_replicas: config.media.consumer_replicas,
            request_timeout_secs: config.media.request_timeout_secs,
            balancer_url: config.balancer.url.clone(),
        }
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
