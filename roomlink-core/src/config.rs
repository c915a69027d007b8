use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;

/// Application configuration shared by the media server and the balancer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub media: MediaConfig,
    pub balancer: BalancerConfig,
    pub redis: RedisConfig,
    pub notifications: NotificationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    /// Identifier reported to the balancer; generated from the hostname when empty
    pub server_id: String,
    /// Base URL the balancer uses to reach this instance
    pub public_url: String,
    /// WebSocket URL handed to clients in room creation replies
    pub public_ws_url: String,
    /// Signaling protocol name handed to clients in room creation replies
    pub protocol: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 3000,
            server_id: String::new(),
            public_url: "http://127.0.0.1:3000".to_string(),
            public_ws_url: "ws://127.0.0.1:3000".to_string(),
            protocol: "protoo".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Number of media workers (0 = one per CPU)
    pub num_workers: usize,
    pub router_codecs: Vec<Value>,
    pub listen_ip: String,
    pub announced_ip: Option<String>,
    pub initial_available_outgoing_bitrate: u32,
    /// Applied to every WebRTC transport after creation (0 = disabled)
    pub max_incoming_bitrate: u32,
    pub ice_servers: Vec<Value>,
    pub default_max_peer_count: u32,
    pub consumer_replicas: u32,
    /// Timeout for server-initiated requests to peers
    pub request_timeout_secs: u64,
    /// Shared secret for the network throttle requests (unset = always rejected)
    pub network_throttle_secret: Option<String>,
    /// Interface the throttle backend impairs; empty disables the `tc` backend
    pub throttle_interface: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            router_codecs: default_router_codecs(),
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: None,
            initial_available_outgoing_bitrate: 1_000_000,
            max_incoming_bitrate: 5_000_000,
            ice_servers: Vec::new(),
            default_max_peer_count: 2,
            consumer_replicas: 0,
            request_timeout_secs: 20,
            network_throttle_secret: None,
            throttle_interface: String::new(),
        }
    }
}

fn default_router_codecs() -> Vec<Value> {
    vec![
        json!({"kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2}),
        json!({"kind": "video", "mimeType": "video/VP8", "clockRate": 90000,
               "parameters": {"x-google-start-bitrate": 1000}}),
        json!({"kind": "video", "mimeType": "video/VP9", "clockRate": 90000,
               "parameters": {"profile-id": 2, "x-google-start-bitrate": 1000}}),
        json!({"kind": "video", "mimeType": "video/h264", "clockRate": 90000,
               "parameters": {"packetization-mode": 1, "profile-level-id": "42e01f",
                              "level-asymmetry-allowed": 1, "x-google-start-bitrate": 1000}}),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Balancer base URL used by media servers for registration and room-closed events
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub health_check_interval_secs: u64,
    pub health_check_timeout_secs: u64,
    pub health_check_path: String,
    /// Timeout for forwarding room creation to a media server
    pub forward_timeout_secs: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "0.0.0.0".to_string(),
            port: 4000,
            health_check_interval_secs: 30,
            health_check_timeout_secs: 5,
            health_check_path: "/rooms/health".to_string(),
            forward_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Empty URL keeps the capacity ledger in memory (single balancer only)
    pub url: String,
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            key_prefix: "roomlink:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub timeout_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { timeout_secs: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    ///
    /// Priority order:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // ROOMLINK__SERVER__HTTP_PORT=3000, ROOMLINK__MEDIA__NUM_WORKERS=4, ...
        builder = builder.add_source(
            Environment::with_prefix("ROOMLINK")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    #[must_use]
    pub fn balancer_address(&self) -> String {
        format!("{}:{}", self.balancer.host, self.balancer.port)
    }

    /// Number of media workers to spawn, resolving 0 to the CPU count
    #[must_use]
    pub fn worker_count(&self) -> usize {
        if self.media.num_workers > 0 {
            return self.media.num_workers;
        }
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }

    /// Check every section and report all problems at once
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("server.http_port must be non-zero".to_string());
        }
        if !self.server.public_url.starts_with("http://") && !self.server.public_url.starts_with("https://") {
            errors.push(format!(
                "server.public_url must be an http(s) URL, got '{}'",
                self.server.public_url
            ));
        }
        if self.server.public_ws_url.is_empty() {
            errors.push("server.public_ws_url must not be empty".to_string());
        }
        if self.media.default_max_peer_count < 2 {
            errors.push("media.default_max_peer_count must be at least 2".to_string());
        }
        if self.media.request_timeout_secs == 0 {
            errors.push("media.request_timeout_secs must be non-zero".to_string());
        }
        if self.balancer.port == 0 {
            errors.push("balancer.port must be non-zero".to_string());
        }
        if self.balancer.health_check_interval_secs == 0 {
            errors.push("balancer.health_check_interval_secs must be non-zero".to_string());
        }
        if !self.balancer.health_check_path.starts_with('/') {
            errors.push("balancer.health_check_path must start with '/'".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.media.default_max_peer_count, 2);
        assert_eq!(config.media.max_incoming_bitrate, 5_000_000);
        assert_eq!(config.balancer.health_check_interval_secs, 30);
        assert!(config.redis.url.is_empty());
        assert_eq!(config.media.router_codecs.len(), 4);
    }

    #[test]
    fn test_addresses() {
        let mut config = Config::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.http_port = 3443;
        config.balancer.port = 4001;

        assert_eq!(config.http_address(), "127.0.0.1:3443");
        assert_eq!(config.balancer_address(), "0.0.0.0:4001");
    }

    #[test]
    fn test_worker_count_resolves_auto() {
        let mut config = Config::default();
        assert!(config.worker_count() >= 1);

        config.media.num_workers = 3;
        assert_eq!(config.worker_count(), 3);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.server.public_url = "ftp://nope".to_string();
        config.media.default_max_peer_count = 1;
        config.logging.format = "xml".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("public_url")));
        assert!(errors.iter().any(|e| e.contains("default_max_peer_count")));
        assert!(errors.iter().any(|e| e.contains("logging.format")));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = Config::load(Some("/definitely/not/here.yaml")).unwrap();
        assert_eq!(config.balancer.health_check_path, "/rooms/health");
    }
}
