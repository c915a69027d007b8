//! Health monitoring for media servers
//!
//! Checks every registered server's liveness endpoint on a timer and records
//! the result in the ledger. This is the only writer of `healthy`.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use roomlink_core::notification::join_url;

use crate::error::{Error, Result};
use crate::ledger::{CapacityLedger, ServerRecord};

/// Configuration for liveness checks
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub interval_secs: u64,
    /// Per-check HTTP timeout
    pub timeout_secs: u64,
    /// Path appended to each server's base URL
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_secs: 5,
            path: "/rooms/health".to_string(),
        }
    }
}

/// Periodic checker for registered servers
pub struct HealthMonitor {
    ledger: Arc<dyn CapacityLedger>,
    client: reqwest::Client,
    check_config: HealthCheckConfig,
    cancel_token: CancellationToken,
}

impl HealthMonitor {
    pub fn new(ledger: Arc<dyn CapacityLedger>, check_config: HealthCheckConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(check_config.timeout_secs))
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            ledger,
            client,
            check_config,
            cancel_token: CancellationToken::new(),
        })
    }

    /// Start the check loop
    ///
    /// Returns the `JoinHandle` so the caller can detect panics or task completion.
    /// Use `shutdown()` to stop the loop.
    pub fn start(&self) -> Result<tokio::task::JoinHandle<()>> {
        if self.check_config.interval_secs == 0 {
            return Err(Error::Configuration(
                "health check interval must be non-zero".to_string(),
            ));
        }

        let ledger = self.ledger.clone();
        let client = self.client.clone();
        let path = self.check_config.path.clone();
        let cancel_token = self.cancel_token.clone();
        let mut timer = interval(Duration::from_secs(self.check_config.interval_secs));

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        tracing::info!("Health monitor shutting down");
                        return;
                    }
                    _ = timer.tick() => {
                        Self::check_servers(&ledger, &client, &path).await;
                    }
                }
            }
        });

        Ok(handle)
    }

    /// Run one check round immediately
    pub async fn check_now(&self) {
        Self::check_servers(&self.ledger, &self.client, &self.check_config.path).await;
    }

    /// Stop the check loop
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    async fn check_servers(ledger: &Arc<dyn CapacityLedger>, client: &reqwest::Client, path: &str) {
        let servers = match ledger.servers().await {
            Ok(servers) => servers,
            Err(e) => {
                tracing::error!("Failed to list servers for health check: {}", e);
                return;
            }
        };

        let checks = servers.into_iter().map(|server| async move {
            let healthy = Self::check_server(client, &server, path).await;
            if healthy != server.healthy {
                if healthy {
                    tracing::info!(server_id = %server.server_id, "Server recovered");
                } else {
                    tracing::warn!(server_id = %server.server_id, url = %server.base_url, "Server marked unhealthy");
                }
            }
            if let Err(e) = ledger.set_healthy(&server.server_id, healthy).await {
                tracing::warn!(server_id = %server.server_id, error = %e, "Failed to record health");
            }
        });
        join_all(checks).await;
    }

    async fn check_server(client: &reqwest::Client, server: &ServerRecord, path: &str) -> bool {
        let url = join_url(&server.base_url, path);
        match client.get(&url).send().await {
            Ok(response) => {
                let ok = response.status().is_success();
                if !ok {
                    tracing::debug!(server_id = %server.server_id, status = %response.status(), "Health check failed");
                }
                ok
            }
            Err(e) => {
                tracing::debug!(server_id = %server.server_id, error = %e, "Health check failed");
                false
            }
        }
    }
}
