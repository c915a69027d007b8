//! Process-wide network impairment
//!
//! At most one impairment is active per process. The cell remembers which
//! room applied it so closing that room lifts it again.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::types::RoomId;

#[derive(Debug, Error)]
pub enum ThrottleError {
    #[error("Operation NOT allowed. Invalid secret.")]
    Forbidden,

    #[error("{0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleParams {
    /// bits per second
    pub uplink: u64,
    /// bits per second
    pub downlink: u64,
    /// milliseconds
    pub rtt: u64,
    /// percent
    pub packet_loss: f64,
}

impl ThrottleParams {
    pub const DEFAULT_UPLINK: u64 = 1_000_000;
    pub const DEFAULT_DOWNLINK: u64 = 1_000_000;

    #[must_use]
    pub fn with_defaults(uplink: Option<u64>, downlink: Option<u64>, rtt: Option<u64>, packet_loss: Option<f64>) -> Self {
        Self {
            uplink: uplink.unwrap_or(Self::DEFAULT_UPLINK),
            downlink: downlink.unwrap_or(Self::DEFAULT_DOWNLINK),
            rtt: rtt.unwrap_or(0),
            packet_loss: packet_loss.unwrap_or(0.0),
        }
    }
}

/// Applies and removes the actual impairment
#[async_trait]
pub trait ThrottleBackend: Send + Sync {
    async fn start(&self, params: &ThrottleParams) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;
}

/// Shapes one interface with `tc` + `netem`
pub struct NetemBackend {
    interface: String,
}

impl NetemBackend {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }

    async fn tc(&self, args: &[&str]) -> anyhow::Result<()> {
        let output = Command::new("tc").args(args).output().await?;
        if !output.status.success() {
            anyhow::bail!(
                "tc {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ThrottleBackend for NetemBackend {
    async fn start(&self, params: &ThrottleParams) -> anyhow::Result<()> {
        // netem shapes egress only, so the tighter of both directions applies
        let rate = format!("{}bit", params.uplink.min(params.downlink));
        let delay = format!("{}ms", params.rtt / 2);
        let loss = format!("{}%", params.packet_loss);
        self.tc(&[
            "qdisc",
            "replace",
            "dev",
            self.interface.as_str(),
            "root",
            "netem",
            "delay",
            delay.as_str(),
            "loss",
            loss.as_str(),
            "rate",
            rate.as_str(),
        ])
        .await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.tc(&["qdisc", "del", "dev", self.interface.as_str(), "root"]).await
    }
}

/// Backend for hosts where impairment is not set up
pub struct UnavailableBackend;

#[async_trait]
impl ThrottleBackend for UnavailableBackend {
    async fn start(&self, _params: &ThrottleParams) -> anyhow::Result<()> {
        anyhow::bail!("network throttling is not available on this server")
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct ActiveThrottle {
    owner: RoomId,
    params: ThrottleParams,
}

pub struct NetworkThrottle {
    secret: Option<String>,
    backend: Arc<dyn ThrottleBackend>,
    active: Mutex<Option<ActiveThrottle>>,
}

impl NetworkThrottle {
    pub fn new(secret: Option<String>, backend: Arc<dyn ThrottleBackend>) -> Arc<Self> {
        Arc::new(Self {
            secret,
            backend,
            active: Mutex::new(None),
        })
    }

    /// Picks the `tc` backend when an interface is configured
    pub fn from_settings(secret: Option<String>, interface: &str) -> Arc<Self> {
        let backend: Arc<dyn ThrottleBackend> = if interface.is_empty() {
            Arc::new(UnavailableBackend)
        } else {
            Arc::new(NetemBackend::new(interface))
        };
        Self::new(secret, backend)
    }

    fn check_secret(&self, provided: Option<&str>) -> Result<(), ThrottleError> {
        match (&self.secret, provided) {
            (Some(expected), Some(provided)) if expected == provided => Ok(()),
            _ => Err(ThrottleError::Forbidden),
        }
    }

    pub async fn apply(
        &self,
        owner: &RoomId,
        secret: Option<&str>,
        params: ThrottleParams,
    ) -> Result<(), ThrottleError> {
        self.check_secret(secret)?;

        let mut active = self.active.lock().await;
        self.backend
            .start(&params)
            .await
            .map_err(|e| ThrottleError::Backend(e.to_string()))?;

        info!(room_id = %owner, ?params, "Network throttle enabled");
        *active = Some(ActiveThrottle {
            owner: owner.clone(),
            params,
        });
        Ok(())
    }

    pub async fn reset(&self, secret: Option<&str>) -> Result<(), ThrottleError> {
        self.check_secret(secret)?;

        let mut active = self.active.lock().await;
        self.backend
            .stop()
            .await
            .map_err(|e| ThrottleError::Backend(e.to_string()))?;

        info!("Network throttle disabled");
        *active = None;
        Ok(())
    }

    /// Lift the impairment in the background if `owner` applied it
    pub fn release(self: &Arc<Self>, owner: &RoomId) {
        let throttle = self.clone();
        let owner = owner.clone();
        tokio::spawn(async move {
            let mut active = throttle.active.lock().await;
            if active.as_ref().is_some_and(|a| a.owner == owner) {
                match throttle.backend.stop().await {
                    Ok(()) => info!(room_id = %owner, "Network throttle released with its room"),
                    Err(e) => warn!(room_id = %owner, error = %e, "Failed to release network throttle"),
                }
                *active = None;
            }
        });
    }

    pub async fn active(&self) -> Option<(RoomId, ThrottleParams)> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|a| (a.owner.clone(), a.params))
    }
}
