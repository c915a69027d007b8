//! Balancer process

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use roomlink_api::http::create_balancer_router;
use roomlink_cluster::{
    CapacityLedger, HealthMonitor, HealthCheckConfig, HttpRoomForwarder, MemoryLedger, PlacementScheduler,
    RedisLedger,
};
use roomlink_core::Config;

use crate::shutdown_signal;

pub async fn run(config: Config) -> Result<()> {
    let ledger: Arc<dyn CapacityLedger> = if config.redis.url.is_empty() {
        info!("Redis not configured, keeping the capacity ledger in memory");
        Arc::new(MemoryLedger::new())
    } else {
        info!(key_prefix = %config.redis.key_prefix, "Using Redis capacity ledger");
        Arc::new(RedisLedger::new(&config.redis.url, config.redis.key_prefix.clone())?)
    };

    let forwarder = HttpRoomForwarder::new(Duration::from_secs(config.balancer.forward_timeout_secs))?;
    let scheduler = Arc::new(PlacementScheduler::new(ledger.clone(), Arc::new(forwarder)));

    let monitor = HealthMonitor::new(
        ledger,
        HealthCheckConfig {
            interval_secs: config.balancer.health_check_interval_secs,
            timeout_secs: config.balancer.health_check_timeout_secs,
            path: config.balancer.health_check_path.clone(),
        },
    )?;
    let monitor_task = monitor.start()?;
    info!(
        interval_secs = config.balancer.health_check_interval_secs,
        path = %config.balancer.health_check_path,
        "Health monitor started"
    );

    let addr = config.balancer_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind balancer address {addr}: {e}"))?;
    info!("Balancer listening on {}", addr);

    if let Err(e) = axum::serve(listener, create_balancer_router(scheduler))
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("HTTP server error: {}", e);
    }

    monitor.shutdown();
    if let Err(e) = monitor_task.await {
        error!("Health monitor task failed: {}", e);
    }

    info!("Balancer shut down gracefully");
    Ok(())
}
