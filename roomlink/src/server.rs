//! Media server process

use anyhow::Result;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use roomlink_api::http::create_media_router;
use roomlink_core::{bootstrap::resolve_server_id, Config, NotificationSink};
use roomlink_sfu::engine::loopback::LoopbackWorker;
use roomlink_sfu::engine::MediaWorker;
use roomlink_sfu::{NetworkThrottle, SessionContext, SessionRegistry, SfuConfig};

use crate::shutdown_signal;

pub async fn run(config: Config) -> Result<()> {
    let server_id = resolve_server_id(&config);
    let sfu_config = Arc::new(SfuConfig::from_config(&config, &server_id));
    let notifier = NotificationSink::new(Duration::from_secs(config.notifications.timeout_secs))?;

    let throttle = NetworkThrottle::from_settings(
        config.media.network_throttle_secret.clone(),
        &config.media.throttle_interface,
    );
    if config.media.throttle_interface.is_empty() {
        info!("Network throttle backend disabled (no interface configured)");
    }

    let worker_count = config.worker_count();
    let workers: Vec<Arc<dyn MediaWorker>> = (0..worker_count)
        .map(|i| LoopbackWorker::new(format!("worker-{i}")) as Arc<dyn MediaWorker>)
        .collect();
    info!(workers = worker_count, "Media workers started");
    warn!(
        engine = "loopback",
        "Media workers run the in-process loopback engine: rooms and signaling work end to end but no media is forwarded"
    );

    let registry = SessionRegistry::new(
        SessionContext {
            config: sfu_config,
            notifier: notifier.clone(),
            throttle,
        },
        workers,
    )?;

    if let Some(balancer_url) = &config.balancer.url {
        match notifier
            .register_server(balancer_url, &server_id, &config.server.public_url, worker_count)
            .await
        {
            Ok(()) => info!(server_id = %server_id, balancer = %balancer_url, "Registered with balancer"),
            Err(e) => warn!(server_id = %server_id, error = %e, "Balancer registration failed, continuing"),
        }
    }

    let http_addr = config.http_address();
    let listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_addr}: {e}"))?;
    info!(server_id = %server_id, "HTTP server listening on {}", http_addr);

    let server = axum::serve(listener, create_media_router(registry.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .into_future();

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("HTTP server error: {}", e);
            }
        }
        (worker_id, reason) = registry.worker_died() => {
            error!(worker_id = %worker_id, reason = %reason, "Media worker died, exiting");
            std::process::exit(1);
        }
    }

    let stats = registry.stats();
    info!(rooms = stats.active_rooms, peers = stats.total_peers, "Closing rooms");
    registry.close_all();
    // Room-closed notifications are in flight
    tokio::time::sleep(Duration::from_millis(200)).await;

    info!("Media server shut down gracefully");
    Ok(())
}
