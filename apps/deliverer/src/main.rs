//! Delivery worker binary: scans for due pending deliveries, then runs the
//! worker pool against the shared job queue until shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use botgate_bus::{InMemoryJobQueue, NatsJobQueue, SharedJobQueue};
use botgate_core::{delivery_queue_name, delivery_result_subject};
use botgate_delivery::{requeue_due, BreakerSettings, WorkerConfig, WorkerPool};
use botgate_store::{MemoryStore, SharedStore, SqliteStore};
use botgate_telemetry::{init_telemetry, TelemetryConfig};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry(TelemetryConfig::from_env(
        "botgate-deliverer",
        env!("CARGO_PKG_VERSION"),
    ))?;

    let store: SharedStore = match std::env::var("DATABASE_PATH").ok().filter(|v| !v.is_empty()) {
        Some(path) => {
            tracing::info!(path = %path, "opening sqlite store");
            Arc::new(SqliteStore::open(&path)?)
        }
        None => {
            tracing::warn!("DATABASE_PATH not set, deliverer state lives in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let queue: SharedJobQueue = match std::env::var("NATS_URL").ok().filter(|v| !v.is_empty()) {
        Some(url) => {
            let client = async_nats::connect(&url).await?;
            tracing::info!(url = %url, "connected to NATS");
            Arc::new(
                NatsJobQueue::new(client, delivery_queue_name(), delivery_result_subject())
                    .await?,
            )
        }
        None => {
            tracing::warn!("NATS_URL not set, using the in-process queue");
            Arc::new(InMemoryJobQueue::new())
        }
    };

    let workers = env_u32("WEBHOOK_WORKERS", 4) as usize;
    let config = WorkerConfig {
        max_retries: env_u32("WEBHOOK_MAX_RETRIES", 5),
        breaker: BreakerSettings {
            failure_threshold: env_u32("BREAKER_FAILURE_THRESHOLD", 5),
            reset_timeout: Duration::from_secs(env_u32("BREAKER_RESET_SECS", 60) as u64),
        },
        ..WorkerConfig::default()
    };
    let grace = Duration::from_secs(env_u32("SHUTDOWN_GRACE_SECS", 30) as u64);

    // Attempts abandoned by a previous process are still pending and due.
    let requeued = requeue_due(&store, &queue, OffsetDateTime::now_utc()).await?;
    tracing::info!(requeued, workers, "deliverer starting");

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let pool = Arc::new(WorkerPool::new(store, queue, config, cancel.clone())?);
    let running = Arc::clone(&pool).run(workers);

    tokio::select! {
        _ = running => {}
        _ = async {
            cancel.cancelled().await;
            tokio::time::sleep(grace).await;
        } => {
            tracing::warn!(grace = ?grace, "shutdown grace elapsed, abandoning in-flight deliveries");
        }
    }

    tracing::info!("deliverer stopped");
    Ok(())
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(term) => term,
                Err(err) => {
                    tracing::error!(error = %err, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::info!("shutdown signal received");
        cancel.cancel();
    });
}
