//! Gateway binary: ingests Telegram updates, serves the client APIs, and
//! fans events out to WebSocket (and optionally gRPC) subscribers.

use std::sync::Arc;

use anyhow::Result;
use botgate_bus::{
    InMemoryEventBus, InMemoryJobQueue, InMemoryKvStore, NatsEventBus, NatsJobQueue, NatsKvStore,
    SharedEventBus, SharedJobQueue, SharedKvStore,
};
use botgate_core::{delivery_queue_name, delivery_result_subject};
use botgate_gateway::{build_router, config::GatewayConfig, AppState, PrincipalRateLimiter};
use botgate_store::{GatewayStore as _, MemoryStore, SharedStore, SqliteStore};
use botgate_telemetry::{init_telemetry, TelemetryConfig};
use time::Duration as TimeDuration;
use tokio_util::sync::CancellationToken;

const ACL_CACHE_NAMESPACE: &str = "botgate-acl";
const RETENTION_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry(TelemetryConfig::from_env(
        "botgate-gateway",
        env!("CARGO_PKG_VERSION"),
    ))?;
    let config = GatewayConfig::from_env()?;

    let store: SharedStore = match &config.database_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "opening sqlite store");
            Arc::new(SqliteStore::open(path)?)
        }
        None => {
            tracing::warn!("DATABASE_PATH not set, state lives in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let (bus, kv, queue): (SharedEventBus, SharedKvStore, SharedJobQueue) = match &config.nats_url
    {
        Some(url) => {
            let client = async_nats::connect(url).await?;
            let js = async_nats::jetstream::new(client.clone());
            tracing::info!(url = %url, "connected to NATS");
            (
                Arc::new(NatsEventBus::new(client.clone())),
                Arc::new(NatsKvStore::new(&js, ACL_CACHE_NAMESPACE).await?),
                Arc::new(
                    NatsJobQueue::new(client, delivery_queue_name(), delivery_result_subject())
                        .await?,
                ),
            )
        }
        None => {
            tracing::warn!("NATS_URL not set, using the in-process bus");
            (
                Arc::new(InMemoryEventBus::new()),
                Arc::new(InMemoryKvStore::new()),
                Arc::new(InMemoryJobQueue::new()),
            )
        }
    };

    let limiter = PrincipalRateLimiter::new(
        config.rate_limit_capacity,
        config.rate_limit_refill_per_sec,
    );
    let state = AppState::assemble(
        Arc::clone(&store),
        bus,
        kv,
        queue,
        &config.jwt_secret,
        &config.api_key_prefix,
        limiter,
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    if config.message_retention_days > 0 {
        spawn_retention_sweep(
            Arc::clone(&store),
            config.message_retention_days,
            cancel.clone(),
        );
    }

    #[cfg(feature = "grpc")]
    if let Some(addr) = config.grpc_bind {
        let grpc_state = state.clone();
        let grpc_cancel = cancel.clone();
        tokio::spawn(async move {
            tracing::info!(%addr, "grpc stream listening");
            let served = tonic::transport::Server::builder()
                .add_service(botgate_gateway::grpc::server(grpc_state))
                .serve_with_shutdown(addr, grpc_cancel.cancelled());
            if let Err(err) = served.await {
                tracing::error!(error = %err, "grpc server failed");
            }
        });
    }

    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!(addr = %config.bind, "gateway listening");

    let serve_cancel = cancel.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { serve_cancel.cancelled().await });

    let grace = config.shutdown_grace;
    tokio::select! {
        result = server => result?,
        _ = async {
            cancel.cancelled().await;
            tokio::time::sleep(grace).await;
        } => {
            tracing::warn!(grace = ?grace, "shutdown grace elapsed, abandoning in-flight work");
        }
    }

    state.hub.shutdown().await;
    tracing::info!("gateway stopped");
    Ok(())
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

fn spawn_retention_sweep(store: SharedStore, retention_days: u32, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let cutoff =
                        time::OffsetDateTime::now_utc() - TimeDuration::days(retention_days as i64);
                    match store.delete_messages_before(cutoff).await {
                        Ok(0) => {}
                        Ok(removed) => tracing::info!(removed, "retention sweep removed messages"),
                        Err(err) => tracing::error!(error = %err, "retention sweep failed"),
                    }
                }
            }
        }
    });
}
