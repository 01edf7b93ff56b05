use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use botgate_auth::DEFAULT_KEY_PREFIX;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: SocketAddr,
    pub grpc_bind: Option<SocketAddr>,
    /// Absent means the in-process bus (single-instance deployments, tests).
    pub nats_url: Option<String>,
    /// Absent means the in-memory store.
    pub database_path: Option<PathBuf>,
    pub jwt_secret: String,
    pub api_key_prefix: String,
    pub rate_limit_capacity: u32,
    pub rate_limit_refill_per_sec: u32,
    /// 0 disables the retention sweep.
    pub message_retention_days: u32,
    pub shutdown_grace: Duration,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let bind: SocketAddr = std::env::var("BIND")
            .unwrap_or_else(|_| "0.0.0.0:8080".into())
            .parse()
            .context("invalid BIND address")?;
        let grpc_bind = match std::env::var("GRPC_BIND") {
            Ok(raw) => Some(raw.parse().context("invalid GRPC_BIND address")?),
            Err(_) => None,
        };
        let jwt_secret = std::env::var("JWT_SECRET").unwrap_or_else(|_| {
            tracing::warn!("JWT_SECRET not set, using a development default");
            "botgate-dev-secret".into()
        });
        Ok(Self {
            bind,
            grpc_bind,
            nats_url: std::env::var("NATS_URL").ok().filter(|v| !v.is_empty()),
            database_path: std::env::var("DATABASE_PATH")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            jwt_secret,
            api_key_prefix: std::env::var("API_KEY_PREFIX")
                .unwrap_or_else(|_| DEFAULT_KEY_PREFIX.into()),
            rate_limit_capacity: env_u32("RATE_LIMIT_CAPACITY", 60),
            rate_limit_refill_per_sec: env_u32("RATE_LIMIT_REFILL_PER_SEC", 1),
            message_retention_days: env_u32("MESSAGE_RETENTION_DAYS", 0),
            shutdown_grace: Duration::from_secs(env_u32("SHUTDOWN_GRACE_SECS", 30) as u64),
        })
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
