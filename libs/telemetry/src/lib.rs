//! Lightweight facade around tracing-subscriber setup.
//!
//! ```no_run
//! use botgate_telemetry::{init_telemetry, TelemetryConfig};
//!
//! # fn main() -> anyhow::Result<()> {
//! let cfg = TelemetryConfig::from_env("botgate-gateway", env!("CARGO_PKG_VERSION"));
//! init_telemetry(cfg)?;
//! tracing::info!("telemetry configured");
//! Ok(())
//! # }
//! ```

use std::sync::OnceLock;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static INIT: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: String,
    pub json_logs: bool,
}

impl TelemetryConfig {
    /// Reads `LOG_FORMAT` (`json` default, anything else means text).
    pub fn from_env(service_name: &str, service_version: &str) -> Self {
        let json_logs = std::env::var("LOG_FORMAT")
            .map(|v| !v.eq_ignore_ascii_case("text"))
            .unwrap_or(true);
        Self {
            service_name: service_name.to_string(),
            service_version: service_version.to_string(),
            json_logs,
        }
    }
}

/// Installs the global subscriber once; later calls are no-ops so tests and
/// embedded routers can call it freely.
pub fn init_telemetry(cfg: TelemetryConfig) -> Result<()> {
    if INIT.get().is_some() {
        return Ok(());
    }

    let fmt_layer = if cfg.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .ok();

    tracing::info!(
        service = %cfg.service_name,
        version = %cfg.service_version,
        "telemetry initialised"
    );
    INIT.set(()).ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_defaults_to_json() {
        std::env::remove_var("LOG_FORMAT");
        let cfg = TelemetryConfig::from_env("svc", "0.0.1");
        assert!(cfg.json_logs);
        assert_eq!(cfg.service_name, "svc");
    }

    #[test]
    fn init_is_idempotent() {
        let cfg = TelemetryConfig {
            service_name: "svc".into(),
            service_version: "0".into(),
            json_logs: false,
        };
        init_telemetry(cfg.clone()).expect("first init");
        init_telemetry(cfg).expect("second init");
    }
}
