//! Core shared utilities for registry services: tracing, configuration,
//! liveness/readiness flags and Prometheus exposition.

use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod metrics;
pub use metrics::{render_metrics, RegistryMetrics, METRICS};

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static NODE_LIVENESS: AtomicBool = AtomicBool::new(true);
static NODE_READINESS: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config error: {0}")] Config(#[from] config::ConfigError),
    #[error("tracing init failed: {0}")] Tracing(String),
    #[error("metrics error: {0}")] Metrics(#[from] prometheus::Error),
}

pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }
pub fn mark_not_live() { NODE_LIVENESS.store(false, Ordering::SeqCst); }
pub fn is_live() -> bool { NODE_LIVENESS.load(Ordering::SeqCst) }
pub fn is_ready() -> bool { NODE_READINESS.load(Ordering::SeqCst) }

/// Install the global subscriber. JSON output when `REGISTRY_JSON_LOG` is `1`/`true`.
pub fn init_tracing(service: &str) -> Result<(), CoreError> {
    TRACING_INIT.get_or_try_init(|| -> Result<(), CoreError> {
        let json = std::env::var("REGISTRY_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);
        let res = if json {
            registry
                .with(tracing_subscriber::fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false))
                .try_init()
        } else {
            registry
                .with(tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(false).with_line_number(true))
                .try_init()
        };
        res.map_err(|e| CoreError::Tracing(e.to_string()))
    })?;
    info!(target: "registry-core", service, "tracing initialized");
    Ok(())
}

/// Layered config: serde defaults of `T`, then the file named by
/// `REGISTRY_CONFIG_FILE` (optional), then `REGISTRY__SECTION__KEY` env vars.
pub fn load_config<T: DeserializeOwned>(service: &str) -> Result<T, CoreError> {
    let mut builder = config::Config::builder().set_default("service_name", service)?;
    if let Ok(file) = std::env::var("REGISTRY_CONFIG_FILE") {
        builder = builder.add_source(config::File::with_name(&file).required(false));
    }
    builder = builder.add_source(config::Environment::with_prefix("REGISTRY").separator("__").try_parsing(true));
    let cfg = builder.build()?;
    Ok(cfg.try_deserialize()?)
}
