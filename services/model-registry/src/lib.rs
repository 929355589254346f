//! Tenant-scoped registry of versioned ML model artifacts and their
//! deployment lifecycle.

pub mod access;
pub mod adapters;
pub mod alerting;
pub mod api;
pub mod config;
pub mod deployment;
pub mod error;
pub mod health;
pub mod model;
pub mod store;
pub mod versions;

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::adapters::{BlobStore, EventBus, LogChannel, NotificationChannel, WebhookChannel};
use crate::alerting::{default_rules, AlertEvaluator, CooldownTracker, InProcessCooldowns, StoreCooldowns};
use crate::api::AppState;
use crate::config::RegistryConfig;
use crate::deployment::DeploymentService;
use crate::health::{BlobProbe, EventSinkProbe, HealthAggregator, HealthProbe, StoreProbe};
use crate::store::KvStore;
use crate::versions::ModelVersionService;

pub use crate::error::{RegistryError, Result};

/// Everything the binary wires together.
pub struct Services {
    pub state: AppState,
    pub aggregator: Arc<HealthAggregator>,
    pub evaluator: Arc<AlertEvaluator>,
}

pub fn assemble(cfg: &RegistryConfig, store: Arc<dyn KvStore>, bus: Arc<dyn EventBus>, blob: Arc<dyn BlobStore>) -> anyhow::Result<Services> {
    let versions = Arc::new(ModelVersionService::new(store.clone(), blob.clone(), cfg.verify_artifacts));
    let deployments = Arc::new(DeploymentService::new(store.clone(), bus.clone(), cfg.deployment_subject.clone()));

    let probes: Vec<Arc<dyn HealthProbe>> = vec![
        Arc::new(StoreProbe::new(store.clone(), cfg.health.store_limits())),
        Arc::new(EventSinkProbe::new(bus, cfg.health.sink_limits())),
        Arc::new(BlobProbe::new(blob, cfg.health.blob_limits())),
    ];
    let simple = Arc::new(StoreProbe::new(store.clone(), cfg.health.simple_limits()));
    let aggregator = Arc::new(HealthAggregator::new(probes, simple));

    let mut channels: Vec<Arc<dyn NotificationChannel>> = vec![Arc::new(LogChannel)];
    for url in &cfg.alerts.webhooks {
        channels.push(Arc::new(WebhookChannel::new(url, Duration::from_millis(cfg.alerts.webhook_timeout_ms))?));
    }
    let cooldowns: Arc<dyn CooldownTracker> = if cfg.alerts.shared_cooldowns {
        Arc::new(StoreCooldowns::new(store))
    } else {
        Arc::new(InProcessCooldowns::default())
    };
    info!(channels = channels.len(), shared_cooldowns = cfg.alerts.shared_cooldowns, "alerting_configured");
    let evaluator = Arc::new(AlertEvaluator::new(default_rules(Duration::from_secs(cfg.alerts.cooldown_secs)), cooldowns, channels));

    let state = AppState { versions, deployments, health: aggregator.clone() };
    Ok(Services { state, aggregator, evaluator })
}
