use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

use model_registry::adapters::{BlobStore, EventBus, HttpBlobStore, LogEventBus, NatsEventBus};
use model_registry::alerting::spawn_scheduled;
use model_registry::config::RegistryConfig;
use model_registry::store::{KvStore, SledStore};
use registry_core::{clear_ready, init_tracing, load_config, mark_not_live, mark_ready};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("model-registry")?;
    let cfg: RegistryConfig = load_config("model-registry")?;
    info!(?cfg, "config loaded");

    let store: Arc<dyn KvStore> = Arc::new(SledStore::open(&cfg.data_dir)?);
    let bus: Arc<dyn EventBus> = match cfg.nats_url.as_deref() {
        Some(url) => match NatsEventBus::connect(url).await {
            Ok(bus) => Arc::new(bus),
            Err(e) => {
                warn!(%url, error=%e, "NATS unavailable - running degraded mode");
                Arc::new(LogEventBus)
            }
        },
        None => {
            info!("no nats_url configured - deployment events are logged only");
            Arc::new(LogEventBus)
        }
    };
    let blob: Arc<dyn BlobStore> = Arc::new(HttpBlobStore::new(cfg.blob_endpoint.as_deref(), Duration::from_millis(cfg.health.blob_timeout_ms))?);

    let services = model_registry::assemble(&cfg, store, bus, blob)?;
    if cfg.health.interval_secs > 0 {
        spawn_scheduled(services.aggregator.clone(), services.evaluator.clone(), Duration::from_secs(cfg.health.interval_secs));
    }

    let app = model_registry::api::router(services.state);
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    mark_ready();
    info!(?addr, "service ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
            info!("shutdown requested - draining");
            clear_ready();
            mark_not_live();
        })
        .await?;
    info!("shutdown");
    Ok(())
}
