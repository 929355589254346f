//! Dependency probing and worst-case health aggregation.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use registry_core::METRICS;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::adapters::blob::BlobStore;
use crate::adapters::events::EventBus;
use crate::store::KvStore;

/// Ordered by severity so the worst status is the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus { Healthy, Degraded, Unhealthy }

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self { HealthStatus::Healthy => "healthy", HealthStatus::Degraded => "degraded", HealthStatus::Unhealthy => "unhealthy" }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyHealth {
    pub name: String,
    pub status: HealthStatus,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    pub dependencies: Vec<DependencyHealth>,
}

impl HealthSnapshot {
    pub fn from_dependencies(dependencies: Vec<DependencyHealth>) -> Self {
        Self { status: aggregate(&dependencies), checked_at: Utc::now(), dependencies }
    }

    pub fn dependency(&self, name: &str) -> Option<&DependencyHealth> { self.dependencies.iter().find(|d| d.name == name) }

    pub fn names_with(&self, status: HealthStatus) -> Vec<&str> {
        self.dependencies.iter().filter(|d| d.status == status).map(|d| d.name.as_str()).collect()
    }
}

/// Any unhealthy dependency makes the whole unhealthy, else any degraded one
/// makes it degraded.
pub fn aggregate(deps: &[DependencyHealth]) -> HealthStatus {
    deps.iter().map(|d| d.status).max().unwrap_or(HealthStatus::Healthy)
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeLimits {
    pub timeout: Duration,
    /// Slower successful probes report degraded.
    pub degraded_after: Duration,
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;
    fn limits(&self) -> ProbeLimits;
    async fn check(&self) -> Result<(), String>;
}

pub struct StoreProbe { store: Arc<dyn KvStore>, limits: ProbeLimits }

impl StoreProbe {
    pub fn new(store: Arc<dyn KvStore>, limits: ProbeLimits) -> Self { Self { store, limits } }
}

#[async_trait]
impl HealthProbe for StoreProbe {
    fn name(&self) -> &str { "store" }
    fn limits(&self) -> ProbeLimits { self.limits }
    async fn check(&self) -> Result<(), String> { self.store.ping().await.map_err(|e| e.to_string()) }
}

pub struct EventSinkProbe { bus: Arc<dyn EventBus>, limits: ProbeLimits }

impl EventSinkProbe {
    pub fn new(bus: Arc<dyn EventBus>, limits: ProbeLimits) -> Self { Self { bus, limits } }
}

#[async_trait]
impl HealthProbe for EventSinkProbe {
    fn name(&self) -> &str { "event_sink" }
    fn limits(&self) -> ProbeLimits { self.limits }
    async fn check(&self) -> Result<(), String> { self.bus.ping().await.map_err(|e| e.to_string()) }
}

pub struct BlobProbe { blob: Arc<dyn BlobStore>, limits: ProbeLimits }

impl BlobProbe {
    pub fn new(blob: Arc<dyn BlobStore>, limits: ProbeLimits) -> Self { Self { blob, limits } }
}

#[async_trait]
impl HealthProbe for BlobProbe {
    fn name(&self) -> &str { "blob_storage" }
    fn limits(&self) -> ProbeLimits { self.limits }
    async fn check(&self) -> Result<(), String> { self.blob.ping().await.map_err(|e| e.to_string()) }
}

/// Runs one probe on its own task so a panic is reported as unhealthy
/// instead of unwinding into the caller.
pub async fn run_probe(probe: Arc<dyn HealthProbe>) -> DependencyHealth {
    let name = probe.name().to_string();
    let limits = probe.limits();
    let started = Instant::now();
    let task = tokio::spawn(async move { tokio::time::timeout(limits.timeout, probe.check()).await });
    let outcome = match task.await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(e),
        Ok(Err(_)) => Err(format!("timed out after {}ms", limits.timeout.as_millis())),
        Err(join) => Err(format!("probe aborted: {join}")),
    };
    let elapsed = started.elapsed();
    let latency_ms = elapsed.as_millis() as u64;
    METRICS.probe_latency_ms.with_label_values(&[name.as_str()]).observe(latency_ms as f64);
    let (status, error) = match outcome {
        Ok(()) if elapsed > limits.degraded_after => (HealthStatus::Degraded, None),
        Ok(()) => (HealthStatus::Healthy, None),
        Err(e) => {
            warn!(dependency=%name, error=%e, latency_ms, "health_probe_failed");
            (HealthStatus::Unhealthy, Some(e))
        }
    };
    DependencyHealth { name, status, latency_ms, error }
}

/// Liveness view: binary and always answerable.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleHealth {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct HealthAggregator {
    probes: Vec<Arc<dyn HealthProbe>>,
    simple: Arc<dyn HealthProbe>,
}

impl HealthAggregator {
    /// `simple` backs [`HealthAggregator::simple_check`], normally a store
    /// probe with a short timeout.
    pub fn new(probes: Vec<Arc<dyn HealthProbe>>, simple: Arc<dyn HealthProbe>) -> Self { Self { probes, simple } }

    /// Probes every dependency concurrently; one failing never aborts the others.
    pub async fn check(&self) -> HealthSnapshot {
        let results = join_all(self.probes.iter().cloned().map(run_probe)).await;
        let snapshot = HealthSnapshot::from_dependencies(results);
        debug!(status=%snapshot.status.as_str(), deps=snapshot.dependencies.len(), "health_checked");
        snapshot
    }

    pub async fn simple_check(&self) -> SimpleHealth {
        let dep = run_probe(self.simple.clone()).await;
        let status = if dep.status == HealthStatus::Unhealthy { HealthStatus::Unhealthy } else { HealthStatus::Healthy };
        SimpleHealth { status, timestamp: Utc::now(), error: dep.error }
    }
}
