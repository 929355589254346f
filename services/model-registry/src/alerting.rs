//! Alert rules over health snapshots, cooldown suppression and channel fan-out.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use registry_core::METRICS;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapters::notify::NotificationChannel;
use crate::health::{HealthAggregator, HealthSnapshot, HealthStatus};
use crate::store::{KvStore, StoreError, WriteBatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity { Info, Warning, Critical }

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub health_status: HealthStatus,
    pub fired_at: DateTime<Utc>,
}

type Predicate = Arc<dyn Fn(&HealthSnapshot) -> bool + Send + Sync>;

/// Named predicate over a snapshot. Templates may use `{status}`,
/// `{unhealthy}` and `{degraded}`.
#[derive(Clone)]
pub struct AlertRule {
    pub name: String,
    pub severity: Severity,
    pub message_template: String,
    pub cooldown: Duration,
    predicate: Predicate,
}

impl AlertRule {
    pub fn new(
        name: &str,
        severity: Severity,
        message_template: &str,
        cooldown: Duration,
        predicate: impl Fn(&HealthSnapshot) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self { name: name.into(), severity, message_template: message_template.into(), cooldown, predicate: Arc::new(predicate) }
    }

    pub fn holds(&self, snapshot: &HealthSnapshot) -> bool { (self.predicate)(snapshot) }

    pub fn render(&self, snapshot: &HealthSnapshot) -> String {
        self.message_template
            .replace("{status}", snapshot.status.as_str())
            .replace("{unhealthy}", &snapshot.names_with(HealthStatus::Unhealthy).join(", "))
            .replace("{degraded}", &snapshot.names_with(HealthStatus::Degraded).join(", "))
    }
}

pub fn default_rules(cooldown: Duration) -> Vec<AlertRule> {
    vec![
        AlertRule::new("registry_unhealthy", Severity::Critical, "model registry is {status}; failing: {unhealthy}", cooldown,
            |s| s.status == HealthStatus::Unhealthy),
        AlertRule::new("store_unavailable", Severity::Critical, "model store probe failing", cooldown,
            |s| s.dependency("store").map_or(false, |d| d.status == HealthStatus::Unhealthy)),
        AlertRule::new("registry_degraded", Severity::Warning, "model registry is degraded; slow: {degraded}", cooldown,
            |s| s.status == HealthStatus::Degraded),
    ]
}

/// Decides whether a rule may fire now and, if so, starts its cooldown.
#[async_trait]
pub trait CooldownTracker: Send + Sync {
    async fn try_acquire(&self, rule: &str, now: DateTime<Utc>, cooldown: Duration) -> bool;
}

fn until(now: DateTime<Utc>, cooldown: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(cooldown).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Per-process map; instances behind a load balancer each keep their own.
#[derive(Default)]
pub struct InProcessCooldowns { until: Mutex<HashMap<String, DateTime<Utc>>> }

#[async_trait]
impl CooldownTracker for InProcessCooldowns {
    async fn try_acquire(&self, rule: &str, now: DateTime<Utc>, cooldown: Duration) -> bool {
        let mut map = self.until.lock();
        if map.get(rule).map_or(false, |u| *u > now) { return false; }
        map.insert(rule.to_string(), until(now, cooldown));
        true
    }
}

pub const COOLDOWN_TABLE: &str = "alert_cooldowns";

#[derive(Serialize, Deserialize)]
struct CooldownRecord { until: DateTime<Utc> }

/// Cooldowns in the shared store. The guarded write means only one of
/// several instances wins a given window.
pub struct StoreCooldowns { store: Arc<dyn KvStore> }

impl StoreCooldowns {
    pub fn new(store: Arc<dyn KvStore>) -> Self { Self { store } }

    async fn acquire(&self, rule: &str, now: DateTime<Utc>, cooldown: Duration) -> Result<bool, StoreError> {
        let current = self.store.get(COOLDOWN_TABLE, rule).await?;
        let batch = match &current {
            Some(raw) => {
                let rec: CooldownRecord = serde_json::from_slice(raw).map_err(|e| StoreError::Corrupt { key: rule.to_string(), reason: e.to_string() })?;
                if rec.until > now { return Ok(false); }
                WriteBatch::new().require_equals(COOLDOWN_TABLE, rule, raw.clone())
            }
            None => WriteBatch::new().require_absent(COOLDOWN_TABLE, rule),
        };
        let next = serde_json::to_vec(&CooldownRecord { until: until(now, cooldown) })
            .map_err(|e| StoreError::Corrupt { key: rule.to_string(), reason: e.to_string() })?;
        match self.store.commit(batch.put(COOLDOWN_TABLE, rule, next, vec![])).await {
            Ok(()) => Ok(true),
            Err(StoreError::PreconditionFailed(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl CooldownTracker for StoreCooldowns {
    /// Fails open: if the store is down the alert still goes out.
    async fn try_acquire(&self, rule: &str, now: DateTime<Utc>, cooldown: Duration) -> bool {
        match self.acquire(rule, now, cooldown).await {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(%rule, error=%e, "cooldown_store_unavailable");
                true
            }
        }
    }
}

pub struct AlertEvaluator {
    rules: Vec<AlertRule>,
    cooldowns: Arc<dyn CooldownTracker>,
    channels: Vec<Arc<dyn NotificationChannel>>,
}

impl AlertEvaluator {
    pub fn new(rules: Vec<AlertRule>, cooldowns: Arc<dyn CooldownTracker>, channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        Self { rules, cooldowns, channels }
    }

    /// Rules run in order; returns the alerts that fired.
    pub async fn evaluate(&self, snapshot: &HealthSnapshot) -> Vec<Alert> {
        self.evaluate_at(snapshot, Utc::now()).await
    }

    pub async fn evaluate_at(&self, snapshot: &HealthSnapshot, now: DateTime<Utc>) -> Vec<Alert> {
        let mut fired = Vec::new();
        for rule in &self.rules {
            if !rule.holds(snapshot) { continue; }
            if !self.cooldowns.try_acquire(&rule.name, now, rule.cooldown).await {
                debug!(rule=%rule.name, "alert_suppressed_cooldown");
                continue;
            }
            let alert = Alert { rule: rule.name.clone(), severity: rule.severity, message: rule.render(snapshot), health_status: snapshot.status, fired_at: now };
            METRICS.alerts_fired_total.with_label_values(&[alert.rule.as_str()]).inc();
            info!(rule=%alert.rule, severity=?alert.severity, "alert_fired");
            self.dispatch(&alert).await;
            fired.push(alert);
        }
        fired
    }

    /// Concurrent delivery; a failing channel is logged and never stops the rest.
    async fn dispatch(&self, alert: &Alert) {
        join_all(self.channels.iter().map(|ch| async move {
            if let Err(e) = ch.send(alert).await {
                error!(channel=%ch.channel_name(), rule=%alert.rule, error=%e, "notification_failed");
                METRICS.notification_failures_total.with_label_values(&[ch.channel_name()]).inc();
            }
        }))
        .await;
    }
}

/// Periodic probe-and-alert loop.
pub fn spawn_scheduled(aggregator: Arc<HealthAggregator>, evaluator: Arc<AlertEvaluator>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let snapshot = aggregator.check().await;
            let fired = evaluator.evaluate(&snapshot).await;
            debug!(status=%snapshot.status.as_str(), fired=fired.len(), "scheduled_health_evaluation");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::notify::NotifyError;
    use crate::health::DependencyHealth;
    use crate::store::SledStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingChannel { name: &'static str, sent: AtomicUsize, fail: bool }

    impl CountingChannel {
        fn new(name: &'static str, fail: bool) -> Arc<Self> { Arc::new(Self { name, sent: AtomicUsize::new(0), fail }) }
    }

    #[async_trait]
    impl NotificationChannel for CountingChannel {
        async fn send(&self, _alert: &Alert) -> Result<(), NotifyError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            if self.fail { Err(NotifyError::Status(500)) } else { Ok(()) }
        }
        fn channel_name(&self) -> &str { self.name }
    }

    fn snapshot(store: HealthStatus, sink: HealthStatus) -> HealthSnapshot {
        HealthSnapshot::from_dependencies(vec![
            DependencyHealth { name: "store".into(), status: store, latency_ms: 3, error: None },
            DependencyHealth { name: "event_sink".into(), status: sink, latency_ms: 3, error: None },
        ])
    }

    #[tokio::test]
    async fn rule_fires_once_per_cooldown_window() {
        let ch = CountingChannel::new("count", false);
        let eval = AlertEvaluator::new(default_rules(Duration::from_secs(300)), Arc::new(InProcessCooldowns::default()), vec![ch.clone() as Arc<dyn NotificationChannel>]);
        let bad = snapshot(HealthStatus::Healthy, HealthStatus::Unhealthy);
        let t0 = Utc::now();
        let first = eval.evaluate_at(&bad, t0).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].rule, "registry_unhealthy");
        assert_eq!(first[0].message, "model registry is unhealthy; failing: event_sink");
        assert!(eval.evaluate_at(&bad, t0 + chrono::Duration::seconds(60)).await.is_empty());
        assert_eq!(eval.evaluate_at(&bad, t0 + chrono::Duration::seconds(301)).await.len(), 1);
        assert_eq!(ch.sent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rules_fire_in_order_and_healthy_fires_nothing() {
        let eval = AlertEvaluator::new(default_rules(Duration::from_secs(60)), Arc::new(InProcessCooldowns::default()), vec![]);
        assert!(eval.evaluate(&snapshot(HealthStatus::Healthy, HealthStatus::Healthy)).await.is_empty());
        let fired = eval.evaluate(&snapshot(HealthStatus::Unhealthy, HealthStatus::Degraded)).await;
        assert_eq!(fired.iter().map(|a| a.rule.as_str()).collect::<Vec<_>>(), vec!["registry_unhealthy", "store_unavailable"]);
    }

    #[tokio::test]
    async fn broken_channel_does_not_block_others() {
        let broken = CountingChannel::new("broken", true);
        let good = CountingChannel::new("good", false);
        let eval = AlertEvaluator::new(default_rules(Duration::from_secs(60)), Arc::new(InProcessCooldowns::default()), vec![broken.clone() as Arc<dyn NotificationChannel>, good.clone()]);
        let fired = eval.evaluate(&snapshot(HealthStatus::Degraded, HealthStatus::Healthy)).await;
        assert_eq!(fired.len(), 1);
        assert_eq!(broken.sent.load(Ordering::SeqCst), 1);
        assert_eq!(good.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn store_cooldowns_are_shared_between_evaluators() {
        let store: Arc<dyn KvStore> = Arc::new(SledStore::temporary().unwrap());
        let a = StoreCooldowns::new(store.clone());
        let b = StoreCooldowns::new(store);
        let now = Utc::now();
        assert!(a.try_acquire("registry_unhealthy", now, Duration::from_secs(300)).await);
        assert!(!b.try_acquire("registry_unhealthy", now + chrono::Duration::seconds(10), Duration::from_secs(300)).await);
        assert!(b.try_acquire("registry_unhealthy", now + chrono::Duration::seconds(301), Duration::from_secs(300)).await);
        assert!(a.try_acquire("store_unavailable", now, Duration::from_secs(300)).await);
    }
}
