//! Registry metric groups, registered once into the default Prometheus registry.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec, TextEncoder,
};

use crate::CoreError;

pub struct RegistryMetrics {
    pub operations_total: IntCounterVec,
    pub deployment_events_total: IntCounterVec,
    pub probe_latency_ms: HistogramVec,
    pub alerts_fired_total: IntCounterVec,
    pub notification_failures_total: IntCounterVec,
}

pub static METRICS: Lazy<RegistryMetrics> = Lazy::new(|| RegistryMetrics {
    operations_total: register_int_counter_vec!(
        "registry_operations_total",
        "Registry operations by name and outcome",
        &["op", "outcome"]
    )
    .expect("registry_operations_total registration"),
    deployment_events_total: register_int_counter_vec!(
        "registry_deployment_events_total",
        "Deployment history entries appended, by resulting status",
        &["status"]
    )
    .expect("registry_deployment_events_total registration"),
    probe_latency_ms: register_histogram_vec!(
        "registry_health_probe_latency_ms",
        "Dependency probe latency in milliseconds",
        &["dependency"],
        vec![5.0, 25.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0]
    )
    .expect("registry_health_probe_latency_ms registration"),
    alerts_fired_total: register_int_counter_vec!(
        "registry_alerts_fired_total",
        "Alerts fired after cooldown suppression",
        &["rule"]
    )
    .expect("registry_alerts_fired_total registration"),
    notification_failures_total: register_int_counter_vec!(
        "registry_notification_failures_total",
        "Notification deliveries that failed, by channel",
        &["channel"]
    )
    .expect("registry_notification_failures_total registration"),
});

impl RegistryMetrics {
    pub fn record_op(&self, op: &str, ok: bool) {
        self.operations_total.with_label_values(&[op, if ok { "ok" } else { "error" }]).inc();
    }
}

/// Prometheus text format of everything in the default registry.
pub fn render_metrics() -> Result<String, CoreError> {
    Lazy::force(&METRICS);
    let families = prometheus::gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&families, &mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_text_contains_recorded_ops() {
        METRICS.record_op("register", true);
        let body = render_metrics().unwrap();
        assert!(body.contains("registry_operations_total"));
    }
}
