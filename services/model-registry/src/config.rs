use serde::{Deserialize, Deserializer};
use std::time::Duration;

use crate::health::ProbeLimits;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub service_name: String,
    pub http_port: u16,
    pub data_dir: String,
    /// Absent or unreachable means events are only logged.
    pub nats_url: Option<String>,
    pub deployment_subject: String,
    /// Base URL that `s3://bucket/key` and `gs://bucket/key` map onto.
    pub blob_endpoint: Option<String>,
    pub verify_artifacts: bool,
    pub health: HealthConfig,
    pub alerts: AlertConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            service_name: "model-registry".into(),
            http_port: 8080,
            data_dir: "./data/registry".into(),
            nats_url: None,
            deployment_subject: "registry.deployments".into(),
            blob_endpoint: None,
            verify_artifacts: true,
            health: HealthConfig::default(),
            alerts: AlertConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub store_timeout_ms: u64,
    pub sink_timeout_ms: u64,
    pub blob_timeout_ms: u64,
    pub simple_timeout_ms: u64,
    pub store_degraded_ms: u64,
    pub other_degraded_ms: u64,
    /// 0 disables the scheduled evaluation.
    pub interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            store_timeout_ms: 2000,
            sink_timeout_ms: 3000,
            blob_timeout_ms: 3000,
            simple_timeout_ms: 1000,
            store_degraded_ms: 1000,
            other_degraded_ms: 2000,
            interval_secs: 60,
        }
    }
}

impl HealthConfig {
    pub fn store_limits(&self) -> ProbeLimits { limits(self.store_timeout_ms, self.store_degraded_ms) }
    pub fn sink_limits(&self) -> ProbeLimits { limits(self.sink_timeout_ms, self.other_degraded_ms) }
    pub fn blob_limits(&self) -> ProbeLimits { limits(self.blob_timeout_ms, self.other_degraded_ms) }
    pub fn simple_limits(&self) -> ProbeLimits { limits(self.simple_timeout_ms, self.simple_timeout_ms) }
}

fn limits(timeout_ms: u64, degraded_ms: u64) -> ProbeLimits {
    ProbeLimits { timeout: Duration::from_millis(timeout_ms), degraded_after: Duration::from_millis(degraded_ms) }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub cooldown_secs: u64,
    /// Keep cooldowns in the store so every instance shares them.
    pub shared_cooldowns: bool,
    #[serde(deserialize_with = "string_or_list")]
    pub webhooks: Vec<String>,
    pub webhook_timeout_ms: u64,
}

impl Default for AlertConfig {
    fn default() -> Self { Self { cooldown_secs: 300, shared_cooldowns: true, webhooks: Vec::new(), webhook_timeout_ms: 5000 } }
}

// env vars arrive as one comma-separated string, files as a list
fn string_or_list<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw { One(String), Many(Vec<String>) }
    Ok(match Raw::deserialize(de)? {
        Raw::One(s) => s.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect(),
        Raw::Many(v) => v,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_sources() {
        let cfg: RegistryConfig = registry_core::load_config("model-registry").unwrap();
        assert_eq!(cfg.deployment_subject, "registry.deployments");
        assert_eq!(cfg.health.store_degraded_ms, 1000);
        assert_eq!(cfg.health.store_limits().timeout, Duration::from_millis(2000));
        assert!(cfg.alerts.shared_cooldowns);
    }

    #[test]
    fn webhooks_accept_comma_separated_string() {
        let cfg: AlertConfig = serde_json::from_value(serde_json::json!({ "webhooks": "http://a/hook, http://b/hook" })).unwrap();
        assert_eq!(cfg.webhooks, vec!["http://a/hook", "http://b/hook"]);
        let cfg: AlertConfig = serde_json::from_value(serde_json::json!({ "webhooks": ["http://a/hook"] })).unwrap();
        assert_eq!(cfg.webhooks.len(), 1);
    }
}
