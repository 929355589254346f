//! Outbound event bus. Publishing is fire-and-forget from the caller's view:
//! failures are logged by the deployment service, never surfaced.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use registry_resilience::{retry_async, RetryConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("publish failed: {0}")] Publish(String),
    #[error("event codec: {0}")] Codec(#[from] serde_json::Error),
    #[error("event bus unavailable: {0}")] Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_type: String,
    pub event_id: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(event_type: &str, payload: serde_json::Value) -> Self {
        Self { event_type: event_type.to_string(), event_id: uuid::Uuid::new_v4().to_string(), emitted_at: Utc::now(), payload }
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, subject: &str, event: &EventEnvelope) -> Result<(), EventBusError>;
    async fn ping(&self) -> Result<(), EventBusError>;
}

pub struct NatsEventBus { client: async_nats::Client, retry: RetryConfig }

impl NatsEventBus {
    pub async fn connect(url: &str) -> Result<Self, EventBusError> {
        let client = async_nats::connect(url).await.map_err(|e| EventBusError::Unavailable(e.to_string()))?;
        info!(%url, "nats_connected");
        Ok(Self { client, retry: RetryConfig::default() })
    }
}

#[async_trait]
impl EventBus for NatsEventBus {
    async fn publish(&self, subject: &str, event: &EventEnvelope) -> Result<(), EventBusError> {
        let bytes = serde_json::to_vec(event)?;
        let client = &self.client;
        retry_async(&self.retry, |_| {
            let payload = bytes.clone();
            let subject = subject.to_string();
            async move { client.publish(subject, payload.into()).await }
        })
        .await
        .map_err(|e| EventBusError::Publish(e.to_string()))
    }

    async fn ping(&self) -> Result<(), EventBusError> {
        self.client.flush().await.map_err(|e| EventBusError::Unavailable(e.to_string()))
    }
}

/// Degraded mode when no broker is reachable: events are only logged and the
/// sink probe reports unhealthy.
pub struct LogEventBus;

#[async_trait]
impl EventBus for LogEventBus {
    async fn publish(&self, subject: &str, event: &EventEnvelope) -> Result<(), EventBusError> {
        warn!(%subject, event_type=%event.event_type, event_id=%event.event_id, "event_bus_degraded_event_logged_only");
        Ok(())
    }

    async fn ping(&self) -> Result<(), EventBusError> {
        Err(EventBusError::Unavailable("no broker connected".into()))
    }
}

/// In-process bus that keeps every published event; used for embedding and tests.
#[derive(Clone, Default)]
pub struct MemoryEventBus { events: Arc<Mutex<Vec<(String, EventEnvelope)>>>, fail: Arc<Mutex<bool>> }

impl MemoryEventBus {
    pub fn new() -> Self { Self::default() }
    pub fn events(&self) -> Vec<(String, EventEnvelope)> { self.events.lock().clone() }
    pub fn set_failing(&self, failing: bool) { *self.fail.lock() = failing; }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, subject: &str, event: &EventEnvelope) -> Result<(), EventBusError> {
        if *self.fail.lock() { return Err(EventBusError::Publish("memory bus set to fail".into())); }
        self.events.lock().push((subject.to_string(), event.clone()));
        Ok(())
    }

    async fn ping(&self) -> Result<(), EventBusError> {
        if *self.fail.lock() { Err(EventBusError::Unavailable("memory bus set to fail".into())) } else { Ok(()) }
    }
}

#[cfg(all(test, feature = "integration"))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nats_publish_roundtrip() {
        let url = std::env::var("NATS_URL").unwrap_or_else(|_| "127.0.0.1:4222".into());
        let bus = match NatsEventBus::connect(&url).await { Ok(b) => b, Err(_) => { eprintln!("NATS not available, skipping"); return; } };
        bus.publish("registry.test", &EventEnvelope::new("PING", serde_json::json!({}))).await.unwrap();
        assert!(bus.ping().await.is_ok());
    }
}
