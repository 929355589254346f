//! Notification channels alerts fan out to.
use async_trait::async_trait;
use registry_resilience::{CircuitBreaker, ResilienceError};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::alerting::{Alert, Severity};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("http: {0}")] Http(#[from] reqwest::Error),
    #[error("receiver answered {0}")] Status(u16),
    #[error("circuit open")] CircuitOpen,
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<(), NotifyError>;
    fn channel_name(&self) -> &str;
}

/// POSTs the alert as JSON. Repeated failures open a breaker so a dead
/// receiver does not slow every evaluation down.
pub struct WebhookChannel {
    name: String,
    url: String,
    client: reqwest::Client,
    breaker: CircuitBreaker,
}

impl WebhookChannel {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { name: format!("webhook:{url}"), url: url.to_string(), client, breaker: CircuitBreaker::new(3, Duration::from_secs(60)) })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    async fn send(&self, alert: &Alert) -> Result<(), NotifyError> {
        let res = self.breaker.call(|| async {
            let resp = self.client.post(&self.url).json(alert).send().await?;
            if !resp.status().is_success() { return Err(NotifyError::Status(resp.status().as_u16())); }
            Ok::<(), NotifyError>(())
        }).await;
        match res {
            Ok(()) => Ok(()),
            Err(ResilienceError::CircuitOpen) => Err(NotifyError::CircuitOpen),
            Err(ResilienceError::Inner(e)) => Err(e),
        }
    }

    fn channel_name(&self) -> &str { &self.name }
}

/// Writes alerts to the service log at a level matching their severity.
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    async fn send(&self, alert: &Alert) -> Result<(), NotifyError> {
        match alert.severity {
            Severity::Critical => error!(rule=%alert.rule, message=%alert.message, "alert"),
            Severity::Warning => warn!(rule=%alert.rule, message=%alert.message, "alert"),
            Severity::Info => info!(rule=%alert.rule, message=%alert.message, "alert"),
        }
        Ok(())
    }

    fn channel_name(&self) -> &str { "log" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthStatus;
    use chrono::Utc;

    fn alert() -> Alert {
        Alert { rule: "registry_unhealthy".into(), severity: Severity::Critical, message: "store down".into(), health_status: HealthStatus::Unhealthy, fired_at: Utc::now() }
    }

    #[tokio::test]
    async fn dead_webhook_opens_breaker() {
        let ch = WebhookChannel::new("http://127.0.0.1:9/hook", Duration::from_millis(300)).unwrap();
        for _ in 0..3 { assert!(matches!(ch.send(&alert()).await, Err(NotifyError::Http(_)))); }
        assert!(matches!(ch.send(&alert()).await, Err(NotifyError::CircuitOpen)));
        assert_eq!(ch.channel_name(), "webhook:http://127.0.0.1:9/hook");
    }

    #[tokio::test]
    async fn log_channel_always_delivers() {
        assert!(LogChannel.send(&alert()).await.is_ok());
    }
}
