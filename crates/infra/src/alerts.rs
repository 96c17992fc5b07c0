//! Alert sinks.
//!
//! Raising an alert never fails the caller: a sink that cannot deliver logs
//! the problem and moves on.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{error, info, warn};

use regsync_outbox::{Alert, AlertSeverity};

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, alert: Alert);
}

/// Writes alerts to the log.
#[derive(Debug, Default, Clone)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn raise(&self, alert: Alert) {
        let related: Vec<String> = alert.related_entities.iter().map(ToString::to_string).collect();
        match alert.severity {
            AlertSeverity::Critical | AlertSeverity::High => error!(
                alert_id = %alert.id,
                tenant_id = %alert.tenant_id,
                connection_id = ?alert.connection_id,
                message_id = ?alert.related_message,
                severity = alert.severity.as_str(),
                category = alert.category.as_str(),
                entities = ?related,
                "{}", alert.message
            ),
            AlertSeverity::Medium => warn!(
                alert_id = %alert.id,
                tenant_id = %alert.tenant_id,
                connection_id = ?alert.connection_id,
                message_id = ?alert.related_message,
                severity = alert.severity.as_str(),
                category = alert.category.as_str(),
                entities = ?related,
                "{}", alert.message
            ),
            AlertSeverity::Low => info!(
                alert_id = %alert.id,
                tenant_id = %alert.tenant_id,
                category = alert.category.as_str(),
                "{}", alert.message
            ),
        }
    }
}

/// Keeps alerts in memory; used by tests and the binary's fallback wiring.
#[derive(Debug, Default, Clone)]
pub struct InMemoryAlertSink {
    alerts: Arc<Mutex<Vec<Alert>>>,
}

impl InMemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .map(|a| a.to_vec())
            .unwrap_or_else(|poisoned| poisoned.into_inner().to_vec())
    }
}

#[async_trait]
impl AlertSink for InMemoryAlertSink {
    async fn raise(&self, alert: Alert) {
        match self.alerts.lock() {
            Ok(mut alerts) => alerts.push(alert),
            Err(poisoned) => poisoned.into_inner().push(alert),
        }
    }
}

/// POSTs each alert as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct HttpAlertSink {
    url: String,
    http_client: Client,
}

impl HttpAlertSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            http_client,
        })
    }
}

#[async_trait]
impl AlertSink for HttpAlertSink {
    async fn raise(&self, alert: Alert) {
        let result = self.http_client.post(&self.url).json(&alert).send().await;
        match result {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(
                alert_id = %alert.id,
                status = resp.status().as_u16(),
                "alert webhook refused alert"
            ),
            Err(e) => warn!(alert_id = %alert.id, error = %e, "alert webhook unreachable"),
        }
    }
}

/// Delivers every alert to each inner sink in turn.
#[derive(Default, Clone)]
pub struct FanoutAlertSink {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl FanoutAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl AlertSink for FanoutAlertSink {
    async fn raise(&self, alert: Alert) {
        for sink in &self.sinks {
            sink.raise(alert.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regsync_core::TenantId;
    use regsync_outbox::AlertCategory;

    #[tokio::test]
    async fn fanout_reaches_every_sink() {
        let a = InMemoryAlertSink::new();
        let b = InMemoryAlertSink::new();
        let sink = FanoutAlertSink::new()
            .with(Arc::new(a.clone()))
            .with(Arc::new(TracingAlertSink))
            .with(Arc::new(b.clone()));

        sink.raise(Alert::new(
            TenantId::new(),
            AlertSeverity::High,
            AlertCategory::SyncFailure,
            "boom",
        ))
        .await;

        assert_eq!(a.alerts().len(), 1);
        assert_eq!(b.alerts()[0].message, "boom");
    }
}
