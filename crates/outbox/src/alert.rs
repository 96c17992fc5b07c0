//! Operator alerts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use regsync_core::{AlertId, ConnectionId, MessageId, TenantId};

use crate::entity::EntityRef;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    SyncFailure,
    Drift,
    Rejection,
}

impl AlertCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCategory::SyncFailure => "sync_failure",
            AlertCategory::Drift => "drift",
            AlertCategory::Rejection => "rejection",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub tenant_id: TenantId,
    pub connection_id: Option<ConnectionId>,
    pub severity: AlertSeverity,
    pub category: AlertCategory,
    pub message: String,
    pub related_entities: Vec<EntityRef>,
    pub related_message: Option<MessageId>,
    pub details: Option<JsonValue>,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        tenant_id: TenantId,
        severity: AlertSeverity,
        category: AlertCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: AlertId::new(),
            tenant_id,
            connection_id: None,
            severity,
            category,
            message: message.into(),
            related_entities: Vec::new(),
            related_message: None,
            details: None,
            raised_at: Utc::now(),
        }
    }

    pub fn for_connection(mut self, connection_id: ConnectionId) -> Self {
        self.connection_id = Some(connection_id);
        self
    }

    pub fn with_message(mut self, message_id: MessageId) -> Self {
        self.related_message = Some(message_id);
        self
    }

    pub fn with_entities(mut self, entities: impl IntoIterator<Item = EntityRef>) -> Self {
        self.related_entities.extend(entities);
        self
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = Some(details);
        self
    }
}
