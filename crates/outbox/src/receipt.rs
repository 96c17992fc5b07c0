//! Registry receipts and the per-entity results they carry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use regsync_core::{ConnectionId, MessageId, ReceiptId, ResultId, TenantId};

use crate::entity::EntityRef;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Accepted,
    Rejected,
    PendingValidation,
}

impl ReceiptStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, ReceiptStatus::PendingValidation)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Accepted => "accepted",
            ReceiptStatus::Rejected => "rejected",
            ReceiptStatus::PendingValidation => "pending_validation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "accepted" => Some(ReceiptStatus::Accepted),
            "rejected" => Some(ReceiptStatus::Rejected),
            "pending_validation" => Some(ReceiptStatus::PendingValidation),
            _ => None,
        }
    }
}

/// One validation problem reported by the Registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub field: Option<String>,
    pub message: String,
}

impl core::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match (&self.code, &self.field) {
            (Some(code), Some(field)) => write!(f, "[{code}] {field}: {}", self.message),
            (Some(code), None) => write!(f, "[{code}] {}", self.message),
            (None, Some(field)) => write!(f, "{field}: {}", self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}

/// Join issues into a single operator-readable line.
pub fn summarize_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultOutcome {
    Success,
    PartialSuccess,
    Failure,
}

impl ResultOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultOutcome::Success => "success",
            ResultOutcome::PartialSuccess => "partial_success",
            ResultOutcome::Failure => "failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(ResultOutcome::Success),
            "partial_success" => Some(ResultOutcome::PartialSuccess),
            "failure" => Some(ResultOutcome::Failure),
            _ => None,
        }
    }
}

/// A local entity named in a result, with the id the Registry issued for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEntity {
    pub entity: EntityRef,
    #[serde(default)]
    pub registry_id: Option<String>,
}

/// A result as it arrives from the Registry, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundResult {
    pub outcome: ResultOutcome,
    #[serde(default)]
    pub entities: Vec<ResultEntity>,
    #[serde(default)]
    pub details: Option<String>,
}

/// A receipt as it arrives from a synchronous response, a poll or the webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundReceipt {
    pub message_id: MessageId,
    #[serde(default)]
    pub receipt_number: Option<String>,
    #[serde(default)]
    pub receipt_date: Option<DateTime<Utc>>,
    pub status: ReceiptStatus,
    #[serde(default)]
    pub validation_errors: Vec<ValidationIssue>,
    #[serde(default)]
    pub results: Vec<InboundResult>,
    /// Verbatim upstream body.
    #[serde(default)]
    pub raw: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub id: ReceiptId,
    pub tenant_id: TenantId,
    pub connection_id: ConnectionId,
    pub message_id: MessageId,
    pub receipt_number: Option<String>,
    pub receipt_date: DateTime<Utc>,
    pub status: ReceiptStatus,
    pub validation_errors: Vec<ValidationIssue>,
    pub raw_response: JsonValue,
    pub received_at: DateTime<Utc>,
}

impl Receipt {
    pub fn from_inbound(
        tenant_id: TenantId,
        connection_id: ConnectionId,
        inbound: &InboundReceipt,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ReceiptId::new(),
            tenant_id,
            connection_id,
            message_id: inbound.message_id,
            receipt_number: inbound.receipt_number.clone(),
            receipt_date: inbound.receipt_date.unwrap_or(now),
            status: inbound.status,
            validation_errors: inbound.validation_errors.clone(),
            raw_response: inbound.raw.clone(),
            received_at: now,
        }
    }

    /// Idempotency key. Receipts without a number share the `-` slot.
    pub fn dedup_key(&self) -> (MessageId, String) {
        (
            self.message_id,
            self.receipt_number.clone().unwrap_or_else(|| "-".to_string()),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub id: ResultId,
    pub receipt_id: ReceiptId,
    pub message_id: MessageId,
    pub tenant_id: TenantId,
    pub outcome: ResultOutcome,
    pub entities: Vec<ResultEntity>,
    pub details: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl SubmissionResult {
    pub fn from_inbound(receipt: &Receipt, inbound: &InboundResult, now: DateTime<Utc>) -> Self {
        Self {
            id: ResultId::new(),
            receipt_id: receipt.id,
            message_id: receipt.message_id,
            tenant_id: receipt.tenant_id,
            outcome: inbound.outcome,
            entities: inbound.entities.clone(),
            details: inbound.details.clone(),
            recorded_at: now,
        }
    }

    /// Entities the Registry applied, with the id it issued.
    pub fn applied(&self) -> Vec<(EntityRef, Option<String>)> {
        match self.outcome {
            ResultOutcome::Success => self
                .entities
                .iter()
                .map(|e| (e.entity, e.registry_id.clone()))
                .collect(),
            ResultOutcome::PartialSuccess => self
                .entities
                .iter()
                .filter_map(|e| e.registry_id.clone().map(|id| (e.entity, Some(id))))
                .collect(),
            ResultOutcome::Failure => Vec::new(),
        }
    }

    /// Entities named by this result that the Registry did not apply.
    pub fn failed(&self) -> Vec<EntityRef> {
        match self.outcome {
            ResultOutcome::Success => Vec::new(),
            ResultOutcome::PartialSuccess => self
                .entities
                .iter()
                .filter(|e| e.registry_id.is_none())
                .map(|e| e.entity)
                .collect(),
            ResultOutcome::Failure => self.entities.iter().map(|e| e.entity).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regsync_core::{ContractId, EmployeeId};
    use serde_json::json;

    #[test]
    fn webhook_body_deserializes_with_defaults() {
        let message_id = MessageId::new();
        let body = json!({
            "message_id": message_id,
            "receipt_number": "R-42",
            "status": "pending_validation",
        });
        let inbound: InboundReceipt = serde_json::from_value(body).unwrap();
        assert_eq!(inbound.message_id, message_id);
        assert!(!inbound.status.is_final());
        assert!(inbound.results.is_empty());
    }

    #[test]
    fn partial_success_splits_applied_and_failed() {
        let emp = EmployeeId::new();
        let con = ContractId::new();
        let result = SubmissionResult {
            id: ResultId::new(),
            receipt_id: ReceiptId::new(),
            message_id: MessageId::new(),
            tenant_id: TenantId::new(),
            outcome: ResultOutcome::PartialSuccess,
            entities: vec![
                ResultEntity { entity: EntityRef::Employee(emp), registry_id: Some("REG-1".into()) },
                ResultEntity { entity: EntityRef::Contract(con), registry_id: None },
            ],
            details: Some("contract start date invalid".into()),
            recorded_at: Utc::now(),
        };

        assert_eq!(result.applied(), vec![(EntityRef::Employee(emp), Some("REG-1".into()))]);
        assert_eq!(result.failed(), vec![EntityRef::Contract(con)]);
    }

    #[test]
    fn issues_summarize_in_order() {
        let issues = vec![
            ValidationIssue { code: Some("E12".into()), field: Some("start_date".into()), message: "in the past".into() },
            ValidationIssue { code: None, field: None, message: "unknown employer".into() },
        ];
        assert_eq!(summarize_issues(&issues), "[E12] start_date: in the past; unknown employer");
    }
}
