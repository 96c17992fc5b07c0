use serde::{Deserialize, Serialize};

use regsync_infra::receipts::ReceiptOutcome;
use regsync_infra::reconciler::ReconcileOutcome;
use regsync_outbox::{OutboxMessage, Receipt, SubmissionResult};

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

impl ListQuery {
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(100).clamp(1, 1000)
    }
}

/// A message with its full receipt and result trail.
#[derive(Debug, Serialize)]
pub struct MessageDetail {
    pub message: OutboxMessage,
    pub receipts: Vec<Receipt>,
    pub results: Vec<SubmissionResult>,
}

#[derive(Debug, Serialize)]
pub struct ReceiptAck {
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub successor_id: Option<String>,
}

impl From<&ReceiptOutcome> for ReceiptAck {
    fn from(outcome: &ReceiptOutcome) -> Self {
        let (label, successor_id) = match outcome {
            ReceiptOutcome::Duplicate => ("duplicate", None),
            ReceiptOutcome::Recorded => ("recorded", None),
            ReceiptOutcome::Pending { .. } => ("pending", None),
            ReceiptOutcome::Rejected => ("rejected", None),
            ReceiptOutcome::Reconciled(ReconcileOutcome::Accepted) => ("accepted", None),
            ReceiptOutcome::Reconciled(ReconcileOutcome::Split { successor }) => {
                ("partially_accepted", Some(successor.to_string()))
            }
            ReceiptOutcome::Reconciled(ReconcileOutcome::Failed) => ("failed", None),
            ReceiptOutcome::Reconciled(ReconcileOutcome::Skipped) => ("skipped", None),
        };
        Self { outcome: label, successor_id }
    }
}
