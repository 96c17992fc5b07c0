//! Registry client: the only component that talks to the Registry.
//!
//! Stateless and single-shot. Retries, backoff and state transitions belong
//! to the dispatcher and the receipt poller; the client only classifies what
//! happened on the wire.

pub mod http;
#[cfg(any(test, feature = "test-support"))]
pub mod scripted;

use async_trait::async_trait;
use serde::Serialize;

use regsync_core::{ConnectionId, MessageId, TenantId};
use regsync_outbox::{
    InboundReceipt, MessageKind, OutboxMessage, RegistryEmployee, SubmissionPayload,
    ValidationIssue,
};

use crate::vault::RegistryCredentials;

pub use http::{HttpRegistryClient, HttpRegistryConfig};
#[cfg(any(test, feature = "test-support"))]
pub use scripted::{ScriptedCall, ScriptedRegistryClient};

/// How a Registry call failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    /// Network failure, 5xx or 429.
    #[error("transient registry failure: {0}")]
    Transient(String),
    #[error("registry call timed out")]
    Timeout,
    /// 401/403: the credentials are wrong, not the submission.
    #[error("registry refused credentials (HTTP {status})")]
    Unauthorized { status: u16 },
    /// Any other 4xx: the submission itself is invalid. Never retried.
    #[error("registry rejected submission (HTTP {status}): {summary}")]
    Rejected {
        status: u16,
        issues: Vec<ValidationIssue>,
        summary: String,
        raw: serde_json::Value,
    },
    /// The Registry answered with something we could not interpret.
    #[error("unexpected registry response: {0}")]
    Protocol(String),
}

impl RegistryError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RegistryError::Transient(_) | RegistryError::Timeout | RegistryError::Protocol(_)
        )
    }
}

/// What goes on the wire for one submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitRequest {
    /// Sent as the idempotency key.
    pub message_id: MessageId,
    pub tenant_id: TenantId,
    pub connection_id: ConnectionId,
    pub employer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub establishment_id: Option<String>,
    pub kind: MessageKind,
    pub payload: SubmissionPayload,
}

impl SubmitRequest {
    pub fn for_message(
        message: &OutboxMessage,
        employer_id: impl Into<String>,
        establishment_id: Option<String>,
    ) -> Self {
        Self {
            message_id: message.id,
            tenant_id: message.tenant_id,
            connection_id: message.connection_id,
            employer_id: employer_id.into(),
            establishment_id,
            kind: message.kind,
            payload: message.payload.clone(),
        }
    }
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Submit one message. A `pending_validation` receipt means the Registry
    /// accepted it for asynchronous processing.
    async fn submit(
        &self,
        credentials: &RegistryCredentials,
        request: &SubmitRequest,
    ) -> Result<InboundReceipt, RegistryError>;

    /// Current receipt for a submitted message, `None` if the Registry has none yet.
    async fn fetch_receipt(
        &self,
        credentials: &RegistryCredentials,
        employer_id: &str,
        message: &OutboxMessage,
    ) -> Result<Option<InboundReceipt>, RegistryError>;

    /// Read-only pull of every employee the Registry holds for an employer.
    async fn fetch_employees(
        &self,
        credentials: &RegistryCredentials,
        employer_id: &str,
    ) -> Result<Vec<RegistryEmployee>, RegistryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(RegistryError::Timeout.is_transient());
        assert!(RegistryError::Transient("503".into()).is_transient());
        assert!(RegistryError::Protocol("garbled".into()).is_transient());
        assert!(!RegistryError::Unauthorized { status: 401 }.is_transient());
        assert!(
            !RegistryError::Rejected {
                status: 422,
                issues: vec![],
                summary: String::new(),
                raw: serde_json::Value::Null,
            }
            .is_transient()
        );
    }
}
