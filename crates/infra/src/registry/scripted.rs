//! Scripted Registry for tests: answers come from queues the test fills.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use regsync_core::MessageId;
use regsync_outbox::{
    InboundReceipt, InboundResult, OutboxMessage, ReceiptStatus, RegistryEmployee, ResultEntity,
    ResultOutcome, ValidationIssue,
};

use super::{RegistryClient, RegistryError, SubmitRequest};
use crate::vault::RegistryCredentials;

type SubmitScript = Box<dyn Fn(&SubmitRequest) -> Result<InboundReceipt, RegistryError> + Send + Sync>;

/// A call the scripted Registry observed.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedCall {
    Submit { message_id: MessageId, username: String },
    FetchReceipt { message_id: MessageId },
    FetchEmployees { employer_id: String },
}

/// Submissions with no script left get a `pending_validation` receipt.
#[derive(Default)]
pub struct ScriptedRegistryClient {
    submits: Mutex<VecDeque<SubmitScript>>,
    receipts: Mutex<HashMap<MessageId, VecDeque<Result<Option<InboundReceipt>, RegistryError>>>>,
    employees: Mutex<Vec<RegistryEmployee>>,
    calls: Mutex<Vec<ScriptedCall>>,
    submit_delay: Mutex<Option<Duration>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedRegistryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_submit<F>(&self, script: F)
    where
        F: Fn(&SubmitRequest) -> Result<InboundReceipt, RegistryError> + Send + Sync + 'static,
    {
        lock(&self.submits).push_back(Box::new(script));
    }

    pub fn push_transient(&self, times: usize) {
        for i in 0..times {
            self.push_submit(move |_| Err(RegistryError::Transient(format!("HTTP 503 (#{})", i + 1))));
        }
    }

    pub fn push_timeout(&self) {
        self.push_submit(|_| Err(RegistryError::Timeout));
    }

    pub fn push_pending(&self) {
        self.push_submit(|req| Ok(pending_receipt(req.message_id)));
    }

    /// Synchronous acceptance: every payload entity applied.
    pub fn push_accepted(&self) {
        self.push_submit(|req| Ok(accepted_receipt(req.message_id, success_for(req))));
    }

    pub fn push_rejected(&self, message: &str) {
        let message = message.to_string();
        self.push_submit(move |_| {
            let issues = vec![ValidationIssue {
                code: Some("VAL".to_string()),
                field: None,
                message: message.clone(),
            }];
            Err(RegistryError::Rejected {
                status: 422,
                summary: regsync_outbox::receipt::summarize_issues(&issues),
                issues,
                raw: serde_json::json!({ "message": message }),
            })
        });
    }

    pub fn push_unauthorized(&self) {
        self.push_submit(|_| Err(RegistryError::Unauthorized { status: 401 }));
    }

    /// Queue the next answer to `fetch_receipt` for one message. The last
    /// queued answer repeats.
    pub fn push_receipt(&self, message_id: MessageId, answer: Result<Option<InboundReceipt>, RegistryError>) {
        lock(&self.receipts).entry(message_id).or_default().push_back(answer);
    }

    pub fn set_employees(&self, employees: Vec<RegistryEmployee>) {
        *lock(&self.employees) = employees;
    }

    pub fn set_submit_delay(&self, delay: Option<Duration>) {
        *lock(&self.submit_delay) = delay;
    }

    pub fn calls(&self) -> Vec<ScriptedCall> {
        lock(&self.calls).clone()
    }

    /// Message ids in the order they were submitted.
    pub fn submitted(&self) -> Vec<MessageId> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                ScriptedCall::Submit { message_id, .. } => Some(*message_id),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl RegistryClient for ScriptedRegistryClient {
    async fn submit(
        &self,
        credentials: &RegistryCredentials,
        request: &SubmitRequest,
    ) -> Result<InboundReceipt, RegistryError> {
        lock(&self.calls).push(ScriptedCall::Submit {
            message_id: request.message_id,
            username: credentials.username.clone(),
        });
        let delay = *lock(&self.submit_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let script = lock(&self.submits).pop_front();
        match script {
            Some(script) => script(request),
            None => Ok(pending_receipt(request.message_id)),
        }
    }

    async fn fetch_receipt(
        &self,
        _credentials: &RegistryCredentials,
        _employer_id: &str,
        message: &OutboxMessage,
    ) -> Result<Option<InboundReceipt>, RegistryError> {
        lock(&self.calls).push(ScriptedCall::FetchReceipt { message_id: message.id });
        let mut receipts = lock(&self.receipts);
        let Some(queue) = receipts.get_mut(&message.id) else {
            return Ok(None);
        };
        if queue.len() > 1 {
            queue.pop_front().unwrap_or(Ok(None))
        } else {
            queue.front().cloned().unwrap_or(Ok(None))
        }
    }

    async fn fetch_employees(
        &self,
        _credentials: &RegistryCredentials,
        employer_id: &str,
    ) -> Result<Vec<RegistryEmployee>, RegistryError> {
        lock(&self.calls).push(ScriptedCall::FetchEmployees {
            employer_id: employer_id.to_string(),
        });
        Ok(lock(&self.employees).clone())
    }
}

pub fn pending_receipt(message_id: MessageId) -> InboundReceipt {
    InboundReceipt {
        message_id,
        receipt_number: None,
        receipt_date: None,
        status: ReceiptStatus::PendingValidation,
        validation_errors: Vec::new(),
        results: Vec::new(),
        raw: serde_json::json!({ "status": "pending_validation" }),
    }
}

pub fn accepted_receipt(message_id: MessageId, results: Vec<InboundResult>) -> InboundReceipt {
    InboundReceipt {
        message_id,
        receipt_number: Some(format!("R-{}", message_id.as_uuid().simple())),
        receipt_date: None,
        status: ReceiptStatus::Accepted,
        validation_errors: Vec::new(),
        raw: serde_json::json!({ "status": "accepted", "results": results }),
        results,
    }
}

/// One success result naming every entity of the request, each with an issued id.
pub fn success_for(request: &SubmitRequest) -> Vec<InboundResult> {
    vec![InboundResult {
        outcome: ResultOutcome::Success,
        entities: request
            .payload
            .entities()
            .into_iter()
            .map(|entity| ResultEntity {
                entity,
                registry_id: Some(format!("REG-{}", entity.as_uuid().simple())),
            })
            .collect(),
        details: None,
    }]
}
