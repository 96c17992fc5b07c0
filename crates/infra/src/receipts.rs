//! Receipt processing and polling.
//!
//! Receipts arrive three ways (synchronous submit response, polling, webhook)
//! and all go through [`ReceiptProcessor::process`]. Recording is idempotent
//! per `(message id, receipt number)`, so a receipt delivered twice changes
//! message state at most once.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use regsync_core::ExpectedVersion;
use regsync_outbox::{
    Alert, AlertCategory, AlertSeverity, InboundReceipt, MessageStatus, OutboxMessage, Receipt,
    ReceiptStatus, SubmissionResult, receipt::summarize_issues,
};

use crate::alerts::AlertSink;
use crate::engine::EngineContext;
use crate::error::{EngineError, StoreError};
use crate::reconciler::{ReconcileOutcome, ResultReconciler};
use crate::registry::RegistryError;
use crate::store::SyncStore;

#[derive(Debug, Clone, PartialEq)]
pub enum ReceiptOutcome {
    /// Same receipt seen before; nothing changed.
    Duplicate,
    /// Stored for audit; the message is terminal or not yet `sent`.
    Recorded,
    /// Registry still validating; next poll scheduled.
    Pending { next_poll_at: DateTime<Utc> },
    Rejected,
    Reconciled(ReconcileOutcome),
}

pub struct ReceiptProcessor {
    store: Arc<dyn SyncStore>,
    alerts: Arc<dyn AlertSink>,
    reconciler: ResultReconciler,
    poll_interval: Duration,
}

impl ReceiptProcessor {
    pub fn new(store: Arc<dyn SyncStore>, alerts: Arc<dyn AlertSink>, poll_interval: Duration) -> Self {
        Self {
            reconciler: ResultReconciler::new(store.clone(), alerts.clone()),
            store,
            alerts,
            poll_interval,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    #[instrument(
        skip(self, inbound),
        fields(message_id = %inbound.message_id, status = inbound.status.as_str()),
        err
    )]
    pub async fn process(
        &self,
        inbound: InboundReceipt,
        now: DateTime<Utc>,
    ) -> Result<ReceiptOutcome, EngineError> {
        let message = self
            .store
            .get_message(inbound.message_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("message {}", inbound.message_id)))?;

        let receipt = Receipt::from_inbound(message.tenant_id, message.connection_id, &inbound, now);
        let results: Vec<SubmissionResult> = if receipt.status == ReceiptStatus::Accepted {
            inbound
                .results
                .iter()
                .map(|r| SubmissionResult::from_inbound(&receipt, r, now))
                .collect()
        } else {
            Vec::new()
        };

        let record = self.store.record_receipt(receipt, results).await?;

        if message.status != MessageStatus::Sent {
            debug!(status = %message.status, "receipt recorded without state change");
            return Ok(if record.is_duplicate() {
                ReceiptOutcome::Duplicate
            } else {
                ReceiptOutcome::Recorded
            });
        }

        let stored = record.receipt().clone();
        if !stored.status.is_final() {
            // A final receipt recorded while the message was still `sending`
            // outranks any later pending one.
            if let Some(earlier) = self.stored_final(&message).await? {
                info!(receipt_number = earlier.receipt_number.as_deref().unwrap_or("-"), "applying final receipt already on file");
                return self.apply(message, &earlier, now).await;
            }
            if record.is_duplicate() {
                return Ok(ReceiptOutcome::Duplicate);
            }
        } else if record.is_duplicate() {
            // A final receipt already on file for a message still `sent`
            // means the previous pass stopped before reconciling; finish it.
            info!("resuming reconciliation from stored receipt");
        }

        self.apply(message, &stored, now).await
    }

    /// Earliest final receipt on file for the message.
    async fn stored_final(&self, message: &OutboxMessage) -> Result<Option<Receipt>, EngineError> {
        let receipts = self.store.receipts_for_message(message.id).await?;
        Ok(receipts
            .into_iter()
            .filter(|r| r.status.is_final())
            .min_by_key(|r| r.received_at))
    }

    async fn apply(
        &self,
        mut message: OutboxMessage,
        receipt: &Receipt,
        now: DateTime<Utc>,
    ) -> Result<ReceiptOutcome, EngineError> {
        let expected = ExpectedVersion::Exact(message.version);
        match receipt.status {
            ReceiptStatus::PendingValidation => {
                let next_poll_at = now + self.poll_interval;
                message.mark_sent(receipt.receipt_number.clone(), Some(next_poll_at), now)?;
                self.write(&message, expected).await?;
                Ok(ReceiptOutcome::Pending { next_poll_at })
            }
            ReceiptStatus::Rejected => {
                let summary = if receipt.validation_errors.is_empty() {
                    "rejected by the registry".to_string()
                } else {
                    summarize_issues(&receipt.validation_errors)
                };
                message.mark_rejected(summary.clone(), now)?;
                if !self.write(&message, expected).await? {
                    return Ok(ReceiptOutcome::Duplicate);
                }
                warn!(message_id = %message.id, summary = %summary, "registry rejected submission");
                self.alerts
                    .raise(
                        Alert::new(
                            message.tenant_id,
                            AlertSeverity::High,
                            AlertCategory::Rejection,
                            format!("{} {} rejected: {summary}", message.kind, message.entity),
                        )
                        .for_connection(message.connection_id)
                        .with_message(message.id)
                        .with_entities(message.affected_entities())
                        .with_details(json!({
                            "receipt_number": receipt.receipt_number,
                            "validation_errors": receipt.validation_errors,
                        })),
                    )
                    .await;
                Ok(ReceiptOutcome::Rejected)
            }
            ReceiptStatus::Accepted => {
                let results: Vec<SubmissionResult> = self
                    .store
                    .results_for_message(message.id)
                    .await?
                    .into_iter()
                    .filter(|r| r.receipt_id == receipt.id)
                    .collect();
                let outcome = self.reconciler.reconcile(message, &results, now).await?;
                Ok(ReceiptOutcome::Reconciled(outcome))
            }
        }
    }

    /// `false` when another worker moved the message first.
    async fn write(&self, message: &OutboxMessage, expected: ExpectedVersion) -> Result<bool, EngineError> {
        match self.store.update_message(message, expected).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_concurrency() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub batch_size: usize,
    /// Messages `sent` longer than this without a final receipt fail.
    pub receipt_window: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            receipt_window: Duration::hours(72),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PollSummary {
    pub polled: usize,
    pub processed: usize,
    pub still_pending: usize,
    pub overdue: usize,
    pub errors: usize,
}

/// Fetches receipts for `sent` messages on a fixed cadence.
pub struct ReceiptPoller {
    ctx: EngineContext,
    processor: Arc<ReceiptProcessor>,
    config: PollerConfig,
}

impl ReceiptPoller {
    pub fn new(ctx: EngineContext, processor: Arc<ReceiptProcessor>, config: PollerConfig) -> Self {
        Self {
            ctx,
            processor,
            config,
        }
    }

    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<PollSummary, EngineError> {
        let due = self
            .ctx
            .store
            .messages_awaiting_receipt(now, self.config.batch_size)
            .await?;
        let mut summary = PollSummary::default();

        for message in due {
            if self.ctx.is_halted(message.connection_id) {
                continue;
            }
            summary.polled += 1;
            let tenant_id = message.tenant_id;
            let connection_id = message.connection_id;
            match self.poll_message(message, now, &mut summary).await {
                Ok(()) => {}
                Err(e @ EngineError::Fault(_)) | Err(e @ EngineError::Domain(_)) => {
                    self.ctx.halt(tenant_id, connection_id, &e.to_string(), now).await;
                    summary.errors += 1;
                }
                Err(EngineError::Store(e)) if e.is_concurrency() => {}
                Err(e) => {
                    warn!(%connection_id, error = %e, "receipt poll failed");
                    summary.errors += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn poll_message(
        &self,
        message: OutboxMessage,
        now: DateTime<Utc>,
        summary: &mut PollSummary,
    ) -> Result<(), EngineError> {
        let sent_at = message.sent_at.unwrap_or(message.updated_at);
        if now - sent_at > self.config.receipt_window {
            return self.expire(message, now, summary).await;
        }

        let Some(connection) = self.ctx.store.get_connection(message.connection_id).await? else {
            return Err(StoreError::NotFound(format!("connection {}", message.connection_id)).into());
        };
        if !connection.is_active() {
            return Ok(());
        }

        let credentials = match self.ctx.open_credentials(&connection) {
            Ok(c) => c,
            Err(e) => {
                self.ctx
                    .fail_connection(&connection, &format!("credential decryption failed: {e}"), now)
                    .await;
                return Ok(());
            }
        };

        let fetched = self
            .ctx
            .registry
            .fetch_receipt(&credentials, &connection.registry_employer_id, &message)
            .await;

        match fetched {
            Ok(Some(receipt)) => {
                let outcome = self.processor.process(receipt, now).await?;
                match outcome {
                    ReceiptOutcome::Pending { .. } => summary.still_pending += 1,
                    ReceiptOutcome::Duplicate => {
                        summary.still_pending += 1;
                        self.reschedule(message, now).await?;
                    }
                    _ => summary.processed += 1,
                }
            }
            Ok(None) => {
                summary.still_pending += 1;
                self.reschedule(message, now).await?;
            }
            Err(RegistryError::Unauthorized { status }) => {
                self.ctx
                    .fail_connection(&connection, &format!("registry refused credentials (HTTP {status})"), now)
                    .await;
            }
            Err(e) => {
                debug!(message_id = %message.id, error = %e, "receipt poll unsuccessful; will retry");
                summary.still_pending += 1;
                self.reschedule(message, now).await?;
            }
        }
        Ok(())
    }

    async fn reschedule(&self, mut message: OutboxMessage, now: DateTime<Utc>) -> Result<(), EngineError> {
        let fresh = self.ctx.store.get_message(message.id).await?;
        if let Some(fresh) = fresh {
            message = fresh;
        }
        if message.status != MessageStatus::Sent {
            return Ok(());
        }
        let expected = ExpectedVersion::Exact(message.version);
        message.mark_sent(None, Some(now + self.processor.poll_interval()), now)?;
        match self.ctx.store.update_message(&message, expected).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_concurrency() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn expire(
        &self,
        mut message: OutboxMessage,
        now: DateTime<Utc>,
        summary: &mut PollSummary,
    ) -> Result<(), EngineError> {
        let expected = ExpectedVersion::Exact(message.version);
        message.mark_receipt_overdue(self.config.receipt_window, now)?;
        match self.ctx.store.update_message(&message, expected).await {
            Ok(_) => {}
            Err(e) if e.is_concurrency() => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        summary.overdue += 1;
        warn!(message_id = %message.id, "no final receipt inside the receipt window");
        self.ctx
            .alerts
            .raise(
                Alert::new(
                    message.tenant_id,
                    AlertSeverity::High,
                    AlertCategory::SyncFailure,
                    format!(
                        "{} {} got no final receipt within {} hours",
                        message.kind,
                        message.entity,
                        self.config.receipt_window.num_hours()
                    ),
                )
                .for_connection(message.connection_id)
                .with_message(message.id)
                .with_entities(message.affected_entities()),
            )
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::InMemoryAlertSink;
    use crate::registry::ScriptedRegistryClient;
    use crate::registry::scripted::{accepted_receipt, pending_receipt};
    use crate::store::{ConnectionStore, InMemorySyncStore, OutboxStore, ReceiptStore};
    use crate::vault::{CredentialVault, RegistryCredentials};
    use regsync_core::{EmployeeId, TenantId};
    use regsync_outbox::{
        Connection, EntityRef, InboundResult, MessageKind, Mutation, ResultEntity, ResultOutcome,
        ValidationIssue,
    };

    struct Fixture {
        store: Arc<InMemorySyncStore>,
        alerts: InMemoryAlertSink,
        registry: Arc<ScriptedRegistryClient>,
        processor: Arc<ReceiptProcessor>,
        poller: ReceiptPoller,
        connection: Connection,
    }

    async fn fixture() -> Fixture {
        let store = InMemorySyncStore::arc();
        let alerts = InMemoryAlertSink::new();
        let registry = Arc::new(ScriptedRegistryClient::new());
        let vault = Arc::new(CredentialVault::single(1, [9u8; 32]));
        let tenant = TenantId::new();
        let creds = vault.seal(tenant, &RegistryCredentials::new("u", "p")).unwrap();
        let connection = Connection::new(tenant, "EMP-1", creds, Utc::now());
        store.insert_connection(&connection).await.unwrap();

        let ctx = EngineContext::new(store.clone(), registry.clone(), vault, Arc::new(alerts.clone()));
        let processor = Arc::new(ReceiptProcessor::new(
            store.clone(),
            Arc::new(alerts.clone()),
            Duration::seconds(60),
        ));
        let poller = ReceiptPoller::new(ctx, processor.clone(), PollerConfig::default());
        Fixture { store, alerts, registry, processor, poller, connection }
    }

    async fn sent(f: &Fixture, emp: EmployeeId, now: DateTime<Utc>) -> OutboxMessage {
        let mut m = OutboxMessage::from_mutation(
            f.connection.tenant_id,
            f.connection.id,
            Mutation::employee(MessageKind::EmployeeCreate, emp, json!({})),
            5,
            now,
        )
        .unwrap();
        m = f.store.append_message(m).await.unwrap();
        let v = m.version;
        m.begin_send(now).unwrap();
        m = f.store.update_message(&m, ExpectedVersion::Exact(v)).await.unwrap();
        let v = m.version;
        m.mark_sent(None, Some(now), now).unwrap();
        f.store.update_message(&m, ExpectedVersion::Exact(v)).await.unwrap()
    }

    fn success(emp: EmployeeId) -> Vec<InboundResult> {
        vec![InboundResult {
            outcome: ResultOutcome::Success,
            entities: vec![ResultEntity {
                entity: EntityRef::Employee(emp),
                registry_id: Some("REG-1".into()),
            }],
            details: None,
        }]
    }

    #[tokio::test]
    async fn duplicate_final_receipt_changes_state_once() {
        let f = fixture().await;
        let emp = EmployeeId::new();
        let now = Utc::now();
        let m = sent(&f, emp, now).await;
        let receipt = accepted_receipt(m.id, success(emp));

        let first = f.processor.process(receipt.clone(), now).await.unwrap();
        assert_eq!(first, ReceiptOutcome::Reconciled(ReconcileOutcome::Accepted));
        let after_first = f.store.get_message(m.id).await.unwrap().unwrap();

        let second = f.processor.process(receipt, now).await.unwrap();
        assert_eq!(second, ReceiptOutcome::Duplicate);
        assert_eq!(f.store.get_message(m.id).await.unwrap().unwrap(), after_first);
        assert_eq!(f.store.receipts_for_message(m.id).await.unwrap().len(), 1);
        assert_eq!(f.store.results_for_message(m.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn final_receipt_seen_during_send_beats_later_pending_one() {
        let f = fixture().await;
        let emp = EmployeeId::new();
        let now = Utc::now();
        let mut m = OutboxMessage::from_mutation(
            f.connection.tenant_id,
            f.connection.id,
            Mutation::employee(MessageKind::EmployeeCreate, emp, json!({})),
            5,
            now,
        )
        .unwrap();
        m = f.store.append_message(m).await.unwrap();
        let v = m.version;
        m.begin_send(now).unwrap();
        m = f.store.update_message(&m, ExpectedVersion::Exact(v)).await.unwrap();

        // The webhook wins the race against the submit response.
        let early = f.processor.process(accepted_receipt(m.id, success(emp)), now).await.unwrap();
        assert_eq!(early, ReceiptOutcome::Recorded);

        let v = m.version;
        m.mark_sent(Some("SYNC-1".into()), None, now).unwrap();
        f.store.update_message(&m, ExpectedVersion::Exact(v)).await.unwrap();
        let mut pending = pending_receipt(m.id);
        pending.receipt_number = Some("SYNC-1".into());

        let outcome = f.processor.process(pending, now).await.unwrap();
        assert_eq!(outcome, ReceiptOutcome::Reconciled(ReconcileOutcome::Accepted));
        let stored = f.store.get_message(m.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Accepted);
        assert_eq!(stored.next_poll_at, None);
        assert_eq!(f.store.receipts_for_message(m.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn pending_then_final_upgrade() {
        let f = fixture().await;
        let emp = EmployeeId::new();
        let now = Utc::now();
        let m = sent(&f, emp, now).await;

        let mut pending = pending_receipt(m.id);
        pending.receipt_number = Some("R-7".into());
        let outcome = f.processor.process(pending.clone(), now).await.unwrap();
        assert_eq!(outcome, ReceiptOutcome::Pending { next_poll_at: now + Duration::seconds(60) });
        assert_eq!(f.processor.process(pending, now).await.unwrap(), ReceiptOutcome::Duplicate);

        let mut accepted = accepted_receipt(m.id, success(emp));
        accepted.receipt_number = Some("R-7".into());
        let outcome = f.processor.process(accepted, now).await.unwrap();
        assert_eq!(outcome, ReceiptOutcome::Reconciled(ReconcileOutcome::Accepted));
        let receipts = f.store.receipts_for_message(m.id).await.unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].status, ReceiptStatus::Accepted);
    }

    #[tokio::test]
    async fn rejected_receipt_rejects_message_and_alerts() {
        let f = fixture().await;
        let now = Utc::now();
        let m = sent(&f, EmployeeId::new(), now).await;

        let receipt = InboundReceipt {
            status: ReceiptStatus::Rejected,
            receipt_number: Some("R-9".into()),
            validation_errors: vec![ValidationIssue {
                code: Some("E4".into()),
                field: Some("national_id".into()),
                message: "unknown person".into(),
            }],
            ..pending_receipt(m.id)
        };
        assert_eq!(f.processor.process(receipt, now).await.unwrap(), ReceiptOutcome::Rejected);

        let stored = f.store.get_message(m.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Rejected);
        assert_eq!(stored.last_error.as_deref(), Some("[E4] national_id: unknown person"));
        let alert = &f.alerts.alerts()[0];
        assert_eq!(alert.category, AlertCategory::Rejection);
    }

    #[tokio::test]
    async fn receipt_for_terminal_message_is_audit_only() {
        let f = fixture().await;
        let emp = EmployeeId::new();
        let now = Utc::now();
        let m = sent(&f, emp, now).await;
        f.processor.process(accepted_receipt(m.id, success(emp)), now).await.unwrap();

        let mut late = accepted_receipt(m.id, success(emp));
        late.receipt_number = Some("R-late".into());
        assert_eq!(f.processor.process(late, now).await.unwrap(), ReceiptOutcome::Recorded);
        assert_eq!(f.store.receipts_for_message(m.id).await.unwrap().len(), 2);
        assert_eq!(
            f.store.get_message(m.id).await.unwrap().unwrap().status,
            MessageStatus::Accepted
        );
    }

    #[tokio::test]
    async fn poller_reschedules_until_receipt_then_reconciles() {
        let f = fixture().await;
        let emp = EmployeeId::new();
        let now = Utc::now();
        let m = sent(&f, emp, now).await;

        let summary = f.poller.poll_once(now).await.unwrap();
        assert_eq!(summary.still_pending, 1);
        let stored = f.store.get_message(m.id).await.unwrap().unwrap();
        assert_eq!(stored.next_poll_at, Some(now + Duration::seconds(60)));

        // Not due yet.
        assert_eq!(f.poller.poll_once(now).await.unwrap().polled, 0);

        f.registry.push_receipt(m.id, Ok(Some(accepted_receipt(m.id, success(emp)))));
        let later = now + Duration::seconds(61);
        let summary = f.poller.poll_once(later).await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(
            f.store.get_message(m.id).await.unwrap().unwrap().status,
            MessageStatus::Accepted
        );
    }

    #[tokio::test]
    async fn poller_expires_messages_past_the_window() {
        let f = fixture().await;
        let now = Utc::now();
        let m = sent(&f, EmployeeId::new(), now).await;

        let summary = f.poller.poll_once(now + Duration::hours(73)).await.unwrap();
        assert_eq!(summary.overdue, 1);
        let stored = f.store.get_message(m.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Error);
        assert_eq!(f.alerts.alerts()[0].severity, AlertSeverity::High);
    }

    #[tokio::test]
    async fn accepted_without_results_halts_connection() {
        let f = fixture().await;
        let now = Utc::now();
        let m = sent(&f, EmployeeId::new(), now).await;
        f.registry.push_receipt(m.id, Ok(Some(accepted_receipt(m.id, vec![]))));

        let summary = f.poller.poll_once(now).await.unwrap();
        assert_eq!(summary.errors, 1);
        assert_eq!(f.store.get_message(m.id).await.unwrap().unwrap().status, MessageStatus::Sent);
        let conn = f.store.get_connection(f.connection.id).await.unwrap().unwrap();
        assert_eq!(conn.status, regsync_outbox::ConnectionStatus::Error);
        assert!(f.alerts.alerts().iter().all(|a| a.severity == AlertSeverity::Critical));
    }
}
