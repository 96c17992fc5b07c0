//! Result reconciler: turns an accepted receipt's results into local state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use regsync_core::{ExpectedVersion, MessageId};
use regsync_outbox::{
    Alert, AlertCategory, AlertSeverity, EntityRef, MessageStatus, OutboxMessage, SubmissionResult,
};

use crate::alerts::AlertSink;
use crate::error::{EngineError, StoreError};
use crate::store::SyncStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Every entity applied; message `accepted`.
    Accepted,
    /// Some entities applied; the rest resubmitted as `successor`.
    Split { successor: MessageId },
    /// Nothing applied; message `error`.
    Failed,
    /// The message is no longer `sent` (already reconciled, or lost a race).
    Skipped,
}

pub struct ResultReconciler {
    store: Arc<dyn SyncStore>,
    alerts: Arc<dyn AlertSink>,
}

impl ResultReconciler {
    pub fn new(store: Arc<dyn SyncStore>, alerts: Arc<dyn AlertSink>) -> Self {
        Self { store, alerts }
    }

    pub async fn reconcile(
        &self,
        message: OutboxMessage,
        results: &[SubmissionResult],
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, EngineError> {
        if message.status != MessageStatus::Sent {
            return Ok(ReconcileOutcome::Skipped);
        }
        if results.is_empty() {
            return Err(self.no_results(&message, "carries no results").await);
        }

        let mut applied: Vec<(EntityRef, Option<String>)> = Vec::new();
        let mut failed: Vec<EntityRef> = Vec::new();
        let mut foreign: Vec<EntityRef> = Vec::new();
        for result in results {
            for (entity, registry_id) in result.applied() {
                if !submitted(&message, &entity) {
                    if !foreign.contains(&entity) {
                        foreign.push(entity);
                    }
                } else if !applied.iter().any(|(e, _)| *e == entity) {
                    applied.push((entity, registry_id));
                }
            }
            for entity in result.failed() {
                if !submitted(&message, &entity) {
                    if !foreign.contains(&entity) {
                        foreign.push(entity);
                    }
                } else if !failed.contains(&entity) {
                    failed.push(entity);
                }
            }
        }
        failed.retain(|f| !applied.iter().any(|(e, _)| e == f));

        if !foreign.is_empty() {
            warn!(message_id = %message.id, ignored = foreign.len(), "results name entities outside the message");
            self.alerts
                .raise(
                    Alert::new(
                        message.tenant_id,
                        AlertSeverity::High,
                        AlertCategory::SyncFailure,
                        format!(
                            "receipt for message {} names {} entit(ies) outside the submission; ignored",
                            message.id,
                            foreign.len()
                        ),
                    )
                    .for_connection(message.connection_id)
                    .with_message(message.id)
                    .with_details(json!({ "ignored_entities": foreign })),
                )
                .await;
        }
        if applied.is_empty() && failed.is_empty() {
            return Err(self.no_results(&message, "names none of its entities").await);
        }

        for (entity, registry_id) in &applied {
            match self
                .store
                .mark_entity_synced(message.tenant_id, message.connection_id, *entity, registry_id.as_deref())
                .await
            {
                Ok(()) => {}
                // Removed locally since enqueue; nothing left to mark.
                Err(StoreError::NotFound(_)) => {
                    debug!(message_id = %message.id, %entity, "applied entity no longer exists locally")
                }
                Err(e) => return Err(e.into()),
            }
        }

        let details: Vec<String> = results.iter().filter_map(|r| r.details.clone()).collect();

        if failed.is_empty() {
            self.accept(message, now).await
        } else if applied.is_empty() {
            self.fail(message, failed, details, now).await
        } else {
            self.split(message, failed, details, now).await
        }
    }

    /// An accepted receipt that applies to nothing in the message.
    async fn no_results(&self, message: &OutboxMessage, what: &str) -> EngineError {
        let text = format!("accepted receipt for message {} {what}", message.id);
        self.alerts
            .raise(
                Alert::new(message.tenant_id, AlertSeverity::Critical, AlertCategory::SyncFailure, text.clone())
                    .for_connection(message.connection_id)
                    .with_message(message.id),
            )
            .await;
        EngineError::fault(text)
    }

    async fn accept(&self, mut message: OutboxMessage, now: DateTime<Utc>) -> Result<ReconcileOutcome, EngineError> {
        let expected = ExpectedVersion::Exact(message.version);
        message.mark_accepted(now)?;
        match self.store.update_message(&message, expected).await {
            Ok(_) => {}
            Err(e) if e.is_concurrency() => return Ok(ReconcileOutcome::Skipped),
            Err(e) => return Err(e.into()),
        }
        self.store
            .record_sync_success(message.connection_id, now)
            .await?;
        info!(message_id = %message.id, connection_id = %message.connection_id, "message accepted");
        Ok(ReconcileOutcome::Accepted)
    }

    async fn fail(
        &self,
        mut message: OutboxMessage,
        failed: Vec<EntityRef>,
        details: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, EngineError> {
        let expected = ExpectedVersion::Exact(message.version);
        let detail = if details.is_empty() {
            "registry reported failure".to_string()
        } else {
            details.join("; ")
        };
        message.mark_failed(detail.clone(), now)?;
        match self.store.update_message(&message, expected).await {
            Ok(_) => {}
            Err(e) if e.is_concurrency() => return Ok(ReconcileOutcome::Skipped),
            Err(e) => return Err(e.into()),
        }

        warn!(message_id = %message.id, kind = %message.kind, detail = %detail, "registry reported failure");
        self.alerts
            .raise(
                Alert::new(
                    message.tenant_id,
                    message.kind.failure_severity(),
                    AlertCategory::SyncFailure,
                    format!("{} {} failed at the registry: {detail}", message.kind, message.entity),
                )
                .for_connection(message.connection_id)
                .with_message(message.id)
                .with_entities(failed),
            )
            .await;
        Ok(ReconcileOutcome::Failed)
    }

    async fn split(
        &self,
        mut message: OutboxMessage,
        failed: Vec<EntityRef>,
        details: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, EngineError> {
        let expected = ExpectedVersion::Exact(message.version);
        let successor = message.split_remainder(&failed, now)?;
        let (original, successor) = match self.store.split_message(&message, expected, successor).await {
            Ok(pair) => pair,
            Err(e) if e.is_concurrency() => return Ok(ReconcileOutcome::Skipped),
            Err(e) => return Err(e.into()),
        };

        info!(
            message_id = %original.id,
            successor_id = %successor.id,
            successor_kind = %successor.kind,
            "partial acceptance; remainder requeued"
        );
        self.alerts
            .raise(
                Alert::new(
                    original.tenant_id,
                    AlertSeverity::Medium,
                    AlertCategory::SyncFailure,
                    format!(
                        "{} partially accepted; {} resubmitted as {}",
                        original.kind,
                        failed.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
                        successor.id
                    ),
                )
                .for_connection(original.connection_id)
                .with_message(original.id)
                .with_entities(failed)
                .with_details(json!({ "successor_id": successor.id, "details": details })),
            )
            .await;
        Ok(ReconcileOutcome::Split {
            successor: successor.id,
        })
    }
}

/// Entities the message itself submitted. The parent of a contract message
/// is not one of them.
fn submitted(message: &OutboxMessage, entity: &EntityRef) -> bool {
    message.entity == *entity || message.payload.contains(entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::InMemoryAlertSink;
    use crate::store::{ConnectionStore, EntityStore, InMemorySyncStore, OutboxStore};
    use chrono::NaiveDate;
    use regsync_core::{ContractId, EmployeeId, ReceiptId, ResultId, TenantId};
    use regsync_outbox::{
        Connection, ContractRecord, EmployeeRecord, EmploymentStatus, EncryptedCredentials,
        EntitySyncStatus, MessageKind, Mutation, ResultEntity, ResultOutcome, SubmissionPayload,
    };

    struct Fixture {
        store: Arc<InMemorySyncStore>,
        alerts: InMemoryAlertSink,
        reconciler: ResultReconciler,
        connection: Connection,
    }

    async fn fixture() -> Fixture {
        let store = InMemorySyncStore::arc();
        let alerts = InMemoryAlertSink::new();
        let connection = Connection::new(TenantId::new(), "EMP-1", EncryptedCredentials::default(), Utc::now());
        store.insert_connection(&connection).await.unwrap();
        let reconciler = ResultReconciler::new(store.clone(), Arc::new(alerts.clone()));
        Fixture { store, alerts, reconciler, connection }
    }

    fn employee(c: &Connection, id: EmployeeId) -> EmployeeRecord {
        EmployeeRecord {
            id,
            tenant_id: c.tenant_id,
            connection_id: c.id,
            registry_id: None,
            sync_status: EntitySyncStatus::Pending,
            identity_hash: "h".into(),
            full_name: "Ada".into(),
            position: "Engineer".into(),
            employment_status: EmploymentStatus::Active,
            updated_at: Utc::now(),
        }
    }

    fn contract(c: &Connection, id: ContractId, employee: EmployeeId) -> ContractRecord {
        ContractRecord {
            id,
            tenant_id: c.tenant_id,
            connection_id: c.id,
            employee_id: employee,
            registry_id: None,
            sync_status: EntitySyncStatus::Pending,
            contract_type: "permanent".into(),
            position: "Engineer".into(),
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end_date: None,
        }
    }

    async fn sent(f: &Fixture, mutation: Mutation) -> OutboxMessage {
        let now = Utc::now();
        let mut m = OutboxMessage::from_mutation(f.connection.tenant_id, f.connection.id, mutation, 5, now).unwrap();
        m = f.store.append_message(m).await.unwrap();
        let v = m.version;
        m.begin_send(now).unwrap();
        m = f.store.update_message(&m, ExpectedVersion::Exact(v)).await.unwrap();
        let v = m.version;
        m.mark_sent(None, None, now).unwrap();
        f.store.update_message(&m, ExpectedVersion::Exact(v)).await.unwrap()
    }

    fn result(m: &OutboxMessage, outcome: ResultOutcome, entities: Vec<ResultEntity>) -> SubmissionResult {
        SubmissionResult {
            id: ResultId::new(),
            receipt_id: ReceiptId::new(),
            message_id: m.id,
            tenant_id: m.tenant_id,
            outcome,
            entities,
            details: Some("contract start date invalid".into()),
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn full_success_accepts_and_records_registry_ids() {
        let f = fixture().await;
        let emp = EmployeeId::new();
        f.store.put_employee(employee(&f.connection, emp)).unwrap();
        let m = sent(&f, Mutation::employee(MessageKind::EmployeeCreate, emp, json!({}))).await;

        let r = result(&m, ResultOutcome::Success, vec![ResultEntity {
            entity: EntityRef::Employee(emp),
            registry_id: Some("REG-1".into()),
        }]);
        let outcome = f.reconciler.reconcile(m.clone(), &[r], Utc::now()).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Accepted);
        let stored = f.store.get_message(m.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Accepted);
        let e = f.store.get_employee(emp).await.unwrap().unwrap();
        assert_eq!(e.registry_id.as_deref(), Some("REG-1"));
        assert_eq!(e.sync_status, EntitySyncStatus::Synced);
        let c = f.store.get_connection(f.connection.id).await.unwrap().unwrap();
        assert!(c.last_sync_at.is_some());
    }

    #[tokio::test]
    async fn partial_success_splits_into_one_narrower_successor() {
        let f = fixture().await;
        let emp = EmployeeId::new();
        let ctr = ContractId::new();
        f.store.put_employee(employee(&f.connection, emp)).unwrap();
        f.store.put_contract(contract(&f.connection, ctr, emp)).unwrap();

        let mutation = Mutation {
            kind: MessageKind::EmployeeCreate,
            entity: EntityRef::Employee(emp),
            parent: None,
            payload: SubmissionPayload::employee(emp, json!({"name": "Ada"})).with_contract(ctr, json!({"type": "permanent"})),
        };
        let m = sent(&f, mutation).await;

        let r = result(&m, ResultOutcome::PartialSuccess, vec![
            ResultEntity { entity: EntityRef::Employee(emp), registry_id: Some("REG-E".into()) },
            ResultEntity { entity: EntityRef::Contract(ctr), registry_id: None },
        ]);
        let outcome = f.reconciler.reconcile(m.clone(), &[r], Utc::now()).await.unwrap();

        let ReconcileOutcome::Split { successor } = outcome else {
            panic!("expected split, got {outcome:?}");
        };
        let original = f.store.get_message(m.id).await.unwrap().unwrap();
        assert_eq!(original.status, MessageStatus::Error);
        assert_eq!(original.successor_id, Some(successor));

        let next = f.store.get_message(successor).await.unwrap().unwrap();
        assert_eq!(next.status, MessageStatus::Queued);
        assert_eq!(next.attempts, 0);
        assert_eq!(next.kind, MessageKind::ContractCreate);
        assert_eq!(next.entity, EntityRef::Contract(ctr));
        assert!(next.payload.employee.is_none());
        assert_eq!(next.predecessor_id, Some(m.id));

        let e = f.store.get_employee(emp).await.unwrap().unwrap();
        assert_eq!(e.registry_id.as_deref(), Some("REG-E"));
        let c = f.store.get_contract(ctr).await.unwrap().unwrap();
        assert_eq!(c.sync_status, EntitySyncStatus::Pending);

        let alerts = f.alerts.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Medium);
    }

    #[tokio::test]
    async fn failure_only_errors_with_kind_severity() {
        let f = fixture().await;
        let ctr = ContractId::new();
        let m = sent(
            &f,
            Mutation::contract(MessageKind::ContractEnd, ctr, EmployeeId::new(), json!({})),
        )
        .await;

        let r = result(&m, ResultOutcome::Failure, vec![ResultEntity {
            entity: EntityRef::Contract(ctr),
            registry_id: None,
        }]);
        let outcome = f.reconciler.reconcile(m.clone(), &[r], Utc::now()).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Failed);
        let stored = f.store.get_message(m.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Error);
        assert_eq!(stored.last_error.as_deref(), Some("contract start date invalid"));
        assert_eq!(f.alerts.alerts()[0].severity, AlertSeverity::Critical);
    }

    #[tokio::test]
    async fn accepted_without_results_is_a_fault_and_changes_nothing() {
        let f = fixture().await;
        let m = sent(&f, Mutation::employee(MessageKind::EmployeeUpdate, EmployeeId::new(), json!({}))).await;

        let err = f.reconciler.reconcile(m.clone(), &[], Utc::now()).await.unwrap_err();
        assert!(matches!(err, EngineError::Fault(_)));
        assert_eq!(f.store.get_message(m.id).await.unwrap().unwrap().status, MessageStatus::Sent);
        assert_eq!(f.alerts.alerts()[0].severity, AlertSeverity::Critical);
    }

    #[tokio::test]
    async fn entities_outside_the_submission_are_left_alone() {
        let f = fixture().await;
        let ours = EmployeeId::new();
        f.store.put_employee(employee(&f.connection, ours)).unwrap();

        let elsewhere = Connection::new(TenantId::new(), "EMP-2", EncryptedCredentials::default(), Utc::now());
        let theirs = employee(&elsewhere, EmployeeId::new());
        f.store.put_employee(theirs.clone()).unwrap();

        let m = sent(&f, Mutation::employee(MessageKind::EmployeeCreate, ours, json!({}))).await;
        let r = result(&m, ResultOutcome::Success, vec![
            ResultEntity { entity: EntityRef::Employee(ours), registry_id: Some("REG-E".into()) },
            ResultEntity { entity: EntityRef::Employee(theirs.id), registry_id: Some("HIJACK".into()) },
        ]);
        let outcome = f.reconciler.reconcile(m.clone(), &[r], Utc::now()).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Accepted);
        let e = f.store.get_employee(ours).await.unwrap().unwrap();
        assert_eq!(e.registry_id.as_deref(), Some("REG-E"));
        assert_eq!(f.store.get_employee(theirs.id).await.unwrap().unwrap(), theirs);

        let alerts = f.alerts.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::High);
        assert_eq!(alerts[0].related_message, Some(m.id));
    }

    #[tokio::test]
    async fn results_naming_only_other_entities_are_a_fault() {
        let f = fixture().await;
        let m = sent(&f, Mutation::employee(MessageKind::EmployeeUpdate, EmployeeId::new(), json!({}))).await;
        let r = result(&m, ResultOutcome::Success, vec![ResultEntity {
            entity: EntityRef::Employee(EmployeeId::new()),
            registry_id: Some("REG-X".into()),
        }]);

        let err = f.reconciler.reconcile(m.clone(), &[r], Utc::now()).await.unwrap_err();
        assert!(matches!(err, EngineError::Fault(_)));
        assert_eq!(f.store.get_message(m.id).await.unwrap().unwrap().status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn not_sent_is_skipped() {
        let f = fixture().await;
        let mut m = sent(&f, Mutation::employee(MessageKind::EmployeeUpdate, EmployeeId::new(), json!({}))).await;
        m.status = MessageStatus::Accepted;
        let outcome = f.reconciler.reconcile(m, &[], Utc::now()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Skipped);
    }
}
