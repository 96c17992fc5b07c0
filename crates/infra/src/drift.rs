//! Drift detector: compares the Registry's employee list with local records.
//!
//! Read-only towards both sides. The only writes are new snapshots and the
//! drift report.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, instrument, warn};

use regsync_core::{ConnectionId, EmployeeId};
use regsync_outbox::{
    Alert, AlertCategory, AlertSeverity, Connection, ContractRecord, DriftReport, LocalEmployee,
    drift::{self, DriftInput},
};

use crate::engine::EngineContext;
use crate::error::EngineError;
use crate::registry::RegistryError;

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DriftRunSummary {
    pub connections: usize,
    pub with_drift: usize,
    pub skipped: usize,
}

pub struct DriftDetector {
    ctx: EngineContext,
}

impl DriftDetector {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// One pass over every active connection.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<DriftRunSummary, EngineError> {
        let mut summary = DriftRunSummary::default();
        for connection in self.ctx.store.list_active_connections().await? {
            if self.ctx.is_halted(connection.id) {
                summary.skipped += 1;
                continue;
            }
            match self.run_for_connection(&connection, now).await {
                Ok(Some(report)) => {
                    summary.connections += 1;
                    if report.has_drift() {
                        summary.with_drift += 1;
                    }
                }
                Ok(None) => summary.skipped += 1,
                Err(e) => {
                    warn!(connection_id = %connection.id, error = %e, "drift check failed");
                    summary.skipped += 1;
                }
            }
        }
        Ok(summary)
    }

    /// `None` when the Registry could not be read this time.
    #[instrument(skip(self, connection), fields(tenant_id = %connection.tenant_id, connection_id = %connection.id))]
    pub async fn run_for_connection(
        &self,
        connection: &Connection,
        now: DateTime<Utc>,
    ) -> Result<Option<DriftReport>, EngineError> {
        let credentials = match self.ctx.open_credentials(connection) {
            Ok(c) => c,
            Err(e) => {
                self.ctx
                    .fail_connection(connection, &format!("credential decryption failed: {e}"), now)
                    .await;
                return Ok(None);
            }
        };

        let registry = match self
            .ctx
            .registry
            .fetch_employees(&credentials, &connection.registry_employer_id)
            .await
        {
            Ok(employees) => employees,
            Err(RegistryError::Unauthorized { status }) => {
                self.ctx
                    .fail_connection(connection, &format!("registry refused credentials (HTTP {status})"), now)
                    .await;
                return Ok(None);
            }
            Err(e) => {
                warn!(error = %e, "registry employee list unavailable; drift check postponed");
                return Ok(None);
            }
        };

        let local = self.local_employees(connection.id).await?;
        let latest = self.ctx.store.latest_snapshots(connection.id).await?;
        let in_flight = self.in_flight(connection.id).await?;

        let analysis = drift::analyze(DriftInput {
            tenant_id: connection.tenant_id,
            connection_id: connection.id,
            local: &local,
            registry: &registry,
            latest_snapshots: &latest,
            in_flight: &in_flight,
            now,
        });

        if !analysis.snapshots.is_empty() {
            self.ctx.store.append_snapshots(&analysis.snapshots).await?;
        }
        let report = analysis.report;
        self.ctx.store.save_drift_report(&report).await?;

        info!(
            compared = report.employees_compared,
            in_flight = report.explained_by_in_flight,
            drift = report.entries.len(),
            snapshots = analysis.snapshots.len(),
            "drift check complete"
        );

        if report.has_drift() {
            let entities: Vec<_> = report
                .entries
                .iter()
                .filter_map(|e| e.employee_id)
                .map(regsync_outbox::EntityRef::Employee)
                .collect();
            self.ctx
                .alerts
                .raise(
                    Alert::new(
                        connection.tenant_id,
                        AlertSeverity::Medium,
                        AlertCategory::Drift,
                        format!(
                            "{} employee(s) differ between the Registry and local records",
                            report.entries.len()
                        ),
                    )
                    .for_connection(connection.id)
                    .with_entities(entities)
                    .with_details(json!({ "report_id": report.id, "entries": report.entries })),
                )
                .await;
        }
        Ok(Some(report))
    }

    async fn local_employees(&self, id: ConnectionId) -> Result<Vec<LocalEmployee>, EngineError> {
        let employees = self.ctx.store.employees_for_connection(id).await?;
        let contracts = self.ctx.store.contracts_for_connection(id).await?;

        let mut by_employee: HashMap<EmployeeId, Vec<&ContractRecord>> = HashMap::new();
        for c in &contracts {
            by_employee.entry(c.employee_id).or_default().push(c);
        }

        Ok(employees
            .into_iter()
            .map(|record| {
                let current_contract = by_employee
                    .get(&record.id)
                    .and_then(|cs| ContractRecord::current(cs.iter().copied()))
                    .cloned();
                LocalEmployee { record, current_contract }
            })
            .collect())
    }

    /// Employees with a non-terminal message for themselves or their contracts.
    async fn in_flight(&self, id: ConnectionId) -> Result<HashSet<EmployeeId>, EngineError> {
        Ok(self
            .ctx
            .store
            .open_messages_for_connection(id)
            .await?
            .iter()
            .flat_map(|m| m.affected_entities())
            .filter_map(|e| e.employee_id())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::InMemoryAlertSink;
    use crate::registry::ScriptedRegistryClient;
    use crate::store::{ConnectionStore, EntityStore, InMemorySyncStore, SnapshotStore};
    use crate::vault::{CredentialVault, RegistryCredentials};
    use crate::writer::OutboxWriter;
    use regsync_core::TenantId;
    use regsync_outbox::{
        DriftKind, EmployeeRecord, EmploymentStatus, EntitySyncStatus, MessageKind, Mutation,
        RegistryEmployee, identity_hash,
    };

    struct Fixture {
        store: Arc<InMemorySyncStore>,
        registry: Arc<ScriptedRegistryClient>,
        alerts: InMemoryAlertSink,
        detector: DriftDetector,
        connection: Connection,
    }

    async fn fixture() -> Fixture {
        let store = InMemorySyncStore::arc();
        let registry = Arc::new(ScriptedRegistryClient::new());
        let alerts = InMemoryAlertSink::new();
        let vault = Arc::new(CredentialVault::single(1, [3u8; 32]));
        let tenant = TenantId::new();
        let sealed = vault.seal(tenant, &RegistryCredentials::new("u", "p")).unwrap();
        let connection = Connection::new(tenant, "EMP-9", sealed, Utc::now());
        store.insert_connection(&connection).await.unwrap();
        let ctx = EngineContext::new(store.clone(), registry.clone(), vault, Arc::new(alerts.clone()));
        Fixture { store, registry, alerts, detector: DriftDetector::new(ctx), connection }
    }

    fn local(f: &Fixture, status: EmploymentStatus) -> EmployeeRecord {
        EmployeeRecord {
            id: EmployeeId::new(),
            tenant_id: f.connection.tenant_id,
            connection_id: f.connection.id,
            registry_id: Some("R-1".into()),
            sync_status: EntitySyncStatus::Synced,
            identity_hash: identity_hash("7702021234"),
            full_name: "Grace Hopper".into(),
            position: "Admiral".into(),
            employment_status: status,
            updated_at: Utc::now(),
        }
    }

    fn remote(status: EmploymentStatus) -> RegistryEmployee {
        RegistryEmployee {
            registry_id: "R-1".into(),
            national_id: "7702021234".into(),
            full_name: "Grace Hopper".into(),
            position: "Admiral".into(),
            contract_type: None,
            employment_status: status,
            valid_from: None,
            valid_to: None,
            raw: json!({"id": "R-1"}),
        }
    }

    #[tokio::test]
    async fn departed_in_registry_is_drift_and_local_record_is_untouched() {
        let f = fixture().await;
        let employee = local(&f, EmploymentStatus::Active);
        f.store.put_employee(employee.clone()).unwrap();
        f.registry.set_employees(vec![remote(EmploymentStatus::Departed)]);

        let report = f
            .detector
            .run_for_connection(&f.connection, Utc::now())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].kind, DriftKind::FieldMismatch);
        assert_eq!(report.entries[0].fields[0].field, "employment_status");

        let history = f.store.snapshot_history(f.connection.id, "R-1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].employment_status, EmploymentStatus::Departed);

        let alerts = f.alerts.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].category, AlertCategory::Drift);
        assert_eq!(alerts[0].related_entities, vec![regsync_outbox::EntityRef::Employee(employee.id)]);

        assert_eq!(f.store.get_employee(employee.id).await.unwrap().unwrap(), employee);
        assert_eq!(
            f.store.latest_drift_report(f.connection.tenant_id).await.unwrap(),
            Some(report)
        );
    }

    #[tokio::test]
    async fn in_flight_work_explains_the_difference() {
        let f = fixture().await;
        let employee = local(&f, EmploymentStatus::Active);
        f.store.put_employee(employee.clone()).unwrap();
        f.registry.set_employees(vec![remote(EmploymentStatus::Departed)]);

        let mut unit = f.store.begin();
        OutboxWriter::new(5)
            .enqueue(
                &mut unit,
                &f.connection,
                f.connection.tenant_id,
                Mutation::employee(MessageKind::EmployeeDelete, employee.id, json!({})),
            )
            .await
            .unwrap();
        unit.commit().unwrap();

        let report = f
            .detector
            .run_for_connection(&f.connection, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert!(!report.has_drift());
        assert_eq!(report.explained_by_in_flight, 1);
        assert!(f.alerts.alerts().is_empty());
    }

    #[tokio::test]
    async fn every_pull_appends_a_snapshot() {
        let f = fixture().await;
        f.store.put_employee(local(&f, EmploymentStatus::Active)).unwrap();
        f.registry.set_employees(vec![remote(EmploymentStatus::Active)]);

        let now = Utc::now();
        f.detector.run_once(now).await.unwrap();
        let summary = f.detector.run_once(now + chrono::Duration::hours(6)).await.unwrap();

        assert_eq!(summary.connections, 1);
        assert_eq!(summary.with_drift, 0);
        let history = f.store.snapshot_history(f.connection.id, "R-1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].captured_at, now);
        assert_eq!(history[1].captured_at, now + chrono::Duration::hours(6));
        assert_eq!(history[0].position, history[1].position);
        assert!(f.alerts.alerts().is_empty());
    }
}
