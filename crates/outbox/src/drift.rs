//! Comparison of local employee state against the Registry's view.
//!
//! Everything here is pure: callers pull the data, this module decides what
//! is drift. Every pull yields a fresh snapshot per Registry employee; older
//! ones stay as history.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use regsync_core::{ConnectionId, EmployeeId, TenantId};

use crate::entity::{ContractRecord, EmployeeRecord, EmploymentStatus};
use crate::snapshot::{identity_hash, EmployeeSnapshot, RegistryEmployee};

/// The fields both sides can be compared on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparableView {
    pub full_name: String,
    pub position: String,
    pub contract_type: Option<String>,
    pub employment_status: EmploymentStatus,
    pub valid_from: Option<NaiveDate>,
    pub valid_to: Option<NaiveDate>,
}

impl ComparableView {
    pub fn from_local(employee: &EmployeeRecord, contract: Option<&ContractRecord>) -> Self {
        Self {
            full_name: employee.full_name.clone(),
            position: employee.position.clone(),
            contract_type: contract.map(|c| c.contract_type.clone()),
            employment_status: employee.employment_status,
            valid_from: contract.map(|c| c.start_date),
            valid_to: contract.and_then(|c| c.end_date),
        }
    }

    pub fn from_registry(employee: &RegistryEmployee) -> Self {
        Self {
            full_name: employee.full_name.clone(),
            position: employee.position.clone(),
            contract_type: employee.contract_type.clone(),
            employment_status: employee.employment_status,
            valid_from: employee.valid_from,
            valid_to: employee.valid_to,
        }
    }

    pub fn from_snapshot(snapshot: &EmployeeSnapshot) -> Self {
        Self {
            full_name: snapshot.full_name.clone(),
            position: snapshot.position.clone(),
            contract_type: snapshot.contract_type.clone(),
            employment_status: snapshot.employment_status,
            valid_from: snapshot.valid_from,
            valid_to: snapshot.valid_to,
        }
    }

    /// Fields that differ, as `(name, self, other)`.
    fn compare(&self, other: &ComparableView) -> Vec<(&'static str, JsonValue, JsonValue)> {
        let mut out = Vec::new();
        let mut check = |name: &'static str, a: JsonValue, b: JsonValue| {
            if a != b {
                out.push((name, a, b));
            }
        };
        check("full_name", json!(self.full_name.trim()), json!(other.full_name.trim()));
        check("position", json!(self.position.trim()), json!(other.position.trim()));
        check("contract_type", json!(self.contract_type), json!(other.contract_type));
        check(
            "employment_status",
            json!(self.employment_status),
            json!(other.employment_status),
        );
        check("valid_from", json!(self.valid_from), json!(other.valid_from));
        check("valid_to", json!(self.valid_to), json!(other.valid_to));
        out
    }

    pub fn diff_against_registry(&self, registry: &ComparableView) -> Vec<FieldDiff> {
        self.compare(registry)
            .into_iter()
            .map(|(field, local, registry)| FieldDiff { field: field.to_string(), local, registry })
            .collect()
    }

    pub fn changes_to(&self, current: &ComparableView) -> Vec<FieldChange> {
        self.compare(current)
            .into_iter()
            .map(|(field, previous, current)| FieldChange { field: field.to_string(), previous, current })
            .collect()
    }
}

/// Local value vs Registry value for one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: String,
    pub local: JsonValue,
    pub registry: JsonValue,
}

/// A field the Registry changed since the previous snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub previous: JsonValue,
    pub current: JsonValue,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftKind {
    MissingLocally,
    MissingInRegistry,
    FieldMismatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftEntry {
    pub registry_employee_id: Option<String>,
    pub employee_id: Option<EmployeeId>,
    pub kind: DriftKind,
    pub fields: Vec<FieldDiff>,
    pub registry_changes: Vec<FieldChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub connection_id: ConnectionId,
    pub generated_at: DateTime<Utc>,
    pub employees_compared: usize,
    pub explained_by_in_flight: usize,
    pub entries: Vec<DriftEntry>,
}

impl DriftReport {
    pub fn has_drift(&self) -> bool {
        !self.entries.is_empty()
    }
}

/// A local employee with the contract the comparison uses.
#[derive(Debug, Clone)]
pub struct LocalEmployee {
    pub record: EmployeeRecord,
    pub current_contract: Option<ContractRecord>,
}

pub struct DriftInput<'a> {
    pub tenant_id: TenantId,
    pub connection_id: ConnectionId,
    pub local: &'a [LocalEmployee],
    pub registry: &'a [RegistryEmployee],
    /// Latest stored snapshot per Registry employee id.
    pub latest_snapshots: &'a HashMap<String, EmployeeSnapshot>,
    /// Employees with a non-terminal message for themselves or their contracts.
    pub in_flight: &'a HashSet<EmployeeId>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DriftAnalysis {
    pub report: DriftReport,
    /// One new snapshot per Registry employee in this pull.
    pub snapshots: Vec<EmployeeSnapshot>,
}

pub fn analyze(input: DriftInput<'_>) -> DriftAnalysis {
    let by_registry_id: HashMap<&str, &LocalEmployee> = input
        .local
        .iter()
        .filter_map(|l| l.record.registry_id.as_deref().map(|id| (id, l)))
        .collect();
    let by_identity: HashMap<&str, &LocalEmployee> = input
        .local
        .iter()
        .map(|l| (l.record.identity_hash.as_str(), l))
        .collect();

    let mut matched: HashSet<EmployeeId> = HashSet::new();
    let mut entries = Vec::new();
    let mut snapshots = Vec::new();
    let mut compared = 0usize;
    let mut explained = 0usize;

    for remote in input.registry {
        let remote_view = ComparableView::from_registry(remote);
        let previous = input.latest_snapshots.get(&remote.registry_id);
        let registry_changes = previous
            .map(|p| ComparableView::from_snapshot(p).changes_to(&remote_view))
            .unwrap_or_default();

        let hash = identity_hash(&remote.national_id);
        let local = by_registry_id
            .get(remote.registry_id.as_str())
            .or_else(|| by_identity.get(hash.as_str()))
            .copied();

        let entry = match local {
            Some(local) => {
                matched.insert(local.record.id);
                compared += 1;
                if input.in_flight.contains(&local.record.id) {
                    explained += 1;
                    None
                } else {
                    let fields = ComparableView::from_local(
                        &local.record,
                        local.current_contract.as_ref(),
                    )
                    .diff_against_registry(&remote_view);
                    (!fields.is_empty()).then(|| DriftEntry {
                        registry_employee_id: Some(remote.registry_id.clone()),
                        employee_id: Some(local.record.id),
                        kind: DriftKind::FieldMismatch,
                        fields,
                        registry_changes: registry_changes.clone(),
                    })
                }
            }
            None if remote.employment_status != EmploymentStatus::Departed => Some(DriftEntry {
                registry_employee_id: Some(remote.registry_id.clone()),
                employee_id: None,
                kind: DriftKind::MissingLocally,
                fields: Vec::new(),
                registry_changes: registry_changes.clone(),
            }),
            None => None,
        };

        snapshots.push(EmployeeSnapshot::capture(
            input.tenant_id,
            input.connection_id,
            remote,
            input.now,
        ));
        entries.extend(entry);
    }

    for local in input.local.iter().filter(|l| !matched.contains(&l.record.id)) {
        compared += 1;
        if input.in_flight.contains(&local.record.id) {
            explained += 1;
            continue;
        }
        if local.record.employment_status == EmploymentStatus::Departed {
            continue;
        }
        entries.push(DriftEntry {
            registry_employee_id: local.record.registry_id.clone(),
            employee_id: Some(local.record.id),
            kind: DriftKind::MissingInRegistry,
            fields: Vec::new(),
            registry_changes: Vec::new(),
        });
    }

    DriftAnalysis {
        report: DriftReport {
            id: Uuid::now_v7(),
            tenant_id: input.tenant_id,
            connection_id: input.connection_id,
            generated_at: input.now,
            employees_compared: compared,
            explained_by_in_flight: explained,
            entries,
        },
        snapshots,
    }
}
