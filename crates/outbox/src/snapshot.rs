//! Registry-side employee views and their stored snapshots.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use regsync_core::{ConnectionId, SnapshotId, TenantId};

use crate::entity::EmploymentStatus;

/// Hash of a national identifier, normalized (whitespace stripped, uppercased).
pub fn identity_hash(national_id: &str) -> String {
    let normalized: String = national_id
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect();
    format!("{:x}", Sha256::digest(normalized.as_bytes()))
}

/// One employee as the Registry reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEmployee {
    pub registry_id: String,
    pub national_id: String,
    pub full_name: String,
    #[serde(default)]
    pub position: String,
    #[serde(default)]
    pub contract_type: Option<String>,
    pub employment_status: EmploymentStatus,
    #[serde(default)]
    pub valid_from: Option<NaiveDate>,
    #[serde(default)]
    pub valid_to: Option<NaiveDate>,
    #[serde(default)]
    pub raw: JsonValue,
}

/// Append-only mirror of the Registry's view of one employee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmployeeSnapshot {
    pub id: SnapshotId,
    pub tenant_id: TenantId,
    pub connection_id: ConnectionId,
    pub registry_employee_id: String,
    pub identity_hash: String,
    pub full_name: String,
    pub position: String,
    pub contract_type: Option<String>,
    pub employment_status: EmploymentStatus,
    pub valid_from: Option<NaiveDate>,
    pub valid_to: Option<NaiveDate>,
    pub raw_payload: JsonValue,
    pub captured_at: DateTime<Utc>,
}

impl EmployeeSnapshot {
    pub fn capture(
        tenant_id: TenantId,
        connection_id: ConnectionId,
        employee: &RegistryEmployee,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SnapshotId::new(),
            tenant_id,
            connection_id,
            registry_employee_id: employee.registry_id.clone(),
            identity_hash: identity_hash(&employee.national_id),
            full_name: employee.full_name.clone(),
            position: employee.position.clone(),
            contract_type: employee.contract_type.clone(),
            employment_status: employee.employment_status,
            valid_from: employee.valid_from,
            valid_to: employee.valid_to,
            raw_payload: employee.raw.clone(),
            captured_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_hash_normalizes_input() {
        assert_eq!(identity_hash("ab 123 456"), identity_hash("AB123456"));
        assert_ne!(identity_hash("AB123456"), identity_hash("AB123457"));
        assert_eq!(identity_hash("x").len(), 64);
    }
}
