//! Local employee/contract records and references to them.
//!
//! The records are owned by the domain layer. The engine reads them for
//! drift comparison and writes back only `registry_id` and `sync_status`.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use regsync_core::{ConnectionId, ContractId, EmployeeId, TenantId};

/// The two entity types the Registry knows about.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Employee,
    Contract,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Employee => "employee",
            EntityKind::Contract => "contract",
        }
    }
}

impl core::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a local entity targeted by a message or a result.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum EntityRef {
    Employee(EmployeeId),
    Contract(ContractId),
}

impl EntityRef {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRef::Employee(_) => EntityKind::Employee,
            EntityRef::Contract(_) => EntityKind::Contract,
        }
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        match self {
            EntityRef::Employee(id) => id.as_uuid(),
            EntityRef::Contract(id) => id.as_uuid(),
        }
    }

    pub fn employee_id(&self) -> Option<EmployeeId> {
        match self {
            EntityRef::Employee(id) => Some(*id),
            EntityRef::Contract(_) => None,
        }
    }

    /// Rebuild a reference from its stored `(type, id)` columns.
    pub fn from_parts(kind: EntityKind, id: uuid::Uuid) -> Self {
        match kind {
            EntityKind::Employee => EntityRef::Employee(EmployeeId::from_uuid(id)),
            EntityKind::Contract => EntityRef::Contract(ContractId::from_uuid(id)),
        }
    }
}

impl core::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.as_uuid())
    }
}

/// Whether the Registry has confirmed the current local state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitySyncStatus {
    Pending,
    Synced,
}

impl EntitySyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitySyncStatus::Pending => "pending",
            EntitySyncStatus::Synced => "synced",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EntitySyncStatus::Pending),
            "synced" => Some(EntitySyncStatus::Synced),
            _ => None,
        }
    }
}

/// Employment status as both sides report it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmploymentStatus {
    Active,
    OnLeave,
    Departed,
    #[serde(other)]
    Unknown,
}

impl EmploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmploymentStatus::Active => "active",
            EmploymentStatus::OnLeave => "on_leave",
            EmploymentStatus::Departed => "departed",
            EmploymentStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => EmploymentStatus::Active,
            "on_leave" => EmploymentStatus::OnLeave,
            "departed" => EmploymentStatus::Departed,
            _ => EmploymentStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmployeeRecord {
    pub id: EmployeeId,
    pub tenant_id: TenantId,
    pub connection_id: ConnectionId,
    pub registry_id: Option<String>,
    pub sync_status: EntitySyncStatus,
    /// SHA-256 (hex) of the normalized national identifier.
    pub identity_hash: String,
    pub full_name: String,
    pub position: String,
    pub employment_status: EmploymentStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractRecord {
    pub id: ContractId,
    pub tenant_id: TenantId,
    pub connection_id: ConnectionId,
    pub employee_id: EmployeeId,
    pub registry_id: Option<String>,
    pub sync_status: EntitySyncStatus,
    pub contract_type: String,
    pub position: String,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
}

impl ContractRecord {
    /// Pick the contract the Registry considers current: the latest start date.
    pub fn current<'a>(contracts: impl IntoIterator<Item = &'a ContractRecord>) -> Option<&'a ContractRecord> {
        contracts.into_iter().max_by_key(|c| (c.start_date, *c.id.as_uuid()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_ref_serializes_tagged() {
        let id = EmployeeId::new();
        let json = serde_json::to_value(EntityRef::Employee(id)).unwrap();
        assert_eq!(json["type"], "employee");
        assert_eq!(json["id"], id.to_string());

        let back: EntityRef = serde_json::from_value(json).unwrap();
        assert_eq!(back, EntityRef::Employee(id));
    }

    #[test]
    fn unknown_employment_status_does_not_fail_deserialization() {
        let status: EmploymentStatus = serde_json::from_str("\"seconded\"").unwrap();
        assert_eq!(status, EmploymentStatus::Unknown);
    }

    #[test]
    fn current_contract_is_latest_start() {
        let tenant = TenantId::new();
        let conn = ConnectionId::new();
        let emp = EmployeeId::new();
        let mk = |start: NaiveDate| ContractRecord {
            id: ContractId::new(),
            tenant_id: tenant,
            connection_id: conn,
            employee_id: emp,
            registry_id: None,
            sync_status: EntitySyncStatus::Pending,
            contract_type: "permanent".into(),
            position: "clerk".into(),
            start_date: start,
            end_date: None,
        };
        let old = mk(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap());
        let new = mk(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        let all = vec![old, new.clone()];
        assert_eq!(ContractRecord::current(&all).map(|c| c.id), Some(new.id));
    }
}
