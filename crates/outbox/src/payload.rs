//! Write-once submission payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use regsync_core::{ContractId, EmployeeId};

use crate::entity::EntityRef;

/// One entity's section of a submission: its local id and the data the
/// Registry receives for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadSection<I> {
    pub local_id: I,
    pub data: JsonValue,
}

/// Snapshot of the data a message submits, captured at enqueue time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmissionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employee: Option<PayloadSection<EmployeeId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<PayloadSection<ContractId>>,
}

impl SubmissionPayload {
    pub fn employee(id: EmployeeId, data: JsonValue) -> Self {
        Self {
            employee: Some(PayloadSection { local_id: id, data }),
            contract: None,
        }
    }

    pub fn contract(id: ContractId, data: JsonValue) -> Self {
        Self {
            employee: None,
            contract: Some(PayloadSection { local_id: id, data }),
        }
    }

    pub fn with_contract(mut self, id: ContractId, data: JsonValue) -> Self {
        self.contract = Some(PayloadSection { local_id: id, data });
        self
    }

    pub fn with_employee(mut self, id: EmployeeId, data: JsonValue) -> Self {
        self.employee = Some(PayloadSection { local_id: id, data });
        self
    }

    /// Entities carried by this payload, employee first.
    pub fn entities(&self) -> Vec<EntityRef> {
        let mut out = Vec::with_capacity(2);
        if let Some(section) = &self.employee {
            out.push(EntityRef::Employee(section.local_id));
        }
        if let Some(section) = &self.contract {
            out.push(EntityRef::Contract(section.local_id));
        }
        out
    }

    pub fn contains(&self, entity: &EntityRef) -> bool {
        match entity {
            EntityRef::Employee(id) => self.employee.as_ref().is_some_and(|s| s.local_id == *id),
            EntityRef::Contract(id) => self.contract.as_ref().is_some_and(|s| s.local_id == *id),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.employee.is_none() && self.contract.is_none()
    }

    /// A copy restricted to the given entities. `None` when nothing remains.
    pub fn narrowed(&self, keep: &[EntityRef]) -> Option<SubmissionPayload> {
        let narrowed = SubmissionPayload {
            employee: self
                .employee
                .clone()
                .filter(|s| keep.contains(&EntityRef::Employee(s.local_id))),
            contract: self
                .contract
                .clone()
                .filter(|s| keep.contains(&EntityRef::Contract(s.local_id))),
        };
        (!narrowed.is_empty()).then_some(narrowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn narrowing_keeps_only_listed_sections() {
        let emp = EmployeeId::new();
        let con = ContractId::new();
        let payload = SubmissionPayload::employee(emp, json!({"name": "Ana"}))
            .with_contract(con, json!({"type": "fixed"}));

        let only_contract = payload.narrowed(&[EntityRef::Contract(con)]).unwrap();
        assert!(only_contract.employee.is_none());
        assert_eq!(only_contract.entities(), vec![EntityRef::Contract(con)]);

        assert!(payload.narrowed(&[EntityRef::Employee(EmployeeId::new())]).is_none());
    }
}
