//! Outbox messages and their delivery state machine.
//!
//! ```text
//! queued  -> sending | error (superseded)
//! sending -> queued (retry) | rejected | sent | error (exhausted)
//! sent    -> sent (pending) | accepted | rejected | error
//! ```
//!
//! `accepted`, `rejected` and `error` are terminal. Messages are never deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use regsync_core::{
    ConnectionId, DomainError, DomainResult, MessageId, TenantId, Versioned,
};

use crate::alert::AlertSeverity;
use crate::entity::{EntityKind, EntityRef};
use crate::payload::SubmissionPayload;
use crate::retry::RetryPolicy;

/// What a message does to its entity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Remove,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    EmployeeCreate,
    EmployeeUpdate,
    EmployeeDelete,
    ContractCreate,
    ContractUpdate,
    ContractEnd,
}

impl MessageKind {
    pub fn from_parts(entity: EntityKind, op: Operation) -> Self {
        match (entity, op) {
            (EntityKind::Employee, Operation::Create) => MessageKind::EmployeeCreate,
            (EntityKind::Employee, Operation::Update) => MessageKind::EmployeeUpdate,
            (EntityKind::Employee, Operation::Remove) => MessageKind::EmployeeDelete,
            (EntityKind::Contract, Operation::Create) => MessageKind::ContractCreate,
            (EntityKind::Contract, Operation::Update) => MessageKind::ContractUpdate,
            (EntityKind::Contract, Operation::Remove) => MessageKind::ContractEnd,
        }
    }

    pub fn entity_kind(&self) -> EntityKind {
        match self {
            MessageKind::EmployeeCreate | MessageKind::EmployeeUpdate | MessageKind::EmployeeDelete => {
                EntityKind::Employee
            }
            MessageKind::ContractCreate | MessageKind::ContractUpdate | MessageKind::ContractEnd => {
                EntityKind::Contract
            }
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            MessageKind::EmployeeCreate | MessageKind::ContractCreate => Operation::Create,
            MessageKind::EmployeeUpdate | MessageKind::ContractUpdate => Operation::Update,
            MessageKind::EmployeeDelete | MessageKind::ContractEnd => Operation::Remove,
        }
    }

    pub fn is_removal(&self) -> bool {
        self.operation() == Operation::Remove
    }

    pub fn is_update(&self) -> bool {
        self.operation() == Operation::Update
    }

    /// Lower is sooner: removals, then updates, then creates.
    pub fn default_priority(&self) -> i32 {
        match self.operation() {
            Operation::Remove => 10,
            Operation::Update => 20,
            Operation::Create => 30,
        }
    }

    /// Severity of the alert raised when the Registry fails this kind.
    pub fn failure_severity(&self) -> AlertSeverity {
        match self.operation() {
            Operation::Remove => AlertSeverity::Critical,
            Operation::Create => AlertSeverity::High,
            Operation::Update => AlertSeverity::Medium,
        }
    }

    /// Same operation, retargeted at another entity type.
    pub fn narrowed_to(&self, entity: EntityKind) -> Self {
        MessageKind::from_parts(entity, self.operation())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::EmployeeCreate => "employee_create",
            MessageKind::EmployeeUpdate => "employee_update",
            MessageKind::EmployeeDelete => "employee_delete",
            MessageKind::ContractCreate => "contract_create",
            MessageKind::ContractUpdate => "contract_update",
            MessageKind::ContractEnd => "contract_end",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "employee_create" => MessageKind::EmployeeCreate,
            "employee_update" => MessageKind::EmployeeUpdate,
            "employee_delete" => MessageKind::EmployeeDelete,
            "contract_create" => MessageKind::ContractCreate,
            "contract_update" => MessageKind::ContractUpdate,
            "contract_end" => MessageKind::ContractEnd,
            _ => return None,
        })
    }
}

impl core::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    Sending,
    Sent,
    Accepted,
    Rejected,
    Error,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 6] = [
        MessageStatus::Queued,
        MessageStatus::Sending,
        MessageStatus::Sent,
        MessageStatus::Accepted,
        MessageStatus::Rejected,
        MessageStatus::Error,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Accepted | MessageStatus::Rejected | MessageStatus::Error
        )
    }

    pub fn can_transition_to(&self, to: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, to),
            (Queued, Sending)
                | (Queued, Error)
                | (Sending, Queued)
                | (Sending, Rejected)
                | (Sending, Sent)
                | (Sending, Error)
                | (Sent, Sent)
                | (Sent, Accepted)
                | (Sent, Rejected)
                | (Sent, Error)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Queued => "queued",
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Accepted => "accepted",
            MessageStatus::Rejected => "rejected",
            MessageStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        MessageStatus::ALL.into_iter().find(|st| st.as_str() == s)
    }
}

impl core::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A domain mutation as handed to the outbox writer.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub kind: MessageKind,
    pub entity: EntityRef,
    pub parent: Option<EntityRef>,
    pub payload: SubmissionPayload,
}

impl Mutation {
    pub fn employee(
        kind: MessageKind,
        employee: regsync_core::EmployeeId,
        data: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            entity: EntityRef::Employee(employee),
            parent: None,
            payload: SubmissionPayload::employee(employee, data),
        }
    }

    pub fn contract(
        kind: MessageKind,
        contract: regsync_core::ContractId,
        employee: regsync_core::EmployeeId,
        data: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            entity: EntityRef::Contract(contract),
            parent: Some(EntityRef::Employee(employee)),
            payload: SubmissionPayload::contract(contract, data),
        }
    }

    /// Bundle a contract section into an employee submission (hire + first contract).
    pub fn bundling_contract(
        mut self,
        contract: regsync_core::ContractId,
        data: serde_json::Value,
    ) -> Self {
        self.payload = self.payload.with_contract(contract, data);
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.kind.entity_kind() != self.entity.kind() {
            return Err(DomainError::validation(format!(
                "{} cannot target {}",
                self.kind, self.entity
            )));
        }
        if !self.payload.contains(&self.entity) {
            return Err(DomainError::validation(format!(
                "payload has no section for {}",
                self.entity
            )));
        }
        match (self.entity.kind(), self.parent) {
            (EntityKind::Contract, Some(EntityRef::Employee(_))) => Ok(()),
            (EntityKind::Contract, _) => Err(DomainError::validation(
                "contract messages must name the owning employee",
            )),
            (EntityKind::Employee, None) => Ok(()),
            (EntityKind::Employee, Some(_)) => Err(DomainError::validation(
                "employee messages have no parent entity",
            )),
        }
    }
}

/// What happened after a transient failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { at: DateTime<Utc> },
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: MessageId,
    pub tenant_id: TenantId,
    pub connection_id: ConnectionId,
    pub kind: MessageKind,
    pub entity: EntityRef,
    pub parent: Option<EntityRef>,
    /// Written once at enqueue; stores refuse updates that change it.
    pub payload: SubmissionPayload,
    pub status: MessageStatus,
    pub priority: i32,
    pub attempts: u32,
    pub max_attempts: u32,
    pub scheduled_at: DateTime<Utc>,
    /// Enqueue order within the store, assigned on append.
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub receipt_ref: Option<String>,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub predecessor_id: Option<MessageId>,
    pub replay_of: Option<MessageId>,
    pub successor_id: Option<MessageId>,
    pub version: u64,
}

impl Versioned for OutboxMessage {
    fn version(&self) -> u64 {
        self.version
    }
}

impl OutboxMessage {
    pub fn from_mutation(
        tenant_id: TenantId,
        connection_id: ConnectionId,
        mutation: Mutation,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        mutation.validate()?;
        Ok(Self {
            id: MessageId::new(),
            tenant_id,
            connection_id,
            kind: mutation.kind,
            entity: mutation.entity,
            parent: mutation.parent,
            payload: mutation.payload,
            status: MessageStatus::Queued,
            priority: mutation.kind.default_priority(),
            attempts: 0,
            max_attempts: max_attempts.max(1),
            scheduled_at: now,
            sequence: 0,
            created_at: now,
            updated_at: now,
            sent_at: None,
            completed_at: None,
            last_error: None,
            receipt_ref: None,
            next_poll_at: None,
            predecessor_id: None,
            replay_of: None,
            successor_id: None,
            version: 0,
        })
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == MessageStatus::Queued && self.scheduled_at <= now
    }

    /// Every entity whose Registry state this message can touch.
    pub fn affected_entities(&self) -> Vec<EntityRef> {
        let mut out = self.payload.entities();
        for e in std::iter::once(self.entity).chain(self.parent) {
            if !out.contains(&e) {
                out.push(e);
            }
        }
        out
    }

    pub fn touches(&self, entity: &EntityRef) -> bool {
        self.entity == *entity
            || self.parent.as_ref() == Some(entity)
            || self.payload.contains(entity)
    }

    fn transition(&mut self, to: MessageStatus, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(DomainError::illegal_transition(self.status, to));
        }
        self.status = to;
        self.updated_at = now;
        if to.is_terminal() {
            self.completed_at = Some(now);
            self.next_poll_at = None;
        }
        Ok(())
    }

    fn charge_attempt(&mut self) {
        self.attempts = (self.attempts + 1).min(self.max_attempts);
    }

    /// `queued -> sending`. The attempt is charged when the outcome is known.
    pub fn begin_send(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.attempts >= self.max_attempts {
            return Err(DomainError::invariant(format!(
                "message {} already used {} of {} attempts",
                self.id, self.attempts, self.max_attempts
            )));
        }
        self.transition(MessageStatus::Sending, now)
    }

    /// Transient failure while sending: charge an attempt, then back off or give up.
    pub fn fail_transient(
        &mut self,
        error: impl Into<String>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> DomainResult<RetryDecision> {
        if self.status != MessageStatus::Sending {
            return Err(DomainError::illegal_transition(self.status, MessageStatus::Queued));
        }
        self.charge_attempt();
        self.last_error = Some(error.into());

        if RetryPolicy::should_retry(self.attempts, self.max_attempts) {
            let at = policy.next_schedule(self.attempts, self.scheduled_at, now);
            self.transition(MessageStatus::Queued, now)?;
            self.scheduled_at = at;
            Ok(RetryDecision::Retry { at })
        } else {
            self.transition(MessageStatus::Error, now)?;
            self.last_error = Some(format!(
                "retries exhausted after {} attempts: {}",
                self.attempts,
                self.last_error.as_deref().unwrap_or_default()
            ));
            Ok(RetryDecision::Exhausted)
        }
    }

    /// `sending -> queued` without consuming an attempt (credentials problem,
    /// not a delivery problem).
    pub fn requeue_uncharged(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != MessageStatus::Sending {
            return Err(DomainError::illegal_transition(self.status, MessageStatus::Queued));
        }
        self.last_error = Some(reason.into());
        self.transition(MessageStatus::Queued, now)
    }

    /// Registry took the submission; a receipt is pending or in hand.
    pub fn mark_sent(
        &mut self,
        receipt_ref: Option<String>,
        next_poll_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        let from_sending = self.status == MessageStatus::Sending;
        self.transition(MessageStatus::Sent, now)?;
        if from_sending {
            self.charge_attempt();
            self.sent_at = Some(now);
            self.last_error = None;
        }
        if receipt_ref.is_some() {
            self.receipt_ref = receipt_ref;
        }
        self.next_poll_at = next_poll_at;
        Ok(())
    }

    pub fn mark_rejected(&mut self, detail: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        let from_sending = self.status == MessageStatus::Sending;
        self.transition(MessageStatus::Rejected, now)?;
        if from_sending {
            self.charge_attempt();
            self.sent_at = Some(now);
        }
        self.last_error = Some(detail.into());
        Ok(())
    }

    pub fn mark_accepted(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != MessageStatus::Sent {
            return Err(DomainError::illegal_transition(self.status, MessageStatus::Accepted));
        }
        self.transition(MessageStatus::Accepted, now)?;
        self.last_error = None;
        Ok(())
    }

    /// The Registry processed the submission and reported failure.
    pub fn mark_failed(&mut self, detail: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != MessageStatus::Sent {
            return Err(DomainError::illegal_transition(self.status, MessageStatus::Error));
        }
        self.transition(MessageStatus::Error, now)?;
        self.last_error = Some(detail.into());
        Ok(())
    }

    /// No receipt arrived inside the receipt window.
    pub fn mark_receipt_overdue(&mut self, window: chrono::Duration, now: DateTime<Utc>) -> DomainResult<()> {
        self.mark_failed(
            format!("no final receipt within {} hours", window.num_hours()),
            now,
        )
    }

    /// A later removal of the same entity makes this queued update moot.
    pub fn mark_superseded(&mut self, by: MessageId, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != MessageStatus::Queued || !self.kind.is_update() {
            return Err(DomainError::invariant(format!(
                "only queued updates can be superseded ({} is {} {})",
                self.id, self.status, self.kind
            )));
        }
        self.transition(MessageStatus::Error, now)?;
        self.last_error = Some(format!("superseded by {by}"));
        Ok(())
    }

    /// Resolve a partially accepted message and produce the retryable
    /// remainder scoped to the entities that failed.
    pub fn split_remainder(
        &mut self,
        failed: &[EntityRef],
        now: DateTime<Utc>,
    ) -> DomainResult<OutboxMessage> {
        if self.status != MessageStatus::Sent {
            return Err(DomainError::illegal_transition(self.status, MessageStatus::Error));
        }
        let payload = self.payload.narrowed(failed).ok_or_else(|| {
            DomainError::invariant(format!(
                "partial result for {} names no entity of its payload",
                self.id
            ))
        })?;
        let entities = payload.entities();
        let primary = if entities.contains(&self.entity) {
            self.entity
        } else {
            entities[0]
        };
        let parent = match primary {
            EntityRef::Employee(_) => None,
            EntityRef::Contract(_) => self.parent.or_else(|| {
                self.payload
                    .employee
                    .as_ref()
                    .map(|s| EntityRef::Employee(s.local_id))
            }),
        };
        let kind = self.kind.narrowed_to(primary.kind());

        let successor = OutboxMessage {
            id: MessageId::new(),
            kind,
            entity: primary,
            parent,
            payload,
            status: MessageStatus::Queued,
            priority: kind.default_priority(),
            attempts: 0,
            scheduled_at: now,
            sequence: 0,
            created_at: now,
            updated_at: now,
            sent_at: None,
            completed_at: None,
            last_error: None,
            receipt_ref: None,
            next_poll_at: None,
            predecessor_id: Some(self.id),
            replay_of: None,
            successor_id: None,
            version: 0,
            ..self.clone()
        };

        self.transition(MessageStatus::Error, now)?;
        self.successor_id = Some(successor.id);
        self.last_error = Some(format!(
            "partially accepted; remainder resubmitted as {}",
            successor.id
        ));
        Ok(successor)
    }

    /// Administrative replay of a failed message as a fresh queued copy.
    /// The original stays terminal.
    pub fn replay(&self, max_attempts: u32, now: DateTime<Utc>) -> DomainResult<OutboxMessage> {
        if !matches!(self.status, MessageStatus::Error | MessageStatus::Rejected) {
            return Err(DomainError::validation(format!(
                "only error or rejected messages can be replayed ({} is {})",
                self.id, self.status
            )));
        }
        Ok(OutboxMessage {
            id: MessageId::new(),
            status: MessageStatus::Queued,
            priority: self.kind.default_priority(),
            attempts: 0,
            max_attempts: max_attempts.max(1),
            scheduled_at: now,
            sequence: 0,
            created_at: now,
            updated_at: now,
            sent_at: None,
            completed_at: None,
            last_error: None,
            receipt_ref: None,
            next_poll_at: None,
            predecessor_id: None,
            replay_of: Some(self.id),
            successor_id: None,
            version: 0,
            ..self.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regsync_core::{ContractId, EmployeeId};
    use serde_json::json;
    use std::time::Duration;

    fn message(kind: MessageKind, max_attempts: u32) -> OutboxMessage {
        let employee = EmployeeId::new();
        OutboxMessage::from_mutation(
            TenantId::new(),
            ConnectionId::new(),
            Mutation::employee(kind, employee, json!({"name": "Ana"})),
            max_attempts,
            Utc::now(),
        )
        .unwrap()
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::fixed(3, Duration::from_secs(5))
    }

    #[test]
    fn priority_follows_kind() {
        assert!(MessageKind::ContractEnd.default_priority() < MessageKind::EmployeeUpdate.default_priority());
        assert!(MessageKind::EmployeeUpdate.default_priority() < MessageKind::EmployeeCreate.default_priority());
        assert_eq!(message(MessageKind::EmployeeDelete, 3).priority, 10);
    }

    #[test]
    fn mutation_validation_rejects_mismatched_kind() {
        let m = Mutation::employee(MessageKind::ContractCreate, EmployeeId::new(), json!({}));
        assert!(matches!(m.validate(), Err(DomainError::Validation(_))));

        let mut m = Mutation::contract(
            MessageKind::ContractCreate,
            ContractId::new(),
            EmployeeId::new(),
            json!({}),
        );
        assert!(m.validate().is_ok());
        m.parent = None;
        assert!(m.validate().is_err());
    }

    #[test]
    fn transient_failures_retry_then_exhaust_at_cap() {
        let mut m = message(MessageKind::EmployeeUpdate, 3);
        let now = Utc::now();

        for expected_attempts in 1..3 {
            m.begin_send(now).unwrap();
            let decision = m.fail_transient("503", &policy(), now).unwrap();
            assert!(matches!(decision, RetryDecision::Retry { .. }));
            assert_eq!(m.status, MessageStatus::Queued);
            assert_eq!(m.attempts, expected_attempts);
            assert!(m.scheduled_at > now);
        }

        m.begin_send(now).unwrap();
        assert_eq!(m.fail_transient("503", &policy(), now).unwrap(), RetryDecision::Exhausted);
        assert_eq!(m.status, MessageStatus::Error);
        assert_eq!(m.attempts, 3);
        assert!(m.completed_at.is_some());
        assert!(m.begin_send(now).is_err());
    }

    #[test]
    fn uncharged_requeue_keeps_attempts() {
        let mut m = message(MessageKind::EmployeeCreate, 3);
        m.begin_send(Utc::now()).unwrap();
        m.requeue_uncharged("401 unauthorized", Utc::now()).unwrap();
        assert_eq!(m.status, MessageStatus::Queued);
        assert_eq!(m.attempts, 0);
    }

    #[test]
    fn sent_then_pending_then_accepted() {
        let mut m = message(MessageKind::EmployeeCreate, 3);
        let now = Utc::now();
        m.begin_send(now).unwrap();
        m.mark_sent(Some("R-1".into()), Some(now), now).unwrap();
        assert_eq!(m.attempts, 1);

        m.mark_sent(None, Some(now + chrono::Duration::minutes(1)), now).unwrap();
        assert_eq!(m.attempts, 1);
        assert_eq!(m.receipt_ref.as_deref(), Some("R-1"));

        m.mark_accepted(now).unwrap();
        assert_eq!(m.status, MessageStatus::Accepted);
        assert!(m.next_poll_at.is_none());
        assert!(m.mark_rejected("late", now).is_err());
    }

    #[test]
    fn supersession_only_applies_to_queued_updates() {
        let mut create = message(MessageKind::EmployeeCreate, 3);
        assert!(create.mark_superseded(MessageId::new(), Utc::now()).is_err());

        let mut update = message(MessageKind::EmployeeUpdate, 3);
        let by = MessageId::new();
        update.mark_superseded(by, Utc::now()).unwrap();
        assert_eq!(update.status, MessageStatus::Error);
        assert_eq!(update.last_error, Some(format!("superseded by {by}")));
    }

    #[test]
    fn split_narrows_to_failed_contract() {
        let employee = EmployeeId::new();
        let contract = ContractId::new();
        let now = Utc::now();
        let mut m = OutboxMessage::from_mutation(
            TenantId::new(),
            ConnectionId::new(),
            Mutation::employee(MessageKind::EmployeeCreate, employee, json!({"name": "Ana"}))
                .bundling_contract(contract, json!({"type": "fixed"})),
            5,
            now,
        )
        .unwrap();
        m.begin_send(now).unwrap();
        m.mark_sent(Some("R-9".into()), None, now).unwrap();

        let successor = m.split_remainder(&[EntityRef::Contract(contract)], now).unwrap();

        assert_eq!(m.status, MessageStatus::Error);
        assert_eq!(m.successor_id, Some(successor.id));
        assert!(m.last_error.as_deref().unwrap().starts_with("partially accepted"));

        assert_eq!(successor.kind, MessageKind::ContractCreate);
        assert_eq!(successor.entity, EntityRef::Contract(contract));
        assert_eq!(successor.parent, Some(EntityRef::Employee(employee)));
        assert_eq!(successor.status, MessageStatus::Queued);
        assert_eq!(successor.attempts, 0);
        assert_eq!(successor.predecessor_id, Some(m.id));
        assert!(successor.payload.employee.is_none());
    }

    #[test]
    fn replay_creates_fresh_message_and_leaves_original() {
        let mut m = message(MessageKind::EmployeeUpdate, 1);
        let now = Utc::now();
        m.begin_send(now).unwrap();
        m.mark_rejected("bad field", now).unwrap();

        let replay = m.replay(4, now).unwrap();
        assert_ne!(replay.id, m.id);
        assert_eq!(replay.replay_of, Some(m.id));
        assert_eq!(replay.attempts, 0);
        assert_eq!(replay.max_attempts, 4);
        assert_eq!(replay.payload, m.payload);
        assert_eq!(m.status, MessageStatus::Rejected);

        let queued = message(MessageKind::EmployeeUpdate, 1);
        assert!(queued.replay(4, now).is_err());
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in MessageStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in MessageStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }
}
