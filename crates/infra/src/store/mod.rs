//! Persistence for connections, the outbox, receipts, local records and
//! Registry snapshots.
//!
//! Every engine-owned write is a single-record, version-checked operation.
//! A `StoreError::Concurrency` means another worker got there first.

pub mod memory;
pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use regsync_core::{ConnectionId, ContractId, EmployeeId, ExpectedVersion, MessageId, TenantId};
use regsync_outbox::{
    Connection, ContractRecord, DriftReport, EmployeeRecord, EmployeeSnapshot, EntityRef,
    MessageStatus, OutboxMessage, Receipt, SubmissionResult,
};

use crate::error::{StoreError, StoreResult};

pub use memory::{InMemorySyncStore, InMemoryUnit};
pub use postgres::PgSyncStore;

#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// Insert a new connection. Fails if the tenant already has an active one.
    async fn insert_connection(&self, connection: &Connection) -> StoreResult<()>;

    async fn get_connection(&self, id: ConnectionId) -> StoreResult<Option<Connection>>;

    async fn active_connection_for_tenant(&self, tenant_id: TenantId) -> StoreResult<Option<Connection>>;

    async fn list_active_connections(&self) -> StoreResult<Vec<Connection>>;

    /// Write back a modified connection. Returns it with the bumped version.
    async fn update_connection(
        &self,
        connection: &Connection,
        expected: ExpectedVersion,
    ) -> StoreResult<Connection>;

    async fn record_sync_success(&self, id: ConnectionId, at: DateTime<Utc>) -> StoreResult<()>;

    async fn mark_connection_error(
        &self,
        id: ConnectionId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Operator action: back to `active`, subject to one active per tenant.
    async fn reactivate_connection(&self, id: ConnectionId, at: DateTime<Utc>) -> StoreResult<Connection>;

    async fn deactivate_connection(&self, id: ConnectionId, at: DateTime<Utc>) -> StoreResult<()>;

    /// Try to take the per-connection dispatch lease. `false` if someone else
    /// holds an unexpired lease.
    async fn acquire_lease(
        &self,
        id: ConnectionId,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn release_lease(&self, id: ConnectionId, holder: &str) -> StoreResult<()>;
}

/// Per-status message counts for one organization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MessageStats {
    pub queued: usize,
    pub sending: usize,
    pub sent: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub error: usize,
}

impl MessageStats {
    pub fn count(&mut self, status: MessageStatus, n: usize) {
        let slot = match status {
            MessageStatus::Queued => &mut self.queued,
            MessageStatus::Sending => &mut self.sending,
            MessageStatus::Sent => &mut self.sent,
            MessageStatus::Accepted => &mut self.accepted,
            MessageStatus::Rejected => &mut self.rejected,
            MessageStatus::Error => &mut self.error,
        };
        *slot += n;
    }
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Append outside any caller transaction (replays, administrative use).
    /// The store assigns the enqueue sequence.
    async fn append_message(&self, message: OutboxMessage) -> StoreResult<OutboxMessage>;

    async fn get_message(&self, id: MessageId) -> StoreResult<Option<OutboxMessage>>;

    /// Version-checked write of a state transition. The payload never changes.
    async fn update_message(
        &self,
        message: &OutboxMessage,
        expected: ExpectedVersion,
    ) -> StoreResult<OutboxMessage>;

    /// Resolve `original` and append its successor in one atomic operation.
    async fn split_message(
        &self,
        original: &OutboxMessage,
        expected: ExpectedVersion,
        successor: OutboxMessage,
    ) -> StoreResult<(OutboxMessage, OutboxMessage)>;

    /// Active connections with at least one queued message due at `now`.
    async fn connections_with_ready_messages(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<ConnectionId>>;

    /// Every non-terminal message of a connection, in enqueue order.
    async fn open_messages_for_connection(&self, id: ConnectionId) -> StoreResult<Vec<OutboxMessage>>;

    /// `sent` messages whose next receipt poll is due.
    async fn messages_awaiting_receipt(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<OutboxMessage>>;

    /// `sending` messages not touched since `before` (crashed workers).
    async fn stale_sending_messages(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<OutboxMessage>>;

    async fn messages_by_status(
        &self,
        tenant_id: TenantId,
        status: MessageStatus,
        limit: usize,
    ) -> StoreResult<Vec<OutboxMessage>>;

    async fn message_stats(&self, tenant_id: TenantId) -> StoreResult<MessageStats>;
}

/// Outcome of recording a receipt under its idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiptRecord {
    Inserted(Receipt),
    /// A pending receipt upgraded to its final status.
    Upgraded(Receipt),
    /// Already recorded; carries the stored receipt.
    Duplicate(Receipt),
}

impl ReceiptRecord {
    pub fn receipt(&self) -> &Receipt {
        match self {
            ReceiptRecord::Inserted(r) | ReceiptRecord::Upgraded(r) | ReceiptRecord::Duplicate(r) => r,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, ReceiptRecord::Duplicate(_))
    }
}

#[async_trait]
pub trait ReceiptStore: Send + Sync {
    /// Record a receipt and its results idempotently, keyed by
    /// `(message id, receipt number)`. Results are stored only when the
    /// receipt is inserted or upgraded.
    async fn record_receipt(
        &self,
        receipt: Receipt,
        results: Vec<SubmissionResult>,
    ) -> StoreResult<ReceiptRecord>;

    async fn receipts_for_message(&self, id: MessageId) -> StoreResult<Vec<Receipt>>;

    async fn results_for_message(&self, id: MessageId) -> StoreResult<Vec<SubmissionResult>>;
}

/// Read access to the domain layer's records, plus the two columns the
/// engine owns on them.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_employee(&self, id: EmployeeId) -> StoreResult<Option<EmployeeRecord>>;

    async fn get_contract(&self, id: ContractId) -> StoreResult<Option<ContractRecord>>;

    async fn employees_for_connection(&self, id: ConnectionId) -> StoreResult<Vec<EmployeeRecord>>;

    async fn contracts_for_connection(&self, id: ConnectionId) -> StoreResult<Vec<ContractRecord>>;

    /// Record the Registry's id (when issued) and mark the entity synced.
    /// Entities outside the given tenant and connection are `NotFound`.
    async fn mark_entity_synced(
        &self,
        tenant_id: TenantId,
        connection_id: ConnectionId,
        entity: EntityRef,
        registry_id: Option<&str>,
    ) -> StoreResult<()>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn append_snapshots(&self, snapshots: &[EmployeeSnapshot]) -> StoreResult<()>;

    /// Latest snapshot per Registry employee id.
    async fn latest_snapshots(
        &self,
        id: ConnectionId,
    ) -> StoreResult<HashMap<String, EmployeeSnapshot>>;

    /// Snapshots of one Registry employee, oldest first.
    async fn snapshot_history(
        &self,
        id: ConnectionId,
        registry_employee_id: &str,
    ) -> StoreResult<Vec<EmployeeSnapshot>>;

    async fn save_drift_report(&self, report: &DriftReport) -> StoreResult<()>;

    async fn latest_drift_report(&self, tenant_id: TenantId) -> StoreResult<Option<DriftReport>>;
}

/// Everything the engine needs from persistence.
pub trait SyncStore:
    ConnectionStore + OutboxStore + ReceiptStore + EntityStore + SnapshotStore
{
}

impl<T> SyncStore for T where
    T: ConnectionStore + OutboxStore + ReceiptStore + EntityStore + SnapshotStore
{
}

/// A caller-owned unit of work the outbox writer joins.
#[async_trait]
pub trait MutationUnit: Send {
    /// Stage an outbox message. Visible to others only once the unit commits.
    async fn insert_outbox_message(&mut self, message: OutboxMessage) -> StoreResult<OutboxMessage>;
}

pub(crate) fn check_version(
    what: &str,
    expected: ExpectedVersion,
    actual: u64,
) -> StoreResult<()> {
    if expected.matches(actual) {
        Ok(())
    } else {
        Err(StoreError::Concurrency(format!(
            "{what} is at version {actual}, expected {expected:?}"
        )))
    }
}
