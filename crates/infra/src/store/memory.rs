//! In-memory store for tests/dev.
//!
//! One lock over all tables so multi-record operations (splits, receipt +
//! results) are atomic the same way they are inside a Postgres transaction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use regsync_core::{ConnectionId, ContractId, EmployeeId, ExpectedVersion, MessageId, TenantId};
use regsync_outbox::{
    Connection, ConnectionStatus, ContractRecord, DriftReport, EmployeeRecord, EmployeeSnapshot,
    EntityRef, EntitySyncStatus, MessageStatus, OutboxMessage, Receipt, SubmissionResult,
};

use super::{
    check_version, ConnectionStore, EntityStore, MessageStats, MutationUnit, OutboxStore,
    ReceiptRecord, ReceiptStore, SnapshotStore,
};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Default)]
struct Tables {
    connections: HashMap<ConnectionId, Connection>,
    leases: HashMap<ConnectionId, (String, DateTime<Utc>)>,
    messages: HashMap<MessageId, OutboxMessage>,
    receipts: Vec<Receipt>,
    results: Vec<SubmissionResult>,
    employees: HashMap<EmployeeId, EmployeeRecord>,
    contracts: HashMap<ContractId, ContractRecord>,
    snapshots: Vec<EmployeeSnapshot>,
    drift_reports: Vec<DriftReport>,
}

#[derive(Debug)]
pub struct InMemorySyncStore {
    tables: RwLock<Tables>,
    next_sequence: AtomicI64,
    fail_message_writes: AtomicBool,
}

impl InMemorySyncStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            next_sequence: AtomicI64::new(1),
            fail_message_writes: AtomicBool::new(false),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Start a unit of work. Dropping it without `commit` discards it.
    pub fn begin(&self) -> InMemoryUnit<'_> {
        InMemoryUnit {
            store: self,
            messages: Vec::new(),
            employees: Vec::new(),
            contracts: Vec::new(),
        }
    }

    /// Make every subsequent message write fail with a storage error.
    pub fn fail_message_writes(&self, fail: bool) {
        self.fail_message_writes.store(fail, Ordering::SeqCst);
    }

    /// Seed or replace a local employee record outside a unit of work.
    pub fn put_employee(&self, employee: EmployeeRecord) -> StoreResult<()> {
        self.write()?.employees.insert(employee.id, employee);
        Ok(())
    }

    pub fn put_contract(&self, contract: ContractRecord) -> StoreResult<()> {
        self.write()?.contracts.insert(contract.id, contract);
        Ok(())
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Tables>> {
        self.tables.read().map_err(|_| StoreError::poisoned())
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Tables>> {
        self.tables.write().map_err(|_| StoreError::poisoned())
    }

    fn next_sequence(&self) -> i64 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }

    fn check_message_writes(&self) -> StoreResult<()> {
        if self.fail_message_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Storage("message write failed".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemorySyncStore {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_single_active(tables: &Tables, candidate: &Connection) -> StoreResult<()> {
    let clash = tables.connections.values().any(|c| {
        c.id != candidate.id && c.tenant_id == candidate.tenant_id && c.is_active()
    });
    if candidate.is_active() && clash {
        return Err(StoreError::Constraint(format!(
            "tenant {} already has an active connection",
            candidate.tenant_id
        )));
    }
    Ok(())
}

fn modify_connection(
    tables: &mut Tables,
    id: ConnectionId,
    f: impl FnOnce(&mut Connection) -> StoreResult<()>,
) -> StoreResult<Connection> {
    let mut connection = tables
        .connections
        .get(&id)
        .cloned()
        .ok_or_else(|| StoreError::NotFound(format!("connection {id}")))?;
    f(&mut connection)?;
    ensure_single_active(tables, &connection)?;
    connection.version += 1;
    tables.connections.insert(id, connection.clone());
    Ok(connection)
}

fn checked_message_write(
    tables: &Tables,
    message: &OutboxMessage,
    expected: ExpectedVersion,
) -> StoreResult<u64> {
    let current = tables
        .messages
        .get(&message.id)
        .ok_or_else(|| StoreError::NotFound(format!("message {}", message.id)))?;
    check_version(&format!("message {}", message.id), expected, current.version)?;
    if current.payload != message.payload {
        return Err(StoreError::Constraint(format!(
            "payload of message {} is write-once",
            message.id
        )));
    }
    if current.tenant_id != message.tenant_id || current.connection_id != message.connection_id {
        return Err(StoreError::TenantIsolation(format!(
            "message {} cannot change owner",
            message.id
        )));
    }
    Ok(current.version)
}

#[async_trait]
impl ConnectionStore for InMemorySyncStore {
    async fn insert_connection(&self, connection: &Connection) -> StoreResult<()> {
        let mut tables = self.write()?;
        if tables.connections.contains_key(&connection.id) {
            return Err(StoreError::Constraint(format!(
                "connection {} already exists",
                connection.id
            )));
        }
        ensure_single_active(&tables, connection)?;
        tables.connections.insert(connection.id, connection.clone());
        Ok(())
    }

    async fn get_connection(&self, id: ConnectionId) -> StoreResult<Option<Connection>> {
        Ok(self.read()?.connections.get(&id).cloned())
    }

    async fn active_connection_for_tenant(&self, tenant_id: TenantId) -> StoreResult<Option<Connection>> {
        Ok(self
            .read()?
            .connections
            .values()
            .find(|c| c.tenant_id == tenant_id && c.is_active())
            .cloned())
    }

    async fn list_active_connections(&self) -> StoreResult<Vec<Connection>> {
        let mut active: Vec<Connection> = self
            .read()?
            .connections
            .values()
            .filter(|c| c.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|c| c.created_at);
        Ok(active)
    }

    async fn update_connection(
        &self,
        connection: &Connection,
        expected: ExpectedVersion,
    ) -> StoreResult<Connection> {
        let mut tables = self.write()?;
        let updated = connection.clone();
        modify_connection(&mut tables, connection.id, |current| {
            check_version(&format!("connection {}", connection.id), expected, current.version)?;
            if current.tenant_id != updated.tenant_id {
                return Err(StoreError::TenantIsolation(format!(
                    "connection {} cannot change tenant",
                    connection.id
                )));
            }
            *current = Connection { version: current.version, ..updated };
            Ok(())
        })
    }

    async fn record_sync_success(&self, id: ConnectionId, at: DateTime<Utc>) -> StoreResult<()> {
        let mut tables = self.write()?;
        modify_connection(&mut tables, id, |c| {
            c.record_sync(at);
            Ok(())
        })?;
        Ok(())
    }

    async fn mark_connection_error(
        &self,
        id: ConnectionId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut tables = self.write()?;
        modify_connection(&mut tables, id, |c| {
            c.mark_error(reason, at);
            Ok(())
        })?;
        Ok(())
    }

    async fn reactivate_connection(&self, id: ConnectionId, at: DateTime<Utc>) -> StoreResult<Connection> {
        let mut tables = self.write()?;
        modify_connection(&mut tables, id, |c| Ok(c.reactivate(at)?))
    }

    async fn deactivate_connection(&self, id: ConnectionId, at: DateTime<Utc>) -> StoreResult<()> {
        let mut tables = self.write()?;
        modify_connection(&mut tables, id, |c| {
            c.deactivate(at);
            Ok(())
        })?;
        tables.leases.remove(&id);
        Ok(())
    }

    async fn acquire_lease(
        &self,
        id: ConnectionId,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tables = self.write()?;
        match tables.leases.get(&id) {
            Some((owner, expires)) if owner != holder && *expires > now => Ok(false),
            _ => {
                tables.leases.insert(id, (holder.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn release_lease(&self, id: ConnectionId, holder: &str) -> StoreResult<()> {
        let mut tables = self.write()?;
        if tables.leases.get(&id).is_some_and(|(owner, _)| owner == holder) {
            tables.leases.remove(&id);
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemorySyncStore {
    async fn append_message(&self, mut message: OutboxMessage) -> StoreResult<OutboxMessage> {
        self.check_message_writes()?;
        let mut tables = self.write()?;
        if tables.messages.contains_key(&message.id) {
            return Err(StoreError::Constraint(format!("message {} already exists", message.id)));
        }
        message.sequence = self.next_sequence();
        message.version = 0;
        tables.messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn get_message(&self, id: MessageId) -> StoreResult<Option<OutboxMessage>> {
        Ok(self.read()?.messages.get(&id).cloned())
    }

    async fn update_message(
        &self,
        message: &OutboxMessage,
        expected: ExpectedVersion,
    ) -> StoreResult<OutboxMessage> {
        self.check_message_writes()?;
        let mut tables = self.write()?;
        let current = checked_message_write(&tables, message, expected)?;
        let mut stored = message.clone();
        stored.version = current + 1;
        tables.messages.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn split_message(
        &self,
        original: &OutboxMessage,
        expected: ExpectedVersion,
        mut successor: OutboxMessage,
    ) -> StoreResult<(OutboxMessage, OutboxMessage)> {
        self.check_message_writes()?;
        let mut tables = self.write()?;
        let current = checked_message_write(&tables, original, expected)?;
        if tables.messages.contains_key(&successor.id) {
            return Err(StoreError::Constraint(format!("message {} already exists", successor.id)));
        }

        let mut stored = original.clone();
        stored.version = current + 1;
        successor.sequence = self.next_sequence();
        successor.version = 0;
        tables.messages.insert(stored.id, stored.clone());
        tables.messages.insert(successor.id, successor.clone());
        Ok((stored, successor))
    }

    async fn connections_with_ready_messages(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<ConnectionId>> {
        let tables = self.read()?;
        let mut earliest: HashMap<ConnectionId, i64> = HashMap::new();
        for m in tables.messages.values().filter(|m| m.is_ready(now)) {
            let active = tables
                .connections
                .get(&m.connection_id)
                .is_some_and(|c| c.status == ConnectionStatus::Active);
            if active {
                let seq = earliest.entry(m.connection_id).or_insert(m.sequence);
                *seq = (*seq).min(m.sequence);
            }
        }
        let mut ids: Vec<(i64, ConnectionId)> = earliest.into_iter().map(|(c, s)| (s, c)).collect();
        ids.sort();
        Ok(ids.into_iter().take(limit).map(|(_, c)| c).collect())
    }

    async fn open_messages_for_connection(&self, id: ConnectionId) -> StoreResult<Vec<OutboxMessage>> {
        let tables = self.read()?;
        let mut open: Vec<OutboxMessage> = tables
            .messages
            .values()
            .filter(|m| m.connection_id == id && !m.status.is_terminal())
            .cloned()
            .collect();
        open.sort_by_key(|m| m.sequence);
        Ok(open)
    }

    async fn messages_awaiting_receipt(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<OutboxMessage>> {
        let tables = self.read()?;
        let mut due: Vec<OutboxMessage> = tables
            .messages
            .values()
            .filter(|m| m.status == MessageStatus::Sent && m.next_poll_at.is_none_or(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|m| (m.next_poll_at, m.sequence));
        due.truncate(limit);
        Ok(due)
    }

    async fn stale_sending_messages(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<OutboxMessage>> {
        let tables = self.read()?;
        let mut stale: Vec<OutboxMessage> = tables
            .messages
            .values()
            .filter(|m| m.status == MessageStatus::Sending && m.updated_at < before)
            .cloned()
            .collect();
        stale.sort_by_key(|m| m.sequence);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn messages_by_status(
        &self,
        tenant_id: TenantId,
        status: MessageStatus,
        limit: usize,
    ) -> StoreResult<Vec<OutboxMessage>> {
        let tables = self.read()?;
        let mut found: Vec<OutboxMessage> = tables
            .messages
            .values()
            .filter(|m| m.tenant_id == tenant_id && m.status == status)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.sequence.cmp(&a.sequence)));
        found.truncate(limit);
        Ok(found)
    }

    async fn message_stats(&self, tenant_id: TenantId) -> StoreResult<MessageStats> {
        let tables = self.read()?;
        let mut stats = MessageStats::default();
        for m in tables.messages.values().filter(|m| m.tenant_id == tenant_id) {
            stats.count(m.status, 1);
        }
        Ok(stats)
    }
}

#[async_trait]
impl ReceiptStore for InMemorySyncStore {
    async fn record_receipt(
        &self,
        receipt: Receipt,
        results: Vec<SubmissionResult>,
    ) -> StoreResult<ReceiptRecord> {
        let mut tables = self.write()?;
        let key = receipt.dedup_key();
        let existing = tables.receipts.iter().position(|r| r.dedup_key() == key);

        let (record, receipt_id) = match existing {
            None => {
                tables.receipts.push(receipt.clone());
                let id = receipt.id;
                (ReceiptRecord::Inserted(receipt), id)
            }
            Some(idx) if !tables.receipts[idx].status.is_final() && receipt.status.is_final() => {
                let stored = &mut tables.receipts[idx];
                stored.status = receipt.status;
                stored.validation_errors = receipt.validation_errors;
                stored.raw_response = receipt.raw_response;
                stored.receipt_date = receipt.receipt_date;
                let upgraded = stored.clone();
                let id = upgraded.id;
                (ReceiptRecord::Upgraded(upgraded), id)
            }
            Some(idx) => return Ok(ReceiptRecord::Duplicate(tables.receipts[idx].clone())),
        };

        tables.results.extend(results.into_iter().map(|mut r| {
            r.receipt_id = receipt_id;
            r
        }));
        Ok(record)
    }

    async fn receipts_for_message(&self, id: MessageId) -> StoreResult<Vec<Receipt>> {
        Ok(self
            .read()?
            .receipts
            .iter()
            .filter(|r| r.message_id == id)
            .cloned()
            .collect())
    }

    async fn results_for_message(&self, id: MessageId) -> StoreResult<Vec<SubmissionResult>> {
        Ok(self
            .read()?
            .results
            .iter()
            .filter(|r| r.message_id == id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl EntityStore for InMemorySyncStore {
    async fn get_employee(&self, id: EmployeeId) -> StoreResult<Option<EmployeeRecord>> {
        Ok(self.read()?.employees.get(&id).cloned())
    }

    async fn get_contract(&self, id: ContractId) -> StoreResult<Option<ContractRecord>> {
        Ok(self.read()?.contracts.get(&id).cloned())
    }

    async fn employees_for_connection(&self, id: ConnectionId) -> StoreResult<Vec<EmployeeRecord>> {
        let mut out: Vec<EmployeeRecord> = self
            .read()?
            .employees
            .values()
            .filter(|e| e.connection_id == id)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.id);
        Ok(out)
    }

    async fn contracts_for_connection(&self, id: ConnectionId) -> StoreResult<Vec<ContractRecord>> {
        let mut out: Vec<ContractRecord> = self
            .read()?
            .contracts
            .values()
            .filter(|c| c.connection_id == id)
            .cloned()
            .collect();
        out.sort_by_key(|c| c.id);
        Ok(out)
    }

    async fn mark_entity_synced(
        &self,
        tenant_id: TenantId,
        connection_id: ConnectionId,
        entity: EntityRef,
        registry_id: Option<&str>,
    ) -> StoreResult<()> {
        let mut tables = self.write()?;
        let owned = |t: TenantId, c: ConnectionId| t == tenant_id && c == connection_id;
        let (slot, status) = match entity {
            EntityRef::Employee(id) => {
                let e = tables
                    .employees
                    .get_mut(&id)
                    .filter(|e| owned(e.tenant_id, e.connection_id))
                    .ok_or_else(|| StoreError::NotFound(format!("employee {id}")))?;
                (&mut e.registry_id, &mut e.sync_status)
            }
            EntityRef::Contract(id) => {
                let c = tables
                    .contracts
                    .get_mut(&id)
                    .filter(|c| owned(c.tenant_id, c.connection_id))
                    .ok_or_else(|| StoreError::NotFound(format!("contract {id}")))?;
                (&mut c.registry_id, &mut c.sync_status)
            }
        };
        if let Some(rid) = registry_id {
            *slot = Some(rid.to_string());
        }
        *status = EntitySyncStatus::Synced;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for InMemorySyncStore {
    async fn append_snapshots(&self, snapshots: &[EmployeeSnapshot]) -> StoreResult<()> {
        self.write()?.snapshots.extend_from_slice(snapshots);
        Ok(())
    }

    async fn latest_snapshots(
        &self,
        id: ConnectionId,
    ) -> StoreResult<HashMap<String, EmployeeSnapshot>> {
        let tables = self.read()?;
        let mut latest: HashMap<String, EmployeeSnapshot> = HashMap::new();
        for s in tables.snapshots.iter().filter(|s| s.connection_id == id) {
            let newer = latest
                .get(&s.registry_employee_id)
                .is_none_or(|prev| s.captured_at >= prev.captured_at);
            if newer {
                latest.insert(s.registry_employee_id.clone(), s.clone());
            }
        }
        Ok(latest)
    }

    async fn snapshot_history(
        &self,
        id: ConnectionId,
        registry_employee_id: &str,
    ) -> StoreResult<Vec<EmployeeSnapshot>> {
        Ok(self
            .read()?
            .snapshots
            .iter()
            .filter(|s| s.connection_id == id && s.registry_employee_id == registry_employee_id)
            .cloned()
            .collect())
    }

    async fn save_drift_report(&self, report: &DriftReport) -> StoreResult<()> {
        self.write()?.drift_reports.push(report.clone());
        Ok(())
    }

    async fn latest_drift_report(&self, tenant_id: TenantId) -> StoreResult<Option<DriftReport>> {
        Ok(self
            .read()?
            .drift_reports
            .iter()
            .rev()
            .find(|r| r.tenant_id == tenant_id)
            .cloned())
    }
}

/// Unit of work over the in-memory store: domain record writes and outbox
/// inserts become visible together on `commit`.
pub struct InMemoryUnit<'a> {
    store: &'a InMemorySyncStore,
    messages: Vec<OutboxMessage>,
    employees: Vec<EmployeeRecord>,
    contracts: Vec<ContractRecord>,
}

impl InMemoryUnit<'_> {
    pub fn upsert_employee(&mut self, employee: EmployeeRecord) {
        self.employees.push(employee);
    }

    pub fn upsert_contract(&mut self, contract: ContractRecord) {
        self.contracts.push(contract);
    }

    pub fn commit(self) -> StoreResult<Vec<OutboxMessage>> {
        let mut tables = self.store.write()?;
        if let Some(dup) = self.messages.iter().find(|m| tables.messages.contains_key(&m.id)) {
            return Err(StoreError::Constraint(format!("message {} already exists", dup.id)));
        }
        for e in self.employees {
            tables.employees.insert(e.id, e);
        }
        for c in self.contracts {
            tables.contracts.insert(c.id, c);
        }
        for m in &self.messages {
            tables.messages.insert(m.id, m.clone());
        }
        Ok(self.messages)
    }
}

#[async_trait]
impl<'a> MutationUnit for InMemoryUnit<'a> {
    async fn insert_outbox_message(&mut self, mut message: OutboxMessage) -> StoreResult<OutboxMessage> {
        self.store.check_message_writes()?;
        message.sequence = self.store.next_sequence();
        message.version = 0;
        self.messages.push(message.clone());
        Ok(message)
    }
}
