//! Postgres-backed store.
//!
//! Schema lives in `migrations/0001_regsync.sql`. Every query is scoped by id
//! (and tenant where the caller supplies one).
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Concurrency`, or `Constraint` for connection/receipt keys |
//! | Database (check / foreign key) | `23514` / `23503` | `Constraint` |
//! | Database (other), PoolClosed, Io, ... | - | `Storage` |
//!
//! Optimistic checks are `UPDATE ... WHERE version = $n`; zero rows means the
//! record moved (`Concurrency`) or does not exist (`NotFound`).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{FromRow, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use regsync_core::{
    ConnectionId, ContractId, EmployeeId, ExpectedVersion, MessageId, ReceiptId, ResultId,
    SnapshotId, TenantId,
};
use regsync_outbox::{
    Connection, ConnectionStatus, ContractRecord, DriftReport, EmployeeRecord, EmployeeSnapshot,
    EmploymentStatus, EncryptedCredentials, EntityKind, EntityRef, EntitySyncStatus, MessageKind,
    MessageStatus, OutboxMessage, Receipt, ReceiptStatus, ResultOutcome, SubmissionResult,
};

use super::{
    ConnectionStore, EntityStore, MessageStats, MutationUnit, OutboxStore, ReceiptRecord,
    ReceiptStore, SnapshotStore,
};
use crate::error::{StoreError, StoreResult};

const MIGRATION: &str = include_str!("../../migrations/0001_regsync.sql");

const MESSAGE_COLUMNS: &str = r#"
    id, sequence, tenant_id, connection_id, kind, entity_type, entity_id, parent_type,
    parent_id, payload, status, priority, attempts, max_attempts, scheduled_at, created_at,
    updated_at, sent_at, completed_at, last_error, receipt_ref, next_poll_at, predecessor_id,
    replay_of, successor_id, version
"#;

const CONNECTION_COLUMNS: &str = r#"
    id, tenant_id, registry_employer_id, registry_establishment_id, credential_key_version,
    credential_ciphertext, status, last_sync_at, last_error, created_at, updated_at, version
"#;

/// Postgres-backed implementation of every store trait.
#[derive(Debug, Clone)]
pub struct PgSyncStore {
    pool: Arc<PgPool>,
}

impl PgSyncStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the schema. Statements are idempotent.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// Begin a unit of work the domain layer and the outbox writer share.
    pub async fn begin(&self) -> StoreResult<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    async fn fetch_messages(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> StoreResult<Vec<OutboxMessage>> {
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(decode_message).collect()
    }

    /// Decide between `NotFound` and `Concurrency` after a guarded update hit no row.
    async fn missed_update(&self, table: &str, id: Uuid, expected: ExpectedVersion) -> StoreError {
        let exists = sqlx::query(&format!("SELECT 1 FROM {table} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&*self.pool)
            .await;
        match exists {
            Ok(Some(_)) => StoreError::Concurrency(format!(
                "{table} {id} is not at expected version {expected:?}"
            )),
            Ok(None) => StoreError::NotFound(format!("{table} {id}")),
            Err(e) => map_sqlx_error("check_exists", e),
        }
    }
}

fn expected_param(expected: ExpectedVersion) -> Option<i64> {
    match expected {
        ExpectedVersion::Any => None,
        ExpectedVersion::Exact(v) => Some(v as i64),
    }
}

async fn insert_message<'e, E>(executor: E, m: &OutboxMessage) -> StoreResult<i64>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let payload = serde_json::to_value(&m.payload)
        .map_err(|e| StoreError::Storage(format!("failed to encode payload: {e}")))?;
    let row = sqlx::query(
        r#"
        INSERT INTO outbox_messages (
            id, tenant_id, connection_id, kind, entity_type, entity_id, parent_type, parent_id,
            payload, status, priority, attempts, max_attempts, scheduled_at, created_at,
            updated_at, sent_at, completed_at, last_error, receipt_ref, next_poll_at,
            predecessor_id, replay_of, successor_id, version
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                $18, $19, $20, $21, $22, $23, $24, 0)
        RETURNING sequence
        "#,
    )
    .bind(m.id.as_uuid())
    .bind(m.tenant_id.as_uuid())
    .bind(m.connection_id.as_uuid())
    .bind(m.kind.as_str())
    .bind(m.entity.kind().as_str())
    .bind(m.entity.as_uuid())
    .bind(m.parent.map(|p| p.kind().as_str()))
    .bind(m.parent.map(|p| *p.as_uuid()))
    .bind(payload)
    .bind(m.status.as_str())
    .bind(m.priority)
    .bind(m.attempts as i32)
    .bind(m.max_attempts as i32)
    .bind(m.scheduled_at)
    .bind(m.created_at)
    .bind(m.updated_at)
    .bind(m.sent_at)
    .bind(m.completed_at)
    .bind(&m.last_error)
    .bind(&m.receipt_ref)
    .bind(m.next_poll_at)
    .bind(m.predecessor_id.map(|id| *id.as_uuid()))
    .bind(m.replay_of.map(|id| *id.as_uuid()))
    .bind(m.successor_id.map(|id| *id.as_uuid()))
    .fetch_one(executor)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Constraint(format!("message {} already exists", m.id))
        } else {
            map_sqlx_error("insert_message", e)
        }
    })?;
    row.try_get("sequence")
        .map_err(|e| StoreError::Storage(format!("failed to read sequence: {e}")))
}

async fn update_message_row<'e, E>(
    executor: E,
    m: &OutboxMessage,
    expected: ExpectedVersion,
) -> StoreResult<Option<i64>>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    // Payload, owner and lineage-of-origin columns are never written here.
    let row = sqlx::query(
        r#"
        UPDATE outbox_messages SET
            status = $3, priority = $4, attempts = $5, scheduled_at = $6, updated_at = $7,
            sent_at = $8, completed_at = $9, last_error = $10, receipt_ref = $11,
            next_poll_at = $12, successor_id = $13, version = version + 1
        WHERE id = $1 AND ($2::bigint IS NULL OR version = $2)
        RETURNING version
        "#,
    )
    .bind(m.id.as_uuid())
    .bind(expected_param(expected))
    .bind(m.status.as_str())
    .bind(m.priority)
    .bind(m.attempts as i32)
    .bind(m.scheduled_at)
    .bind(m.updated_at)
    .bind(m.sent_at)
    .bind(m.completed_at)
    .bind(&m.last_error)
    .bind(&m.receipt_ref)
    .bind(m.next_poll_at)
    .bind(m.successor_id.map(|id| *id.as_uuid()))
    .fetch_optional(executor)
    .await
    .map_err(|e| map_sqlx_error("update_message", e))?;

    row.map(|r| r.try_get::<i64, _>("version"))
        .transpose()
        .map_err(|e| StoreError::Storage(format!("failed to read version: {e}")))
}

#[async_trait]
impl ConnectionStore for PgSyncStore {
    #[instrument(skip(self, connection), fields(connection_id = %connection.id, tenant_id = %connection.tenant_id), err)]
    async fn insert_connection(&self, connection: &Connection) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO connections (
                id, tenant_id, registry_employer_id, registry_establishment_id,
                credential_key_version, credential_ciphertext, status, last_sync_at,
                last_error, created_at, updated_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 0)
            "#,
        )
        .bind(connection.id.as_uuid())
        .bind(connection.tenant_id.as_uuid())
        .bind(&connection.registry_employer_id)
        .bind(&connection.registry_establishment_id)
        .bind(connection.credentials.key_version as i32)
        .bind(&connection.credentials.ciphertext)
        .bind(connection.status.as_str())
        .bind(connection.last_sync_at)
        .bind(&connection.last_error)
        .bind(connection.created_at)
        .bind(connection.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_connection_error("insert_connection", e))?;
        Ok(())
    }

    async fn get_connection(&self, id: ConnectionId) -> StoreResult<Option<Connection>> {
        let row = sqlx::query(&format!("SELECT {CONNECTION_COLUMNS} FROM connections WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_connection", e))?;
        row.as_ref().map(decode_connection).transpose()
    }

    async fn active_connection_for_tenant(&self, tenant_id: TenantId) -> StoreResult<Option<Connection>> {
        let row = sqlx::query(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM connections WHERE tenant_id = $1 AND status = 'active'"
        ))
        .bind(tenant_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("active_connection_for_tenant", e))?;
        row.as_ref().map(decode_connection).transpose()
    }

    async fn list_active_connections(&self) -> StoreResult<Vec<Connection>> {
        let rows = sqlx::query(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM connections WHERE status = 'active' ORDER BY created_at"
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_active_connections", e))?;
        rows.iter().map(decode_connection).collect()
    }

    #[instrument(skip(self, connection), fields(connection_id = %connection.id, expected = ?expected), err)]
    async fn update_connection(
        &self,
        connection: &Connection,
        expected: ExpectedVersion,
    ) -> StoreResult<Connection> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE connections SET
                registry_employer_id = $3, registry_establishment_id = $4,
                credential_key_version = $5, credential_ciphertext = $6, status = $7,
                last_sync_at = $8, last_error = $9, updated_at = $10, version = version + 1
            WHERE id = $1 AND ($2::bigint IS NULL OR version = $2)
            RETURNING {CONNECTION_COLUMNS}
            "#
        ))
        .bind(connection.id.as_uuid())
        .bind(expected_param(expected))
        .bind(&connection.registry_employer_id)
        .bind(&connection.registry_establishment_id)
        .bind(connection.credentials.key_version as i32)
        .bind(&connection.credentials.ciphertext)
        .bind(connection.status.as_str())
        .bind(connection.last_sync_at)
        .bind(&connection.last_error)
        .bind(connection.updated_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_connection_error("update_connection", e))?;

        match row {
            Some(row) => decode_connection(&row),
            None => Err(self.missed_update("connections", *connection.id.as_uuid(), expected).await),
        }
    }

    async fn record_sync_success(&self, id: ConnectionId, at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE connections
            SET last_sync_at = GREATEST(COALESCE(last_sync_at, $2), $2), updated_at = $2,
                version = version + 1
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_sync_success", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("connection {id}")));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(connection_id = %id), err)]
    async fn mark_connection_error(
        &self,
        id: ConnectionId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE connections
            SET status = 'error', last_error = $2, updated_at = $3, version = version + 1
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(reason)
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_connection_error", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("connection {id}")));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(connection_id = %id), err)]
    async fn reactivate_connection(&self, id: ConnectionId, at: DateTime<Utc>) -> StoreResult<Connection> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE connections
            SET status = 'active', last_error = NULL, updated_at = $2, version = version + 1
            WHERE id = $1 AND status <> 'active'
            RETURNING {CONNECTION_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_connection_error("reactivate_connection", e))?;

        match row {
            Some(row) => decode_connection(&row),
            None => match self.get_connection(id).await? {
                Some(_) => Err(StoreError::InvalidState(format!("connection {id} is already active"))),
                None => Err(StoreError::NotFound(format!("connection {id}"))),
            },
        }
    }

    async fn deactivate_connection(&self, id: ConnectionId, at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE connections
            SET status = 'inactive', updated_at = $2, version = version + 1
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("deactivate_connection", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("connection {id}")));
        }
        Ok(())
    }

    async fn acquire_lease(
        &self,
        id: ConnectionId,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let row = sqlx::query(
            r#"
            INSERT INTO connection_leases (connection_id, holder, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (connection_id) DO UPDATE
                SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
                WHERE connection_leases.expires_at <= $4
                   OR connection_leases.holder = EXCLUDED.holder
            RETURNING connection_id
            "#,
        )
        .bind(id.as_uuid())
        .bind(holder)
        .bind(now + ttl)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("acquire_lease", e))?;
        Ok(row.is_some())
    }

    async fn release_lease(&self, id: ConnectionId, holder: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM connection_leases WHERE connection_id = $1 AND holder = $2")
            .bind(id.as_uuid())
            .bind(holder)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("release_lease", e))?;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PgSyncStore {
    #[instrument(skip(self, message), fields(message_id = %message.id, connection_id = %message.connection_id), err)]
    async fn append_message(&self, mut message: OutboxMessage) -> StoreResult<OutboxMessage> {
        message.sequence = insert_message(&*self.pool, &message).await?;
        message.version = 0;
        Ok(message)
    }

    async fn get_message(&self, id: MessageId) -> StoreResult<Option<OutboxMessage>> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM outbox_messages WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_message", e))?;
        row.as_ref().map(decode_message).transpose()
    }

    #[instrument(
        skip(self, message),
        fields(message_id = %message.id, status = %message.status, expected = ?expected),
        err
    )]
    async fn update_message(
        &self,
        message: &OutboxMessage,
        expected: ExpectedVersion,
    ) -> StoreResult<OutboxMessage> {
        match update_message_row(&*self.pool, message, expected).await? {
            Some(version) => Ok(OutboxMessage {
                version: version as u64,
                ..message.clone()
            }),
            None => Err(self.missed_update("outbox_messages", *message.id.as_uuid(), expected).await),
        }
    }

    #[instrument(
        skip(self, original, successor),
        fields(message_id = %original.id, successor_id = %successor.id),
        err
    )]
    async fn split_message(
        &self,
        original: &OutboxMessage,
        expected: ExpectedVersion,
        mut successor: OutboxMessage,
    ) -> StoreResult<(OutboxMessage, OutboxMessage)> {
        let mut tx = self.begin().await?;

        let Some(version) = update_message_row(&mut *tx, original, expected).await? else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(self.missed_update("outbox_messages", *original.id.as_uuid(), expected).await);
        };
        successor.sequence = insert_message(&mut *tx, &successor).await?;
        successor.version = 0;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        let stored = OutboxMessage {
            version: version as u64,
            ..original.clone()
        };
        Ok((stored, successor))
    }

    async fn connections_with_ready_messages(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<ConnectionId>> {
        let rows = sqlx::query(
            r#"
            SELECT m.connection_id, MIN(m.sequence) AS first_sequence
            FROM outbox_messages m
            JOIN connections c ON c.id = m.connection_id
            WHERE m.status = 'queued' AND m.scheduled_at <= $1 AND c.status = 'active'
            GROUP BY m.connection_id
            ORDER BY first_sequence
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("connections_with_ready_messages", e))?;

        rows.iter()
            .map(|r| {
                r.try_get::<Uuid, _>("connection_id")
                    .map(ConnectionId::from_uuid)
                    .map_err(|e| StoreError::Storage(format!("failed to read connection_id: {e}")))
            })
            .collect()
    }

    async fn open_messages_for_connection(&self, id: ConnectionId) -> StoreResult<Vec<OutboxMessage>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM outbox_messages
             WHERE connection_id = $1 AND status IN ('queued', 'sending', 'sent')
             ORDER BY sequence"
        );
        self.fetch_messages("open_messages_for_connection", sqlx::query(&sql).bind(*id.as_uuid()))
            .await
    }

    async fn messages_awaiting_receipt(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<OutboxMessage>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM outbox_messages
             WHERE status = 'sent' AND (next_poll_at IS NULL OR next_poll_at <= $1)
             ORDER BY next_poll_at NULLS FIRST, sequence
             LIMIT $2"
        );
        self.fetch_messages(
            "messages_awaiting_receipt",
            sqlx::query(&sql).bind(now).bind(limit as i64),
        )
        .await
    }

    async fn stale_sending_messages(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<OutboxMessage>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM outbox_messages
             WHERE status = 'sending' AND updated_at < $1
             ORDER BY sequence
             LIMIT $2"
        );
        self.fetch_messages(
            "stale_sending_messages",
            sqlx::query(&sql).bind(before).bind(limit as i64),
        )
        .await
    }

    async fn messages_by_status(
        &self,
        tenant_id: TenantId,
        status: MessageStatus,
        limit: usize,
    ) -> StoreResult<Vec<OutboxMessage>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM outbox_messages
             WHERE tenant_id = $1 AND status = $2
             ORDER BY updated_at DESC, sequence DESC
             LIMIT $3"
        );
        self.fetch_messages(
            "messages_by_status",
            sqlx::query(&sql)
                .bind(*tenant_id.as_uuid())
                .bind(status.as_str())
                .bind(limit as i64),
        )
        .await
    }

    async fn message_stats(&self, tenant_id: TenantId) -> StoreResult<MessageStats> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM outbox_messages WHERE tenant_id = $1 GROUP BY status",
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("message_stats", e))?;

        let mut stats = MessageStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(decode_error)?;
            let n: i64 = row.try_get("n").map_err(decode_error)?;
            let status = MessageStatus::parse(&status)
                .ok_or_else(|| StoreError::Storage(format!("unknown message status '{status}'")))?;
            stats.count(status, n as usize);
        }
        Ok(stats)
    }
}

async fn insert_results(
    tx: &mut Transaction<'_, Postgres>,
    receipt_id: ReceiptId,
    results: &[SubmissionResult],
) -> StoreResult<()> {
    for r in results {
        let entities = serde_json::to_value(&r.entities)
            .map_err(|e| StoreError::Storage(format!("failed to encode result entities: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO submission_results (
                id, receipt_id, message_id, tenant_id, outcome, entities, details, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(r.id.as_uuid())
        .bind(receipt_id.as_uuid())
        .bind(r.message_id.as_uuid())
        .bind(r.tenant_id.as_uuid())
        .bind(r.outcome.as_str())
        .bind(entities)
        .bind(&r.details)
        .bind(r.recorded_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_result", e))?;
    }
    Ok(())
}

const RECEIPT_COLUMNS: &str = r#"
    id, tenant_id, connection_id, message_id, receipt_number, receipt_date, status,
    validation_errors, raw_response, received_at
"#;

#[async_trait]
impl ReceiptStore for PgSyncStore {
    #[instrument(
        skip(self, receipt, results),
        fields(message_id = %receipt.message_id, receipt_number = ?receipt.receipt_number, status = receipt.status.as_str()),
        err
    )]
    async fn record_receipt(
        &self,
        receipt: Receipt,
        results: Vec<SubmissionResult>,
    ) -> StoreResult<ReceiptRecord> {
        let (_, key) = receipt.dedup_key();
        let validation_errors = serde_json::to_value(&receipt.validation_errors)
            .map_err(|e| StoreError::Storage(format!("failed to encode validation errors: {e}")))?;

        let mut tx = self.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO registry_receipts (
                id, tenant_id, connection_id, message_id, receipt_number, receipt_key,
                receipt_date, status, validation_errors, raw_response, received_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (message_id, receipt_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(receipt.id.as_uuid())
        .bind(receipt.tenant_id.as_uuid())
        .bind(receipt.connection_id.as_uuid())
        .bind(receipt.message_id.as_uuid())
        .bind(&receipt.receipt_number)
        .bind(&key)
        .bind(receipt.receipt_date)
        .bind(receipt.status.as_str())
        .bind(&validation_errors)
        .bind(&receipt.raw_response)
        .bind(receipt.received_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_receipt", e))?;

        let record = if inserted.is_some() {
            insert_results(&mut tx, receipt.id, &results).await?;
            ReceiptRecord::Inserted(receipt)
        } else {
            let upgraded = if receipt.status.is_final() {
                sqlx::query(&format!(
                    r#"
                    UPDATE registry_receipts
                    SET status = $3, validation_errors = $4, raw_response = $5, receipt_date = $6
                    WHERE message_id = $1 AND receipt_key = $2 AND status = 'pending_validation'
                    RETURNING {RECEIPT_COLUMNS}
                    "#
                ))
                .bind(receipt.message_id.as_uuid())
                .bind(&key)
                .bind(receipt.status.as_str())
                .bind(&validation_errors)
                .bind(&receipt.raw_response)
                .bind(receipt.receipt_date)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("upgrade_receipt", e))?
            } else {
                None
            };

            match upgraded {
                Some(row) => {
                    let stored = decode_receipt(&row)?;
                    insert_results(&mut tx, stored.id, &results).await?;
                    ReceiptRecord::Upgraded(stored)
                }
                None => {
                    let row = sqlx::query(&format!(
                        "SELECT {RECEIPT_COLUMNS} FROM registry_receipts
                         WHERE message_id = $1 AND receipt_key = $2"
                    ))
                    .bind(receipt.message_id.as_uuid())
                    .bind(&key)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("load_receipt", e))?;
                    ReceiptRecord::Duplicate(decode_receipt(&row)?)
                }
            }
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(record)
    }

    async fn receipts_for_message(&self, id: MessageId) -> StoreResult<Vec<Receipt>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECEIPT_COLUMNS} FROM registry_receipts WHERE message_id = $1 ORDER BY received_at"
        ))
        .bind(id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("receipts_for_message", e))?;
        rows.iter().map(decode_receipt).collect()
    }

    async fn results_for_message(&self, id: MessageId) -> StoreResult<Vec<SubmissionResult>> {
        let rows = sqlx::query(
            r#"
            SELECT id, receipt_id, message_id, tenant_id, outcome, entities, details, recorded_at
            FROM submission_results
            WHERE message_id = $1
            ORDER BY recorded_at
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("results_for_message", e))?;

        rows.iter()
            .map(|row| ResultRow::from_row(row).map_err(decode_error)?.try_into())
            .collect()
    }
}

const EMPLOYEE_COLUMNS: &str = r#"
    id, tenant_id, connection_id, registry_id, sync_status, identity_hash, full_name, position,
    employment_status, updated_at
"#;

const CONTRACT_COLUMNS: &str = r#"
    id, tenant_id, connection_id, employee_id, registry_id, sync_status, contract_type,
    position, start_date, end_date
"#;

#[async_trait]
impl EntityStore for PgSyncStore {
    async fn get_employee(&self, id: EmployeeId) -> StoreResult<Option<EmployeeRecord>> {
        let row = sqlx::query(&format!("SELECT {EMPLOYEE_COLUMNS} FROM employees WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_employee", e))?;
        row.as_ref().map(decode_employee).transpose()
    }

    async fn get_contract(&self, id: ContractId) -> StoreResult<Option<ContractRecord>> {
        let row = sqlx::query(&format!("SELECT {CONTRACT_COLUMNS} FROM contracts WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_contract", e))?;
        row.as_ref().map(decode_contract).transpose()
    }

    async fn employees_for_connection(&self, id: ConnectionId) -> StoreResult<Vec<EmployeeRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {EMPLOYEE_COLUMNS} FROM employees WHERE connection_id = $1 ORDER BY id"
        ))
        .bind(id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("employees_for_connection", e))?;
        rows.iter().map(decode_employee).collect()
    }

    async fn contracts_for_connection(&self, id: ConnectionId) -> StoreResult<Vec<ContractRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {CONTRACT_COLUMNS} FROM contracts WHERE connection_id = $1 ORDER BY id"
        ))
        .bind(id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("contracts_for_connection", e))?;
        rows.iter().map(decode_contract).collect()
    }

    #[instrument(skip(self, registry_id), fields(tenant_id = %tenant_id, connection_id = %connection_id, entity = %entity), err)]
    async fn mark_entity_synced(
        &self,
        tenant_id: TenantId,
        connection_id: ConnectionId,
        entity: EntityRef,
        registry_id: Option<&str>,
    ) -> StoreResult<()> {
        let table = match entity.kind() {
            EntityKind::Employee => "employees",
            EntityKind::Contract => "contracts",
        };
        let result = sqlx::query(&format!(
            "UPDATE {table} SET registry_id = COALESCE($2, registry_id), sync_status = 'synced'
             WHERE id = $1 AND tenant_id = $3 AND connection_id = $4"
        ))
        .bind(entity.as_uuid())
        .bind(registry_id)
        .bind(tenant_id.as_uuid())
        .bind(connection_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_entity_synced", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(entity.to_string()));
        }
        Ok(())
    }
}

const SNAPSHOT_COLUMNS: &str = r#"
    id, tenant_id, connection_id, registry_employee_id, identity_hash, full_name, position,
    contract_type, employment_status, valid_from, valid_to, raw_payload, captured_at
"#;

#[async_trait]
impl SnapshotStore for PgSyncStore {
    async fn append_snapshots(&self, snapshots: &[EmployeeSnapshot]) -> StoreResult<()> {
        let mut tx = self.begin().await?;
        for s in snapshots {
            sqlx::query(&format!(
                "INSERT INTO employee_snapshots ({SNAPSHOT_COLUMNS})
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
            ))
            .bind(s.id.as_uuid())
            .bind(s.tenant_id.as_uuid())
            .bind(s.connection_id.as_uuid())
            .bind(&s.registry_employee_id)
            .bind(&s.identity_hash)
            .bind(&s.full_name)
            .bind(&s.position)
            .bind(&s.contract_type)
            .bind(s.employment_status.as_str())
            .bind(s.valid_from)
            .bind(s.valid_to)
            .bind(&s.raw_payload)
            .bind(s.captured_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("append_snapshot", e))?;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    async fn latest_snapshots(
        &self,
        id: ConnectionId,
    ) -> StoreResult<HashMap<String, EmployeeSnapshot>> {
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT ON (registry_employee_id) {SNAPSHOT_COLUMNS}
             FROM employee_snapshots
             WHERE connection_id = $1
             ORDER BY registry_employee_id, captured_at DESC"
        ))
        .bind(id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest_snapshots", e))?;

        rows.iter()
            .map(|row| decode_snapshot(row).map(|s| (s.registry_employee_id.clone(), s)))
            .collect()
    }

    async fn snapshot_history(
        &self,
        id: ConnectionId,
        registry_employee_id: &str,
    ) -> StoreResult<Vec<EmployeeSnapshot>> {
        let rows = sqlx::query(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM employee_snapshots
             WHERE connection_id = $1 AND registry_employee_id = $2
             ORDER BY captured_at"
        ))
        .bind(id.as_uuid())
        .bind(registry_employee_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("snapshot_history", e))?;
        rows.iter().map(decode_snapshot).collect()
    }

    async fn save_drift_report(&self, report: &DriftReport) -> StoreResult<()> {
        let entries = serde_json::to_value(&report.entries)
            .map_err(|e| StoreError::Storage(format!("failed to encode drift entries: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO drift_reports (
                id, tenant_id, connection_id, generated_at, employees_compared,
                explained_by_in_flight, entries
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(report.id)
        .bind(report.tenant_id.as_uuid())
        .bind(report.connection_id.as_uuid())
        .bind(report.generated_at)
        .bind(report.employees_compared as i32)
        .bind(report.explained_by_in_flight as i32)
        .bind(entries)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_drift_report", e))?;
        Ok(())
    }

    async fn latest_drift_report(&self, tenant_id: TenantId) -> StoreResult<Option<DriftReport>> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, connection_id, generated_at, employees_compared,
                   explained_by_in_flight, entries
            FROM drift_reports
            WHERE tenant_id = $1
            ORDER BY generated_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest_drift_report", e))?;

        let Some(row) = row else { return Ok(None) };
        let entries: serde_json::Value = row.try_get("entries").map_err(decode_error)?;
        Ok(Some(DriftReport {
            id: row.try_get("id").map_err(decode_error)?,
            tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(decode_error)?),
            connection_id: ConnectionId::from_uuid(row.try_get("connection_id").map_err(decode_error)?),
            generated_at: row.try_get("generated_at").map_err(decode_error)?,
            employees_compared: row.try_get::<i32, _>("employees_compared").map_err(decode_error)? as usize,
            explained_by_in_flight: row
                .try_get::<i32, _>("explained_by_in_flight")
                .map_err(decode_error)? as usize,
            entries: serde_json::from_value(entries)
                .map_err(|e| StoreError::Storage(format!("failed to decode drift entries: {e}")))?,
        }))
    }
}

#[async_trait]
impl MutationUnit for Transaction<'static, Postgres> {
    async fn insert_outbox_message(&mut self, mut message: OutboxMessage) -> StoreResult<OutboxMessage> {
        message.sequence = insert_message(&mut **self, &message).await?;
        message.version = 0;
        Ok(message)
    }
}

// SQLx row types

#[derive(Debug)]
struct MessageRow {
    id: Uuid,
    sequence: i64,
    tenant_id: Uuid,
    connection_id: Uuid,
    kind: String,
    entity_type: String,
    entity_id: Uuid,
    parent_type: Option<String>,
    parent_id: Option<Uuid>,
    payload: serde_json::Value,
    status: String,
    priority: i32,
    attempts: i32,
    max_attempts: i32,
    scheduled_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    receipt_ref: Option<String>,
    next_poll_at: Option<DateTime<Utc>>,
    predecessor_id: Option<Uuid>,
    replay_of: Option<Uuid>,
    successor_id: Option<Uuid>,
    version: i64,
}

impl<'r> FromRow<'r, PgRow> for MessageRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(MessageRow {
            id: row.try_get("id")?,
            sequence: row.try_get("sequence")?,
            tenant_id: row.try_get("tenant_id")?,
            connection_id: row.try_get("connection_id")?,
            kind: row.try_get("kind")?,
            entity_type: row.try_get("entity_type")?,
            entity_id: row.try_get("entity_id")?,
            parent_type: row.try_get("parent_type")?,
            parent_id: row.try_get("parent_id")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            scheduled_at: row.try_get("scheduled_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            sent_at: row.try_get("sent_at")?,
            completed_at: row.try_get("completed_at")?,
            last_error: row.try_get("last_error")?,
            receipt_ref: row.try_get("receipt_ref")?,
            next_poll_at: row.try_get("next_poll_at")?,
            predecessor_id: row.try_get("predecessor_id")?,
            replay_of: row.try_get("replay_of")?,
            successor_id: row.try_get("successor_id")?,
            version: row.try_get("version")?,
        })
    }
}

fn parse_entity_kind(s: &str) -> StoreResult<EntityKind> {
    match s {
        "employee" => Ok(EntityKind::Employee),
        "contract" => Ok(EntityKind::Contract),
        other => Err(StoreError::Storage(format!("unknown entity type '{other}'"))),
    }
}

impl TryFrom<MessageRow> for OutboxMessage {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let parent = match (row.parent_type, row.parent_id) {
            (Some(kind), Some(id)) => Some(EntityRef::from_parts(parse_entity_kind(&kind)?, id)),
            _ => None,
        };
        Ok(OutboxMessage {
            id: MessageId::from_uuid(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            connection_id: ConnectionId::from_uuid(row.connection_id),
            kind: MessageKind::parse(&row.kind)
                .ok_or_else(|| StoreError::Storage(format!("unknown message kind '{}'", row.kind)))?,
            entity: EntityRef::from_parts(parse_entity_kind(&row.entity_type)?, row.entity_id),
            parent,
            payload: serde_json::from_value(row.payload)
                .map_err(|e| StoreError::Storage(format!("failed to decode payload: {e}")))?,
            status: MessageStatus::parse(&row.status)
                .ok_or_else(|| StoreError::Storage(format!("unknown message status '{}'", row.status)))?,
            priority: row.priority,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            scheduled_at: row.scheduled_at,
            sequence: row.sequence,
            created_at: row.created_at,
            updated_at: row.updated_at,
            sent_at: row.sent_at,
            completed_at: row.completed_at,
            last_error: row.last_error,
            receipt_ref: row.receipt_ref,
            next_poll_at: row.next_poll_at,
            predecessor_id: row.predecessor_id.map(MessageId::from_uuid),
            replay_of: row.replay_of.map(MessageId::from_uuid),
            successor_id: row.successor_id.map(MessageId::from_uuid),
            version: row.version as u64,
        })
    }
}

fn decode_message(row: &PgRow) -> StoreResult<OutboxMessage> {
    MessageRow::from_row(row).map_err(decode_error)?.try_into()
}

fn decode_connection(row: &PgRow) -> StoreResult<Connection> {
    let status: String = row.try_get("status").map_err(decode_error)?;
    Ok(Connection {
        id: ConnectionId::from_uuid(row.try_get("id").map_err(decode_error)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(decode_error)?),
        registry_employer_id: row.try_get("registry_employer_id").map_err(decode_error)?,
        registry_establishment_id: row.try_get("registry_establishment_id").map_err(decode_error)?,
        credentials: EncryptedCredentials {
            key_version: row.try_get::<i32, _>("credential_key_version").map_err(decode_error)? as u32,
            ciphertext: row.try_get("credential_ciphertext").map_err(decode_error)?,
        },
        status: ConnectionStatus::parse(&status)
            .ok_or_else(|| StoreError::Storage(format!("unknown connection status '{status}'")))?,
        last_sync_at: row.try_get("last_sync_at").map_err(decode_error)?,
        last_error: row.try_get("last_error").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
        updated_at: row.try_get("updated_at").map_err(decode_error)?,
        version: row.try_get::<i64, _>("version").map_err(decode_error)? as u64,
    })
}

fn decode_receipt(row: &PgRow) -> StoreResult<Receipt> {
    let status: String = row.try_get("status").map_err(decode_error)?;
    let issues: serde_json::Value = row.try_get("validation_errors").map_err(decode_error)?;
    Ok(Receipt {
        id: ReceiptId::from_uuid(row.try_get("id").map_err(decode_error)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(decode_error)?),
        connection_id: ConnectionId::from_uuid(row.try_get("connection_id").map_err(decode_error)?),
        message_id: MessageId::from_uuid(row.try_get("message_id").map_err(decode_error)?),
        receipt_number: row.try_get("receipt_number").map_err(decode_error)?,
        receipt_date: row.try_get("receipt_date").map_err(decode_error)?,
        status: ReceiptStatus::parse(&status)
            .ok_or_else(|| StoreError::Storage(format!("unknown receipt status '{status}'")))?,
        validation_errors: serde_json::from_value(issues)
            .map_err(|e| StoreError::Storage(format!("failed to decode validation errors: {e}")))?,
        raw_response: row.try_get("raw_response").map_err(decode_error)?,
        received_at: row.try_get("received_at").map_err(decode_error)?,
    })
}

#[derive(Debug)]
struct ResultRow {
    id: Uuid,
    receipt_id: Uuid,
    message_id: Uuid,
    tenant_id: Uuid,
    outcome: String,
    entities: serde_json::Value,
    details: Option<String>,
    recorded_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for ResultRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ResultRow {
            id: row.try_get("id")?,
            receipt_id: row.try_get("receipt_id")?,
            message_id: row.try_get("message_id")?,
            tenant_id: row.try_get("tenant_id")?,
            outcome: row.try_get("outcome")?,
            entities: row.try_get("entities")?,
            details: row.try_get("details")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}

impl TryFrom<ResultRow> for SubmissionResult {
    type Error = StoreError;

    fn try_from(row: ResultRow) -> Result<Self, Self::Error> {
        Ok(SubmissionResult {
            id: ResultId::from_uuid(row.id),
            receipt_id: ReceiptId::from_uuid(row.receipt_id),
            message_id: MessageId::from_uuid(row.message_id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            outcome: ResultOutcome::parse(&row.outcome)
                .ok_or_else(|| StoreError::Storage(format!("unknown outcome '{}'", row.outcome)))?,
            entities: serde_json::from_value(row.entities)
                .map_err(|e| StoreError::Storage(format!("failed to decode result entities: {e}")))?,
            details: row.details,
            recorded_at: row.recorded_at,
        })
    }
}

fn parse_sync_status(s: &str) -> StoreResult<EntitySyncStatus> {
    EntitySyncStatus::parse(s).ok_or_else(|| StoreError::Storage(format!("unknown sync status '{s}'")))
}

fn decode_employee(row: &PgRow) -> StoreResult<EmployeeRecord> {
    let sync_status: String = row.try_get("sync_status").map_err(decode_error)?;
    let employment_status: String = row.try_get("employment_status").map_err(decode_error)?;
    Ok(EmployeeRecord {
        id: EmployeeId::from_uuid(row.try_get("id").map_err(decode_error)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(decode_error)?),
        connection_id: ConnectionId::from_uuid(row.try_get("connection_id").map_err(decode_error)?),
        registry_id: row.try_get("registry_id").map_err(decode_error)?,
        sync_status: parse_sync_status(&sync_status)?,
        identity_hash: row.try_get("identity_hash").map_err(decode_error)?,
        full_name: row.try_get("full_name").map_err(decode_error)?,
        position: row.try_get("position").map_err(decode_error)?,
        employment_status: EmploymentStatus::parse(&employment_status),
        updated_at: row.try_get("updated_at").map_err(decode_error)?,
    })
}

fn decode_contract(row: &PgRow) -> StoreResult<ContractRecord> {
    let sync_status: String = row.try_get("sync_status").map_err(decode_error)?;
    Ok(ContractRecord {
        id: ContractId::from_uuid(row.try_get("id").map_err(decode_error)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(decode_error)?),
        connection_id: ConnectionId::from_uuid(row.try_get("connection_id").map_err(decode_error)?),
        employee_id: EmployeeId::from_uuid(row.try_get("employee_id").map_err(decode_error)?),
        registry_id: row.try_get("registry_id").map_err(decode_error)?,
        sync_status: parse_sync_status(&sync_status)?,
        contract_type: row.try_get("contract_type").map_err(decode_error)?,
        position: row.try_get("position").map_err(decode_error)?,
        start_date: row.try_get::<NaiveDate, _>("start_date").map_err(decode_error)?,
        end_date: row.try_get("end_date").map_err(decode_error)?,
    })
}

fn decode_snapshot(row: &PgRow) -> StoreResult<EmployeeSnapshot> {
    let employment_status: String = row.try_get("employment_status").map_err(decode_error)?;
    Ok(EmployeeSnapshot {
        id: SnapshotId::from_uuid(row.try_get("id").map_err(decode_error)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(decode_error)?),
        connection_id: ConnectionId::from_uuid(row.try_get("connection_id").map_err(decode_error)?),
        registry_employee_id: row.try_get("registry_employee_id").map_err(decode_error)?,
        identity_hash: row.try_get("identity_hash").map_err(decode_error)?,
        full_name: row.try_get("full_name").map_err(decode_error)?,
        position: row.try_get("position").map_err(decode_error)?,
        contract_type: row.try_get("contract_type").map_err(decode_error)?,
        employment_status: EmploymentStatus::parse(&employment_status),
        valid_from: row.try_get("valid_from").map_err(decode_error)?,
        valid_to: row.try_get("valid_to").map_err(decode_error)?,
        raw_payload: row.try_get("raw_payload").map_err(decode_error)?,
        captured_at: row.try_get("captured_at").map_err(decode_error)?,
    })
}

fn decode_error(err: sqlx::Error) -> StoreError {
    StoreError::Storage(format!("failed to decode row: {err}"))
}

/// Connection writes: a unique violation is the one-active-per-tenant index.
fn map_connection_error(operation: &str, err: sqlx::Error) -> StoreError {
    if is_unique_violation(&err) {
        StoreError::Constraint(format!(
            "{operation}: organization already has an active connection"
        ))
    } else {
        map_sqlx_error(operation, err)
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Concurrency(msg),
                Some("23503") | Some("23514") => StoreError::Constraint(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
