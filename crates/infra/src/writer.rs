//! Outbox writer: records a mutation intent inside the caller's unit of work.

use chrono::{DateTime, Utc};
use tracing::debug;

use regsync_core::{DomainError, TenantId};
use regsync_outbox::{Connection, Mutation, OutboxMessage};

use crate::error::StoreError;
use crate::store::MutationUnit;

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("connection {0} is not active")]
    ConnectionInactive(String),
    #[error("connection belongs to another organization")]
    TenantMismatch,
    #[error("invalid mutation: {0}")]
    InvalidMutation(#[from] DomainError),
    /// The insert failed; the caller's unit of work must abort.
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct OutboxWriter {
    max_attempts: u32,
}

impl OutboxWriter {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub async fn enqueue<U>(
        &self,
        unit: &mut U,
        connection: &Connection,
        tenant_id: TenantId,
        mutation: Mutation,
    ) -> Result<OutboxMessage, WriterError>
    where
        U: MutationUnit + ?Sized,
    {
        self.enqueue_at(unit, connection, tenant_id, mutation, Utc::now())
            .await
    }

    pub async fn enqueue_at<U>(
        &self,
        unit: &mut U,
        connection: &Connection,
        tenant_id: TenantId,
        mutation: Mutation,
        now: DateTime<Utc>,
    ) -> Result<OutboxMessage, WriterError>
    where
        U: MutationUnit + ?Sized,
    {
        if connection.tenant_id != tenant_id {
            return Err(WriterError::TenantMismatch);
        }
        if !connection.is_active() {
            return Err(WriterError::ConnectionInactive(connection.id.to_string()));
        }

        let message = OutboxMessage::from_mutation(
            tenant_id,
            connection.id,
            mutation,
            self.max_attempts,
            now,
        )?;
        let message = unit.insert_outbox_message(message).await?;

        debug!(
            tenant_id = %tenant_id,
            connection_id = %connection.id,
            message_id = %message.id,
            kind = %message.kind,
            sequence = message.sequence,
            "outbox message staged"
        );
        Ok(message)
    }
}
