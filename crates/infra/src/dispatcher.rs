//! Dispatcher: moves queued outbox messages to the Registry.
//!
//! One worker per connection at a time (store lease plus an in-process
//! claim), many connections in parallel under a fixed worker pool.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use regsync_core::{ConnectionId, ExpectedVersion, MessageId};
use regsync_outbox::{
    Alert, AlertCategory, AlertSeverity, Connection, InboundReceipt, OutboxMessage, RetryDecision,
    RetryPolicy, ordering,
};

use crate::engine::EngineContext;
use crate::error::EngineError;
use crate::receipts::{ReceiptOutcome, ReceiptProcessor};
use crate::registry::{RegistryError, SubmitRequest};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Connections dispatched in parallel.
    pub workers: usize,
    /// Connections picked per tick, and sends per connection per tick.
    pub batch_size: usize,
    pub call_timeout: Duration,
    pub lease_ttl: chrono::Duration,
    pub retry: RetryPolicy,
    /// Lease holder name for this process.
    pub holder: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 32,
            call_timeout: Duration::from_secs(30),
            lease_ttl: chrono::Duration::seconds(120),
            retry: RetryPolicy::default(),
            holder: format!("regsync-{}", uuid::Uuid::now_v7()),
        }
    }
}

/// What happened to one message handed to the Registry.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Delivered(ReceiptOutcome),
    Retrying { at: DateTime<Utc> },
    Exhausted,
    Rejected,
    /// Put back without charging an attempt; the connection is unusable.
    Requeued,
    LostRace,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub connections: usize,
    pub delivered: usize,
    pub retried: usize,
    pub exhausted: usize,
    pub rejected: usize,
    pub requeued: usize,
    pub superseded: usize,
    pub recovered: usize,
    pub lost_races: usize,
    pub faults: usize,
}

impl DispatchSummary {
    fn record(&mut self, outcome: &SendOutcome) {
        match outcome {
            SendOutcome::Delivered(_) => self.delivered += 1,
            SendOutcome::Retrying { .. } => self.retried += 1,
            SendOutcome::Exhausted => self.exhausted += 1,
            SendOutcome::Rejected => self.rejected += 1,
            SendOutcome::Requeued => self.requeued += 1,
            SendOutcome::LostRace => self.lost_races += 1,
        }
    }

    fn merge(&mut self, other: DispatchSummary) {
        self.connections += other.connections;
        self.delivered += other.delivered;
        self.retried += other.retried;
        self.exhausted += other.exhausted;
        self.rejected += other.rejected;
        self.requeued += other.requeued;
        self.superseded += other.superseded;
        self.recovered += other.recovered;
        self.lost_races += other.lost_races;
        self.faults += other.faults;
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    ctx: EngineContext,
    processor: Arc<ReceiptProcessor>,
    config: Arc<DispatcherConfig>,
    permits: Arc<Semaphore>,
    claimed: Arc<Mutex<HashSet<ConnectionId>>>,
}

/// Wall-clock time within one tick. Starts at the caller's `now` and
/// advances with the runtime clock, so slow sends stamp their real time.
#[derive(Clone, Copy)]
struct TickClock {
    base: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl TickClock {
    fn start(base: DateTime<Utc>) -> Self {
        Self { base, started: tokio::time::Instant::now() }
    }

    fn now(&self) -> DateTime<Utc> {
        self.base + chrono::Duration::from_std(self.started.elapsed()).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

/// Releases the in-process claim on a connection when the task ends,
/// including by panic.
struct Claim {
    claimed: Arc<Mutex<HashSet<ConnectionId>>>,
    id: ConnectionId,
}

impl Drop for Claim {
    fn drop(&mut self) {
        match self.claimed.lock() {
            Ok(mut set) => set.remove(&self.id),
            Err(poisoned) => poisoned.into_inner().remove(&self.id),
        };
    }
}

impl Dispatcher {
    pub fn new(ctx: EngineContext, processor: Arc<ReceiptProcessor>, config: DispatcherConfig) -> Self {
        let workers = config.workers.max(1);
        Self {
            ctx,
            processor,
            config: Arc::new(config),
            permits: Arc::new(Semaphore::new(workers)),
            claimed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    fn claim(&self, id: ConnectionId) -> Option<Claim> {
        let inserted = match self.claimed.lock() {
            Ok(mut set) => set.insert(id),
            Err(poisoned) => poisoned.into_inner().insert(id),
        };
        inserted.then(|| Claim {
            claimed: self.claimed.clone(),
            id,
        })
    }

    fn is_claimed(&self, id: ConnectionId) -> bool {
        match self.claimed.lock() {
            Ok(set) => set.contains(&id),
            Err(poisoned) => poisoned.into_inner().contains(&id),
        }
    }

    /// One dispatcher tick: recover crashed sends, then drain every
    /// connection with ready messages.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<DispatchSummary, EngineError> {
        let clock = TickClock::start(now);
        let mut total = DispatchSummary {
            recovered: self.recover_stale(now).await?,
            ..DispatchSummary::default()
        };

        let ready = self
            .ctx
            .store
            .connections_with_ready_messages(now, self.config.batch_size)
            .await?;

        let mut tasks = JoinSet::new();
        for id in ready {
            if self.ctx.is_halted(id) {
                continue;
            }
            let Some(claim) = self.claim(id) else {
                continue;
            };
            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| EngineError::fault("dispatcher worker pool closed"))?;
            let this = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let _claim = claim;
                this.drain_connection(id, clock).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(summary) => total.merge(summary),
                Err(e) => {
                    error!(error = %e, "dispatch task aborted");
                    total.faults += 1;
                }
            }
        }
        Ok(total)
    }

    /// Send up to one batch for the connection. The lease is renewed before
    /// every send, so it outlives any single Registry call.
    #[instrument(skip(self, clock), fields(connection_id = %id))]
    async fn drain_connection(&self, id: ConnectionId, clock: TickClock) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        let holder = self.config.holder.as_str();

        let tenant_id = match self.ctx.store.get_connection(id).await {
            Ok(Some(c)) if c.is_active() => c.tenant_id,
            Ok(_) => return summary,
            Err(e) => {
                warn!(error = %e, "could not load connection");
                return summary;
            }
        };

        for _ in 0..self.config.batch_size.max(1) {
            match self.ctx.store.acquire_lease(id, holder, self.config.lease_ttl, clock.now()).await {
                Ok(true) => summary.connections = 1,
                Ok(false) => {
                    debug!("connection leased by another worker");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "lease acquisition failed");
                    break;
                }
            }
            match self.dispatch_next(id, clock, &mut summary).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(EngineError::Store(e)) if e.is_concurrency() => summary.lost_races += 1,
                Err(e) => {
                    summary.faults += 1;
                    self.ctx.halt(tenant_id, id, &e.to_string(), clock.now()).await;
                    break;
                }
            }
        }

        if summary.connections > 0 {
            if let Err(e) = self.ctx.store.release_lease(id, holder).await {
                warn!(error = %e, "lease release failed; it will expire");
            }
        }
        summary
    }

    /// Plan the connection and send its head message. `false` when there is
    /// nothing left to send right now.
    async fn dispatch_next(
        &self,
        id: ConnectionId,
        clock: TickClock,
        summary: &mut DispatchSummary,
    ) -> Result<bool, EngineError> {
        let now = clock.now();
        // Re-read per send so credential rotation and deactivation apply at once.
        let Some(connection) = self.ctx.store.get_connection(id).await? else {
            return Ok(false);
        };
        if !connection.is_active() || self.ctx.is_halted(id) {
            return Ok(false);
        }

        let open = self.ctx.store.open_messages_for_connection(id).await?;
        let plan = ordering::plan(&open, now);

        for (update, removal) in &plan.superseded {
            if self.supersede(&open, *update, *removal, now).await? {
                summary.superseded += 1;
            }
        }

        let Some(head) = plan.dispatchable.first() else {
            if !plan.blocked.is_empty() {
                debug!(blocked = plan.blocked.len(), "ready messages waiting on earlier ones");
            }
            return Ok(false);
        };
        let message = open
            .into_iter()
            .find(|m| m.id == *head)
            .ok_or_else(|| EngineError::fault(format!("planned message {head} not among open messages")))?;

        let outcome = self.send(&connection, message, clock).await?;
        summary.record(&outcome);
        Ok(true)
    }

    async fn supersede(
        &self,
        open: &[OutboxMessage],
        update: MessageId,
        removal: MessageId,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let Some(mut message) = open.iter().find(|m| m.id == update).cloned() else {
            return Ok(false);
        };
        let expected = ExpectedVersion::Exact(message.version);
        message.mark_superseded(removal, now)?;
        match self.ctx.store.update_message(&message, expected).await {
            Ok(_) => {
                info!(message_id = %update, superseded_by = %removal, "queued update superseded");
                Ok(true)
            }
            Err(e) if e.is_concurrency() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(
        skip(self, connection, message, clock),
        fields(message_id = %message.id, kind = %message.kind, attempt = message.attempts + 1)
    )]
    async fn send(
        &self,
        connection: &Connection,
        mut message: OutboxMessage,
        clock: TickClock,
    ) -> Result<SendOutcome, EngineError> {
        let expected = ExpectedVersion::Exact(message.version);
        message.begin_send(clock.now())?;
        let Some(message) = self.write(&message, expected).await? else {
            return Ok(SendOutcome::LostRace);
        };

        let credentials = match self.ctx.open_credentials(connection) {
            Ok(c) => c,
            Err(e) => {
                let reason = format!("credential decryption failed: {e}");
                return self.requeue(connection, message, reason, clock.now()).await;
            }
        };

        let request = SubmitRequest::for_message(
            &message,
            connection.registry_employer_id.as_str(),
            connection.registry_establishment_id.clone(),
        );
        let response = tokio::time::timeout(
            self.config.call_timeout,
            self.ctx.registry.submit(&credentials, &request),
        )
        .await
        .unwrap_or(Err(RegistryError::Timeout));

        let now = clock.now();
        match response {
            Ok(receipt) => self.on_receipt(message, receipt, now).await,
            Err(RegistryError::Unauthorized { status }) => {
                let reason = format!("registry refused credentials (HTTP {status})");
                self.requeue(connection, message, reason, now).await
            }
            Err(RegistryError::Rejected { status, issues, summary, .. }) => {
                self.on_rejected(message, status, issues, summary, now).await
            }
            Err(e) => self.on_transient(message, e, now).await,
        }
    }

    async fn on_receipt(
        &self,
        mut message: OutboxMessage,
        receipt: InboundReceipt,
        now: DateTime<Utc>,
    ) -> Result<SendOutcome, EngineError> {
        if receipt.message_id != message.id {
            let err = RegistryError::Protocol(format!(
                "receipt names message {} instead of {}",
                receipt.message_id, message.id
            ));
            return self.on_transient(message, err, now).await;
        }

        let next_poll_at = (!receipt.status.is_final()).then(|| now + self.processor.poll_interval());
        let expected = ExpectedVersion::Exact(message.version);
        message.mark_sent(receipt.receipt_number.clone(), next_poll_at, now)?;
        if self.write(&message, expected).await?.is_none() {
            return Ok(SendOutcome::LostRace);
        }
        debug!(status = receipt.status.as_str(), "submission delivered");

        let outcome = self.processor.process(receipt, now).await?;
        Ok(SendOutcome::Delivered(outcome))
    }

    async fn on_rejected(
        &self,
        mut message: OutboxMessage,
        status: u16,
        issues: Vec<regsync_outbox::ValidationIssue>,
        summary: String,
        now: DateTime<Utc>,
    ) -> Result<SendOutcome, EngineError> {
        let expected = ExpectedVersion::Exact(message.version);
        message.mark_rejected(summary.clone(), now)?;
        let Some(message) = self.write(&message, expected).await? else {
            return Ok(SendOutcome::LostRace);
        };
        warn!(status, summary = %summary, "registry rejected submission");
        self.ctx
            .alerts
            .raise(
                Alert::new(
                    message.tenant_id,
                    AlertSeverity::High,
                    AlertCategory::Rejection,
                    format!("{} {} rejected: {summary}", message.kind, message.entity),
                )
                .for_connection(message.connection_id)
                .with_message(message.id)
                .with_entities(message.affected_entities())
                .with_details(json!({ "status": status, "validation_errors": issues })),
            )
            .await;
        Ok(SendOutcome::Rejected)
    }

    async fn on_transient(
        &self,
        mut message: OutboxMessage,
        err: RegistryError,
        now: DateTime<Utc>,
    ) -> Result<SendOutcome, EngineError> {
        let expected = ExpectedVersion::Exact(message.version);
        let decision = message.fail_transient(err.to_string(), &self.config.retry, now)?;
        let Some(message) = self.write(&message, expected).await? else {
            return Ok(SendOutcome::LostRace);
        };
        match decision {
            RetryDecision::Retry { at } => {
                info!(attempts = message.attempts, retry_at = %at, error = %err, "transient failure; retry scheduled");
                Ok(SendOutcome::Retrying { at })
            }
            RetryDecision::Exhausted => {
                self.raise_exhausted(&message).await;
                Ok(SendOutcome::Exhausted)
            }
        }
    }

    async fn requeue(
        &self,
        connection: &Connection,
        mut message: OutboxMessage,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<SendOutcome, EngineError> {
        let expected = ExpectedVersion::Exact(message.version);
        message.requeue_uncharged(reason.clone(), now)?;
        self.write(&message, expected).await?;
        self.ctx.fail_connection(connection, &reason, now).await;
        Ok(SendOutcome::Requeued)
    }

    async fn raise_exhausted(&self, message: &OutboxMessage) {
        error!(
            message_id = %message.id,
            attempts = message.attempts,
            last_error = message.last_error.as_deref().unwrap_or_default(),
            "retries exhausted"
        );
        self.ctx
            .alerts
            .raise(
                Alert::new(
                    message.tenant_id,
                    AlertSeverity::High,
                    AlertCategory::SyncFailure,
                    format!(
                        "{} {} failed after {} attempts",
                        message.kind, message.entity, message.attempts
                    ),
                )
                .for_connection(message.connection_id)
                .with_message(message.id)
                .with_entities(message.affected_entities()),
            )
            .await;
    }

    /// `None` when another worker moved the message first.
    async fn write(
        &self,
        message: &OutboxMessage,
        expected: ExpectedVersion,
    ) -> Result<Option<OutboxMessage>, EngineError> {
        match self.ctx.store.update_message(message, expected).await {
            Ok(stored) => Ok(Some(stored)),
            Err(e) if e.is_concurrency() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Return `sending` messages abandoned by a crashed worker to the queue,
    /// charged as a transient failure. A connection whose lease is still
    /// held elsewhere has a live sender and is left alone.
    async fn recover_stale(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let holder = self.config.holder.as_str();
        let before = now - self.config.lease_ttl;
        let stale = self
            .ctx
            .store
            .stale_sending_messages(before, self.config.batch_size)
            .await?;

        let mut recovered = 0;
        for message in stale {
            let id = message.connection_id;
            if self.is_claimed(id) {
                continue;
            }
            if !self.ctx.store.acquire_lease(id, holder, self.config.lease_ttl, now).await? {
                debug!(message_id = %message.id, connection_id = %id, "stale send still leased elsewhere");
                continue;
            }
            let result = self.recover(message, now).await;
            if let Err(e) = self.ctx.store.release_lease(id, holder).await {
                warn!(error = %e, connection_id = %id, "lease release failed; it will expire");
            }
            if result? {
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn recover(&self, mut message: OutboxMessage, now: DateTime<Utc>) -> Result<bool, EngineError> {
        let expected = ExpectedVersion::Exact(message.version);
        let decision = message.fail_transient(
            "send interrupted: worker lease expired",
            &self.config.retry,
            now,
        )?;
        let Some(message) = self.write(&message, expected).await? else {
            return Ok(false);
        };
        warn!(message_id = %message.id, connection_id = %message.connection_id, "recovered stale send");
        if decision == RetryDecision::Exhausted {
            self.raise_exhausted(&message).await;
        }
        Ok(true)
    }
}
