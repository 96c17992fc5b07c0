//! `regsync-outbox`: the synchronization domain model.
//!
//! Connections, outbox messages and their delivery state machine, receipts
//! and results, Registry snapshots and drift comparison. Pure and
//! synchronous: persistence and IO live in `regsync-infra`.

pub mod alert;
pub mod connection;
pub mod drift;
pub mod entity;
pub mod message;
pub mod ordering;
pub mod payload;
pub mod receipt;
pub mod retry;
pub mod snapshot;

pub use alert::{Alert, AlertCategory, AlertSeverity};
pub use connection::{Connection, ConnectionStatus, EncryptedCredentials};
pub use drift::{DriftEntry, DriftKind, DriftReport, FieldChange, FieldDiff, LocalEmployee};
pub use entity::{
    ContractRecord, EmployeeRecord, EmploymentStatus, EntityKind, EntityRef, EntitySyncStatus,
};
pub use message::{MessageKind, MessageStatus, Mutation, Operation, OutboxMessage, RetryDecision};
pub use ordering::DispatchPlan;
pub use payload::{PayloadSection, SubmissionPayload};
pub use receipt::{
    InboundReceipt, InboundResult, Receipt, ReceiptStatus, ResultEntity, ResultOutcome,
    SubmissionResult, ValidationIssue,
};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use snapshot::{identity_hash, EmployeeSnapshot, RegistryEmployee};
