//! `regsync-core`: foundation building blocks shared by every crate.
//!
//! Pure primitives only: identifiers, the domain error model and optimistic
//! versioning. No IO.

pub mod error;
pub mod id;
pub mod version;

pub use error::{DomainError, DomainResult};
pub use id::{
    AlertId, ConnectionId, ContractId, EmployeeId, MessageId, ReceiptId, ResultId, SnapshotId,
    TenantId,
};
pub use version::{ExpectedVersion, Versioned};
