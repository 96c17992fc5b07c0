//! Optimistic concurrency for single-row state transitions.

use crate::error::{DomainError, DomainResult};

/// Optimistic concurrency expectation for a versioned record.
///
/// Every engine-owned record carries a `version` that the store bumps on each
/// successful write. Writers pass the version they read; a mismatch means
/// another worker transitioned the record first and the loser must re-read.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking (inserts, administrative overrides).
    Any,
    /// Require the record to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}

/// Records that carry an optimistic version.
pub trait Versioned {
    /// Monotonically increasing write version.
    fn version(&self) -> u64;

    /// The expectation to pass when writing back what was read.
    fn expected(&self) -> ExpectedVersion {
        ExpectedVersion::Exact(self.version())
    }
}
