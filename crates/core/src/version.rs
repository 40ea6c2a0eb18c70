//! Optimistic record version.
//!
//! Every persisted job record carries a `Version`. Writers read a record, derive
//! the next state, and submit it guarded on the version they read; the store
//! rejects the write if any other writer got there first. This is the only
//! synchronization primitive the engine relies on.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Monotonically increasing revision of a single record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// Version assigned to a freshly created record.
    pub const INITIAL: Version = Version(1);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// The version a record takes after one successful guarded write.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    pub fn matches(self, actual: Version) -> bool {
        self == actual
    }

    pub fn check(self, actual: Version) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self}, actual: {actual})"
            )))
        }
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::INITIAL
    }
}

impl core::fmt::Display for Version {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "v{}", self.0)
    }
}
