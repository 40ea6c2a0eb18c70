use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use agentjobs_core::{JobId, Version};

use crate::types::Job;

/// Store operation error.
///
/// These are **infrastructure errors**. A `VersionConflict` is the expected
/// outcome of losing a race and is handled by the lease manager; it is never a
/// reason to retry blindly.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("version conflict on {job_id}: expected {expected}, found {found}")]
    VersionConflict {
        job_id: JobId,
        expected: Version,
        found: Version,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }
}

/// Durable job record store.
///
/// ## Contract
///
/// - `conditional_update` is atomic: it either replaces the whole record and
///   advances its version by one, or fails with `VersionConflict` leaving the
///   stored record untouched. There is no partial write.
/// - `list_due` returns records with `status = queued AND due_at <= now` or
///   `status = running AND (lease_expires_at IS NULL OR lease_expires_at < now)`,
///   ordered by `due_at`.
/// - `list_by_scope` is for inspection only; scope never participates in
///   locking.
#[async_trait]
pub trait JobRecordStore: Send + Sync {
    /// Persist a new record. The stored version is always `Version::INITIAL`.
    async fn create(&self, job: Job) -> Result<Job, StoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Candidates for a dispatcher cycle.
    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Jobs sharing a correlation key, oldest first.
    async fn list_by_scope(&self, scope: &str, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Replace the record if (and only if) it is still at `expected`.
    ///
    /// Returns the stored record carrying its new version.
    async fn conditional_update(
        &self,
        job_id: JobId,
        expected: Version,
        next: Job,
    ) -> Result<Job, StoreError>;
}

#[async_trait]
impl<S: JobRecordStore + ?Sized> JobRecordStore for Arc<S> {
    async fn create(&self, job: Job) -> Result<Job, StoreError> {
        (**self).create(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).get(job_id).await
    }

    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        (**self).list_due(now, limit).await
    }

    async fn list_by_scope(&self, scope: &str, limit: usize) -> Result<Vec<Job>, StoreError> {
        (**self).list_by_scope(scope, limit).await
    }

    async fn conditional_update(
        &self,
        job_id: JobId,
        expected: Version,
        next: Job,
    ) -> Result<Job, StoreError> {
        (**self).conditional_update(job_id, expected, next).await
    }
}

/// Fetch a record that must exist.
pub async fn load_required<S: JobRecordStore + ?Sized>(
    store: &S,
    job_id: JobId,
) -> Result<Job, StoreError> {
    store.get(job_id).await?.ok_or(StoreError::NotFound(job_id))
}
