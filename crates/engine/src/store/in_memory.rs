use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use agentjobs_core::{JobId, Version};

use super::r#trait::{JobRecordStore, StoreError};
use crate::types::Job;

/// In-memory job store.
///
/// Intended for tests/dev. Honors the same conditional-write contract as the
/// durable adapters, so protocol tests against it are meaningful.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("lock poisoned".to_string())
}

#[async_trait]
impl JobRecordStore for InMemoryJobStore {
    async fn create(&self, mut job: Job) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        job.version = Version::INITIAL;
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs.get(&job_id).cloned())
    }

    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let mut due: Vec<Job> = jobs
            .values()
            .filter(|j| j.is_claimable(now))
            .cloned()
            .collect();

        due.sort_by_key(|j| (j.due_at, j.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn list_by_scope(&self, scope: &str, limit: usize) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let mut result: Vec<Job> = jobs
            .values()
            .filter(|j| j.scope.as_deref() == Some(scope))
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn conditional_update(
        &self,
        job_id: JobId,
        expected: Version,
        mut next: Job,
    ) -> Result<Job, StoreError> {
        if next.id != job_id {
            return Err(StoreError::Corrupt(format!(
                "update for {job_id} carries record {}",
                next.id
            )));
        }

        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let current = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;

        if !expected.matches(current.version) {
            return Err(StoreError::VersionConflict {
                job_id,
                expected,
                found: current.version,
            });
        }

        next.version = current.version.next();
        *current = next.clone();
        Ok(next)
    }
}
