//! Submission interface used by the outer application.
//!
//! Everything returned here is a `JobView`; lease ownership never leaves the
//! engine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, instrument, warn};

use agentjobs_core::{Clock, JobId};

use crate::store::{JobRecordStore, StoreError};
use crate::types::{Job, JobStatus, JobType, JobView};

/// Conditional writes from the submission side retry this many times.
const CANCEL_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Error)]
pub enum SubmitError {
    #[error("invalid submission: {0}")]
    Invalid(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {0} kept changing; try again")]
    Conflict(JobId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Defaults to now
    pub due_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    pub max_attempts: Option<u32>,
}

impl SubmitOptions {
    pub fn due_at(mut self, due_at: DateTime<Utc>) -> Self {
        self.due_at = Some(due_at);
        self
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job is now `cancelled`.
    Cancelled,
    /// The job is running under a live lease; its handler will observe the
    /// request at its next checkpoint.
    Requested,
    AlreadyTerminal,
}

/// Submit, inspect and cancel jobs.
#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobRecordStore>,
    clock: Arc<dyn Clock>,
}

impl JobService {
    pub fn new(store: Arc<dyn JobRecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    #[instrument(skip(self, payload, options), fields(job_type = %job_type))]
    pub async fn submit(
        &self,
        job_type: JobType,
        payload: Value,
        options: SubmitOptions,
    ) -> Result<JobId, SubmitError> {
        if options.max_attempts == Some(0) {
            return Err(SubmitError::Invalid("max_attempts must be at least 1".into()));
        }
        if options.scope.as_deref().is_some_and(|s| s.trim().is_empty()) {
            return Err(SubmitError::Invalid("scope must not be blank".into()));
        }

        let now = self.clock.now();
        let mut job = Job::new(job_type, payload, options.due_at.unwrap_or(now), now);
        job.scope = options.scope;
        job.max_attempts = options.max_attempts;

        let job = self.store.create(job).await?;
        info!(job_id = %job.id, due_at = %job.due_at, "job submitted");
        Ok(job.id)
    }

    pub async fn get(&self, job_id: JobId) -> Result<Option<JobView>, SubmitError> {
        Ok(self.store.get(job_id).await?.map(|job| job.view()))
    }

    /// Cancel a job.
    ///
    /// Queued jobs, and running jobs whose lease already lapsed, are
    /// cancelled directly. A live lease only gets the cancellation flag.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn cancel(&self, job_id: JobId) -> Result<CancelOutcome, SubmitError> {
        for _ in 0..CANCEL_ATTEMPTS {
            let job = self
                .store
                .get(job_id)
                .await?
                .ok_or(SubmitError::NotFound(job_id))?;

            if job.status.is_terminal() {
                return Ok(CancelOutcome::AlreadyTerminal);
            }

            let now = self.clock.now();
            let live_lease = job.status == JobStatus::Running && !job.lease_expired(now);
            if live_lease && job.cancel_requested {
                return Ok(CancelOutcome::Requested);
            }

            let mut next = job.clone();
            next.cancel_requested = true;
            next.updated_at = now;
            if !live_lease {
                next.status = JobStatus::Cancelled;
                next.clear_lease();
            }

            match self.store.conditional_update(job_id, job.version, next).await {
                Ok(_) if live_lease => {
                    info!("cancellation requested for running job");
                    return Ok(CancelOutcome::Requested);
                }
                Ok(_) => {
                    info!(previous_status = %job.status, "job cancelled");
                    return Ok(CancelOutcome::Cancelled);
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }

        warn!("cancel kept losing to concurrent writers");
        Err(SubmitError::Conflict(job_id))
    }

    /// Jobs sharing `scope`, oldest first.
    pub async fn list_by_scope(
        &self,
        scope: &str,
        limit: usize,
    ) -> Result<Vec<JobView>, SubmitError> {
        let jobs = self.store.list_by_scope(scope, limit).await?;
        Ok(jobs.iter().map(JobView::from).collect())
    }
}
