//! Lease protocol: claim, renew, release.
//!
//! Every transition is a version-guarded `conditional_update` on the job
//! record, built from a fresh read of that record. Ownership is checked on the
//! read and the write is guarded on the read's version, so a write can only
//! land if nothing changed between the check and the write.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use agentjobs_core::{Clock, JobId, Version, WorkerId};

use crate::store::{JobRecordStore, StoreError};
use crate::types::{Job, JobStatus, LastError, saturating_after};

/// Proof of a successful claim.
///
/// Held by the executor for the lifetime of one attempt. Never serialized
/// into job views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    pub job_id: JobId,
    pub owner: WorkerId,
    /// The attempt number this lease was issued for
    pub attempt: u32,
    /// Version of the record after our last successful write
    pub version: Version,
    pub expires_at: DateTime<Utc>,
}

impl LeaseToken {
    fn issued(job: &Job, owner: WorkerId, expires_at: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id,
            owner,
            attempt: job.attempt,
            version: job.version,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Track a write made under this lease.
    pub(crate) fn observe(&mut self, job: &Job) {
        self.version = job.version;
        if let Some(expires_at) = job.lease_expires_at {
            self.expires_at = expires_at;
        }
    }
}

/// Result of a claim attempt.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Claimed { token: LeaseToken, job: Job },
    /// Another owner won the race (the version guard rejected our write).
    AlreadyClaimed,
    /// Not due, leased by someone else, or terminal.
    NotEligible(JobStatus),
    /// An expired lease had a pending cancellation; the job is now cancelled.
    Cancelled(Job),
}

/// Final or retry-bound transition of a leased job.
#[derive(Debug, Clone, PartialEq)]
pub enum Release {
    Completed,
    Failed(LastError),
    Retry {
        due_at: DateTime<Utc>,
        error: LastError,
    },
    Cancelled,
}

impl Release {
    fn label(&self) -> &'static str {
        match self {
            Release::Completed => "completed",
            Release::Failed(_) => "failed",
            Release::Retry { .. } => "retry",
            Release::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ReleaseOutcome {
    Applied(Job),
    /// The record was already terminal; nothing was written.
    AlreadyTerminal,
    /// The lease was lost to another owner; nothing was written.
    Dropped,
}

#[derive(Debug, Clone, Error)]
pub enum LeaseError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("lease on {0} is no longer held")]
    LeaseLost(JobId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Claim/renew/release over a job record store.
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn JobRecordStore>,
    clock: Arc<dyn Clock>,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn JobRecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn store(&self) -> &Arc<dyn JobRecordStore> {
        &self.store
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Try to take the lease on `job_id` for `ttl`.
    #[instrument(skip(self), fields(job_id = %job_id, owner = %owner))]
    pub async fn claim(
        &self,
        job_id: JobId,
        owner: WorkerId,
        ttl: Duration,
    ) -> Result<ClaimOutcome, LeaseError> {
        let now = self.clock.now();
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or(LeaseError::NotFound(job_id))?;

        if !job.is_claimable(now) {
            debug!(status = %job.status, "job not eligible for claim");
            return Ok(ClaimOutcome::NotEligible(job.status));
        }

        if job.cancel_requested {
            let mut next = job.clone();
            next.status = JobStatus::Cancelled;
            next.clear_lease();
            next.updated_at = now;
            return match self.store.conditional_update(job_id, job.version, next).await {
                Ok(stored) => {
                    info!(
                        attempt = stored.attempt,
                        "expired lease had pending cancellation; job cancelled"
                    );
                    Ok(ClaimOutcome::Cancelled(stored))
                }
                Err(e) if e.is_conflict() => Ok(ClaimOutcome::AlreadyClaimed),
                Err(e) => Err(e.into()),
            };
        }

        if job.status == JobStatus::Running {
            warn!(
                previous_owner = ?job.lease_owner,
                lease_expires_at = ?job.lease_expires_at,
                attempt = job.attempt,
                "reclaiming expired lease"
            );
        }

        let expires_at = saturating_after(now, ttl);
        let mut next = job.clone();
        next.status = JobStatus::Running;
        next.lease_owner = Some(owner);
        next.lease_expires_at = Some(expires_at);
        next.attempt = job.attempt.saturating_add(1);
        next.updated_at = now;

        match self.store.conditional_update(job_id, job.version, next).await {
            Ok(stored) => {
                let token = LeaseToken::issued(&stored, owner, expires_at);
                info!(attempt = token.attempt, %expires_at, "job claimed");
                Ok(ClaimOutcome::Claimed { token, job: stored })
            }
            Err(e) if e.is_conflict() => {
                debug!("claim lost the race");
                Ok(ClaimOutcome::AlreadyClaimed)
            }
            Err(StoreError::NotFound(id)) => Err(LeaseError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Extend the lease by `ttl` from now.
    #[instrument(skip(self, token), fields(job_id = %token.job_id, attempt = token.attempt))]
    pub async fn renew(&self, token: &mut LeaseToken, ttl: Duration) -> Result<Job, LeaseError> {
        self.apply_owned(token, |job, now| {
            job.lease_expires_at = Some(saturating_after(now, ttl));
            Ok::<(), LeaseError>(())
        })
        .await
        .inspect(|job| debug!(lease_expires_at = ?job.lease_expires_at, "lease renewed"))
    }

    /// Read-modify-write on a record this token still owns.
    ///
    /// A guard conflict with ownership intact can only come from a
    /// cancellation request; the write is re-applied once on the newer
    /// version. Anything else means the lease is gone.
    pub(crate) async fn apply_owned<F, E>(
        &self,
        token: &mut LeaseToken,
        mutate: F,
    ) -> Result<Job, E>
    where
        F: Fn(&mut Job, DateTime<Utc>) -> Result<(), E>,
        E: From<LeaseError>,
    {
        for _ in 0..2 {
            let current = self
                .store
                .get(token.job_id)
                .await
                .map_err(LeaseError::from)?
                .ok_or(LeaseError::NotFound(token.job_id))?;

            if !current.is_owned_by(token) {
                return Err(LeaseError::LeaseLost(token.job_id).into());
            }
            if current.version != token.version {
                debug!(
                    token_version = %token.version,
                    record_version = %current.version,
                    "record changed under live lease"
                );
            }

            let now = self.clock.now();
            let mut next = current.clone();
            mutate(&mut next, now)?;
            next.updated_at = now;

            match self.store.conditional_update(token.job_id, current.version, next).await {
                Ok(stored) => {
                    token.observe(&stored);
                    return Ok(stored);
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(LeaseError::from(e).into()),
            }
        }

        warn!(job_id = %token.job_id, "lease write conflicted twice; treating lease as lost");
        Err(LeaseError::LeaseLost(token.job_id).into())
    }

    /// Terminal or retry-bound transition.
    ///
    /// Never rewrites a terminal record. A retry-bound release on a job whose
    /// cancellation was requested lands as `cancelled`.
    #[instrument(
        skip(self, token, release),
        fields(job_id = %token.job_id, attempt = token.attempt, release = release.label())
    )]
    pub async fn release(
        &self,
        token: &LeaseToken,
        release: Release,
    ) -> Result<ReleaseOutcome, LeaseError> {
        let mut token = token.clone();
        let current = self
            .store
            .get(token.job_id)
            .await?
            .ok_or(LeaseError::NotFound(token.job_id))?;

        if current.status.is_terminal() {
            debug!(status = %current.status, "release on terminal job ignored");
            return Ok(ReleaseOutcome::AlreadyTerminal);
        }

        let result = self
            .apply_owned(&mut token, |job, now| {
                apply_release(job, &release, now);
                Ok::<(), LeaseError>(())
            })
            .await;

        match result {
            Ok(job) => {
                match job.status {
                    JobStatus::Queued => warn!(due_at = %job.due_at, "job re-queued for retry"),
                    status => info!(%status, "job released"),
                }
                Ok(ReleaseOutcome::Applied(job))
            }
            Err(LeaseError::LeaseLost(_)) => {
                // Someone may have finished the job between our two reads.
                if let Some(latest) = self.store.get(token.job_id).await? {
                    if latest.status.is_terminal() {
                        return Ok(ReleaseOutcome::AlreadyTerminal);
                    }
                }
                warn!("release dropped: lease no longer held");
                Ok(ReleaseOutcome::Dropped)
            }
            Err(e) => Err(e),
        }
    }
}

fn apply_release(job: &mut Job, release: &Release, now: DateTime<Utc>) {
    job.clear_lease();
    match release {
        Release::Completed => {
            job.status = JobStatus::Completed;
            job.last_error = None;
        }
        Release::Failed(error) => {
            job.status = JobStatus::Failed;
            job.last_error = Some(error.clone());
        }
        Release::Retry { due_at, error } => {
            job.last_error = Some(error.clone());
            if job.cancel_requested {
                job.status = JobStatus::Cancelled;
            } else {
                job.status = JobStatus::Queued;
                job.due_at = *due_at;
            }
        }
        Release::Cancelled => {
            job.status = JobStatus::Cancelled;
        }
    }
    job.updated_at = now;
}
