//! Checkpoint protocol.
//!
//! A checkpoint is the last durably saved progress of a job, numbered by a
//! sequence that only ever grows. Saving a checkpoint and renewing the lease
//! are one conditional write: either both land or neither does.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument};

use agentjobs_core::{Clock, JobId};

use crate::lease::{LeaseError, LeaseManager, LeaseToken};
use crate::store::{JobRecordStore, StoreError, load_required};
use crate::types::{Job, saturating_after, to_chrono};

/// Last saved progress of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// 0 means nothing was saved yet
    pub seq: u64,
    pub data: Value,
}

impl Checkpoint {
    pub fn is_initial(&self) -> bool {
        self.seq == 0
    }
}

#[derive(Debug, Clone, Error)]
pub enum CheckpointError {
    #[error("checkpoint sequence mismatch on {job_id}: expected {expected}, found {found}")]
    SequenceMismatch { job_id: JobId, expected: u64, found: u64 },

    #[error("lease on {0} is no longer held")]
    LeaseLost(JobId),

    #[error("job {0} was cancelled")]
    Cancelled(JobId),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<LeaseError> for CheckpointError {
    fn from(err: LeaseError) -> Self {
        match err {
            LeaseError::NotFound(id) => CheckpointError::NotFound(id),
            LeaseError::LeaseLost(id) => CheckpointError::LeaseLost(id),
            LeaseError::Store(e) => CheckpointError::Store(e),
        }
    }
}

/// How often a handler should checkpoint: every `every_steps` logical steps
/// or every `every` of wall-clock time, whichever comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointPolicy {
    pub every_steps: u32,
    pub every: Duration,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            every_steps: 10,
            every: Duration::from_secs(5 * 60),
        }
    }
}

impl CheckpointPolicy {
    pub fn new(every_steps: u32, every: Duration) -> Self {
        Self { every_steps, every }
    }
}

/// Tracks steps and time since the last checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointCadence {
    policy: CheckpointPolicy,
    steps: u32,
    since: DateTime<Utc>,
}

impl CheckpointCadence {
    pub fn new(policy: CheckpointPolicy, now: DateTime<Utc>) -> Self {
        Self {
            policy,
            steps: 0,
            since: now,
        }
    }

    pub fn policy(&self) -> CheckpointPolicy {
        self.policy
    }

    /// Record one logical step; true when a checkpoint is due.
    pub fn tick(&mut self, now: DateTime<Utc>) -> bool {
        self.steps = self.steps.saturating_add(1);
        self.is_due(now)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.steps >= self.policy.every_steps.max(1)
            || now - self.since >= to_chrono(self.policy.every)
    }

    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.steps = 0;
        self.since = now;
    }
}

/// Loads and saves checkpoints for leased jobs.
#[derive(Clone)]
pub struct CheckpointManager {
    leases: LeaseManager,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn JobRecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: LeaseManager::new(store, clock),
        }
    }

    pub fn from_leases(leases: LeaseManager) -> Self {
        Self { leases }
    }

    /// Last saved checkpoint, or `(0, derive_initial(payload))` if none.
    #[instrument(skip(self, derive_initial), fields(job_id = %job_id))]
    pub async fn load<F>(
        &self,
        job_id: JobId,
        derive_initial: F,
    ) -> Result<Checkpoint, CheckpointError>
    where
        F: FnOnce(&Value) -> Value,
    {
        let job = load_required(self.leases.store().as_ref(), job_id)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(id) => CheckpointError::NotFound(id),
                other => CheckpointError::Store(other),
            })?;
        Ok(checkpoint_of(&job, derive_initial))
    }

    /// Save `data` as the checkpoint following `seq` and renew the lease by
    /// `ttl`, in one guarded write. Returns the new sequence.
    ///
    /// `seq` must equal the stored sequence. A pending cancellation rejects
    /// the save with `Cancelled` and writes nothing.
    #[instrument(skip(self, token, data), fields(job_id = %token.job_id, attempt = token.attempt))]
    pub async fn save(
        &self,
        token: &mut LeaseToken,
        seq: u64,
        data: Value,
        ttl: Duration,
    ) -> Result<u64, CheckpointError> {
        let job_id = token.job_id;
        let next_seq = seq + 1;

        let stored = self
            .leases
            .apply_owned(token, |job, now| {
                if job.cancel_requested {
                    return Err(CheckpointError::Cancelled(job_id));
                }
                if job.checkpoint_seq != seq {
                    return Err(CheckpointError::SequenceMismatch {
                        job_id,
                        expected: seq,
                        found: job.checkpoint_seq,
                    });
                }
                job.checkpoint_seq = next_seq;
                job.checkpoint_data = Some(data.clone());
                job.lease_expires_at = Some(saturating_after(now, ttl));
                Ok(())
            })
            .await;

        match stored {
            Ok(job) => {
                debug!(
                    seq = job.checkpoint_seq,
                    lease_expires_at = ?job.lease_expires_at,
                    "checkpoint saved"
                );
                Ok(job.checkpoint_seq)
            }
            Err(CheckpointError::Cancelled(id)) => {
                info!("cancellation observed at checkpoint");
                Err(CheckpointError::Cancelled(id))
            }
            Err(e) => Err(e),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        self.leases.clock()
    }
}

pub(crate) fn checkpoint_of<F>(job: &Job, derive_initial: F) -> Checkpoint
where
    F: FnOnce(&Value) -> Value,
{
    match (&job.checkpoint_data, job.checkpoint_seq) {
        (Some(data), seq) => Checkpoint {
            seq,
            data: data.clone(),
        },
        (None, 0) => Checkpoint {
            seq: 0,
            data: derive_initial(&job.payload),
        },
        (None, seq) => Checkpoint {
            seq,
            data: Value::Null,
        },
    }
}
