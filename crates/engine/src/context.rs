//! Execution context handed to handlers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::warn;

use agentjobs_core::JobId;

use crate::checkpoint::{CheckpointCadence, CheckpointError, CheckpointManager, CheckpointPolicy};
use crate::lease::{LeaseError, LeaseManager, LeaseToken};
use crate::store::StoreError;
use crate::types::{JobStatus, saturating_before};

/// Failure of a context call. Handlers normally propagate these with `?`.
#[derive(Debug, Clone, Error)]
pub enum ContextError {
    #[error("cancellation requested")]
    Cancelled,

    #[error("lease lost")]
    LeaseLost,

    #[error("checkpoint sequence mismatch: expected {expected}, found {found}")]
    SequenceMismatch { expected: u64, found: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<CheckpointError> for ContextError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::Cancelled(_) => ContextError::Cancelled,
            CheckpointError::LeaseLost(_) | CheckpointError::NotFound(_) => ContextError::LeaseLost,
            CheckpointError::SequenceMismatch { expected, found, .. } => {
                ContextError::SequenceMismatch { expected, found }
            }
            CheckpointError::Store(e) => ContextError::Store(e),
        }
    }
}

impl From<LeaseError> for ContextError {
    fn from(err: LeaseError) -> Self {
        match err {
            LeaseError::NotFound(_) | LeaseError::LeaseLost(_) => ContextError::LeaseLost,
            LeaseError::Store(e) => ContextError::Store(e),
        }
    }
}

/// Handle through which a running handler records progress.
///
/// The lease token lives here, shared with the executor's heartbeat; the
/// handler never sees it.
pub struct JobContext {
    job_id: JobId,
    attempt: u32,
    token: Arc<AsyncMutex<LeaseToken>>,
    leases: LeaseManager,
    checkpoints: CheckpointManager,
    lease_ttl: Duration,
    deadline_margin: Duration,
    seq: AtomicU64,
    cadence: Mutex<CheckpointCadence>,
    deadline: watch::Sender<DateTime<Utc>>,
    cancelled: AtomicBool,
    lease_lost: AtomicBool,
}

pub(crate) struct ContextParts {
    pub token: LeaseToken,
    pub leases: LeaseManager,
    pub checkpoints: CheckpointManager,
    pub lease_ttl: Duration,
    pub deadline_margin: Duration,
    pub seq: u64,
    pub cadence: CheckpointPolicy,
}

impl JobContext {
    pub(crate) fn new(parts: ContextParts) -> Self {
        let now = parts.leases.now();
        let deadline = saturating_before(parts.token.expires_at, parts.deadline_margin);
        let (deadline_tx, _) = watch::channel(deadline);
        Self {
            job_id: parts.token.job_id,
            attempt: parts.token.attempt,
            token: Arc::new(AsyncMutex::new(parts.token)),
            leases: parts.leases,
            checkpoints: parts.checkpoints,
            lease_ttl: parts.lease_ttl,
            deadline_margin: parts.deadline_margin,
            seq: AtomicU64::new(parts.seq),
            cadence: Mutex::new(CheckpointCadence::new(parts.cadence, now)),
            deadline: deadline_tx,
            cancelled: AtomicBool::new(false),
            lease_lost: AtomicBool::new(false),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Sequence of the last durable checkpoint.
    pub fn checkpoint_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Time by which the handler must have returned or checkpointed.
    ///
    /// Lease expiry minus the safety margin; every checkpoint moves it.
    pub fn deadline(&self) -> DateTime<Utc> {
        *self.deadline.borrow()
    }

    /// Time left before `deadline()`, zero once passed.
    pub fn remaining(&self) -> Duration {
        (self.deadline() - self.leases.now()).to_std().unwrap_or(Duration::ZERO)
    }

    /// Record one logical step. True when the checkpoint cadence says a
    /// checkpoint is due.
    pub fn tick(&self) -> bool {
        let now = self.leases.now();
        let mut cadence = self.cadence.lock().unwrap_or_else(|p| p.into_inner());
        cadence.tick(now)
    }

    /// Durably save `data` as the next checkpoint and renew the lease.
    ///
    /// Fails with `Cancelled` when cancellation was requested; the handler
    /// should stop and return the error.
    pub async fn checkpoint(&self, data: Value) -> Result<u64, ContextError> {
        let mut token = self.token.lock().await;
        let seq = self.seq.load(Ordering::SeqCst);

        match self.checkpoints.save(&mut token, seq, data, self.lease_ttl).await {
            Ok(next) => {
                self.seq.store(next, Ordering::SeqCst);
                self.publish_deadline(&token);
                let now = self.leases.now();
                self.cadence.lock().unwrap_or_else(|p| p.into_inner()).reset(now);
                Ok(next)
            }
            Err(e) => {
                let err = ContextError::from(e);
                self.note(&err);
                Err(err)
            }
        }
    }

    /// Whether cancellation was requested. Reads the record once per call
    /// until a request is seen, then answers from memory.
    pub async fn is_cancelled(&self) -> Result<bool, ContextError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Ok(true);
        }
        let job = self
            .leases
            .store()
            .get(self.job_id)
            .await?
            .ok_or(ContextError::LeaseLost)?;
        let cancelled = job.cancel_requested || job.status == JobStatus::Cancelled;
        if cancelled {
            self.cancelled.store(true, Ordering::SeqCst);
        }
        Ok(cancelled)
    }

    /// Extend the lease without checkpointing (executor heartbeat).
    pub(crate) async fn renew(&self) -> Result<(), ContextError> {
        let mut token = self.token.lock().await;
        match self.leases.renew(&mut token, self.lease_ttl).await {
            Ok(_) => {
                self.publish_deadline(&token);
                Ok(())
            }
            Err(e) => {
                let err = ContextError::from(e);
                self.note(&err);
                Err(err)
            }
        }
    }

    pub(crate) fn deadline_watch(&self) -> watch::Receiver<DateTime<Utc>> {
        self.deadline.subscribe()
    }

    pub(crate) async fn token(&self) -> LeaseToken {
        self.token.lock().await.clone()
    }

    pub(crate) fn cancellation_observed(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn lease_lost(&self) -> bool {
        self.lease_lost.load(Ordering::SeqCst)
    }

    fn publish_deadline(&self, token: &LeaseToken) {
        self.deadline
            .send_replace(saturating_before(token.expires_at, self.deadline_margin));
    }

    fn note(&self, err: &ContextError) {
        match err {
            ContextError::Cancelled => self.cancelled.store(true, Ordering::SeqCst),
            ContextError::LeaseLost | ContextError::SequenceMismatch { .. } => {
                warn!(
                    job_id = %self.job_id,
                    attempt = self.attempt,
                    error = %err,
                    "lease lost during execution"
                );
                self.lease_lost.store(true, Ordering::SeqCst);
            }
            ContextError::Store(_) => {}
        }
    }
}

impl core::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("attempt", &self.attempt)
            .field("checkpoint_seq", &self.checkpoint_seq())
            .field("deadline", &self.deadline())
            .finish()
    }
}
