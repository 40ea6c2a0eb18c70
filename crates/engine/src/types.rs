//! Core job types: the persisted record and its read-only projection.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use agentjobs_core::{DomainError, JobId, Version, WorkerId};

use crate::lease::LeaseToken;

/// Job type tag, selecting a handler from the registry.
///
/// Closed on purpose: a type with no registered handler is detected when the
/// registry is built, not when a job of that type is picked up.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Scheduled digest of recent activity.
    Digest,
    /// Cross-record analysis over a business scope.
    Analysis,
    /// Multi-stage pipeline that may rewrite its own later stages.
    Pipeline,
}

impl JobType {
    pub const ALL: [JobType; 3] = [JobType::Digest, JobType::Analysis, JobType::Pipeline];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Digest => "digest",
            JobType::Analysis => "analysis",
            JobType::Pipeline => "pipeline",
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job type: {s}")))
    }
}

/// Job execution status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `due_at`, then claimable
    Queued,
    /// Held by a lease owner
    Running,
    /// Handler returned successfully
    Completed,
    /// Permanent error or attempts exhausted
    Failed,
    /// Cancelled on request
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses are write-once.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Failure category recorded on the job; mirrors the retry classification.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    RateLimited,
    Timeout,
    Permanent,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Permanent => "permanent",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(ErrorKind::Transient),
            "rate_limited" => Ok(ErrorKind::RateLimited),
            "timeout" => Ok(ErrorKind::Timeout),
            "permanent" => Ok(ErrorKind::Permanent),
            other => Err(DomainError::validation(format!("unknown error kind: {other}"))),
        }
    }
}

/// Most recent failure of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub kind: ErrorKind,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl LastError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, occurred_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            message: message.into(),
            occurred_at,
        }
    }
}

/// A schedulable unit of work, exactly as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    /// Handler selector
    pub job_type: JobType,
    pub status: JobStatus,
    /// Input blob, immutable after creation
    pub payload: Value,
    /// Eligible for claim once `now >= due_at`
    pub due_at: DateTime<Utc>,
    /// Incremented by exactly one on every claim
    pub attempt: u32,
    /// Per-job attempt cap; `None` defers to the handler or engine default
    pub max_attempts: Option<u32>,
    pub lease_owner: Option<WorkerId>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Never decreases
    pub checkpoint_seq: u64,
    pub checkpoint_data: Option<Value>,
    pub last_error: Option<LastError>,
    /// Cooperative cancellation flag, observed at checkpoint boundaries
    pub cancel_requested: bool,
    /// Correlation key used for listing only, never for locking
    pub scope: Option<String>,
    /// Optimistic guard, managed by the store
    pub version: Version,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new queued job.
    pub fn new(
        job_type: JobType,
        payload: Value,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            job_type,
            status: JobStatus::Queued,
            payload,
            due_at,
            attempt: 0,
            max_attempts: None,
            lease_owner: None,
            lease_expires_at: None,
            checkpoint_seq: 0,
            checkpoint_data: None,
            last_error: None,
            cancel_requested: false,
            scope: None,
            version: Version::INITIAL,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// True once the lease (if any) has lapsed.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        match self.lease_expires_at {
            Some(expires_at) => expires_at < now,
            None => true,
        }
    }

    /// Whether a claim may be attempted at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Queued => self.due_at <= now,
            JobStatus::Running => self.lease_expired(now),
            _ => false,
        }
    }

    /// The record is still held by the lease described by `token`.
    ///
    /// Version is deliberately not compared: a cancellation request bumps the
    /// version without taking the lease away.
    pub fn is_owned_by(&self, token: &LeaseToken) -> bool {
        self.status == JobStatus::Running
            && self.lease_owner == Some(token.owner)
            && self.attempt == token.attempt
    }

    pub fn clear_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }

    pub fn view(&self) -> JobView {
        JobView::from(self)
    }
}

/// Progress summary exposed to callers (the blob itself stays internal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckpointSummary {
    pub seq: u64,
    pub has_data: bool,
}

/// Read-only projection of a job for the submission interface.
///
/// Never carries lease ownership or token material.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub attempt: u32,
    pub due_at: DateTime<Utc>,
    pub last_error: Option<LastError>,
    pub checkpoint: CheckpointSummary,
    pub cancel_requested: bool,
    pub scope: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type,
            status: job.status,
            attempt: job.attempt,
            due_at: job.due_at,
            last_error: job.last_error.clone(),
            checkpoint: CheckpointSummary {
                seq: job.checkpoint_seq,
                has_data: job.checkpoint_data.is_some(),
            },
            cancel_requested: job.cancel_requested,
            scope: job.scope.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// Convert a configured duration into a timestamp offset, saturating.
pub(crate) fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// `at + d`, saturating at the end of representable time.
pub(crate) fn saturating_after(at: DateTime<Utc>, d: std::time::Duration) -> DateTime<Utc> {
    at.checked_add_signed(to_chrono(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - d`, saturating at the start of representable time.
pub(crate) fn saturating_before(at: DateTime<Utc>, d: std::time::Duration) -> DateTime<Utc> {
    at.checked_sub_signed(to_chrono(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
