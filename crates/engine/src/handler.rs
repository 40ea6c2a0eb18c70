//! Handler interface implemented by callers.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::checkpoint::{Checkpoint, CheckpointPolicy};
use crate::context::{ContextError, JobContext};
use crate::retry::ErrorCode;

/// Failure reported by a handler.
///
/// Only `code` and `retry_after` drive the retry decision; `message` is
/// recorded on the job for diagnosis.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code:?}: {message}")]
pub struct HandlerError {
    pub code: ErrorCode,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl HandlerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Business, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            code: ErrorCode::RateLimited,
            message: message.into(),
            retry_after,
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Http(status), message)
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(ErrorCode::Internal, format!("{err:#}"))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorCode::InvalidInput, err.to_string())
    }
}

/// Context failures surface to handlers so that `?` stops the step; the
/// executor recognizes them and never turns them into a retry on its own.
impl From<ContextError> for HandlerError {
    fn from(err: ContextError) -> Self {
        let code = match err {
            ContextError::Cancelled => ErrorCode::Cancelled,
            ContextError::LeaseLost => ErrorCode::LeaseLost,
            ContextError::SequenceMismatch { .. } => ErrorCode::LeaseLost,
            ContextError::Store(_) => ErrorCode::Unavailable,
        };
        Self::new(code, err.to_string())
    }
}

/// Per-handler execution options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerOptions {
    /// Overrides the engine default; a job's own cap overrides this
    pub max_attempts: Option<u32>,
    /// Overrides the engine checkpoint cadence
    pub checkpoint: Option<CheckpointPolicy>,
    /// Enables executor-driven lease renewal up to this total runtime, for
    /// single steps that can outlast one lease TTL
    pub max_runtime: Option<Duration>,
}

impl HandlerOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_checkpoint(mut self, policy: CheckpointPolicy) -> Self {
        self.checkpoint = Some(policy);
        self
    }

    pub fn with_max_runtime(mut self, max_runtime: Duration) -> Self {
        self.max_runtime = Some(max_runtime);
        self
    }
}

/// Work for one job type.
///
/// `execute` must be resumable: it receives the last durable checkpoint and
/// is expected to continue after it, checkpointing through `ctx` at least as
/// often as its cadence requires.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn options(&self) -> HandlerOptions {
        HandlerOptions::default()
    }

    /// Checkpoint data for a job that has never saved one.
    fn initial_checkpoint(&self, payload: &Value) -> Value {
        let _ = payload;
        Value::Null
    }

    async fn execute(
        &self,
        ctx: &JobContext,
        payload: &Value,
        last: &Checkpoint,
    ) -> Result<(), HandlerError>;
}
