//! Retry classification and backoff.
//!
//! Both halves are pure: classification reads only the code a handler
//! reported, and `RetryPolicy::next_due_at` takes `now` and a jitter source as
//! arguments.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::handler::HandlerError;
use crate::types::{ErrorKind, saturating_after};

/// Failure code reported by a handler (or synthesized by the executor).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Connection reset, DNS failure, etc.
    Network,
    /// Dependency briefly unavailable.
    Unavailable,
    /// Explicit throttling signal.
    RateLimited,
    /// The handler or a dependency ran out of time.
    DeadlineExceeded,
    InvalidInput,
    UnsupportedJobType,
    /// Unrecoverable business-logic error.
    Business,
    /// The handler stopped because cancellation was requested.
    Cancelled,
    /// The handler observed that its lease is gone.
    LeaseLost,
    /// Anything not otherwise categorized.
    Internal,
    /// Raw HTTP status from a dependency.
    Http(u16),
}

/// Retry category of a failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Classification {
    Transient,
    RateLimited { retry_after: Option<Duration> },
    Timeout,
    Permanent,
}

impl Classification {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Classification::Transient => ErrorKind::Transient,
            Classification::RateLimited { .. } => ErrorKind::RateLimited,
            Classification::Timeout => ErrorKind::Timeout,
            Classification::Permanent => ErrorKind::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Classification::Permanent)
    }
}

/// Retry category of a code, without any hint.
///
/// `Cancelled` and `LeaseLost` never reach a store transition through this
/// table (the executor intercepts them); they map to `Permanent` so a stray
/// one can never loop.
pub fn kind_of(code: ErrorCode) -> ErrorKind {
    match code {
        ErrorCode::Network | ErrorCode::Unavailable | ErrorCode::Internal => ErrorKind::Transient,
        ErrorCode::RateLimited => ErrorKind::RateLimited,
        ErrorCode::DeadlineExceeded => ErrorKind::Timeout,
        ErrorCode::InvalidInput
        | ErrorCode::UnsupportedJobType
        | ErrorCode::Business
        | ErrorCode::Cancelled
        | ErrorCode::LeaseLost => ErrorKind::Permanent,
        ErrorCode::Http(429) => ErrorKind::RateLimited,
        ErrorCode::Http(408) | ErrorCode::Http(504) => ErrorKind::Timeout,
        ErrorCode::Http(500..=599) => ErrorKind::Transient,
        ErrorCode::Http(400..=499) => ErrorKind::Permanent,
        ErrorCode::Http(_) => ErrorKind::Transient,
    }
}

/// Classify a handler failure by its reported code.
pub fn classify(error: &HandlerError) -> Classification {
    match kind_of(error.code) {
        ErrorKind::Transient => Classification::Transient,
        ErrorKind::RateLimited => Classification::RateLimited {
            retry_after: error.retry_after,
        },
        ErrorKind::Timeout => Classification::Timeout,
        ErrorKind::Permanent => Classification::Permanent,
    }
}

/// Source of the multiplicative jitter factor, in `[0.5, 1.5]`.
pub trait JitterSource: Send + Sync {
    fn factor(&self) -> f64;
}

/// Uniformly random jitter.
#[derive(Debug, Default, Copy, Clone)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn factor(&self) -> f64 {
        rand::thread_rng().gen_range(0.5..=1.5)
    }
}

/// Constant factor, clamped into `[0.5, 1.5]`. For tests and simulations.
#[derive(Debug, Copy, Clone)]
pub struct FixedJitter(f64);

impl FixedJitter {
    pub const NONE: FixedJitter = FixedJitter(1.0);

    pub fn new(factor: f64) -> Self {
        Self(factor.clamp(0.5, 1.5))
    }
}

impl JitterSource for FixedJitter {
    fn factor(&self) -> f64 {
        self.0
    }
}

/// Exponential backoff with a cap and an attempt limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first attempt is `base_delay * 2`
    pub base_delay: Duration,
    /// Cap applied before jitter
    pub max_delay: Duration,
    /// Engine-wide default; handlers and jobs may override
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// `min(base * 2^attempt, cap)`, before jitter.
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Delay before the next attempt, or `None` to stop retrying.
    pub fn delay(
        &self,
        attempt: u32,
        classification: &Classification,
        jitter: &dyn JitterSource,
    ) -> Option<Duration> {
        if !classification.is_retryable() || attempt >= self.max_attempts {
            return None;
        }

        let capped = self.capped_delay(attempt);
        let computed = Duration::try_from_secs_f64(capped.as_secs_f64() * jitter.factor())
            .unwrap_or(self.max_delay);
        match classification {
            Classification::RateLimited {
                retry_after: Some(hint),
            } => Some(computed.max(*hint)),
            _ => Some(computed),
        }
    }

    /// When the job becomes due again, or `None` to stop retrying.
    pub fn next_due_at(
        &self,
        attempt: u32,
        classification: &Classification,
        now: DateTime<Utc>,
        jitter: &dyn JitterSource,
    ) -> Option<DateTime<Utc>> {
        let delay = self.delay(attempt, classification, jitter)?;
        Some(saturating_after(now, delay))
    }
}
