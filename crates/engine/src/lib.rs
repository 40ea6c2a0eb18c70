//! Agent job execution engine.
//!
//! Runs long, multi-step jobs on top of a store that offers nothing more than
//! single-record conditional writes:
//!
//! - at most one active execution per job, through version-guarded leases
//! - resume from the last durable checkpoint after a crash or timeout
//! - classified failures: retry with backoff, or fail with a diagnosable error

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod executor;
pub mod handler;
pub mod lease;
pub mod registry;
pub mod retry;
pub mod store;
pub mod submission;
pub mod types;

mod integration_tests;

pub use checkpoint::{
    Checkpoint, CheckpointCadence, CheckpointError, CheckpointManager, CheckpointPolicy,
};
pub use config::{ConfigError, EngineConfig};
pub use context::{ContextError, JobContext};
pub use dispatcher::{DispatchReport, Dispatcher, DispatcherHandle};
pub use executor::{ExecutionOutcome, Executor};
pub use handler::{HandlerError, HandlerOptions, JobHandler};
pub use lease::{ClaimOutcome, LeaseError, LeaseManager, LeaseToken, Release, ReleaseOutcome};
pub use registry::{HandlerRegistry, HandlerRegistryBuilder, RegistryError};
pub use retry::{
    Classification, ErrorCode, FixedJitter, JitterSource, RandomJitter, RetryPolicy, classify,
};
pub use store::{InMemoryJobStore, JobRecordStore, PostgresJobStore, StoreError};
pub use submission::{CancelOutcome, JobService, SubmitError, SubmitOptions};
pub use types::{CheckpointSummary, ErrorKind, Job, JobStatus, JobType, JobView, LastError};

pub use agentjobs_core::{Clock, JobId, ManualClock, SystemClock, Version, WorkerId};
