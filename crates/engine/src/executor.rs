//! Runs one claimed job to its next state.
//!
//! Handler errors never escape: every attempt ends in a store transition
//! (`completed`, `failed`, `queued` for retry, `cancelled`) or, when the lease
//! was lost, in no write at all.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{Instrument, error, info, info_span, warn};

use agentjobs_core::Clock;

use crate::checkpoint::{CheckpointManager, checkpoint_of};
use crate::config::EngineConfig;
use crate::context::{ContextParts, JobContext};
use crate::handler::{HandlerError, HandlerOptions, JobHandler};
use crate::lease::{LeaseManager, LeaseToken, Release, ReleaseOutcome};
use crate::registry::HandlerRegistry;
use crate::retry::{Classification, ErrorCode, JitterSource, RandomJitter, RetryPolicy, classify};
use crate::store::JobRecordStore;
use crate::types::{ErrorKind, Job, JobStatus, LastError};

/// How an attempt ended, as far as this executor is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Retrying { due_at: DateTime<Utc> },
    Failed { kind: ErrorKind },
    Cancelled,
    /// The lease was lost (or the job finished elsewhere); nothing was written.
    Abandoned,
}

enum Run {
    Returned(Result<(), HandlerError>),
    TimedOut,
    LeaseLost,
}

/// Executes claimed jobs with the registered handlers.
#[derive(Clone)]
pub struct Executor {
    leases: LeaseManager,
    checkpoints: CheckpointManager,
    registry: Arc<HandlerRegistry>,
    config: EngineConfig,
    jitter: Arc<dyn JitterSource>,
}

impl Executor {
    pub fn new(
        store: Arc<dyn JobRecordStore>,
        clock: Arc<dyn Clock>,
        registry: Arc<HandlerRegistry>,
        config: EngineConfig,
    ) -> Self {
        let leases = LeaseManager::new(store, clock);
        Self {
            checkpoints: CheckpointManager::from_leases(leases.clone()),
            leases,
            registry,
            config,
            jitter: Arc::new(RandomJitter),
        }
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    /// Attempt cap for a job: the job's own, else the handler's, else the
    /// engine default.
    pub fn max_attempts_for(&self, job: &Job, options: &HandlerOptions) -> u32 {
        job.max_attempts
            .or(options.max_attempts)
            .unwrap_or(self.config.retry.max_attempts)
    }

    /// Run `job` (as returned by a successful claim) under `token`.
    pub async fn execute(&self, job: Job, token: LeaseToken) -> ExecutionOutcome {
        let span = info_span!(
            "execute",
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = token.attempt
        );
        self.execute_inner(job, token).instrument(span).await
    }

    async fn execute_inner(&self, job: Job, token: LeaseToken) -> ExecutionOutcome {
        let now = self.leases.now();

        let Some(handler) = self.registry.get(job.job_type) else {
            error!("no handler registered for job type");
            let error = LastError::new(
                ErrorKind::Permanent,
                format!("no handler registered for job type {}", job.job_type),
                now,
            );
            return self.release(&token, Release::Failed(error)).await;
        };

        let options = handler.options();
        let max_attempts = self.max_attempts_for(&job, &options);

        if token.attempt > max_attempts {
            warn!(max_attempts, "attempt cap exceeded after lease expiry; failing without running");
            let error = LastError::new(
                ErrorKind::Timeout,
                format!(
                    "attempt {} exceeds cap of {max_attempts}; previous attempts lost their lease",
                    token.attempt
                ),
                now,
            );
            return self.release(&token, Release::Failed(error)).await;
        }

        let last = checkpoint_of(&job, |payload| handler.initial_checkpoint(payload));
        if !last.is_initial() {
            info!(seq = last.seq, "resuming from checkpoint");
        }

        let ctx = JobContext::new(ContextParts {
            token,
            leases: self.leases.clone(),
            checkpoints: self.checkpoints.clone(),
            lease_ttl: self.config.lease_ttl,
            deadline_margin: self.config.deadline_margin,
            seq: last.seq,
            cadence: options.checkpoint.unwrap_or(self.config.checkpoint),
        });

        let run = self.run_handler(handler.as_ref(), &ctx, &job, &last, &options).await;
        let token = ctx.token().await;
        let now = self.leases.now();

        let failure = match run {
            Run::Returned(Ok(())) if ctx.cancellation_observed() => {
                info!("handler returned after observing cancellation");
                return self.release(&token, Release::Cancelled).await;
            }
            Run::Returned(Ok(())) => {
                return self.release(&token, Release::Completed).await;
            }
            Run::LeaseLost => {
                warn!("lease lost while handler was running; abandoning attempt");
                return ExecutionOutcome::Abandoned;
            }
            Run::TimedOut => {
                warn!(deadline = %ctx.deadline(), "handler exceeded its deadline");
                HandlerError::new(
                    ErrorCode::DeadlineExceeded,
                    format!("deadline {} exceeded", ctx.deadline()),
                )
            }
            Run::Returned(Err(e)) => e,
        };

        if failure.code == ErrorCode::Cancelled || ctx.cancellation_observed() {
            return self.release(&token, Release::Cancelled).await;
        }
        if failure.code == ErrorCode::LeaseLost || ctx.lease_lost() {
            warn!(error = %failure, "handler stopped on lost lease; abandoning attempt");
            return ExecutionOutcome::Abandoned;
        }

        let classification = classify(&failure);
        let policy = RetryPolicy {
            max_attempts,
            ..self.config.retry
        };
        let error = LastError::new(classification.kind(), failure.message.clone(), now);

        match policy.next_due_at(token.attempt, &classification, now, self.jitter.as_ref()) {
            Some(due_at) => {
                warn!(
                    kind = %classification.kind(),
                    error = %failure,
                    %due_at,
                    "attempt failed; will retry"
                );
                self.release(&token, Release::Retry { due_at, error }).await
            }
            None => {
                let reason = match classification {
                    Classification::Permanent => "permanent error",
                    _ => "attempts exhausted",
                };
                warn!(
                    kind = %classification.kind(),
                    error = %failure,
                    max_attempts,
                    reason,
                    "attempt failed; not retrying"
                );
                self.release(&token, Release::Failed(error)).await
            }
        }
    }

    async fn run_handler(
        &self,
        handler: &dyn JobHandler,
        ctx: &JobContext,
        job: &Job,
        last: &crate::checkpoint::Checkpoint,
        options: &HandlerOptions,
    ) -> Run {
        let clock = self.leases.clock().clone();
        let started = clock.now();

        tokio::select! {
            result = handler.execute(ctx, &job.payload, last) => Run::Returned(result),
            _ = deadline_elapsed(ctx.deadline_watch(), clock.clone()) => Run::TimedOut,
            _ = heartbeat(ctx, clock, started, options.max_runtime, self.config.lease_ttl) => {
                Run::LeaseLost
            }
        }
    }

    async fn release(&self, token: &LeaseToken, release: Release) -> ExecutionOutcome {
        match self.leases.release(token, release).await {
            Ok(ReleaseOutcome::Applied(job)) => outcome_of(&job),
            Ok(ReleaseOutcome::AlreadyTerminal) | Ok(ReleaseOutcome::Dropped) => {
                ExecutionOutcome::Abandoned
            }
            Err(e) => {
                // The lease will lapse and the job will be reclaimed.
                error!(error = %e, "failed to release job");
                ExecutionOutcome::Abandoned
            }
        }
    }
}

fn outcome_of(job: &Job) -> ExecutionOutcome {
    match job.status {
        JobStatus::Completed => ExecutionOutcome::Completed,
        JobStatus::Failed => ExecutionOutcome::Failed {
            kind: job
                .last_error
                .as_ref()
                .map_or(ErrorKind::Permanent, |e| e.kind),
        },
        JobStatus::Queued => ExecutionOutcome::Retrying { due_at: job.due_at },
        JobStatus::Cancelled => ExecutionOutcome::Cancelled,
        JobStatus::Running => ExecutionOutcome::Abandoned,
    }
}

/// Resolves once the (moving) deadline has passed.
async fn deadline_elapsed(mut deadline: watch::Receiver<DateTime<Utc>>, clock: Arc<dyn Clock>) {
    loop {
        let at = *deadline.borrow_and_update();
        let remaining = (at - clock.now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = tokio::time::sleep(remaining) => return,
            changed = deadline.changed() => {
                if changed.is_err() {
                    tokio::time::sleep(remaining).await;
                    return;
                }
            }
        }
    }
}

/// Renews the lease every third of a TTL while `max_runtime` allows.
/// Resolves only if the lease is lost.
async fn heartbeat(
    ctx: &JobContext,
    clock: Arc<dyn Clock>,
    started: DateTime<Utc>,
    max_runtime: Option<Duration>,
    lease_ttl: Duration,
) {
    let Some(max_runtime) = max_runtime else {
        return std::future::pending().await;
    };
    let period = (lease_ttl / 3).max(Duration::from_millis(10));

    loop {
        tokio::time::sleep(period).await;
        let elapsed = (clock.now() - started).to_std().unwrap_or(Duration::ZERO);
        if elapsed >= max_runtime {
            // Stop renewing; the deadline will run out on its own.
            return std::future::pending().await;
        }
        match ctx.renew().await {
            Ok(()) => {}
            Err(e) if ctx.lease_lost() => {
                warn!(error = %e, "heartbeat lost the lease");
                return;
            }
            Err(e) => warn!(error = %e, "heartbeat renewal failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{Checkpoint, CheckpointPolicy};
    use crate::lease::ClaimOutcome;
    use crate::retry::FixedJitter;
    use crate::store::InMemoryJobStore;
    use crate::types::JobType;
    use agentjobs_core::{JobId, ManualClock, WorkerId};
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        clock: ManualClock,
        executor: Executor,
    }

    fn fixture(registry: HandlerRegistry) -> Fixture {
        agentjobs_observability::init_for_tests();
        let store = Arc::new(InMemoryJobStore::new());
        let clock = ManualClock::default();
        let config = EngineConfig {
            lease_ttl: Duration::from_secs(60),
            deadline_margin: Duration::from_secs(10),
            retry: RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 3),
            ..EngineConfig::default()
        };
        let executor =
            Executor::new(store.clone(), Arc::new(clock.clone()), Arc::new(registry), config)
                .with_jitter(Arc::new(FixedJitter::NONE));
        Fixture { store, clock, executor }
    }

    async fn claim(f: &Fixture, job: Job) -> (Job, LeaseToken) {
        let job = f.store.create(job).await.unwrap();
        match f
            .executor
            .leases()
            .claim(job.id, WorkerId::new(), f.executor.config().lease_ttl)
            .await
            .unwrap()
        {
            ClaimOutcome::Claimed { token, job } => (job, token),
            other => panic!("unexpected {other:?}"),
        }
    }

    fn new_job(f: &Fixture, job_type: JobType) -> Job {
        let now = f.clock.now();
        Job::new(job_type, json!({"items": 3}), now, now)
    }

    async fn stored(f: &Fixture, id: JobId) -> Job {
        f.store.get(id).await.unwrap().unwrap()
    }

    struct Fails(HandlerError);

    #[async_trait]
    impl JobHandler for Fails {
        async fn execute(
            &self,
            _: &JobContext,
            _: &Value,
            _: &Checkpoint,
        ) -> Result<(), HandlerError> {
            Err(self.0.clone())
        }
    }

    /// Checkpoints each item, starting after the last saved one.
    struct Steps {
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for Steps {
        fn options(&self) -> HandlerOptions {
            HandlerOptions::default()
                .with_checkpoint(CheckpointPolicy::new(1, Duration::from_secs(60)))
        }

        fn initial_checkpoint(&self, _payload: &Value) -> Value {
            json!({"done": 0})
        }

        async fn execute(
            &self,
            ctx: &JobContext,
            payload: &Value,
            last: &Checkpoint,
        ) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let total = payload["items"].as_u64().unwrap_or(0);
            let mut done = last.data["done"].as_u64().unwrap_or(0);
            while done < total {
                done += 1;
                if ctx.tick() {
                    ctx.checkpoint(json!({"done": done})).await?;
                }
            }
            Ok(())
        }
    }

    struct Hangs;

    #[async_trait]
    impl JobHandler for Hangs {
        async fn execute(
            &self,
            _: &JobContext,
            _: &Value,
            _: &Checkpoint,
        ) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn success_completes_and_clears_error() {
        let f = fixture(
            HandlerRegistry::builder()
                .register(JobType::Pipeline, Steps { calls: AtomicU32::new(0) })
                .build_partial()
                .unwrap(),
        );
        let mut job = new_job(&f, JobType::Pipeline);
        job.last_error = Some(LastError::new(ErrorKind::Transient, "earlier", f.clock.now()));
        let (job, token) = claim(&f, job).await;

        assert_eq!(f.executor.execute(job.clone(), token).await, ExecutionOutcome::Completed);

        let stored = stored(&f, job.id).await;
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.checkpoint_seq, 3);
        assert!(stored.last_error.is_none());
        assert!(stored.lease_owner.is_none());
    }

    #[tokio::test]
    async fn transient_error_requeues_with_backoff_from_attempt() {
        let f = fixture(
            HandlerRegistry::builder()
                .register(JobType::Digest, Fails(HandlerError::transient("upstream 503")))
                .build_partial()
                .unwrap(),
        );
        let (job, token) = claim(&f, new_job(&f, JobType::Digest)).await;
        let now = f.clock.now();

        let outcome = f.executor.execute(job.clone(), token).await;
        assert_eq!(
            outcome,
            ExecutionOutcome::Retrying {
                due_at: now + chrono::Duration::seconds(2)
            }
        );

        let stored = stored(&f, job.id).await;
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.attempt, 1);
        let last_error = stored.last_error.unwrap();
        assert_eq!(last_error.kind, ErrorKind::Transient);
        assert_eq!(last_error.message, "upstream 503");
    }

    #[tokio::test]
    async fn permanent_error_fails_immediately() {
        let f = fixture(
            HandlerRegistry::builder()
                .register(JobType::Digest, Fails(HandlerError::invalid_input("no recipients")))
                .build_partial()
                .unwrap(),
        );
        let (job, token) = claim(&f, new_job(&f, JobType::Digest)).await;

        assert_eq!(
            f.executor.execute(job.clone(), token).await,
            ExecutionOutcome::Failed {
                kind: ErrorKind::Permanent
            }
        );
        assert_eq!(stored(&f, job.id).await.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn unknown_job_type_is_a_permanent_failure() {
        let f = fixture(
            HandlerRegistry::builder()
                .register(JobType::Digest, Fails(HandlerError::transient("unused")))
                .build_partial()
                .unwrap(),
        );
        let (job, token) = claim(&f, new_job(&f, JobType::Analysis)).await;

        assert_eq!(
            f.executor.execute(job.clone(), token).await,
            ExecutionOutcome::Failed {
                kind: ErrorKind::Permanent
            }
        );
        let stored = stored(&f, job.id).await;
        assert!(stored.last_error.unwrap().message.contains("analysis"));
    }

    #[tokio::test]
    async fn per_job_attempt_cap_wins_over_defaults() {
        let f = fixture(
            HandlerRegistry::builder()
                .register(JobType::Digest, Fails(HandlerError::transient("blip")))
                .build_partial()
                .unwrap(),
        );
        let (job, token) = claim(&f, new_job(&f, JobType::Digest).with_max_attempts(1)).await;

        assert_eq!(
            f.executor.execute(job, token).await,
            ExecutionOutcome::Failed {
                kind: ErrorKind::Transient
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hung_handler_times_out_and_is_retried() {
        let f = fixture(
            HandlerRegistry::builder()
                .register(JobType::Analysis, Hangs)
                .build_partial()
                .unwrap(),
        );
        let (job, token) = claim(&f, new_job(&f, JobType::Analysis)).await;

        let outcome = f.executor.execute(job.clone(), token).await;
        assert!(matches!(outcome, ExecutionOutcome::Retrying { .. }));
        assert_eq!(
            stored(&f, job.id).await.last_error.unwrap().kind,
            ErrorKind::Timeout
        );
    }

    #[tokio::test]
    async fn crash_looping_job_fails_without_running_handler() {
        let steps = Arc::new(Steps { calls: AtomicU32::new(0) });
        let f = fixture(
            HandlerRegistry::builder()
                .register_arc(JobType::Pipeline, steps.clone())
                .build_partial()
                .unwrap(),
        );
        let mut job = new_job(&f, JobType::Pipeline);
        job.attempt = 3;
        let (job, token) = claim(&f, job).await;
        assert_eq!(token.attempt, 4);

        assert_eq!(
            f.executor.execute(job, token).await,
            ExecutionOutcome::Failed {
                kind: ErrorKind::Timeout
            }
        );
        assert_eq!(steps.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn handler_stopping_on_cancellation_cancels_job() {
        struct Cooperative;

        #[async_trait]
        impl JobHandler for Cooperative {
            async fn execute(
                &self,
                ctx: &JobContext,
                _: &Value,
                _: &Checkpoint,
            ) -> Result<(), HandlerError> {
                ctx.checkpoint(json!({"step": 1})).await?;
                Ok(())
            }
        }

        let f = fixture(
            HandlerRegistry::builder()
                .register(JobType::Digest, Cooperative)
                .build_partial()
                .unwrap(),
        );
        let (job, token) = claim(&f, new_job(&f, JobType::Digest)).await;

        let mut flagged = stored(&f, job.id).await;
        flagged.cancel_requested = true;
        f.store
            .conditional_update(job.id, flagged.version, flagged)
            .await
            .unwrap();

        assert_eq!(f.executor.execute(job.clone(), token).await, ExecutionOutcome::Cancelled);
        assert_eq!(stored(&f, job.id).await.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn handler_returning_ok_after_seeing_cancellation_is_not_completed() {
        struct StopsQuietly;

        #[async_trait]
        impl JobHandler for StopsQuietly {
            async fn execute(
                &self,
                ctx: &JobContext,
                _: &Value,
                _: &Checkpoint,
            ) -> Result<(), HandlerError> {
                if ctx.is_cancelled().await? {
                    return Ok(());
                }
                ctx.checkpoint(json!({"step": 1})).await?;
                Ok(())
            }
        }

        let f = fixture(
            HandlerRegistry::builder()
                .register(JobType::Analysis, StopsQuietly)
                .build_partial()
                .unwrap(),
        );
        let (job, token) = claim(&f, new_job(&f, JobType::Analysis)).await;

        let mut flagged = stored(&f, job.id).await;
        flagged.cancel_requested = true;
        f.store
            .conditional_update(job.id, flagged.version, flagged)
            .await
            .unwrap();

        assert_eq!(f.executor.execute(job.clone(), token).await, ExecutionOutcome::Cancelled);
        let stored = stored(&f, job.id).await;
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert!(stored.lease_owner.is_none());
    }

    #[tokio::test]
    async fn handler_swallowing_checkpoint_cancellation_is_not_completed() {
        struct IgnoresError;

        #[async_trait]
        impl JobHandler for IgnoresError {
            async fn execute(
                &self,
                ctx: &JobContext,
                _: &Value,
                _: &Checkpoint,
            ) -> Result<(), HandlerError> {
                let _ = ctx.checkpoint(json!({"step": 1})).await;
                Ok(())
            }
        }

        let f = fixture(
            HandlerRegistry::builder()
                .register(JobType::Digest, IgnoresError)
                .build_partial()
                .unwrap(),
        );
        let (job, token) = claim(&f, new_job(&f, JobType::Digest)).await;

        let mut flagged = stored(&f, job.id).await;
        flagged.cancel_requested = true;
        f.store
            .conditional_update(job.id, flagged.version, flagged)
            .await
            .unwrap();

        assert_eq!(f.executor.execute(job.clone(), token).await, ExecutionOutcome::Cancelled);
        assert_eq!(stored(&f, job.id).await.status, JobStatus::Cancelled);
    }
}
