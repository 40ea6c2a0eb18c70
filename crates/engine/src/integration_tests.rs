//! Cross-component scenarios: submission → dispatcher → executor → store.
//!
//! Verifies:
//! - At most one claim succeeds per job, however many runners race
//! - Retryable failures back off and stop at the attempt cap
//! - A reclaimed job resumes from its last durable checkpoint
//! - Terminal states are write-once
//! - Timeouts and cooperative cancellation

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use proptest::prelude::*;
    use serde_json::{Value, json};
    use tokio::sync::{Notify, Semaphore};

    use agentjobs_core::{Clock, JobId, ManualClock, WorkerId};

    use crate::checkpoint::{Checkpoint, CheckpointManager, CheckpointPolicy};
    use crate::config::EngineConfig;
    use crate::context::{ContextParts, JobContext};
    use crate::dispatcher::Dispatcher;
    use crate::handler::{HandlerError, HandlerOptions, JobHandler};
    use crate::lease::{ClaimOutcome, LeaseManager, Release, ReleaseOutcome};
    use crate::registry::HandlerRegistry;
    use crate::retry::FixedJitter;
    use crate::store::{InMemoryJobStore, JobRecordStore};
    use crate::submission::{CancelOutcome, JobService, SubmitOptions};
    use crate::types::{ErrorKind, Job, JobStatus, JobType};

    const TTL: Duration = Duration::from_secs(60);

    struct Engine {
        store: Arc<InMemoryJobStore>,
        clock: ManualClock,
        service: JobService,
    }

    impl Engine {
        fn new() -> Self {
            agentjobs_observability::init_for_tests();
            let store = Arc::new(InMemoryJobStore::new());
            let clock = ManualClock::default();
            let service = JobService::new(store.clone(), Arc::new(clock.clone()));
            Self { store, clock, service }
        }

        fn config(&self) -> EngineConfig {
            let mut config = EngineConfig {
                lease_ttl: TTL,
                deadline_margin: Duration::from_secs(10),
                ..EngineConfig::default()
            };
            config.retry.base_delay = Duration::from_secs(1);
            config.retry.max_delay = Duration::from_secs(60);
            config
        }

        /// A dispatcher with its own worker identity, as another process would have.
        fn dispatcher(&self, registry: HandlerRegistry) -> Dispatcher {
            Dispatcher::new(
                self.store.clone(),
                Arc::new(self.clock.clone()),
                Arc::new(registry),
                self.config(),
            )
            .with_jitter(Arc::new(FixedJitter::NONE))
        }

        fn leases(&self) -> LeaseManager {
            LeaseManager::new(self.store.clone(), Arc::new(self.clock.clone()))
        }

        async fn job(&self, id: JobId) -> Job {
            self.store.get(id).await.unwrap().unwrap()
        }
    }

    fn only(job_type: JobType, handler: Arc<dyn JobHandler>) -> HandlerRegistry {
        HandlerRegistry::builder()
            .register_arc(job_type, handler)
            .build_partial()
            .unwrap()
    }

    struct AlwaysTransient {
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for AlwaysTransient {
        async fn execute(
            &self,
            _: &JobContext,
            _: &Value,
            _: &Checkpoint,
        ) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::transient("dependency unavailable"))
        }
    }

    /// Records the checkpoint each invocation starts from.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Checkpoint>>,
    }

    #[async_trait]
    impl JobHandler for Recorder {
        async fn execute(
            &self,
            _: &JobContext,
            _: &Value,
            last: &Checkpoint,
        ) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(last.clone());
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scenario_transient_failures_exhaust_attempts() {
        let engine = Engine::new();
        let handler = Arc::new(AlwaysTransient {
            calls: AtomicU32::new(0),
        });
        let dispatcher = engine.dispatcher(only(JobType::Digest, handler.clone()));
        let id = engine
            .service
            .submit(JobType::Digest, json!({}), SubmitOptions::default().max_attempts(3))
            .await
            .unwrap();

        // Attempt 1: re-queued at now + base * 2^1.
        let start = engine.clock.now();
        dispatcher.dispatch_and_wait().await.unwrap();
        let job = engine.job(id).await;
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt, 1);
        assert_eq!(job.due_at, start + chrono::Duration::seconds(2));
        assert_eq!(job.last_error.as_ref().unwrap().kind, ErrorKind::Transient);

        // Not due yet: nothing happens.
        assert_eq!(dispatcher.dispatch_and_wait().await.unwrap().claimed, 0);

        // Attempt 2: re-queued at now + base * 2^2.
        engine.clock.advance(chrono::Duration::seconds(2));
        let second = engine.clock.now();
        dispatcher.dispatch_and_wait().await.unwrap();
        let job = engine.job(id).await;
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt, 2);
        assert_eq!(job.due_at, second + chrono::Duration::seconds(4));

        // Attempt 3 hits the cap even though Transient alone would retry.
        engine.clock.advance(chrono::Duration::seconds(4));
        dispatcher.dispatch_and_wait().await.unwrap();
        let job = engine.job(id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt, 3);
        assert_eq!(job.last_error.unwrap().kind, ErrorKind::Transient);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        // Failed jobs are never picked up again.
        engine.clock.advance(chrono::Duration::days(1));
        assert_eq!(dispatcher.dispatch_and_wait().await.unwrap().scanned, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scenario_reclaimed_job_resumes_from_checkpoint() {
        let engine = Engine::new();
        let id = engine
            .service
            .submit(JobType::Pipeline, json!({"stages": 8}), SubmitOptions::default())
            .await
            .unwrap();

        // First runner claims and checkpoints up to seq 3, then dies without
        // renewing or releasing.
        let leases = engine.leases();
        let token = match leases.claim(id, WorkerId::new(), TTL).await.unwrap() {
            ClaimOutcome::Claimed { token, .. } => token,
            other => panic!("unexpected {other:?}"),
        };
        let ctx = JobContext::new(ContextParts {
            token,
            checkpoints: CheckpointManager::from_leases(leases.clone()),
            leases,
            lease_ttl: TTL,
            deadline_margin: Duration::from_secs(10),
            seq: 0,
            cadence: CheckpointPolicy::default(),
        });
        for step in [1, 3, 5] {
            ctx.checkpoint(json!({"step": step})).await.unwrap();
        }
        drop(ctx);

        // Lease lapses; a second dispatcher picks the job up.
        engine.clock.advance(chrono::Duration::seconds(61));
        let recorder = Arc::new(Recorder::default());
        let report = engine
            .dispatcher(only(JobType::Pipeline, recorder.clone()))
            .dispatch_and_wait()
            .await
            .unwrap();
        assert_eq!(report.claimed, 1);

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![Checkpoint {
                seq: 3,
                data: json!({"step": 5})
            }]
        );
        let job = engine.job(id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempt, 2);
        assert_eq!(job.checkpoint_seq, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn terminal_states_are_write_once() {
        let engine = Engine::new();
        let id = engine
            .service
            .submit(JobType::Analysis, json!({}), SubmitOptions::default())
            .await
            .unwrap();
        let leases = engine.leases();
        let token = match leases.claim(id, WorkerId::new(), TTL).await.unwrap() {
            ClaimOutcome::Claimed { token, .. } => token,
            other => panic!("unexpected {other:?}"),
        };

        assert!(matches!(
            leases.release(&token, Release::Completed).await.unwrap(),
            ReleaseOutcome::Applied(_)
        ));
        let completed = engine.job(id).await;

        for release in [Release::Completed, Release::Cancelled] {
            assert!(matches!(
                leases.release(&token, release).await.unwrap(),
                ReleaseOutcome::AlreadyTerminal
            ));
        }
        assert_eq!(engine.service.cancel(id).await.unwrap(), CancelOutcome::AlreadyTerminal);
        engine.clock.advance(chrono::Duration::days(1));
        assert!(matches!(
            leases.claim(id, WorkerId::new(), TTL).await.unwrap(),
            ClaimOutcome::NotEligible(JobStatus::Completed)
        ));

        assert_eq!(engine.job(id).await, completed);
    }

    /// Checkpoints once; on the first attempt it then hangs past its deadline.
    #[derive(Default)]
    struct HangsOnce {
        seen: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl JobHandler for HangsOnce {
        async fn execute(
            &self,
            ctx: &JobContext,
            _: &Value,
            last: &Checkpoint,
        ) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(last.seq);
            if last.is_initial() {
                ctx.checkpoint(json!({"fetched": true})).await?;
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_attempt_retries_and_resumes() {
        let engine = Engine::new();
        let handler = Arc::new(HangsOnce::default());
        let dispatcher = engine.dispatcher(only(JobType::Analysis, handler.clone()));
        let id = engine
            .service
            .submit(JobType::Analysis, json!({}), SubmitOptions::default())
            .await
            .unwrap();

        dispatcher.dispatch_and_wait().await.unwrap();
        let job = engine.job(id).await;
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.last_error.as_ref().unwrap().kind, ErrorKind::Timeout);
        assert_eq!(job.checkpoint_seq, 1);

        engine.clock.set(job.due_at);
        dispatcher.dispatch_and_wait().await.unwrap();
        let job = engine.job(id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(*handler.seen.lock().unwrap(), vec![0, 1]);
    }

    /// A single step longer than one lease TTL, kept alive by heartbeat.
    struct LongStep;

    #[async_trait]
    impl JobHandler for LongStep {
        fn options(&self) -> HandlerOptions {
            HandlerOptions::default().with_max_runtime(Duration::from_secs(600))
        }

        async fn execute(
            &self,
            _: &JobContext,
            _: &Value,
            _: &Checkpoint,
        ) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_secs(90)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_keeps_long_step_alive() {
        let engine = Engine::new();
        let dispatcher = engine.dispatcher(only(JobType::Pipeline, Arc::new(LongStep)));
        let id = engine
            .service
            .submit(JobType::Pipeline, json!({}), SubmitOptions::default())
            .await
            .unwrap();

        dispatcher.dispatch_and_wait().await.unwrap();
        let job = engine.job(id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.last_error.is_none());
    }

    /// Checkpoints, waits to be let go, then checkpoints again.
    struct Cooperative {
        started: Notify,
        go: Semaphore,
    }

    #[async_trait]
    impl JobHandler for Cooperative {
        async fn execute(
            &self,
            ctx: &JobContext,
            _: &Value,
            _: &Checkpoint,
        ) -> Result<(), HandlerError> {
            ctx.checkpoint(json!({"step": 1})).await?;
            self.started.notify_one();
            let _ = self.go.acquire().await;
            if ctx.is_cancelled().await? {
                return Err(HandlerError::from(crate::context::ContextError::Cancelled));
            }
            ctx.checkpoint(json!({"step": 2})).await?;
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn running_job_honors_cancellation_at_next_boundary() {
        let engine = Engine::new();
        let handler = Arc::new(Cooperative {
            started: Notify::new(),
            go: Semaphore::new(0),
        });
        let dispatcher = engine.dispatcher(only(JobType::Pipeline, handler.clone()));
        let id = engine
            .service
            .submit(JobType::Pipeline, json!({}), SubmitOptions::default())
            .await
            .unwrap();

        assert_eq!(dispatcher.dispatch_once().await.unwrap().claimed, 1);
        handler.started.notified().await;

        assert_eq!(engine.service.cancel(id).await.unwrap(), CancelOutcome::Requested);
        handler.go.add_permits(1);
        dispatcher.wait_idle().await;

        let job = engine.job(id).await;
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.checkpoint_seq, 1);
        assert!(job.lease_owner.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reclaim_race_after_expiry_has_one_winner() {
        let engine = Engine::new();
        let id = engine
            .service
            .submit(JobType::Digest, json!({}), SubmitOptions::default())
            .await
            .unwrap();
        let leases = engine.leases();
        leases.claim(id, WorkerId::new(), TTL).await.unwrap();
        engine.clock.advance(chrono::Duration::seconds(61));

        let winners = race_claims(&leases, id, 16).await;
        assert_eq!(winners, 1);
        assert_eq!(engine.job(id).await.attempt, 2);
    }

    async fn race_claims(leases: &LeaseManager, id: JobId, n: usize) -> usize {
        let mut handles = Vec::with_capacity(n);
        for _ in 0..n {
            let leases = leases.clone();
            handles.push(tokio::spawn(async move {
                leases.claim(id, WorkerId::new(), TTL).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                ClaimOutcome::Claimed { .. } => winners += 1,
                ClaimOutcome::AlreadyClaimed | ClaimOutcome::NotEligible(_) => {}
                ClaimOutcome::Cancelled(job) => panic!("unexpected cancellation of {}", job.id),
            }
        }
        winners
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn concurrent_claims_have_exactly_one_winner(n in 2usize..24) {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap();

            let (winners, attempt) = rt.block_on(async {
                let store = Arc::new(InMemoryJobStore::new());
                let clock = ManualClock::default();
                let now = clock.now();
                let job = store
                    .create(Job::new(JobType::Digest, json!({}), now, now))
                    .await
                    .unwrap();
                let leases = LeaseManager::new(store.clone(), Arc::new(clock));
                let winners = race_claims(&leases, job.id, n).await;
                let attempt = store.get(job.id).await.unwrap().unwrap().attempt;
                (winners, attempt)
            });

            prop_assert_eq!(winners, 1);
            prop_assert_eq!(attempt, 1);
        }
    }
}
