//! Finds due jobs, claims them, and runs them on a bounded pool.
//!
//! Stateless between invocations: any number of dispatchers (in this process
//! or others) may run `dispatch_once` concurrently against the same store.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Semaphore, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, instrument};

use agentjobs_core::Clock;

use crate::config::EngineConfig;
use crate::executor::Executor;
use crate::lease::ClaimOutcome;
use crate::registry::HandlerRegistry;
use crate::retry::JitterSource;
use crate::store::{JobRecordStore, StoreError};

/// What one trigger invocation did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Candidates returned by `list_due`
    pub scanned: usize,
    /// Claimed and handed to the pool
    pub claimed: usize,
    /// Another dispatcher's claim landed first
    pub lost_race: usize,
    /// No longer due or claimable by the time we looked
    pub not_eligible: usize,
    /// Expired leases whose pending cancellation was applied
    pub cancelled: usize,
    /// Left for the next trigger because the pool was full
    pub deferred: usize,
    /// Claims that failed on a store error
    pub errors: usize,
}

/// Dispatcher value; cheap to clone, clones share the pool.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn JobRecordStore>,
    executor: Executor,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobRecordStore>,
        clock: Arc<dyn Clock>,
        registry: Arc<HandlerRegistry>,
        config: EngineConfig,
    ) -> Self {
        let executor = Executor::new(store.clone(), clock, registry, config);
        Self::from_executor(store, executor)
    }

    pub fn from_executor(store: Arc<dyn JobRecordStore>, executor: Executor) -> Self {
        let permits = Arc::new(Semaphore::new(executor.config().max_concurrent));
        Self {
            store,
            executor,
            permits,
        }
    }

    pub fn with_jitter(self, jitter: Arc<dyn JitterSource>) -> Self {
        let executor = self.executor.with_jitter(jitter);
        Self { executor, ..self }
    }

    pub fn config(&self) -> &EngineConfig {
        self.executor.config()
    }

    /// Executions currently running on this dispatcher's pool.
    pub fn in_flight(&self) -> usize {
        self.config().max_concurrent - self.permits.available_permits()
    }

    /// One trigger invocation: scan, claim, hand off. Does not wait for the
    /// executions it started.
    #[instrument(skip(self), fields(worker_id = %self.config().worker_id))]
    pub async fn dispatch_once(&self) -> Result<DispatchReport, StoreError> {
        let config = self.config();
        let leases = self.executor.leases();
        let candidates = self.store.list_due(leases.now(), config.batch_size).await?;

        let mut report = DispatchReport {
            scanned: candidates.len(),
            ..DispatchReport::default()
        };

        for (index, candidate) in candidates.iter().enumerate() {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                report.deferred = candidates.len() - index;
                debug!(deferred = report.deferred, "pool full; deferring remaining candidates");
                break;
            };

            match leases.claim(candidate.id, config.worker_id, config.lease_ttl).await {
                Ok(ClaimOutcome::Claimed { token, job }) => {
                    report.claimed += 1;
                    let executor = self.executor.clone();
                    let span = info_span!("execution", job_id = %job.id);
                    tokio::spawn(
                        async move {
                            let outcome = executor.execute(job, token).await;
                            debug!(?outcome, "execution finished");
                            drop(permit);
                        }
                        .instrument(span),
                    );
                }
                Ok(ClaimOutcome::AlreadyClaimed) => report.lost_race += 1,
                Ok(ClaimOutcome::NotEligible(_)) => report.not_eligible += 1,
                Ok(ClaimOutcome::Cancelled(_)) => report.cancelled += 1,
                Err(e) => {
                    error!(job_id = %candidate.id, error = %e, "claim failed");
                    report.errors += 1;
                }
            }
        }

        if report.claimed > 0 || report.errors > 0 {
            info!(?report, "dispatch cycle finished");
        } else {
            debug!(?report, "dispatch cycle finished");
        }
        Ok(report)
    }

    /// Wait until no execution started by this dispatcher is running.
    pub async fn wait_idle(&self) {
        let all = self.config().max_concurrent as u32;
        // Closed only if we close it, which never happens.
        if let Ok(permits) = self.permits.acquire_many(all).await {
            drop(permits);
        }
    }

    /// `dispatch_once`, then wait for the started executions to finish.
    pub async fn dispatch_and_wait(&self) -> Result<DispatchReport, StoreError> {
        let report = self.dispatch_once().await?;
        self.wait_idle().await;
        Ok(report)
    }

    /// Run the trigger in-process every `interval`.
    ///
    /// A slow cycle does not hold back the next one: each tick spawns its own
    /// invocation, exactly like overlapping external triggers would.
    pub fn spawn_periodic(self, interval: Duration) -> DispatcherHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let dispatcher = self.clone();

        let join = tokio::spawn(async move {
            info!(
                interval = ?interval,
                worker_id = %dispatcher.config().worker_id,
                "dispatcher started"
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut cycles = JoinSet::new();

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        while cycles.try_join_next().is_some() {}
                        let d = dispatcher.clone();
                        cycles.spawn(async move {
                            if let Err(e) = d.dispatch_once().await {
                                error!(error = %e, "dispatch cycle failed");
                            }
                        });
                    }
                }
            }

            while cycles.join_next().await.is_some() {}
            dispatcher.wait_idle().await;
            info!("dispatcher stopped");
        });

        DispatcherHandle {
            shutdown: Some(shutdown_tx),
            join,
        }
    }
}

/// Handle to a periodic dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Stop triggering and wait for running executions to drain.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.join).await {
            error!(error = %e, "dispatcher task ended abnormally");
        }
    }
}
