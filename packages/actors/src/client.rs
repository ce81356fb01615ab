//! Job client: enqueue, perform and requeue.
//!
//! The client owns no queue state itself. It resolves the queue a job
//! belongs to, builds the hook pipeline of the job's worker and hands the
//! envelope to a [`QueueEngine`].

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use coord_core::{
    Clock, CoordEvent, CoordinationConfig, DEFAULT_QUEUE, DelayedJobPayload, Envelope,
    FULL_QUEUE_KEY, JobError, JobId, JobOptions, KvStore, LockKind, LockManager, QueueRegistry,
    RUN_AT_KEY, naming,
};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::delay::DELAY_EXECUTION_WORKER;
use crate::engine::QueueEngine;
use crate::error::ClientError;
use crate::handler::{Completion, JobHandler, JobHandlerRegistry, WorkerConfig};
use crate::hooks::{
    EnqueueContext, EnqueueVerdict, HookPipeline, JobHook, JobState, PerformContext, PerformHalt,
    PipelineOutcome, RetryPlan,
};
use crate::locks::{QueueLockHook, WorkerLockHook};
use crate::retry::{QueueMemoHook, QueueMemoResetHook, RetryHook};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Result of an enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued {
        job_id: JobId,
        queue: String,
        run_at: Option<i64>,
    },
    /// A before-enqueue hook refused the job. Nothing was stored.
    Vetoed { hook: String },
}

impl EnqueueOutcome {
    pub fn is_enqueued(&self) -> bool {
        matches!(self, EnqueueOutcome::Enqueued { .. })
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            EnqueueOutcome::Enqueued { job_id, .. } => Some(*job_id),
            EnqueueOutcome::Vetoed { .. } => None,
        }
    }
}

/// Result of one perform.
#[derive(Debug, Clone)]
pub enum PerformOutcome {
    Completed,
    Skipped {
        reason: String,
    },
    /// Put back on `queue` without running.
    Requeued {
        queue: String,
        run_at: i64,
        lock: Option<LockKind>,
    },
    Failed {
        error: JobError,
        retry: Option<RetryPlan>,
    },
}

impl PerformOutcome {
    pub fn state(&self) -> JobState {
        match self {
            PerformOutcome::Completed => JobState::Completed,
            PerformOutcome::Skipped { .. } => JobState::Skipped,
            PerformOutcome::Requeued { .. } => JobState::Requeued,
            PerformOutcome::Failed { .. } => JobState::Failed,
        }
    }
}

/// Enqueues jobs and performs them through their worker's hooks.
pub struct JobClient<S, E> {
    engine: Arc<E>,
    locks: LockManager<S>,
    handlers: Arc<JobHandlerRegistry>,
    config: CoordinationConfig,
    hooks: Vec<Arc<dyn JobHook>>,
    events: broadcast::Sender<CoordEvent>,
}

impl<S, E> Clone for JobClient<S, E> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            locks: self.locks.clone(),
            handlers: self.handlers.clone(),
            config: self.config.clone(),
            hooks: self.hooks.clone(),
            events: self.events.clone(),
        }
    }
}

impl<S: KvStore, E: QueueEngine> JobClient<S, E> {
    pub fn new(
        engine: Arc<E>,
        locks: LockManager<S>,
        handlers: Arc<JobHandlerRegistry>,
        config: CoordinationConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            engine,
            locks,
            handlers,
            config,
            hooks: Vec::new(),
            events,
        }
    }

    /// Add a hook to every worker's pipeline.
    pub fn with_hook(mut self, hook: Arc<dyn JobHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> &broadcast::Sender<CoordEvent> {
        &self.events
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn locks(&self) -> &LockManager<S> {
        &self.locks
    }

    pub fn handlers(&self) -> &Arc<JobHandlerRegistry> {
        &self.handlers
    }

    pub fn queues(&self) -> &Arc<QueueRegistry> {
        self.handlers.queues()
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        self.locks.clock()
    }

    fn handler(&self, worker: &str) -> Result<Arc<dyn JobHandler>, ClientError> {
        self.handlers
            .get(worker)
            .ok_or_else(|| ClientError::UnknownWorker(worker.to_string()))
    }

    /// Hooks applying to jobs of `config`'s worker.
    pub fn pipeline_for(&self, config: &WorkerConfig) -> HookPipeline {
        let mut hooks: Vec<Arc<dyn JobHook>> =
            vec![Arc::new(QueueMemoHook), Arc::new(QueueMemoResetHook)];

        if let Some(strategy) = config.lock_strategy(LockKind::Queue) {
            hooks.push(Arc::new(QueueLockHook::new(
                strategy,
                self.locks.clone(),
                config
                    .queue_lock_ttl_secs
                    .unwrap_or(self.config.queue_lock_ttl_secs),
            )));
        }
        if let Some(strategy) = config.lock_strategy(LockKind::Worker) {
            hooks.push(Arc::new(WorkerLockHook::new(
                strategy,
                self.locks.clone(),
                config
                    .worker_lock_ttl_secs
                    .unwrap_or(self.config.worker_lock_ttl_secs),
                config
                    .requeue_delay_secs
                    .unwrap_or(self.config.requeue_delay_secs),
            )));
        }
        if config.retry.is_enabled() {
            hooks.push(Arc::new(RetryHook::new(
                config.retry.clone(),
                config.queue_name(),
            )));
        }

        hooks.extend(self.hooks.iter().cloned());
        HookPipeline::new(hooks)
    }

    /// Enqueue a job for `worker`.
    ///
    /// The queue is taken from `full_queue`, then `queue`/`queue_namespace`
    /// (missing parts default to the app key and `default`), then the
    /// worker's own queue, and written back into `full_queue`. A
    /// `run_at` option schedules the job instead of pushing it.
    pub async fn enqueue(&self, worker: &str, mut options: JobOptions) -> Result<EnqueueOutcome, ClientError> {
        let handler = self.handler(worker)?;
        let config = handler.config();

        let run_at = options.remove(RUN_AT_KEY).and_then(|v| v.as_i64());
        let queue = resolve_queue(config, &options);
        if !self.config.skip_queue_check && !self.queues().contains(&queue) {
            tracing::error!("QUEUE_ERROR ({}): {} will not be worked!", worker, queue);
        }
        options.insert(FULL_QUEUE_KEY.to_string(), Value::String(queue.clone()));

        let envelope = Envelope::new(worker, options);
        self.submit(config, queue, envelope, run_at).await
    }

    /// Enqueue a deferred method call.
    pub async fn enqueue_delayed(&self, payload: &DelayedJobPayload) -> Result<EnqueueOutcome, ClientError> {
        // A scheduled payload carries `run_at`, which `enqueue` routes.
        self.enqueue(DELAY_EXECUTION_WORKER, payload.to_options()?)
            .await
    }

    /// Run before-enqueue hooks, then store the envelope on `queue`.
    async fn submit(
        &self,
        config: &WorkerConfig,
        queue: String,
        envelope: Envelope,
        run_at: Option<i64>,
    ) -> Result<EnqueueOutcome, ClientError> {
        let ctx = EnqueueContext {
            worker: envelope.worker.clone(),
            queue,
            options: envelope.options.clone(),
            run_at,
        };

        if let EnqueueVerdict::Veto { hook } = self.pipeline_for(config).before_enqueue(&ctx).await? {
            self.emit(CoordEvent::EnqueueVetoed {
                worker: ctx.worker,
                queue: ctx.queue,
                hook: hook.clone(),
                timestamp: Utc::now(),
            });
            return Ok(EnqueueOutcome::Vetoed { hook });
        }

        let queue = ctx.queue;
        let job_id = envelope.id;
        let worker = envelope.worker.clone();

        match run_at {
            Some(ts) => self.engine.enqueue_at(&queue, ts, envelope).await?,
            None => self.engine.push(&queue, envelope).await?,
        }

        tracing::debug!(%job_id, %worker, %queue, ?run_at, "job enqueued");
        self.emit(CoordEvent::JobEnqueued {
            job_id,
            worker,
            queue: queue.clone(),
            run_at,
            timestamp: Utc::now(),
        });
        Ok(EnqueueOutcome::Enqueued {
            job_id,
            queue,
            run_at,
        })
    }

    /// Perform one dequeued job through its worker's hooks.
    ///
    /// Requeue and retry plans produced by the hooks are applied before
    /// returning. A failing job is not an error of this call.
    pub async fn perform(&self, envelope: Envelope) -> Result<PerformOutcome, ClientError> {
        let handler = self.handler(&envelope.worker)?;
        let pipeline = self.pipeline_for(handler.config());
        let job_id = envelope.id;
        let worker = envelope.worker.clone();

        self.emit(CoordEvent::JobStarted {
            job_id,
            worker: worker.clone(),
            timestamp: Utc::now(),
        });

        let started = Instant::now();
        let mut ctx = PerformContext::new(envelope, self.clock().now());
        let outcome = pipeline
            .perform(&mut ctx, |options| handler.perform(options))
            .await;

        match outcome {
            PipelineOutcome::Completed(Completion::Performed) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                tracing::info!(%job_id, %worker, duration_ms, "job completed");
                self.emit(CoordEvent::JobCompleted {
                    job_id,
                    worker,
                    duration_ms,
                    timestamp: Utc::now(),
                });
                Ok(PerformOutcome::Completed)
            }
            PipelineOutcome::Completed(Completion::Skipped { reason })
            | PipelineOutcome::Halted(PerformHalt::Skip { reason }) => {
                Ok(self.skipped(job_id, worker, reason))
            }
            PipelineOutcome::Halted(PerformHalt::Requeue { run_at, lock }) => {
                self.requeue_with(handler.config(), ctx.envelope, run_at, lock)
                    .await
            }
            PipelineOutcome::Failed(error) => {
                let retry = ctx.retry.take();
                tracing::error!(%job_id, %worker, attempt = ctx.envelope.attempt, "job failed: {}", error);
                self.emit(CoordEvent::JobFailed {
                    job_id,
                    worker,
                    error: error.to_string(),
                    attempt: ctx.envelope.attempt,
                    will_retry: retry.is_some(),
                    timestamp: Utc::now(),
                });
                if let Some(plan) = &retry {
                    self.retry(ctx.envelope, plan).await?;
                }
                Ok(PerformOutcome::Failed { error, retry })
            }
        }
    }

    /// Put a job back on the queue it came from, due at `run_at`.
    ///
    /// Only the due time changes; `full_queue` and the rest of the options
    /// are kept. Before-enqueue hooks run again, so a requeue can be vetoed.
    pub async fn requeue(&self, envelope: Envelope, run_at: i64) -> Result<PerformOutcome, ClientError> {
        let handler = self.handler(&envelope.worker)?;
        self.requeue_with(handler.config(), envelope, run_at, None)
            .await
    }

    async fn requeue_with(
        &self,
        config: &WorkerConfig,
        mut envelope: Envelope,
        run_at: i64,
        lock: Option<LockKind>,
    ) -> Result<PerformOutcome, ClientError> {
        let queue = envelope
            .full_queue()
            .map(str::to_string)
            .unwrap_or_else(|| config.queue_name());
        envelope
            .options
            .insert(FULL_QUEUE_KEY.to_string(), Value::String(queue.clone()));
        let job_id = envelope.id;
        let worker = envelope.worker.clone();

        match self
            .submit(config, queue.clone(), envelope, Some(run_at))
            .await?
        {
            EnqueueOutcome::Enqueued { .. } => {
                tracing::info!(%job_id, %worker, %queue, run_at, ?lock, "job requeued");
                self.emit(CoordEvent::JobRequeued {
                    job_id,
                    worker,
                    queue: queue.clone(),
                    run_at: Some(run_at),
                    lock,
                    timestamp: Utc::now(),
                });
                Ok(PerformOutcome::Requeued { queue, run_at, lock })
            }
            EnqueueOutcome::Vetoed { hook } => {
                Ok(self.skipped(job_id, worker, format!("requeue vetoed by {hook}")))
            }
        }
    }

    /// Schedule the next attempt of a failed job. Enqueue hooks are not
    /// consulted: the job already passed them once.
    async fn retry(&self, mut envelope: Envelope, plan: &RetryPlan) -> Result<(), ClientError> {
        envelope.attempt = plan.attempt;
        envelope
            .options
            .insert(FULL_QUEUE_KEY.to_string(), Value::String(plan.queue.clone()));
        let job_id = envelope.id;
        let worker = envelope.worker.clone();

        self.engine
            .enqueue_at(&plan.queue, plan.run_at, envelope)
            .await?;
        self.emit(CoordEvent::JobRetrying {
            job_id,
            worker,
            queue: plan.queue.clone(),
            attempt: plan.attempt,
            run_at: plan.run_at,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    fn skipped(&self, job_id: JobId, worker: String, reason: String) -> PerformOutcome {
        tracing::info!(%job_id, %worker, "job skipped: {}", reason);
        self.emit(CoordEvent::JobSkipped {
            job_id,
            worker,
            reason: reason.clone(),
            timestamp: Utc::now(),
        });
        PerformOutcome::Skipped { reason }
    }

    fn emit(&self, event: CoordEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Queue a job with `options` goes to.
fn resolve_queue(config: &WorkerConfig, options: &JobOptions) -> String {
    if let Some(queue) = options.get(FULL_QUEUE_KEY).and_then(Value::as_str) {
        return queue.to_string();
    }

    let queue = options.get("queue").and_then(Value::as_str);
    let namespace = options.get("queue_namespace").and_then(Value::as_str);
    if queue.is_none() && namespace.is_none() {
        return config.queue_name();
    }

    naming::full_queue_name(
        namespace.unwrap_or(&config.app_key),
        queue.unwrap_or(DEFAULT_QUEUE),
    )
}
