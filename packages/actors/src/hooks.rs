//! Ordered job hooks wrapped around enqueue and perform.
//!
//! Hooks are explicit objects with a numeric priority rather than methods
//! discovered by name. A [`HookPipeline`] sorts them once and then drives a
//! job through its lifecycle:
//!
//! ```text
//! Created -> (before_enqueue veto?) -> Enqueued -> (before_perform halt?)
//!         -> Running -> Completed | Requeued | Skipped | Failed
//! ```

use std::future::Future;
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use coord_core::{Envelope, JobError, JobOptions, LockKind};
use futures_util::FutureExt;

use crate::handler::{Completion, HandlerFuture};

/// Boxed future returned by hook methods.
pub type HookFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Created,
    Enqueued,
    Vetoed,
    Running,
    Completed,
    Requeued,
    Skipped,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Vetoed
                | JobState::Completed
                | JobState::Requeued
                | JobState::Skipped
                | JobState::Failed
        )
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Created, Enqueued)
                | (Created, Vetoed)
                | (Enqueued, Running)
                | (Enqueued, Requeued)
                | (Enqueued, Skipped)
                | (Enqueued, Failed)
                | (Running, Completed)
                | (Running, Skipped)
                | (Running, Failed)
        )
    }
}

/// Cooperative stop raised by a before-perform hook. Not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PerformHalt {
    /// Put the job back on its queue, due at `run_at`.
    Requeue {
        run_at: i64,
        lock: Option<LockKind>,
    },
    /// Drop the job without running it.
    Skip { reason: String },
}

/// Order in which failure hooks run relative to each other.
///
/// Queue bookkeeping lives in `First` and `Last` so that everything in
/// `Normal` sees the queue the job came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FailureStage {
    First,
    #[default]
    Normal,
    Last,
}

/// Where a failed job should be submitted again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPlan {
    pub queue: String,
    pub run_at: i64,
    pub attempt: u32,
}

/// What before-enqueue hooks see.
#[derive(Debug, Clone)]
pub struct EnqueueContext {
    pub worker: String,
    pub queue: String,
    pub options: JobOptions,
    pub run_at: Option<i64>,
}

/// Per-perform state shared by the hooks of one job run.
#[derive(Debug)]
pub struct PerformContext {
    pub envelope: Envelope,
    /// Unix seconds at the start of the perform.
    pub now: i64,
    /// Queue a failure-driven resubmission should target.
    pub requeue_queue: Option<String>,
    pub retry: Option<RetryPlan>,
    state: JobState,
    failure_hooks_ran: bool,
    held: Vec<PerformGuard>,
}

impl PerformContext {
    pub fn new(envelope: Envelope, now: i64) -> Self {
        Self {
            envelope,
            now,
            requeue_queue: None,
            retry: None,
            state: JobState::Enqueued,
            failure_hooks_ran: false,
            held: Vec::new(),
        }
    }

    pub fn options(&self) -> &JobOptions {
        &self.envelope.options
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn failure_hooks_ran(&self) -> bool {
        self.failure_hooks_ran
    }

    /// Keep `guard` for the rest of this perform.
    ///
    /// Used by before-perform hooks that take a resource before the job is
    /// known to run. The guard is released if a later hook halts or errors,
    /// and otherwise together with the around-perform guards.
    pub fn hold(&mut self, guard: PerformGuard) {
        self.held.push(guard);
    }

    pub fn held_guards(&self) -> Vec<&str> {
        self.held.iter().map(PerformGuard::name).collect()
    }

    fn advance(&mut self, next: JobState) {
        if self.state.can_transition_to(next) {
            self.state = next;
        } else {
            tracing::warn!(
                job_id = %self.envelope.id,
                from = ?self.state,
                to = ?next,
                "ignoring invalid job state transition"
            );
        }
    }
}

/// Cleanup registered by a hook for the duration of one perform.
///
/// The release future is awaited once the job finishes, whatever the
/// outcome, including panics inside the job. A guard dropped without being
/// released (the perform future was cancelled) spawns its release on the
/// current tokio runtime.
pub struct PerformGuard {
    name: String,
    release: Option<HookFuture<'static, Result<(), JobError>>>,
}

impl PerformGuard {
    pub fn new<F>(name: impl Into<String>, release: F) -> Self
    where
        F: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            release: Some(Box::pin(release)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn release(mut self) {
        if let Some(release) = self.release.take()
            && let Err(e) = release.await
        {
            tracing::warn!(guard = %self.name, "perform guard release failed: {}", e);
        }
    }
}

impl Drop for PerformGuard {
    fn drop(&mut self) {
        let Some(release) = self.release.take() else {
            return;
        };
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(guard = %name, "perform guard dropped, releasing in background");
                handle.spawn(async move {
                    if let Err(e) = release.await {
                        tracing::warn!(guard = %name, "perform guard release failed: {}", e);
                    }
                });
            }
            Err(_) => {
                tracing::warn!(guard = %name, "perform guard dropped outside a runtime, left to expire");
            }
        }
    }
}

impl std::fmt::Debug for PerformGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformGuard").field("name", &self.name).finish()
    }
}

/// One concern contributing behavior around enqueue and perform.
///
/// Every method has a pass-through default, so hooks implement only the
/// stages they care about.
pub trait JobHook: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Lower runs first.
    fn priority(&self) -> i32 {
        0
    }

    fn failure_stage(&self) -> FailureStage {
        FailureStage::Normal
    }

    /// Return `Ok(false)` to veto the enqueue.
    fn before_enqueue<'a>(&'a self, _ctx: &'a EnqueueContext) -> HookFuture<'a, Result<bool, JobError>> {
        Box::pin(async { Ok(true) })
    }

    fn before_perform<'a>(
        &'a self,
        _ctx: &'a mut PerformContext,
    ) -> HookFuture<'a, Result<ControlFlow<PerformHalt>, JobError>> {
        Box::pin(async { Ok(ControlFlow::Continue(())) })
    }

    fn around_perform<'a>(
        &'a self,
        _ctx: &'a mut PerformContext,
    ) -> HookFuture<'a, Result<Option<PerformGuard>, JobError>> {
        Box::pin(async { Ok(None) })
    }

    fn on_failure<'a>(
        &'a self,
        _ctx: &'a mut PerformContext,
        _error: &'a JobError,
    ) -> HookFuture<'a, Result<(), JobError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Result of running before-enqueue hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueVerdict {
    Accept,
    Veto { hook: String },
}

/// How a perform driven by the pipeline ended.
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    Completed(Completion),
    Halted(PerformHalt),
    Failed(JobError),
}

/// Hooks of one worker, sorted by priority.
#[derive(Clone, Default)]
pub struct HookPipeline {
    hooks: Vec<Arc<dyn JobHook>>,
    failure_order: Vec<Arc<dyn JobHook>>,
}

impl std::fmt::Debug for HookPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.hooks.iter().map(|h| h.name()))
            .finish()
    }
}

impl HookPipeline {
    pub fn new(hooks: impl IntoIterator<Item = Arc<dyn JobHook>>) -> Self {
        let mut hooks: Vec<Arc<dyn JobHook>> = hooks.into_iter().collect();
        hooks.sort_by_key(|h| h.priority());

        let mut failure_order = hooks.clone();
        failure_order.sort_by_key(|h| (h.failure_stage(), h.priority()));

        Self {
            hooks,
            failure_order,
        }
    }

    pub fn hook_names(&self) -> Vec<&str> {
        self.hooks.iter().map(|h| h.name()).collect()
    }

    pub fn failure_hook_names(&self) -> Vec<&str> {
        self.failure_order.iter().map(|h| h.name()).collect()
    }

    /// Run before-enqueue hooks until one vetoes.
    pub async fn before_enqueue(&self, ctx: &EnqueueContext) -> Result<EnqueueVerdict, JobError> {
        for hook in &self.hooks {
            if !hook.before_enqueue(ctx).await? {
                tracing::debug!(hook = hook.name(), worker = %ctx.worker, "enqueue vetoed");
                return Ok(EnqueueVerdict::Veto {
                    hook: hook.name().to_string(),
                });
            }
        }
        Ok(EnqueueVerdict::Accept)
    }

    /// Drive one perform: before hooks, guards, the job, guard release and,
    /// on failure, the failure hooks exactly once.
    pub async fn perform<F>(&self, ctx: &mut PerformContext, job: F) -> PipelineOutcome
    where
        F: FnOnce(&JobOptions) -> HandlerFuture,
    {
        for hook in &self.hooks {
            match hook.before_perform(ctx).await {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(halt)) => {
                    tracing::debug!(hook = hook.name(), ?halt, "perform halted");
                    release_all(std::mem::take(&mut ctx.held)).await;
                    ctx.advance(match halt {
                        PerformHalt::Requeue { .. } => JobState::Requeued,
                        PerformHalt::Skip { .. } => JobState::Skipped,
                    });
                    return PipelineOutcome::Halted(halt);
                }
                Err(e) => {
                    release_all(std::mem::take(&mut ctx.held)).await;
                    return self.fail(ctx, e).await;
                }
            }
        }

        let mut guards = std::mem::take(&mut ctx.held);
        for hook in &self.hooks {
            match hook.around_perform(ctx).await {
                Ok(Some(guard)) => guards.push(guard),
                Ok(None) => {}
                Err(e) => {
                    release_all(guards).await;
                    return self.fail(ctx, e).await;
                }
            }
        }

        ctx.advance(JobState::Running);
        let result = AssertUnwindSafe(job(ctx.options()))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(JobError::Panicked(panic_message(&*panic))));

        release_all(guards).await;

        match result {
            Ok(completion) => {
                ctx.advance(match completion {
                    Completion::Performed => JobState::Completed,
                    Completion::Skipped { .. } => JobState::Skipped,
                });
                PipelineOutcome::Completed(completion)
            }
            Err(e) => self.fail(ctx, e).await,
        }
    }

    /// Run failure hooks once for this context. Later calls are no-ops.
    pub async fn run_failure_hooks(&self, ctx: &mut PerformContext, error: &JobError) {
        if ctx.failure_hooks_ran {
            return;
        }
        ctx.failure_hooks_ran = true;

        for hook in &self.failure_order {
            if let Err(e) = hook.on_failure(ctx, error).await {
                tracing::warn!(hook = hook.name(), "failure hook errored: {}", e);
            }
        }
    }

    async fn fail(&self, ctx: &mut PerformContext, error: JobError) -> PipelineOutcome {
        ctx.advance(JobState::Failed);
        self.run_failure_hooks(ctx, &error).await;
        PipelineOutcome::Failed(error)
    }
}

/// Release guards in reverse acquisition order.
async fn release_all(guards: Vec<PerformGuard>) {
    for guard in guards.into_iter().rev() {
        guard.release().await;
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked".to_string()
    }
}
