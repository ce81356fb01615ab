//! Failure bookkeeping: queue memo and exponential backoff retries.

use coord_core::JobError;

use crate::hooks::{FailureStage, HookFuture, JobHook, PerformContext, RetryPlan};

/// Delays between attempts, in seconds. The retry limit is its length.
pub const DEFAULT_BACKOFF_SECS: [u64; 6] = [0, 60, 600, 3600, 10_800, 21_600];

/// Remembers the queue a failed job came from, before any other failure hook.
pub struct QueueMemoHook;

impl JobHook for QueueMemoHook {
    fn name(&self) -> &str {
        "queue_memo"
    }

    fn priority(&self) -> i32 {
        i32::MIN
    }

    fn failure_stage(&self) -> FailureStage {
        FailureStage::First
    }

    fn on_failure<'a>(
        &'a self,
        ctx: &'a mut PerformContext,
        _error: &'a JobError,
    ) -> HookFuture<'a, Result<(), JobError>> {
        Box::pin(async move {
            ctx.requeue_queue = ctx.envelope.full_queue().map(str::to_string);
            Ok(())
        })
    }
}

/// Forgets the remembered queue once every other failure hook has run.
pub struct QueueMemoResetHook;

impl JobHook for QueueMemoResetHook {
    fn name(&self) -> &str {
        "queue_memo_reset"
    }

    fn priority(&self) -> i32 {
        i32::MAX
    }

    fn failure_stage(&self) -> FailureStage {
        FailureStage::Last
    }

    fn on_failure<'a>(
        &'a self,
        ctx: &'a mut PerformContext,
        _error: &'a JobError,
    ) -> HookFuture<'a, Result<(), JobError>> {
        Box::pin(async move {
            ctx.requeue_queue = None;
            Ok(())
        })
    }
}

/// Retry policy of a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff_secs: Vec<u64>,
    pub limit: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::backoff(DEFAULT_BACKOFF_SECS.to_vec())
    }
}

impl RetryPolicy {
    /// Retry once per entry of `backoff_secs`.
    pub fn backoff(backoff_secs: Vec<u64>) -> Self {
        let limit = backoff_secs.len() as u32;
        Self {
            backoff_secs,
            limit,
        }
    }

    pub fn disabled() -> Self {
        Self {
            backoff_secs: Vec::new(),
            limit: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.limit > 0
    }

    /// Delay before retry number `attempt` (zero based). Past the schedule
    /// the last delay repeats.
    pub fn delay_for(&self, attempt: u32) -> u64 {
        self.backoff_secs
            .get(attempt as usize)
            .or(self.backoff_secs.last())
            .copied()
            .unwrap_or(0)
    }
}

/// Plans another attempt for failed jobs until the retry limit is reached.
pub struct RetryHook {
    policy: RetryPolicy,
    default_queue: String,
}

impl RetryHook {
    pub fn new(policy: RetryPolicy, default_queue: impl Into<String>) -> Self {
        Self {
            policy,
            default_queue: default_queue.into(),
        }
    }
}

impl JobHook for RetryHook {
    fn name(&self) -> &str {
        "retry"
    }

    fn priority(&self) -> i32 {
        30
    }

    fn on_failure<'a>(
        &'a self,
        ctx: &'a mut PerformContext,
        error: &'a JobError,
    ) -> HookFuture<'a, Result<(), JobError>> {
        Box::pin(async move {
            let attempt = ctx.envelope.attempt;
            if attempt >= self.policy.limit {
                tracing::warn!(
                    job_id = %ctx.envelope.id,
                    attempt,
                    "retry limit reached: {}",
                    error
                );
                return Ok(());
            }

            let queue = ctx
                .requeue_queue
                .clone()
                .unwrap_or_else(|| self.default_queue.clone());
            let run_at = ctx.now + self.policy.delay_for(attempt) as i64;
            ctx.retry = Some(RetryPlan {
                queue,
                run_at,
                attempt: attempt + 1,
            });
            Ok(())
        })
    }
}
