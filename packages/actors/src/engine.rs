//! Queue engine contract.

use std::future::Future;

use coord_core::Envelope;

use crate::error::EngineError;

/// Storage and scheduling of enqueued jobs, keyed by queue name.
///
/// `pop` must never hand out a job scheduled with [`QueueEngine::enqueue_at`]
/// before its due time.
pub trait QueueEngine: Send + Sync + 'static {
    /// Append a job that is ready now.
    fn push(
        &self,
        queue: &str,
        envelope: Envelope,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Take the next ready job, if any.
    fn pop(&self, queue: &str) -> impl Future<Output = Result<Option<Envelope>, EngineError>> + Send;

    /// Schedule a job to become ready at `run_at` (unix seconds).
    fn enqueue_at(
        &self,
        queue: &str,
        run_at: i64,
        envelope: Envelope,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Number of jobs held for `queue`, ready or scheduled.
    fn len(&self, queue: &str) -> impl Future<Output = Result<usize, EngineError>> + Send;
}
