//! Lifecycle events emitted by the job client and workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lock::LockKind;
use crate::payload::JobId;

/// Events emitted while jobs move through enqueue and perform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoordEvent {
    /// A job was handed to the queue engine.
    JobEnqueued {
        job_id: JobId,
        worker: String,
        queue: String,
        run_at: Option<i64>,
        timestamp: DateTime<Utc>,
    },
    /// A before-enqueue hook refused the job; nothing was stored.
    EnqueueVetoed {
        worker: String,
        queue: String,
        hook: String,
        timestamp: DateTime<Utc>,
    },
    /// A job started executing.
    JobStarted {
        job_id: JobId,
        worker: String,
        timestamp: DateTime<Utc>,
    },
    /// A job completed successfully.
    JobCompleted {
        job_id: JobId,
        worker: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A job could not run yet and was put back on its queue.
    JobRequeued {
        job_id: JobId,
        worker: String,
        queue: String,
        run_at: Option<i64>,
        lock: Option<LockKind>,
        timestamp: DateTime<Utc>,
    },
    /// A job was dropped without running and without failing.
    JobSkipped {
        job_id: JobId,
        worker: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// A job failed.
    JobFailed {
        job_id: JobId,
        worker: String,
        error: String,
        attempt: u32,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },
    /// A failed job was scheduled for another attempt.
    JobRetrying {
        job_id: JobId,
        worker: String,
        queue: String,
        attempt: u32,
        run_at: i64,
        timestamp: DateTime<Utc>,
    },
    /// A polling worker checked in.
    WorkerHeartbeat {
        worker_id: String,
        current_job: Option<JobId>,
        timestamp: DateTime<Utc>,
    },
}

impl CoordEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CoordEvent::JobEnqueued { timestamp, .. }
            | CoordEvent::EnqueueVetoed { timestamp, .. }
            | CoordEvent::JobStarted { timestamp, .. }
            | CoordEvent::JobCompleted { timestamp, .. }
            | CoordEvent::JobRequeued { timestamp, .. }
            | CoordEvent::JobSkipped { timestamp, .. }
            | CoordEvent::JobFailed { timestamp, .. }
            | CoordEvent::JobRetrying { timestamp, .. }
            | CoordEvent::WorkerHeartbeat { timestamp, .. } => *timestamp,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            CoordEvent::JobEnqueued { job_id, .. }
            | CoordEvent::JobStarted { job_id, .. }
            | CoordEvent::JobCompleted { job_id, .. }
            | CoordEvent::JobRequeued { job_id, .. }
            | CoordEvent::JobSkipped { job_id, .. }
            | CoordEvent::JobFailed { job_id, .. }
            | CoordEvent::JobRetrying { job_id, .. } => Some(*job_id),
            CoordEvent::WorkerHeartbeat { current_job, .. } => *current_job,
            CoordEvent::EnqueueVetoed { .. } => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            CoordEvent::JobEnqueued {
                job_id,
                worker,
                queue,
                ..
            } => format!("{} job {} enqueued to {}", worker, job_id, queue),
            CoordEvent::EnqueueVetoed {
                worker, queue, hook, ..
            } => format!("{} enqueue to {} vetoed by {}", worker, queue, hook),
            CoordEvent::JobStarted { job_id, worker, .. } => {
                format!("{} job {} started", worker, job_id)
            }
            CoordEvent::JobCompleted {
                job_id,
                worker,
                duration_ms,
                ..
            } => format!("{} job {} completed in {}ms", worker, job_id, duration_ms),
            CoordEvent::JobRequeued {
                job_id,
                queue,
                lock,
                ..
            } => match lock {
                Some(kind) => format!("Job {} requeued to {} ({} lock held)", job_id, queue, kind),
                None => format!("Job {} requeued to {}", job_id, queue),
            },
            CoordEvent::JobSkipped { job_id, reason, .. } => {
                format!("Job {} skipped: {}", job_id, reason)
            }
            CoordEvent::JobFailed {
                job_id,
                error,
                will_retry,
                ..
            } => {
                let retry = if *will_retry { " (will retry)" } else { "" };
                format!("Job {} failed: {}{}", job_id, error, retry)
            }
            CoordEvent::JobRetrying {
                job_id, attempt, ..
            } => format!("Job {} retrying (attempt {})", job_id, attempt),
            CoordEvent::WorkerHeartbeat { worker_id, .. } => {
                format!("Worker {} heartbeat", worker_id)
            }
        }
    }
}
