//! Message types for actor communication.

use coord_core::{CoordEvent, Envelope, JobId};
use ractor::{ActorRef, RpcReplyPort};

/// Messages for the QueueActor.
#[derive(Debug)]
pub enum QueueMessage {
    /// Append a ready job to a queue.
    Push {
        queue: String,
        envelope: Box<Envelope>,
        reply: RpcReplyPort<()>,
    },

    /// Schedule a job for a later time.
    EnqueueAt {
        queue: String,
        run_at: i64,
        envelope: Box<Envelope>,
        reply: RpcReplyPort<()>,
    },

    /// Take the next due job from a queue.
    Pop {
        queue: String,
        reply: RpcReplyPort<Option<Envelope>>,
    },

    /// Count ready and scheduled jobs in a queue.
    Len {
        queue: String,
        reply: RpcReplyPort<usize>,
    },

    /// Shutdown the queue actor.
    Shutdown,
}

/// Snapshot of a polling worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub current_job: Option<JobId>,
    pub processed: u64,
    pub failed: u64,
}

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Check the queues in priority order and perform one job.
    Poll,

    /// Report the worker's counters.
    Status { reply: RpcReplyPort<WorkerStatus> },

    /// Shutdown the worker.
    Shutdown,
}

/// Messages for the Supervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// List the worker actors.
    ListWorkers {
        reply: RpcReplyPort<Vec<ActorRef<WorkerMessage>>>,
    },

    /// Forward lifecycle events to another channel.
    Subscribe {
        sender: tokio::sync::broadcast::Sender<CoordEvent>,
    },

    /// Shutdown all workers.
    Shutdown,
}
