//! Actor runtime for coordinated job processing.
//!
//! This crate provides the job client, the hook pipeline enforcing queue and
//! worker locks, deferred method invocation and the Ractor-based actors that
//! poll queues.
//!
//! # Architecture
//!
//! - `QueueActor` - Holds every named queue, with due-time scheduling
//! - `WorkerActor` - Polls queues in weight order and performs jobs
//! - `Supervisor` - Spawns and watches the workers
//! - `JobClient` - Enqueues, performs and requeues through the hooks
//!
//! # Usage
//!
//! ```ignore
//! use actors::{JobHandlerRegistry, WorkerConfig, job_handler, start_runtime};
//!
//! let mut handlers = JobHandlerRegistry::default();
//! handlers.register(job_handler!(
//!     WorkerConfig::new("Billing::Sync").worker_lock(["account_id"])?,
//!     |options| Ok(Completion::Performed)
//! ));
//!
//! let runtime = start_runtime(store, Arc::new(handlers), config, 4, clock).await?;
//! runtime.client.enqueue("Billing::Sync", options).await?;
//! ```

mod bootstrap;
mod client;
mod delay;
mod engine;
mod error;
mod handler;
mod hooks;
mod locks;
mod messages;
mod queue_actor;
mod retry;
mod supervisor;
mod worker_actor;

pub use bootstrap::{Runtime, start_runtime};
pub use client::{EnqueueOutcome, JobClient, PerformOutcome};
pub use delay::{
    AsyncMethod, DELAY_EXECUTION_WORKER, DelayClass, DelayExecutionHandler, DelayOutcome,
    DelayRegistry, Delayer, FindFuture, FinderKind, InvocationProxy, InvokeFuture, InvokeOutcome,
    Receiver,
};
pub use engine::QueueEngine;
pub use error::{ClientError, EngineError};
pub use handler::{
    Completion, FnHandler, HandlerFuture, HandlerResult, JobHandler, JobHandlerRegistry,
    LockSource, WorkerConfig,
};
pub use hooks::{
    EnqueueContext, EnqueueVerdict, FailureStage, HookFuture, HookPipeline, JobHook, JobState,
    PerformContext, PerformGuard, PerformHalt, PipelineOutcome, RetryPlan,
};
pub use locks::{
    CLASS_NAME_KEY, DeclaredLock, LOCK_NAMESPACE_KEY, LockStrategy, PayloadLock, QueueLockHook,
    WorkerLockHook,
};
pub use messages::{QueueMessage, SupervisorMessage, WorkerMessage, WorkerStatus};
pub use queue_actor::{ActorQueueEngine, QueueActor, ScheduledQueues};
pub use retry::{DEFAULT_BACKOFF_SECS, QueueMemoHook, QueueMemoResetHook, RetryHook, RetryPolicy};
pub use supervisor::{Supervisor, SupervisorArgs, start_supervisor};
pub use worker_actor::{WorkerActor, WorkerActorState, WorkerArgs};

/// Core types used in handler signatures.
pub use coord_core::{JobError, JobOptions};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
